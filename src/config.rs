use crate::healthcheck::HealthCheckConfig;
use crate::loadbalancer::LoadBalanceStrategy;
use crate::registry::RegistrationRequest;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Offset of the registry API port from the gateway port
pub const REGISTRY_API_PORT_OFFSET: u16 = 1000;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and proxy settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Credential check settings
    #[serde(default)]
    pub auth: AuthSettings,

    /// Per-client request budget
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Health checker settings
    #[serde(default)]
    pub health: HealthSettings,

    /// Services registered at boot. Empty means the built-in default set.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gateway port; the registry API listens on `port + 1000`
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Time allowed to read request headers
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Time allowed to produce a response, backend included
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Idle keep-alive timeout for pooled backend connections
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Drain period for in-flight requests on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum idle connections per backend host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Initial load balancing strategy
    #[serde(default = "default_load_balancer")]
    pub load_balancer: String,
}

impl ServerConfig {
    pub fn registry_api_port(&self) -> u16 {
        self.port.saturating_add(REGISTRY_API_PORT_OFFSET)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            load_balancer: default_load_balancer(),
        }
    }
}

/// Whether failed credential checks reject the request
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Log failures and let the request through (test setups)
    Permissive,
    /// Reject failures with 401
    #[default]
    Strict,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    #[serde(default)]
    pub mode: AuthMode,

    /// Basic-auth user name
    #[serde(default = "default_auth_username")]
    pub username: String,

    /// Basic-auth password. If not set, a random one is generated at startup and logged
    pub password: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            username: default_auth_username(),
            password: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per client within one window
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,

    /// Sliding window length
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Deregister instances once they reach their `max_fails`
    #[serde(default)]
    pub evict_failed_instances: bool,
}

impl HealthSettings {
    pub fn to_check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            evict_failed_instances: self.evict_failed_instances,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            evict_failed_instances: false,
        }
    }
}

/// Explicit route for a service, overriding the built-in route table
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// A service registered at boot
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default = "default_service_address")]
    pub address: String,

    pub port: u16,

    /// Health endpoint path on the service; empty disables probing
    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_service_version")]
    pub version: String,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    pub route: Option<RouteConfig>,
}

impl ServiceConfig {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            address: default_service_address(),
            port,
            health_path: default_health_path(),
            version: default_service_version(),
            tags: BTreeSet::new(),
            weight: default_weight(),
            max_fails: default_max_fails(),
            route: None,
        }
    }

    /// Set tags (builder pattern)
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Absolute health URL, or empty when probing is disabled
    pub fn health_url(&self) -> String {
        if self.health_path.is_empty() {
            return String::new();
        }
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("http://{}:{}{}", self.address, self.port, path)
    }

    pub fn to_registration(&self) -> RegistrationRequest {
        RegistrationRequest::new(&self.name, &self.address, self.port)
            .with_health_url(&self.health_url())
            .with_version(&self.version)
            .with_tags(self.tags.iter().cloned())
            .with_weight(self.weight)
            .with_max_fails(self.max_fails)
    }
}

/// Built-in backend set registered when the config lists no services
pub fn default_services() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig::new("ai-agent", 8081).with_tags(&["ai", "chat"]),
        ServiceConfig::new("app-store", 8082).with_tags(&["apps"]),
        ServiceConfig::new("container-manager", 8083).with_tags(&["docker"]),
        ServiceConfig::new("website-manager", 8084).with_tags(&["web"]),
        ServiceConfig::new("database-manager", 8085).with_tags(&["database"]),
        ServiceConfig::new("monitoring-api", 8086).with_tags(&["monitoring"]),
        ServiceConfig::new("web-ui", 8080).with_tags(&["frontend"]),
    ]
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_read_timeout() -> u64 {
    15
}

fn default_write_timeout() -> u64 {
    15
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_load_balancer() -> String {
    LoadBalanceStrategy::default().to_string()
}

fn default_auth_username() -> String {
    "admin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_requests_per_minute() -> usize {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_service_address() -> String {
    "localhost".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_service_version() -> String {
    "1.0.0".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    3
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.server.port > u16::MAX - REGISTRY_API_PORT_OFFSET {
            anyhow::bail!(
                "server.port {} leaves no room for the registry API on port + {}",
                self.server.port,
                REGISTRY_API_PORT_OFFSET
            );
        }
        if self.server.load_balancer.parse::<LoadBalanceStrategy>().is_err() {
            anyhow::bail!("unknown load balancer '{}'", self.server.load_balancer);
        }
        if self.rate_limit.enabled && self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be non-zero");
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_minute == 0 {
            anyhow::bail!("rate_limit.requests_per_minute must be non-zero (set enabled = false to disable limiting)");
        }
        if self.health.interval_secs == 0 {
            anyhow::bail!("health.interval_secs must be non-zero");
        }
        for service in &self.services {
            if service.name.is_empty() {
                anyhow::bail!("service name must not be empty");
            }
            if service.port == 0 {
                anyhow::bail!("service '{}': port must be non-zero", service.name);
            }
            if let Some(route) = &service.route {
                if !route.path.starts_with('/') {
                    anyhow::bail!(
                        "service '{}': route path '{}' must start with '/'",
                        service.name,
                        route.path
                    );
                }
            }
        }
        Ok(())
    }

    /// Services to register at boot
    pub fn boot_services(&self) -> Vec<ServiceConfig> {
        if self.services.is_empty() {
            default_services()
        } else {
            self.services.clone()
        }
    }

    pub fn load_balance_strategy(&self) -> LoadBalanceStrategy {
        self.server.load_balancer.parse().unwrap_or_default()
    }
}
