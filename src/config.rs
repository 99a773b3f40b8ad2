use crate::backend::parse_address;
use crate::pool::PoolConfig;
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the load balancer
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Backend base addresses, in round-robin order
    #[serde(default)]
    pub backends: Vec<String>,

    /// Listener and upstream connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Active health probing
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listening port, as an integer or a string (default: 8080)
    #[serde(default = "default_listen_port", deserialize_with = "deserialize_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend to respond, in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    /// Socket address the front door listens on
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port).parse().map_err(|e| {
            anyhow::anyhow!("Invalid bind address '{}:{}': {}", self.bind, self.port, e)
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Probe backends and skip the ones that fail (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Path probed on each backend, relative to its base address
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Interval between probe rounds in milliseconds
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Timeout for a single probe in milliseconds
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// Consecutive failures before a backend is taken out of rotation
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before a backend is put back into rotation
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.path.starts_with('/') {
            errors.push(format!("health: 'path' must start with '/', got '{}'", self.path));
        }
        if self.interval_ms == 0 {
            errors.push("health: 'interval_ms' must be greater than 0".to_string());
        }
        if self.timeout_ms == 0 {
            errors.push("health: 'timeout_ms' must be greater than 0".to_string());
        }
        if self.failure_threshold == 0 {
            errors.push("health: 'failure_threshold' must be at least 1".to_string());
        }
        if self.success_threshold == 0 {
            errors.push("health: 'success_threshold' must be at least 1".to_string());
        }
        errors
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_health_path(),
            interval_ms: default_health_interval(),
            timeout_ms: default_health_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Accepts `port = 8080` as well as `port = "8080"`
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(i64),
        Text(String),
    }

    let value = match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => n,
        PortValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", s)))?,
    };

    u16::try_from(value)
        .map_err(|_| serde::de::Error::custom(format!("port {} is out of range 1-65535", value)))
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    5000
}

fn default_health_timeout() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.backends.is_empty() {
            errors.push("at least one backend address is required".to_string());
        }

        for address in &self.backends {
            if let Err(e) = parse_address(address) {
                errors.push(e.to_string());
            }
        }

        if self.server.port == 0 {
            errors.push("server: 'port' must be between 1 and 65535".to_string());
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if self.health.enabled {
            errors.extend(self.health.validate());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
backends = ["http://127.0.0.1:3001", "http://127.0.0.1:3002/api"]

[server]
port = 9090
bind = "127.0.0.1"
request_timeout_secs = 10

[health]
enabled = true
path = "/healthz"
interval_ms = 1000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1], "http://127.0.0.1:3002/api");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert!(config.health.enabled);
        assert_eq!(config.health.path, "/healthz");
        assert_eq!(config.health.interval(), Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_order_is_preserved() {
        let toml = r#"backends = ["http://c", "http://a", "http://b"]"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.backends, vec!["http://c", "http://a", "http://b"]);
    }

    #[test]
    fn test_port_as_string() {
        let toml = r#"
backends = ["http://a"]

[server]
port = "8081"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8081);
    }

    #[test]
    fn test_port_out_of_range() {
        let toml = r#"
[server]
port = 70000
"#;
        let err = toml::from_str::<Config>(toml).unwrap_err().to_string();
        assert!(err.contains("out of range"));

        let toml = r#"
[server]
port = "eighty"
"#;
        let err = toml::from_str::<Config>(toml).unwrap_err().to_string();
        assert!(err.contains("invalid port"));
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_default_health_config() {
        let health = HealthConfig::default();
        assert!(!health.enabled);
        assert_eq!(health.path, "/health");
        assert_eq!(health.interval(), Duration::from_secs(5));
        assert_eq!(health.timeout(), Duration::from_secs(2));
        assert_eq!(health.failure_threshold, 3);
        assert_eq!(health.success_threshold, 1);
    }

    #[test]
    fn test_pool_config_from_server() {
        let server = ServerConfig {
            pool_max_idle_per_host: 4,
            pool_idle_timeout_secs: 15,
            request_timeout_secs: 7,
            ..ServerConfig::default()
        };
        let pool = server.pool_config();
        assert_eq!(pool.max_idle_per_host, 4);
        assert_eq!(pool.idle_timeout, Duration::from_secs(15));
        assert_eq!(pool.request_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_bind_addr() {
        let server = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 8088,
            ..ServerConfig::default()
        };
        assert_eq!(server.bind_addr().unwrap(), "127.0.0.1:8088".parse().unwrap());

        let server = ServerConfig {
            bind: "not-an-ip".to_string(),
            ..ServerConfig::default()
        };
        assert!(server.bind_addr().is_err());
    }

    #[test]
    fn test_validate_empty_backends() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("at least one backend address is required"));
    }

    #[test]
    fn test_validate_malformed_addresses() {
        let toml = r#"backends = ["http://ok.internal", "ftp://files", "no-scheme", ""]"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("ftp://files"));
        assert!(err.contains("no-scheme"));
        assert!(err.contains("backend address is empty"));
        assert!(!err.contains("ok.internal"));
    }

    #[test]
    fn test_validate_port_nonzero() {
        let toml = r#"
backends = ["http://a"]

[server]
port = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'port' must be between 1 and 65535"));
    }

    #[test]
    fn test_validate_health_only_when_enabled() {
        let toml = r#"
backends = ["http://a"]

[health]
path = "health"
failure_threshold = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());

        let mut config = config;
        config.health.enabled = true;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'path' must start with '/'"));
        assert!(err.contains("'failure_threshold' must be at least 1"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"backends = ["http://127.0.0.1:3001"]

[server]
port = 8082"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8082);
        assert_eq!(config.backends, vec!["http://127.0.0.1:3001"]);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backends = []").unwrap();
        assert!(Config::load(file.path()).is_err());

        assert!(Config::load("/nonexistent/roundgate.toml").is_err());
    }
}
