//! Configuration structures for service discovery

use crate::error::{Error, Result};
use crate::models::ServiceDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Service discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Application name, used as the logging prefix
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Coordination service connection settings
    pub coordination: CoordinationConfig,
    /// Instance this process announces (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<ServiceDescriptor>,
    /// Services this process resolves, keyed by domain name
    #[serde(default)]
    pub domains: BTreeMap<String, DomainConfig>,
    /// Registrar tuning
    #[serde(default)]
    pub registrar: RegistrarConfig,
    /// Resolver tuning
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Coordination service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Coordination service endpoints (e.g., "127.0.0.1:2379")
    pub addrs: Vec<String>,
    /// Connection timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    /// Per-request timeout in seconds
    #[serde(default = "default_rw_timeout")]
    pub rw_timeout: u64,
}

impl CoordinationConfig {
    /// Connection timeout
    pub fn dial_duration(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.rw_timeout)
    }
}

/// A service this process resolves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Key path of the service, e.g. "user/v1"
    pub name: String,
    /// Spread calls over all live addresses instead of pinning the first one
    #[serde(default)]
    pub load_balance: bool,
}

impl DomainConfig {
    /// Registry key prefix watched for this domain
    pub fn key_prefix(&self) -> String {
        format!("/{}", self.name.trim_matches('/'))
    }
}

/// Registrar tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    /// How often the supervising task checks for a missing heartbeat, in milliseconds
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Backoff between failed recovery attempts
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Capped exponential backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound on any delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// Growth factor between attempts
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Relative jitter applied to each delay (0.0 to 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

/// Resolver tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Full resynchronization interval in seconds
    #[serde(default = "default_resync_interval")]
    pub resync_interval: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            resync_interval: default_resync_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Maximum log level name ("ERROR", "WARN", "INFO", "DEBUG", "TRACE")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_app_name() -> String {
    "service-discovery".to_string()
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_rw_timeout() -> u64 {
    3
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_backoff_initial_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_resync_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl DiscoveryConfig {
    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use async_fs::File;
        use futures::io::AsyncReadExt;

        let mut file = File::open(path.as_ref()).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        // Try YAML first, then JSON
        let config: Self = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("yaml")
            || path.as_ref().extension().and_then(|s| s.to_str()) == Some("yml")
        {
            serde_yaml::from_str(&contents)?
        } else {
            serde_json::from_str(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the subsystem cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.coordination.addrs.is_empty() {
            return Err(Error::Config("coordination.addrs must not be empty".to_string()));
        }
        if self.coordination.dial_timeout == 0 || self.coordination.rw_timeout == 0 {
            return Err(Error::Config("coordination timeouts must be positive".to_string()));
        }
        if self.registrar.check_interval_ms == 0 {
            return Err(Error::Config("registrar.check_interval_ms must be positive".to_string()));
        }
        if self.resolver.resync_interval == 0 {
            return Err(Error::Config("resolver.resync_interval must be positive".to_string()));
        }
        if let Some(descriptor) = &self.register {
            descriptor
                .validate()
                .map_err(|e| Error::Config(format!("register: {}", e)))?;
        }
        for (domain, config) in &self.domains {
            if config.name.trim_matches('/').is_empty() {
                return Err(Error::Config(format!("domain '{}' has an empty name", domain)));
            }
        }
        Ok(())
    }

    /// Look up a configured domain
    pub fn domain(&self, name: &str) -> Result<&DomainConfig> {
        self.domains
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown domain '{}'", name)))
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            coordination: CoordinationConfig {
                addrs: vec!["127.0.0.1:2379".to_string()],
                dial_timeout: default_dial_timeout(),
                rw_timeout: default_rw_timeout(),
            },
            register: None,
            domains: BTreeMap::new(),
            registrar: RegistrarConfig::default(),
            resolver: ResolverConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
app_name: user
coordination:
  addrs: ["10.0.0.10:2379", "10.0.0.11:2379"]
  dial_timeout: 2
register:
  name: user
  addr: "10.0.0.1:9000"
  weight: 10
  version: v1
  ttl: 10
domains:
  user:
    name: user/v1
    load_balance: true
log:
  level: DEBUG
"#;

    #[test]
    fn test_config_serialization() {
        let config = DiscoveryConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: DiscoveryConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.coordination.addrs, config.coordination.addrs);
        assert!(parsed.register.is_none());
    }

    #[test]
    fn test_yaml_defaults() {
        let config: DiscoveryConfig = serde_yaml::from_str(YAML).unwrap();
        config.validate().unwrap();

        assert_eq!(config.coordination.dial_duration(), Duration::from_secs(2));
        assert_eq!(config.coordination.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.resolver.resync_interval, 60);
        assert_eq!(config.registrar.backoff, BackoffConfig::default());
        assert_eq!(config.log.level, "DEBUG");

        let register = config.register.as_ref().unwrap();
        assert_eq!(register.key(), "/user/v1/10.0.0.1:9000");

        let domain = config.domain("user").unwrap();
        assert_eq!(domain.key_prefix(), "/user/v1");
        assert!(domain.load_balance);
        assert!(config.domain("order").is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = DiscoveryConfig::default();
        config.coordination.addrs.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = DiscoveryConfig::default();
        config.register = Some(ServiceDescriptor::new("user", "", 1, 10));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = DiscoveryConfig::default();
        config.domains.insert(
            "user".to_string(),
            DomainConfig {
                name: "/".to_string(),
                load_balance: false,
            },
        );
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[smol_potat::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("discovery.yaml");
        std::fs::write(&yaml_path, YAML).unwrap();
        let config = DiscoveryConfig::from_file(&yaml_path).await.unwrap();
        assert_eq!(config.app_name, "user");

        let json_path = dir.path().join("discovery.json");
        std::fs::write(&json_path, r#"{"coordination":{"addrs":["127.0.0.1:2379"]}}"#).unwrap();
        let config = DiscoveryConfig::from_file(&json_path).await.unwrap();
        assert_eq!(config.app_name, "service-discovery");
        assert!(config.domains.is_empty());

        let bad_path = dir.path().join("bad.json");
        std::fs::write(&bad_path, r#"{"coordination":{"addrs":[]}}"#).unwrap();
        assert!(DiscoveryConfig::from_file(&bad_path).await.is_err());
    }
}
