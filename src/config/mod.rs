use crate::error::ConfigError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Default config path used when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gatehouse/config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// User to drop privileges to after binding listeners. No-op if not running as root.
    #[serde(default)]
    pub uid: Option<String>,
    /// Group to drop privileges to after binding listeners.
    #[serde(default)]
    pub gid: Option<String>,
    /// One entry per HTTP proxy listener.
    #[serde(default, rename = "http")]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub listen: String,
    #[serde(default)]
    pub allow: Vec<Subnet>,
    #[serde(default)]
    pub deny: Vec<Subnet>,
    #[serde(default, rename = "ratelimit")]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default, rename = "global")]
    pub global_rps: u32,
    #[serde(default, rename = "perhost")]
    pub per_host_rps: u32,
}

/// A CIDR subnet, parsed eagerly at deserialize time so that a malformed
/// entry fails config load rather than surfacing during an ACL check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet(pub IpNetwork);

impl TryFrom<String> for Subnet {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse::<IpNetwork>()
            .map(Subnet)
            .map_err(|e| format!("{}: {}", value, e))
    }
}

impl From<Subnet> for String {
    fn from(s: Subnet) -> Self {
        s.0.to_string()
    }
}

impl Subnet {
    pub fn contains(&self, ip: std::net::IpAddr) -> bool {
        self.0.contains(ip)
    }
}

impl Config {
    /// Load configuration from `path`. Missing file falls back to built-in
    /// defaults (no listeners), matching local-dev ergonomics; an explicit
    /// path that exists but fails to read or parse is a hard error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        } else {
            tracing::warn!(
                "config file not found at {}, using defaults (no listeners)",
                path.display()
            );
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for l in &self.listeners {
            l.listen
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBind(l.listen.clone()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
http:
  - listen: "0.0.0.0:8080"
    allow: ["10.0.0.0/8"]
    deny: ["10.1.0.0/16"]
    ratelimit:
      global: 1000
      perhost: 20
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.listeners.len(), 1);
        let l = &cfg.listeners[0];
        assert_eq!(l.listen, "0.0.0.0:8080");
        assert_eq!(l.rate_limit.global_rps, 1000);
        assert_eq!(l.rate_limit.per_host_rps, 20);
        assert!(l.allow[0].contains("10.0.0.1".parse().unwrap()));
        assert!(l.deny[0].contains("10.1.0.1".parse().unwrap()));
    }

    #[test]
    fn rejects_bad_subnet() {
        let yaml = r#"
http:
  - listen: "0.0.0.0:8080"
    allow: ["not-a-cidr"]
"#;
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_bad_bind_address() {
        let cfg = Config {
            uid: None,
            gid: None,
            listeners: vec![ListenerConfig {
                listen: "not-an-addr".to_string(),
                allow: vec![],
                deny: vec![],
                rate_limit: RateLimitConfig::default(),
            }],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/gatehouse-config.yaml")).unwrap();
        assert!(cfg.listeners.is_empty());
    }
}
