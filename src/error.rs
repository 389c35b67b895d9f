use std::fmt;

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    Parse(serde_yaml::Error),
    InvalidSubnet(String),
    InvalidBind(String),
    UnsupportedFormat(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {}", e),
            ConfigError::InvalidSubnet(s) => write!(f, "invalid subnet: {}", s),
            ConfigError::InvalidBind(s) => write!(f, "invalid listen address: {}", s),
            ConfigError::UnsupportedFormat(s) => write!(f, "unsupported config format: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Read(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Errors raised while running a listener or serving a single connection.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ProxyError {
    Bind(String, std::io::Error),
    Dial(String, std::io::Error),
    BadRequest(String),
    RoundTrip(String),
    Shutdown,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Bind(addr, e) => write!(f, "bind failed, addr={}: {}", addr, e),
            ProxyError::Dial(host, e) => write!(f, "dial failed, host={}: {}", host, e),
            ProxyError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ProxyError::RoundTrip(msg) => write!(f, "round trip failed: {}", msg),
            ProxyError::Shutdown => write!(f, "shutting down"),
        }
    }
}

impl std::error::Error for ProxyError {}
