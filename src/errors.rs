use std::fmt;
use std::fmt::Formatter;

/// Reasons a configuration file is rejected at startup.
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "ConfigError: cannot read file: {}", e),
            ConfigError::Parse(e) => write!(f, "ConfigError: malformed json: {}", e),
            ConfigError::Invalid(e) => write!(f, "ConfigError: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl From<&str> for ConfigError {
    fn from(e: &str) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

impl From<String> for ConfigError {
    fn from(e: String) -> Self {
        ConfigError::Invalid(e)
    }
}
