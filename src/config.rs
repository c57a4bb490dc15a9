use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineSettings;
use crate::limits::{DEFAULT_REQUESTER_CAP, MAX_REQUESTER_CAP};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var}: {reason}")]
    OutOfRange { var: &'static str, reason: &'static str },
}

/// Server configuration, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Connections authenticated with this password may cancel any booking.
    pub operator_password: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub default_cap: u32,
    pub lock_timeout: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            operator_password: None,
            max_connections: 256,
            compact_threshold: 1000,
            default_cap: DEFAULT_REQUESTER_CAP,
            lock_timeout: Duration::from_millis(2000),
            metrics_port: None,
        }
    }
}

fn parse<T: FromStr>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: v }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let lock_timeout_ms: u64 = parse(
            "SLOTBOOK_LOCK_TIMEOUT_MS",
            get("SLOTBOOK_LOCK_TIMEOUT_MS"),
            d.lock_timeout.as_millis() as u64,
        )?;
        let metrics_port = match get("SLOTBOOK_METRICS_PORT") {
            None => None,
            Some(v) => Some(parse("SLOTBOOK_METRICS_PORT", Some(v), 0u16)?),
        };

        let config = Self {
            bind: get("SLOTBOOK_BIND").unwrap_or(d.bind),
            port: parse("SLOTBOOK_PORT", get("SLOTBOOK_PORT"), d.port)?,
            data_dir: get("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("SLOTBOOK_PASSWORD").unwrap_or(d.password),
            operator_password: get("SLOTBOOK_OPERATOR_PASSWORD").filter(|p| !p.is_empty()),
            max_connections: parse(
                "SLOTBOOK_MAX_CONNECTIONS",
                get("SLOTBOOK_MAX_CONNECTIONS"),
                d.max_connections,
            )?,
            compact_threshold: parse(
                "SLOTBOOK_COMPACT_THRESHOLD",
                get("SLOTBOOK_COMPACT_THRESHOLD"),
                d.compact_threshold,
            )?,
            default_cap: parse("SLOTBOOK_DEFAULT_CAP", get("SLOTBOOK_DEFAULT_CAP"), d.default_cap)?,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            metrics_port,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::OutOfRange {
                var: "SLOTBOOK_MAX_CONNECTIONS",
                reason: "must be at least 1",
            });
        }
        if self.default_cap > MAX_REQUESTER_CAP {
            return Err(ConfigError::OutOfRange {
                var: "SLOTBOOK_DEFAULT_CAP",
                reason: "above the maximum requester cap",
            });
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                var: "SLOTBOOK_LOCK_TIMEOUT_MS",
                reason: "must be positive",
            });
        }
        if self.operator_password.as_deref() == Some(self.password.as_str()) {
            return Err(ConfigError::OutOfRange {
                var: "SLOTBOOK_OPERATOR_PASSWORD",
                reason: "must differ from SLOTBOOK_PASSWORD",
            });
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_cap: self.default_cap,
            lock_timeout: self.lock_timeout,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
