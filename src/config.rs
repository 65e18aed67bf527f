use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("SHIFTBOOK_TLS_CERT and SHIFTBOOK_TLS_KEY must be set together, or neither")]
    PartialTls,
}

/// PEM files for the TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last rewrite that trigger compaction.
    pub compact_threshold: u64,
    pub tls: Option<TlsFiles>,
    pub metrics_port: Option<u16>,
    pub drain_timeout: Duration,
}

impl ServerConfig {
    /// | Env Var                        | Default     |
    /// |--------------------------------|-------------|
    /// | `SHIFTBOOK_BIND`               | `0.0.0.0`   |
    /// | `SHIFTBOOK_PORT`               | `5433`      |
    /// | `SHIFTBOOK_DATA_DIR`           | `./data`    |
    /// | `SHIFTBOOK_PASSWORD`           | `shiftbook` |
    /// | `SHIFTBOOK_MAX_CONNECTIONS`    | `256`       |
    /// | `SHIFTBOOK_COMPACT_THRESHOLD`  | `1000`      |
    /// | `SHIFTBOOK_TLS_CERT` / `_KEY`  | unset       |
    /// | `SHIFTBOOK_METRICS_PORT`       | unset       |
    /// | `SHIFTBOOK_DRAIN_TIMEOUT_SECS` | `10`        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |var: &str, default: &str| lookup(var).unwrap_or_else(|| default.to_string());

        let tls = match (lookup("SHIFTBOOK_TLS_CERT"), lookup("SHIFTBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Self {
            bind: text("SHIFTBOOK_BIND", "0.0.0.0"),
            port: parse(&lookup, "SHIFTBOOK_PORT", "port number")?.unwrap_or(5433),
            data_dir: text("SHIFTBOOK_DATA_DIR", "./data").into(),
            password: text("SHIFTBOOK_PASSWORD", "shiftbook"),
            max_connections: parse(&lookup, "SHIFTBOOK_MAX_CONNECTIONS", "connection count")?
                .unwrap_or(256),
            compact_threshold: parse(&lookup, "SHIFTBOOK_COMPACT_THRESHOLD", "append count")?
                .unwrap_or(1000),
            tls,
            metrics_port: parse(&lookup, "SHIFTBOOK_METRICS_PORT", "port number")?,
            drain_timeout: Duration::from_secs(
                parse(&lookup, "SHIFTBOOK_DRAIN_TIMEOUT_SECS", "number of seconds")?.unwrap_or(10),
            ),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value,
        })
}
