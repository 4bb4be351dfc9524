//! Server settings, read once from `CANCHAS_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::FixedOffset;
use thiserror::Error;

use crate::calendar::Calendar;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub admin_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub utc_offset_hours: i32,
    pub open_hour: u32,
    pub close_hour: u32,
    pub tls: Option<TlsPaths>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls = match (lookup("CANCHAS_TLS_CERT"), lookup("CANCHAS_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => {
                return Err(ConfigError::Inconsistent(
                    "both CANCHAS_TLS_CERT and CANCHAS_TLS_KEY must be set, or neither",
                ));
            }
        };

        let config = Config {
            port: parsed(&lookup, "CANCHAS_PORT")?.unwrap_or(5433),
            bind: lookup("CANCHAS_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("CANCHAS_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("CANCHAS_PASSWORD").unwrap_or_else(|| "canchas".into()),
            admin_password: lookup("CANCHAS_ADMIN_PASSWORD").unwrap_or_else(|| "canchas-admin".into()),
            max_connections: parsed(&lookup, "CANCHAS_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "CANCHAS_COMPACT_THRESHOLD")?.unwrap_or(1000),
            utc_offset_hours: parsed(&lookup, "CANCHAS_UTC_OFFSET_HOURS")?.unwrap_or(-6),
            open_hour: parsed(&lookup, "CANCHAS_OPEN_HOUR")?.unwrap_or(8),
            close_hour: parsed(&lookup, "CANCHAS_CLOSE_HOUR")?.unwrap_or(23),
            tls,
            metrics_port: parsed(&lookup, "CANCHAS_METRICS_PORT")?,
        };

        if config.open_hour >= config.close_hour || config.close_hour > 24 {
            return Err(ConfigError::Inconsistent(
                "CANCHAS_OPEN_HOUR must be before CANCHAS_CLOSE_HOUR, which is at most 24",
            ));
        }
        if config.max_connections == 0 {
            return Err(ConfigError::Inconsistent("CANCHAS_MAX_CONNECTIONS must be positive"));
        }
        if config.password == config.admin_password {
            return Err(ConfigError::Inconsistent(
                "CANCHAS_PASSWORD and CANCHAS_ADMIN_PASSWORD must differ",
            ));
        }
        config.offset()?;
        Ok(config)
    }

    fn offset(&self) -> Result<FixedOffset, ConfigError> {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::Invalid {
                var: "CANCHAS_UTC_OFFSET_HOURS",
                value: self.utc_offset_hours.to_string(),
            })
    }

    pub fn calendar(&self) -> Result<Calendar, ConfigError> {
        Ok(Calendar::new(self.offset()?, self.open_hour, self.close_hour))
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("canchas.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
