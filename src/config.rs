use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::engine::EngineSettings;

/// Server configuration, read from `COURTD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub pending_ttl: Duration,
    /// Facility wall-clock offset from UTC, in minutes.
    pub utc_offset_minutes: i32,
    pub reaper_interval: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables take their default;
    /// set but unparsable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let utc_offset_minutes: i32 = parse(&lookup, "COURTD_UTC_OFFSET_MINUTES")?.unwrap_or(0);
        if !(-18 * 60..=18 * 60).contains(&utc_offset_minutes) {
            return Err(ConfigError::Invalid {
                var: "COURTD_UTC_OFFSET_MINUTES",
                value: utc_offset_minutes.to_string(),
            });
        }
        let pending_ttl_secs: u64 = parse(&lookup, "COURTD_PENDING_TTL_SECS")?.unwrap_or(86_400);
        let reaper_interval_secs: u64 =
            parse(&lookup, "COURTD_REAPER_INTERVAL_SECS")?.unwrap_or(5);
        if reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "COURTD_REAPER_INTERVAL_SECS",
                value: "0".into(),
            });
        }
        Ok(Self {
            port: parse(&lookup, "COURTD_PORT")?.unwrap_or(5433),
            bind: lookup("COURTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("COURTD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("COURTD_PASSWORD").unwrap_or_else(|| "courtd".into()),
            max_connections: parse(&lookup, "COURTD_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parse(&lookup, "COURTD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            pending_ttl: Duration::from_secs(pending_ttl_secs),
            utc_offset_minutes,
            reaper_interval: Duration::from_secs(reaper_interval_secs),
            tls_cert: lookup("COURTD_TLS_CERT"),
            tls_key: lookup("COURTD_TLS_KEY"),
            metrics_port: parse(&lookup, "COURTD_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            pending_ttl_ms: i64::try_from(self.pending_ttl.as_millis()).unwrap_or(i64::MAX),
            // Range checked in `from_lookup`.
            utc_offset: FixedOffset::east_opt(self.utc_offset_minutes * 60)
                .unwrap_or(EngineSettings::default().utc_offset),
            ..EngineSettings::default()
        }
    }
}

fn parse<T: FromStr>(
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
