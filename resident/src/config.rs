use serde_derive::Deserialize;
use std::env;
use std::fs;
use thiserror::Error;

use crate::core::request::DEFAULT_MAX_BODY_SIZE;
use crate::db::DbConfig;
use crate::session::SessionConfig;

pub const SERVER_SOFTWARE: &str = concat!("resident/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} has an invalid value {value:?}")]
    InvalidVar { name: String, value: String },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub app_id: String,
    /// Verbose error pages and the access log.
    pub debug: bool,
    /// Drop buffered output before rendering an error page.
    pub discard_existing_output: bool,
    /// Bytes held back for the fatal fault path, `0` disables the reserve.
    pub memory_reserve_size: usize,
    /// Write the access line after each request in debug mode.
    pub access_log: bool,
    pub server_software: String,
    /// Sign and validate cookies with this key when set.
    pub cookie_validation_key: Option<String>,
    /// Record every panic as the last error through a process-wide hook.
    pub record_panics: bool,
    /// Largest request body the built-in server buffers.
    pub max_body_size: usize,
    pub session: SessionConfig,
    pub db: DbConfig,
}

impl Default for WorkerConfig {
    fn default() -> WorkerConfig {
        WorkerConfig {
            app_id: "resident".to_owned(),
            debug: false,
            discard_existing_output: true,
            memory_reserve_size: 262_144,
            access_log: true,
            server_software: SERVER_SOFTWARE.to_owned(),
            cookie_validation_key: None,
            record_panics: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            session: SessionConfig::default(),
            db: DbConfig::default(),
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidVar {
            name: name.to_owned(),
            value: value.to_owned(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidVar {
        name: name.to_owned(),
        value: value.to_owned(),
    })
}

impl WorkerConfig {
    pub fn from_json_str(document: &str) -> Result<WorkerConfig, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }

    ///
    /// Configuration from the process environment. `RESIDENT_CONFIG` names a
    /// JSON file loaded first; the other `RESIDENT_*` variables override it.
    ///
    pub fn from_env() -> Result<WorkerConfig, ConfigError> {
        WorkerConfig::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<WorkerConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("RESIDENT_CONFIG") {
            Some(path) => {
                let document = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                WorkerConfig::from_json_str(&document)?
            }
            None => WorkerConfig::default(),
        };

        if let Some(value) = lookup("RESIDENT_APP_ID") {
            config.app_id = value;
        }
        if let Some(value) = lookup("RESIDENT_DEBUG") {
            config.debug = parse_bool("RESIDENT_DEBUG", &value)?;
        }
        if let Some(value) = lookup("RESIDENT_ACCESS_LOG") {
            config.access_log = parse_bool("RESIDENT_ACCESS_LOG", &value)?;
        }
        if let Some(value) = lookup("RESIDENT_MEMORY_RESERVE") {
            config.memory_reserve_size = parse_number("RESIDENT_MEMORY_RESERVE", &value)?;
        }
        if let Some(value) = lookup("RESIDENT_COOKIE_KEY") {
            config.cookie_validation_key = Some(value).filter(|v| !v.is_empty());
        }
        if let Some(value) = lookup("RESIDENT_MAX_BODY_SIZE") {
            config.max_body_size = parse_number("RESIDENT_MAX_BODY_SIZE", &value)?;
        }
        if let Some(value) = lookup("RESIDENT_SESSION_NAME") {
            config.session.name = value;
        }
        if let Some(value) = lookup("RESIDENT_SESSION_TIMEOUT") {
            config.session.timeout = parse_number("RESIDENT_SESSION_TIMEOUT", &value)?;
        }

        Ok(config)
    }
}
