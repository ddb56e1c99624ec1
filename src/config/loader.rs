//! Load settings from the process environment (with `.env`) or from JSON.

use super::types::{AuthSettings, DatabaseSettings, ServerSettings};
use crate::error::ConfigError;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

fn parse<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(None),
        Some(s) => s.trim().parse::<T>().map(Some).map_err(|e| ConfigError::InvalidSetting {
            key,
            reason: format!("'{}': {}", s, e),
        }),
    }
}

impl ServerSettings {
    /// Read `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build settings from a variable lookup. `PORT` is required.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse::<u16>("PORT", var("PORT"))?.ok_or(ConfigError::InvalidSetting {
            key: "PORT",
            reason: "not set".into(),
        })?;
        let mut settings = ServerSettings::new(port);
        if let Some(base_path) = var("BASE_PATH") {
            settings.base_path = base_path;
        }
        if let Some(level) = var("LOG_LEVEL") {
            settings.log_level = level;
        }
        if let Some(limit) = parse::<usize>("BODY_LIMIT", var("BODY_LIMIT"))? {
            settings.body_limit = limit;
        }
        if let Some(url) = var("DATABASE_URL").filter(|u| !u.is_empty()) {
            let mut database = DatabaseSettings {
                url,
                max_connections: 5,
            };
            if let Some(n) = parse::<u32>("DATABASE_MAX_CONNECTIONS", var("DATABASE_MAX_CONNECTIONS"))? {
                database.max_connections = n;
            }
            settings.database = Some(database);
        }
        let header = var("AUTH_HEADER");
        let scheme = var("AUTH_SCHEME");
        if header.is_some() || scheme.is_some() {
            let defaults = AuthSettings::default();
            settings.auth = Some(AuthSettings {
                header: header.map(|h| h.to_ascii_lowercase()).unwrap_or(defaults.header),
                scheme: scheme.unwrap_or(defaults.scheme),
            });
        }
        Ok(settings)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins; otherwise `trellis=<log_level>`.
/// Safe to call more than once.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("trellis={}", log_level)));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
