//! Server settings as read from the environment or a JSON document.

use serde::{Deserialize, Serialize};

fn default_log_level() -> String {
    "info".into()
}

fn default_body_limit() -> usize {
    2 * 1024 * 1024
}

fn default_max_connections() -> u32 {
    5
}

fn default_auth_header() -> String {
    "authorization".into()
}

fn default_auth_scheme() -> String {
    "Bearer".into()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    /// Prefix joined in front of every controller path.
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Largest accepted request body, in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
    /// Absent: models are registered but no pool is opened.
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
    #[serde(default)]
    pub auth: Option<AuthSettings>,
}

impl ServerSettings {
    pub fn new(port: u16) -> Self {
        ServerSettings {
            port,
            base_path: String::new(),
            log_level: default_log_level(),
            body_limit: default_body_limit(),
            database: None,
            auth: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Where [`crate::policy::BearerToken`] looks for credentials.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthSettings {
    #[serde(default = "default_auth_header")]
    pub header: String,
    #[serde(default = "default_auth_scheme")]
    pub scheme: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            header: default_auth_header(),
            scheme: default_auth_scheme(),
        }
    }
}
