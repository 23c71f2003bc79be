use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use log::{info, warn};

use crate::error::ConfigError;

const DEV_SESSION_SECRET: &str = "lounge-development-secret";

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub name: String,
    pub port: u16,
}

impl DatabaseConfig {
    /// Remote hosts get TLS, local development databases do not.
    pub fn wants_tls(&self) -> bool {
        !matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub production: bool,
    pub session_secret: String,
    pub database: DatabaseConfig,
    pub static_dir: PathBuf,
    pub views_dir: PathBuf,
    pub tls: Option<TlsPaths>,
    pub trust_proxy: bool,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let production = lookup("NODE_ENV").is_some_and(|v| v == "production");

        let session_secret = match lookup("SESSION_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None if production => return Err(ConfigError::Missing("SESSION_SECRET")),
            None => {
                warn!("SESSION_SECRET not set, using the development fallback");
                DEV_SESSION_SECRET.to_string()
            }
        };

        let tls = match (lookup("TLS_CERT_PATH"), lookup("TLS_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            (None, None) => None,
            _ => {
                warn!("Only one of TLS_CERT_PATH/TLS_KEY_PATH is set, serving plain HTTP");
                None
            }
        };

        Ok(Self {
            port: try_load(&lookup, "PORT", "4444")?,
            production,
            session_secret,
            database: DatabaseConfig {
                host: try_load(&lookup, "DB_HOST", "localhost")?,
                user: try_load(&lookup, "DB_USER", "root")?,
                password: lookup("DB_PASSWORD").unwrap_or_default(),
                name: try_load(&lookup, "DB_NAME", "login_db")?,
                port: try_load(&lookup, "DB_PORT", "3306")?,
            },
            static_dir: try_load::<String, _>(&lookup, "STATIC_DIR", "public")?.into(),
            views_dir: try_load::<String, _>(&lookup, "VIEWS_DIR", "views")?.into(),
            tls,
            trust_proxy: try_load(&lookup, "TRUST_PROXY", "false")?,
        })
    }
}

fn try_load<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}
