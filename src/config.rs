//! Process configuration: database location and initial settings

use crate::error::Error;
use crate::settings::Settings;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Default SQLite database URL
pub const DEFAULT_DATABASE_URL: &str = "sqlite://proxy-pool.db";

/// Config file looked up when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "proxy-pool.toml";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,
    /// Initial dynamic settings
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            settings: Settings::default(),
        }
    }
}

impl Config {
    /// Loads the config from `path`, or from `./proxy-pool.toml` if present,
    /// otherwise starts from defaults. Environment variables override either.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                tracing::info!(path = %path.display(), "loading config");
                Self::from_toml(&contents)?
            }
            None => match fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(contents) => {
                    tracing::info!(path = DEFAULT_CONFIG_FILE, "loading config");
                    Self::from_toml(&contents)?
                }
                Err(_) => Self::default(),
            },
        };

        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("PROXY_POOL_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(value) = var("PROXY_POOL_CHECKING_ENABLED") {
            self.settings.checking_enabled = parse_env("PROXY_POOL_CHECKING_ENABLED", &value)?;
        }
        if let Some(value) = var("PROXY_POOL_MAX_PROXIES_CHECK") {
            self.settings.max_proxies_check = parse_env("PROXY_POOL_MAX_PROXIES_CHECK", &value)?;
        }
        if let Some(value) = var("PROXY_POOL_PROXY_CHECK_TIMEOUT") {
            self.settings.proxy_check_timeout =
                parse_env("PROXY_POOL_PROXY_CHECK_TIMEOUT", &value)?;
        }
        if let Some(value) = var("PROXY_POOL_LIVE_LAST_OK_MINUTES") {
            self.settings.live_last_ok_minutes =
                parse_env("PROXY_POOL_LIVE_LAST_OK_MINUTES", &value)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} has an invalid value: {value}")))
}
