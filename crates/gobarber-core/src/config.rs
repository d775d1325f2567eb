//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the API base URL, where the session is persisted and the
//! last email used to sign in.
//!
//! Configuration is stored at `~/.config/gobarber/config.json`. The
//! `GOBARBER_API_URL` and `GOBARBER_DATA_DIR` environment variables take
//! precedence over the file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "gobarber";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default API endpoint (the development backend)
const DEFAULT_API_BASE_URL: &str = "http://localhost:3333";

/// Default namespace for persisted storage keys
pub const DEFAULT_STORAGE_PREFIX: &str = "@GoBarber";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const ENV_API_URL: &str = "GOBARBER_API_URL";
const ENV_DATA_DIR: &str = "GOBARBER_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub storage_prefix: String,
    pub data_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
            data_dir: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            last_email: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults if missing) and apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Record `email` as the last sign-in email in the config file. Environment
    /// overrides are not written back.
    pub fn remember_email(email: &str) -> Result<()> {
        Self::remember_email_at(&Self::config_path()?, email)
    }

    fn remember_email_at(path: &std::path::Path, email: &str) -> Result<()> {
        let mut stored = Self::load_from(path)?;
        stored.last_email = Some(email.to_string());
        stored.save_to(path)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted key-value storage
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
