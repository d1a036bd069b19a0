//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend location, idle-logout timings, and where the access credential
//! is kept between runs.
//!
//! Configuration is stored at `~/.config/bizdesk/config.json`. Values can be
//! overridden with `BIZDESK_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::{ApiSettings, DEFAULT_BASE_URL};
use crate::auth::{CredentialStore, FileStore, KeyringStore, MemoryStore};
use crate::idle::IdleConfig;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "bizdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_API_URL: &str = "BIZDESK_API_URL";
const ENV_IDLE_TIMEOUT: &str = "BIZDESK_IDLE_TIMEOUT_SECS";
const ENV_WARNING_WINDOW: &str = "BIZDESK_WARNING_WINDOW_SECS";
const ENV_CREDENTIAL_STORAGE: &str = "BIZDESK_CREDENTIAL_STORAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStorage {
    Keyring,
    #[default]
    File,
    Memory,
}

impl FromStr for CredentialStorage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => bail!("Unknown credential storage '{}' (expected keyring, file or memory)", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub login_path: String,
    pub register_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub idle_timeout_secs: u64,
    pub warning_window_secs: u64,
    pub request_timeout_secs: u64,
    pub credential_storage: CredentialStorage,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let api = ApiSettings::default();
        let idle = IdleConfig::default();
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            login_path: api.login_path,
            register_path: api.register_path,
            refresh_path: api.refresh_path,
            logout_path: api.logout_path,
            idle_timeout_secs: idle.idle_timeout.as_secs(),
            warning_window_secs: idle.warning_window.as_secs(),
            request_timeout_secs: api.request_timeout.as_secs(),
            credential_storage: CredentialStorage::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load from disk (or defaults), apply environment overrides, validate.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(secs) = lookup(ENV_IDLE_TIMEOUT) {
            self.idle_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number of seconds", ENV_IDLE_TIMEOUT))?;
        }
        if let Some(secs) = lookup(ENV_WARNING_WINDOW) {
            self.warning_window_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number of seconds", ENV_WARNING_WINDOW))?;
        }
        if let Some(storage) = lookup(ENV_CREDENTIAL_STORAGE) {
            self.credential_storage = storage.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            bail!("idle_timeout_secs must be greater than zero");
        }
        if self.warning_window_secs >= self.idle_timeout_secs {
            bail!(
                "warning_window_secs ({}) must be shorter than idle_timeout_secs ({})",
                self.warning_window_secs,
                self.idle_timeout_secs
            );
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn idle_config(&self) -> IdleConfig {
        IdleConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            warning_window: Duration::from_secs(self.warning_window_secs),
        }
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            base_url: self.api_base_url.clone(),
            login_path: self.login_path.clone(),
            register_path: self.register_path.clone(),
            refresh_path: self.refresh_path.clone(),
            logout_path: self.logout_path.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        let store: Arc<dyn CredentialStore> = match self.credential_storage {
            CredentialStorage::Keyring => Arc::new(KeyringStore::new()),
            CredentialStorage::File => Arc::new(FileStore::new(Self::cache_dir()?)),
            CredentialStorage::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}
