//! Application configuration
//!
//! Settings live in `config.toml` under the platform config directory. Any
//! `TEAMS_CLI_*` environment variable overrides the matching file setting.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{AuthConfig, TokenStore};

pub const ENV_TENANT: &str = "TEAMS_CLI_TENANT";
pub const ENV_DISABLE_DEVICE_CODE: &str = "TEAMS_CLI_DISABLE_DEVICE_CODE";
pub const ENV_DISABLE_TERM_EVERYTHING: &str = "TEAMS_CLI_DISABLE_TERM_EVERYTHING";
pub const ENV_ELECTRON_OZONE: &str = "TEAMS_CLI_ELECTRON_OZONE";

/// Application configuration
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Azure AD tenant (defaults to `common`)
    pub tenant: Option<String>,
    /// Identity provider base URL
    pub authority: Option<String>,
    /// Where token files are kept (defaults to `~/.config/fossteams`)
    pub token_dir: Option<PathBuf>,
    /// Go straight to the login helper
    pub disable_device_code: bool,
    /// Never run the login helper inside term.everything
    pub disable_embedded_display: bool,
    /// Run Electron natively on Wayland
    pub native_wayland: bool,
    /// Overall deadline for the device code flow
    pub device_code_timeout_secs: Option<u64>,
}

/// `1`, `true` or `yes`, case-insensitive.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "teams-cli", "teams-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Log file used while the TUI owns the terminal
    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("teams-cli.log"))
    }

    /// Load the config file and apply environment overrides.
    pub fn load() -> Result<Self> {
        let config = Self::load_from(&Self::config_path()?)?;
        Ok(config.with_env(|key| env::var(key).ok()))
    }

    /// Load configuration from `path`; a missing file gives the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Overlay environment variables, read through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(tenant) = lookup(ENV_TENANT) {
            self.tenant = Some(tenant.trim().to_string());
        }
        if let Some(v) = lookup(ENV_DISABLE_DEVICE_CODE) {
            self.disable_device_code = is_truthy(&v);
        }
        if let Some(v) = lookup(ENV_DISABLE_TERM_EVERYTHING) {
            self.disable_embedded_display = is_truthy(&v);
        }
        if let Some(v) = lookup(ENV_ELECTRON_OZONE) {
            self.native_wayland = is_truthy(&v);
        }
        self
    }

    pub fn to_auth_config(&self) -> AuthConfig {
        let defaults = AuthConfig::default();
        AuthConfig {
            tenant: self
                .tenant
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or(defaults.tenant),
            authority: self.authority.clone().unwrap_or(defaults.authority),
            disable_device_code: self.disable_device_code,
            disable_embedded_display: self.disable_embedded_display,
            native_wayland: self.native_wayland,
            device_code_timeout: self
                .device_code_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.device_code_timeout),
            ..defaults
        }
    }

    pub fn token_store(&self) -> Result<TokenStore> {
        let dir = match &self.token_dir {
            Some(dir) => dir.clone(),
            None => TokenStore::default_dir().context("Could not determine home directory")?,
        };
        Ok(TokenStore::new(dir))
    }
}
