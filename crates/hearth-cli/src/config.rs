//! `hearth` configuration file.
//!
//! Looked up in order: `--config PATH`, `$HEARTH_CONFIG`, then
//! `~/.config/hearth/config.toml`. A missing default file means defaults.
//!
//! ```toml
//! cache_path = "/var/lib/hearth/cache.db"
//! remote_url = "https://example.com/api/"
//!
//! [agent]
//! may_update_window_ms = 5000
//!
//! [client]
//! debounce_ms = 75
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use hearth_agent::AgentConfig;
use hearth_client::ClientConfig;

pub const CONFIG_ENV: &str = "HEARTH_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    pub cache_path: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub agent: AgentConfig,
    pub client: ClientConfig,
}

/// `~/.config/hearth/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hearth").join("config.toml"))
}

/// `~/.local/share/hearth/cache.db`
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("hearth").join("cache.db"))
}

impl HearthConfig {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_file(Path::new(&path));
        }
        match config_file_path() {
            Some(path) if path.exists() => Self::load_file(&path),
            _ => {
                tracing::debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// The cache database path: explicit override, config, then the default.
    pub fn cache_path(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit.or(self.cache_path.as_deref()) {
            return Ok(path.to_path_buf());
        }
        default_cache_path().context("no data directory; pass --cache")
    }

    pub fn remote_url(&self) -> Result<&str> {
        match self.remote_url.as_deref() {
            Some(url) => Ok(url),
            None => bail!("remote_url is not configured"),
        }
    }
}
