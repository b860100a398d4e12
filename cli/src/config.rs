//! Config file loading for the `conduit` binary.
//!
//! The file is TOML. `[client]` holds a [`ClientConfig`]; `[languages]` maps
//! file extensions to language ids:
//!
//! ```toml
//! [client]
//! worker = { command = "desc-worker", args = ["--stdio"] }
//! handshake_timeout_secs = 10
//!
//! [languages]
//! desc = "desc"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

use conduit_types::ClientConfig;
use serde::Deserialize;

/// Overrides the default config location.
pub const CONFIG_ENV: &str = "CONDUIT_CONFIG";

#[derive(Debug, Deserialize)]
pub struct ConduitConfig {
    pub client: ClientConfig,
    #[serde(default)]
    pub languages: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

impl ConduitConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Language id for a file: the `[languages]` entry for its extension,
    /// else the extension itself, else `plaintext`.
    pub fn language_for(&self, path: &Path) -> String {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            return "plaintext".to_string();
        };
        self.languages
            .get(ext)
            .cloned()
            .unwrap_or_else(|| ext.to_ascii_lowercase())
    }
}

/// `$CONDUIT_CONFIG`, else `~/.conduit/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".conduit").join("config.toml"))
}
