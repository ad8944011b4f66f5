//! # Configuration
//!
//! `burrow.toml` tunes where the environment lives and how sessions behave.
//! Every key is optional; a missing file means all defaults.
//!
//! ```toml
//! base_dir = "/data/burrow"
//! assets_dir = "/opt/burrow/assets"
//! setup_timeout_secs = 300
//! fallback_exit_code = 126
//! fallback_delay_ms = 500
//! fallback_shell = "/bin/sh"
//! respawn_on_empty = true
//! scrollback_bytes = 262144
//! terminal_cols = 80
//! terminal_rows = 24
//! exit_drain_ms = 500
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub const CONFIG_FILE_NAME: &str = "burrow.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BurrowConfig {
    /// Environment root; the per-user data directory when unset
    pub base_dir: Option<PathBuf>,
    /// Directory holding the bundled assets; `assets` next to the executable
    /// when unset
    pub assets_dir: Option<PathBuf>,
    pub setup_timeout_secs: u64,
    /// Exit code of a sandboxed session that triggers the shell fallback
    pub fallback_exit_code: i32,
    pub fallback_delay_ms: u64,
    pub fallback_shell: String,
    /// Open a fresh default session when the last one is closed
    pub respawn_on_empty: bool,
    pub scrollback_bytes: usize,
    pub terminal_cols: u16,
    pub terminal_rows: u16,
    /// How long an exiting session waits for its remaining output
    pub exit_drain_ms: u64,
}

impl Default for BurrowConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            assets_dir: None,
            setup_timeout_secs: 300,
            fallback_exit_code: 126,
            fallback_delay_ms: 500,
            fallback_shell: "/bin/sh".to_string(),
            respawn_on_empty: true,
            scrollback_bytes: 256 * 1024,
            terminal_cols: 80,
            terminal_rows: 24,
            exit_drain_ms: 500,
        }
    }
}

impl BurrowConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Load `burrow.toml` from the per-user config directory.
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.setup_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "setup_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.fallback_shell.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "fallback_shell",
                reason: "must not be empty".to_string(),
            });
        }
        if self.terminal_cols == 0 || self.terminal_rows == 0 {
            return Err(ConfigError::Invalid {
                key: "terminal_cols/terminal_rows",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    /// Configured assets directory, else `assets` beside the running binary.
    pub fn resolve_assets_dir(&self) -> PathBuf {
        if let Some(dir) = &self.assets_dir {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("assets")))
            .unwrap_or_else(|| PathBuf::from("assets"))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "Burrow", "burrow").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
