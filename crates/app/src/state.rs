use std::{fs, path::PathBuf};

use common::prelude::ClientConfig;
use serde::{Deserialize, Serialize};
use url::Url;

pub const APP_NAME: &str = "epad";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Gateway WebSocket URL; the DSN is attached as a query parameter
    #[serde(default = "default_backend")]
    pub backend: Url,
    /// Connection string used when none is given on the command line
    #[serde(default)]
    pub dsn: Option<String>,
    /// Default log directive, overridden by `--log-level` and `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_backend() -> Url {
    Url::parse("ws://localhost:8080/").expect("default backend url is valid")
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            dsn: None,
            log_level: default_log_level(),
            client: ClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the config file, which may not exist
    pub config_path: PathBuf,
    /// Loaded configuration, or defaults when there is no config file
    pub config: AppConfig,
}

impl AppState {
    /// Get the epad directory path (custom or default ~/.epad)
    pub fn epad_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let epad_dir = Self::epad_dir(custom_path)?;
        let config_path = epad_dir.join(CONFIG_FILE_NAME);

        let config = if config_path.exists() {
            let config_toml = fs::read_to_string(&config_path)?;
            toml::from_str(&config_toml)?
        } else {
            AppConfig::default()
        };

        Ok(Self {
            config_path,
            config,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
