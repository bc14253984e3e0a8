//! Optional TOML configuration file. Command-line flags overlay whatever
//! the file provides; a bad file refuses to start the server.

use std::path::{Path, PathBuf};

use thiserror::Error;

use ferrite_common::config::ServerConfig;
use ferrite_common::FerriteError;

pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
    tracing::info!(path = %path.display(), "Loading configuration file");
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {detail}", path.display())]
    Parse { path: PathBuf, detail: String },
}

impl From<ConfigError> for FerriteError {
    fn from(e: ConfigError) -> Self {
        FerriteError::Config(e.to_string())
    }
}
