//! Engine configuration loader for Weft.
//!
//! Reads `weft.toml` from the data directory (`~/.weft/` in production) and
//! deserializes it into [`EngineConfig`]. Falls back to defaults when the file
//! is missing or malformed.

use std::path::{Path, PathBuf};

use weft_types::config::EngineConfig;

/// File name of the engine config inside the data directory.
pub const CONFIG_FILE: &str = "weft.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Returns the data directory from `WEFT_DATA_DIR`, falling back to `~/.weft`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("WEFT_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".weft")
        }
    }
}

/// Read and parse a config file without any fallback.
pub async fn read_engine_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load engine configuration from `{data_dir}/weft.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    match read_engine_config(&config_path).await {
        Ok(config) => config,
        Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    }
}
