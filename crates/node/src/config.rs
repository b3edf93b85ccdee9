use std::path::{Path, PathBuf};
use std::time::Duration;

use rockmesh_presence::{PositioningMode, PresenceConfig, PresenceError};
use rockmesh_sensor::GeoSample;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Invalid(#[from] PresenceError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// TCP port for peer links, 0 picks any free port
    pub port: u16,
    pub presence: PresenceConfig,
    /// Where the mock geolocation source starts its walk
    pub origin: GeoSample,
    pub sample_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: 0,
            presence: PresenceConfig::default(),
            origin: GeoSample::new(0.0, 0.0),
            sample_interval_ms: 1_000,
        }
    }
}

impl NodeConfig {
    /// Reads the config file (explicit path, or the per-user default when it
    /// exists) and applies command line overrides on top.
    pub fn load(
        path: Option<PathBuf>,
        name: Option<String>,
        port: Option<u16>,
        mode: Option<PositioningMode>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => match default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        if let Some(name) = name {
            config.name = name;
        }
        if let Some(port) = port {
            config.port = port;
        }
        if let Some(mode) = mode {
            config.presence.mode = mode;
        }

        config.presence.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

fn default_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| format!("rock-{}", &uuid::Uuid::new_v4().to_string()[..8]))
}

fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "rockmesh", "rockmeshd")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}
