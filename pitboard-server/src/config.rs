//! Server configuration
//!
//! Read from the JSON file named by `PITBOARD_CONFIG` when set; every field
//! has a default, so the file may be partial or absent. `PITBOARD_BIND`
//! overrides the bind address.

use anyhow::{Context, Result};
use pitboard_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "PITBOARD_CONFIG";
pub const BIND_ENV: &str = "PITBOARD_BIND";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Engine instances hosted in this process
    pub instances: usize,
    pub persistence_enabled: bool,
    /// Snapshot directory; defaults to the platform data dir
    pub store_dir: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9110".to_string(),
            instances: 1,
            persistence_enabled: true,
            store_dir: None,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from the environment
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Ok(bind) = std::env::var(BIND_ENV) {
            config.bind = bind;
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("Invalid bind address {:?}", self.bind))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pitboard")
        })
    }
}
