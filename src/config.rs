//! Bridge configuration loading.
//!
//! The stream directory (name → address) is an explicit, read-only
//! configuration object loaded once and passed into the bridge at
//! construction. Unknown names are simply absent from the map.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the WebSocket bridge.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Address the bridge listens on for WebSocket clients.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Stream directory: name → `tcp://host:port` stream address.
    #[serde(default)]
    pub streams: HashMap<String, String>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        let mut streams = HashMap::new();
        streams.insert("test1".to_string(), "tcp://127.0.0.1:1234".to_string());
        Self {
            listen: default_listen(),
            streams,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (`PTYCAST_LISTEN`).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("PTYCAST_LISTEN") {
            self.listen = listen;
        }
    }

    /// Resolve a stream name to its address, if configured.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.streams.get(name).map(String::as_str)
    }
}
