//! Configuration for the appearance engine.
//!
//! Loaded from `appearance_config.json` with support for an environment
//! variable override.

use std::{
    env, fs, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use bevy::prelude::Resource;
use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_APPEARANCE_CONFIG: &str = include_str!("data/appearance_config.json");

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppearanceConfig {
    /// Deepest overlay nesting accepted by canonicalization.
    pub max_overlay_depth: usize,
    /// World units per tile, in pixels.
    pub tile_size: u32,
    /// Pending load callbacks for one id before the client cache warns.
    pub pending_callback_warn_threshold: usize,
    pub server_bind: SocketAddr,
    /// Chebyshev radius, in tiles, of the per-viewer visibility pass.
    pub visibility_range: u32,
}

impl Default for AppearanceConfig {
    fn default() -> Self {
        Self {
            max_overlay_depth: 16,
            tile_size: 32,
            pending_callback_warn_threshold: 1024,
            server_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 41100),
            visibility_range: 8,
        }
    }
}

impl AppearanceConfig {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            serde_json::from_str(BUILTIN_APPEARANCE_CONFIG)
                .expect("builtin appearance config should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppearanceConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| AppearanceConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = AppearanceConfig::from_json_str(&contents)?;
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum AppearanceConfigError {
    #[error("failed to parse appearance config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read appearance config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Handle for accessing the appearance configuration.
#[derive(Resource, Debug, Clone)]
pub struct AppearanceConfigHandle(pub Arc<AppearanceConfig>);

impl AppearanceConfigHandle {
    pub fn new(config: Arc<AppearanceConfig>) -> Self {
        Self(config)
    }

    pub fn get(&self) -> Arc<AppearanceConfig> {
        Arc::clone(&self.0)
    }
}

impl Default for AppearanceConfigHandle {
    fn default() -> Self {
        Self(AppearanceConfig::builtin())
    }
}

/// Load the appearance configuration from `APPEARANCE_CONFIG_PATH`, falling
/// back to the builtin copy.
pub fn load_appearance_config_from_env() -> Arc<AppearanceConfig> {
    if let Some(path) = env::var("APPEARANCE_CONFIG_PATH").ok().map(PathBuf::from) {
        match AppearanceConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "appearance::config",
                    path = %path.display(),
                    "appearance_config.loaded=file"
                );
                return Arc::new(config);
            }
            Err(err) => {
                tracing::warn!(
                    target: "appearance::config",
                    path = %path.display(),
                    error = %err,
                    "appearance_config.load_failed"
                );
            }
        }
    }

    tracing::info!(
        target: "appearance::config",
        "appearance_config.loaded=builtin"
    );
    AppearanceConfig::builtin()
}
