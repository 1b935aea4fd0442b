//! Persistent configuration for the battlevote CLI.
//!
//! Config file lives at `~/.config/battlevote/config.toml`. Every key is
//! optional; command-line flags (and their environment variables) win over
//! the file, and the file wins over built-in defaults.

use std::path::{Path, PathBuf};

use battlevote_sdk::ClientConfig;
use battlevote_sdk::types::ItemId;
use serde::{Deserialize, Serialize};

/// User configuration (persisted in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Relay WebSocket URL.
    pub relay_url: Option<String>,
    /// Item service base URL.
    pub api_url: Option<String>,
    /// Directory holding `battlevote/state.db`.
    pub data_dir: Option<PathBuf>,
    pub battlefield_size: Option<usize>,
    pub max_item_id: Option<ItemId>,
    /// Vote under this id instead of the device fingerprint.
    pub user_id: Option<String>,
    /// Use the in-process relay instead of the network.
    pub offline: Option<bool>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("battlevote")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl Config {
    /// Load `path`, falling back to defaults when it is missing or broken.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str(&s) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Bad config file {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Can't read {}: {e}", path.display());
                Self::default()
            }
        }
    }
}

/// Effective settings after merging CLI > config file > defaults.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub client: ClientConfig,
    pub data_dir: PathBuf,
    pub user_id: Option<String>,
    pub offline: bool,
}

impl Resolved {
    pub fn merge(cli: &super::Cli, config: &Config) -> Self {
        let defaults = ClientConfig::default();
        let client = ClientConfig {
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| config.relay_url.clone())
                .unwrap_or(defaults.relay_url),
            api_url: cli
                .api_url
                .clone()
                .or_else(|| config.api_url.clone())
                .unwrap_or(defaults.api_url),
            battlefield_size: cli
                .battlefield_size
                .or(config.battlefield_size)
                .unwrap_or(defaults.battlefield_size),
            max_item_id: cli
                .max_item_id
                .or(config.max_item_id)
                .unwrap_or(defaults.max_item_id),
            ..defaults
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| config.data_dir.clone())
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            client,
            data_dir,
            user_id: cli.user_id.clone().or_else(|| config.user_id.clone()),
            offline: cli.offline || config.offline.unwrap_or(false),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("battlevote").join("state.db")
    }
}
