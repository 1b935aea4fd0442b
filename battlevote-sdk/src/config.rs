//! Client configuration.
//!
//! Every value has a fixed default; consumers override individual fields
//! (the CLI maps its flags, environment and config file onto this struct).

use std::time::Duration;

use crate::types::ItemId;

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080/ws";
/// Default base URL of the item service (`GET {base}/items/{id}`).
pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";
/// Number of items in a battle.
pub const DEFAULT_BATTLEFIELD_SIZE: usize = 2;
/// Highest item id a random battle may draw.
pub const DEFAULT_MAX_ITEM_ID: ItemId = 248;
/// Battle shown on first run.
pub const DEFAULT_BATTLE_ITEMS: [ItemId; 3] = [1, 25, 44];

/// Configuration for the channel, engine and session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Item service base URL.
    pub api_url: String,
    /// Items per random battle, and the minimum for a restored battle.
    pub battlefield_size: usize,
    /// Random battles draw from `1..=max_item_id`.
    pub max_item_id: ItemId,
    /// Give up on `connect()` after this long.
    pub connect_timeout: Duration,
    /// Keep-alive interval while connected.
    pub heartbeat_interval: Duration,
    /// Delay before the single reconnect attempt after an unexpected close.
    pub reconnect_delay: Duration,
    /// How often to re-read shared storage for votes cast in other tabs.
    pub storage_poll_interval: Duration,
    /// How long a fetched item stays fresh in the item cache.
    pub item_cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            battlefield_size: DEFAULT_BATTLEFIELD_SIZE,
            max_item_id: DEFAULT_MAX_ITEM_ID,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            storage_poll_interval: Duration::from_secs(5),
            item_cache_ttl: Duration::from_secs(300),
        }
    }
}
