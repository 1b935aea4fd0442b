//! Item details for display.
//!
//! Items are fetched from the item service (`GET {base}/items/{id}`) and
//! cached per id for a freshness window, so redrawing a battle doesn't refetch
//! its participants.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::config::ClientConfig;
use crate::error::ItemError;
use crate::types::ItemId;

/// Item as served by the item service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    /// Decimetres.
    pub height: u32,
    /// Hectograms.
    pub weight: u32,
    #[serde(default)]
    pub base_experience: Option<u32>,
    #[serde(default)]
    pub sprites: Sprites,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Sprites {
    pub front_default: Option<String>,
}

/// Display-ready view of an [`Item`].
#[derive(Debug, Clone, PartialEq)]
pub struct ItemCard {
    pub id: ItemId,
    pub name: String,
    pub weight: String,
    pub height: String,
    pub base_experience: Option<u32>,
    pub image: Option<String>,
}

impl From<&Item> for ItemCard {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            name: capitalize(&item.name),
            weight: format!("{:.1} kg", item.weight as f64 / 10.0),
            height: format!("{:.1} m", item.height as f64 / 10.0),
            base_experience: item.base_experience,
            image: item.sprites.front_default.clone(),
        }
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// HTTP client for the item service with a per-id cache.
pub struct ItemClient {
    http: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: Mutex<HashMap<ItemId, (Instant, Item)>>,
}

impl ItemClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_base_url(&config.api_url, config.item_cache_ttl)
    }

    pub fn with_base_url(base_url: &str, ttl: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch item `id`, from cache when fresh.
    pub async fn fetch(&self, id: ItemId) -> Result<ItemCard, ItemError> {
        if let Some(item) = self.cached(id) {
            return Ok(ItemCard::from(&item));
        }

        let url = format!("{}/items/{id}", self.base_url);
        tracing::debug!(%url, "Fetching item");
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ItemError::NotFound(id));
        }
        if !status.is_success() {
            return Err(ItemError::Status {
                id,
                status: status.as_u16(),
            });
        }
        let item: Item = resp.json().await?;
        let card = ItemCard::from(&item);
        self.insert(id, item);
        Ok(card)
    }

    /// Fetch several items; the first failure wins.
    pub async fn fetch_all(&self, ids: &[ItemId]) -> Result<Vec<ItemCard>, ItemError> {
        let cards = futures::future::try_join_all(ids.iter().map(|&id| self.fetch(id))).await?;
        Ok(cards)
    }

    fn cached(&self, id: ItemId) -> Option<Item> {
        self.cached_at(id, Instant::now())
    }

    fn cached_at(&self, id: ItemId, now: Instant) -> Option<Item> {
        let mut cache = self.cache.lock();
        match cache.get(&id) {
            Some((fetched, item)) if now.duration_since(*fetched) < self.ttl => Some(item.clone()),
            Some(_) => {
                cache.remove(&id);
                None
            }
            None => None,
        }
    }

    fn insert(&self, id: ItemId, item: Item) {
        self.cache.lock().insert(id, (Instant::now(), item));
    }
}
