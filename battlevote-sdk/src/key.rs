//! Canonical battle keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ItemId;

const SEPARATOR: &str = "_vs_";

/// Identifies a battle by its participants.
///
/// Derived from the numerically sorted item ids joined by `_vs_`, so every
/// client computing the key for the same set of items agrees on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BattleKey(String);

impl BattleKey {
    pub fn from_items(ids: &[ItemId]) -> Self {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        let parts: Vec<String> = sorted.iter().map(|id| id.to_string()).collect();
        Self(parts.join(SEPARATOR))
    }

    /// The participants encoded in the key, ascending. Segments that are not
    /// item ids are skipped.
    pub fn item_ids(&self) -> Vec<ItemId> {
        if self.0.is_empty() {
            return Vec::new();
        }
        self.0
            .split(SEPARATOR)
            .filter_map(|part| part.parse().ok())
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BattleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BattleKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BattleKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
