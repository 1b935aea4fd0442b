//! Which battle is on screen.
//!
//! The session picks the active item set (restored, random or explicit),
//! persists it as the store's current battle so a restart resumes it, and
//! derives the [`BattleKey`] the engine is scoped to.

use rand::Rng;
use tokio::sync::broadcast;

use crate::config::{ClientConfig, DEFAULT_BATTLE_ITEMS};
use crate::error::SessionError;
use crate::event::Notice;
use crate::key::BattleKey;
use crate::store::BattleStore;
use crate::types::{CurrentBattle, ItemId};

pub struct BattleSession {
    store: BattleStore,
    battlefield_size: usize,
    max_item_id: ItemId,
    current: Vec<ItemId>,
    notices: broadcast::Sender<Notice>,
}

impl BattleSession {
    /// Resume the persisted battle, or fall back to the default one when
    /// nothing usable is stored.
    pub fn restore(
        store: BattleStore,
        config: &ClientConfig,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        let current = match store.current_battle() {
            Some(battle) if battle.item_ids.len() >= config.battlefield_size => battle.item_ids,
            Some(battle) => {
                tracing::debug!(
                    items = battle.item_ids.len(),
                    "Stored battle too small; using default"
                );
                DEFAULT_BATTLE_ITEMS.to_vec()
            }
            None => DEFAULT_BATTLE_ITEMS.to_vec(),
        };
        let session = Self {
            store,
            battlefield_size: config.battlefield_size,
            max_item_id: config.max_item_id,
            current,
            notices,
        };
        session.persist();
        session
    }

    /// Draw `battlefield_size` distinct ids from `1..=max_item_id` and make
    /// them the current battle.
    pub fn start_random_battle<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> Result<BattleKey, SessionError> {
        let size = self.battlefield_size;
        let max = self.max_item_id;
        if size > max as usize {
            return Err(SessionError::BattlefieldTooLarge { size, max });
        }
        let mut ids: Vec<ItemId> = rand::seq::index::sample(rng, max as usize, size)
            .into_iter()
            .map(|i| i as ItemId + 1)
            .collect();
        ids.sort_unstable();

        tracing::info!(items = ?ids, "Starting random battle");
        self.current = ids.clone();
        self.persist();
        // No receivers is fine.
        let _ = self.notices.send(Notice::RandomBattle { items: ids });
        Ok(self.battle_key())
    }

    /// Make `ids` the current battle.
    pub fn set_battle(&mut self, ids: Vec<ItemId>) -> Result<BattleKey, SessionError> {
        let mut ids = ids;
        ids.sort_unstable();
        ids.dedup();
        if ids.len() < self.battlefield_size {
            return Err(SessionError::TooFewItems {
                min: self.battlefield_size,
                got: ids.len(),
            });
        }
        self.current = ids;
        self.persist();
        Ok(self.battle_key())
    }

    pub fn battle_key(&self) -> BattleKey {
        BattleKey::from_items(&self.current)
    }

    pub fn item_ids(&self) -> &[ItemId] {
        &self.current
    }

    fn persist(&self) {
        self.store.save_current_battle(&CurrentBattle {
            item_ids: self.current.clone(),
        });
    }
}
