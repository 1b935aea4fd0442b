//! Vote and battle data shared by the engine, store and wire format.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::key::BattleKey;

/// Numeric id of a battle participant.
pub type ItemId = u32;

/// Votes for one item and its share of the battle total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemTally {
    pub votes: u64,
    /// 0..=100. Zero while the battle has no votes.
    #[serde(default)]
    pub percentage: f64,
}

/// Per-item tallies, keyed by item id.
pub type VoteStats = BTreeMap<ItemId, ItemTally>;

/// A single vote as it travels over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub item_id: ItemId,
    pub user_id: String,
    /// Epoch milliseconds at the voting client.
    pub timestamp: i64,
}

impl VoteRecord {
    /// Composite key used to fold each remote vote at most once.
    pub fn dedup_key(&self) -> String {
        format!("{}-{}-{}", self.user_id, self.item_id, self.timestamp)
    }
}

/// What the engine knows about the active battle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BattleState {
    /// The item this client voted for, if it voted through this engine.
    pub user_vote: Option<ItemId>,
    pub vote_stats: VoteStats,
    pub total_votes: u64,
    /// Items sharing the top vote count, ascending. Empty with no votes.
    pub winners: Vec<ItemId>,
    pub has_voted: bool,
}

impl BattleState {
    /// Zero tallies for every item of `key`.
    pub fn seeded(key: &BattleKey) -> Self {
        Self {
            vote_stats: seed_stats(key),
            ..Self::default()
        }
    }

    pub fn is_tied(&self) -> bool {
        self.winners.len() > 1
    }

    /// The single leading item, if there is exactly one.
    pub fn leader(&self) -> Option<ItemId> {
        match self.winners.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

/// Zero tallies for every item of `key`.
pub fn seed_stats(key: &BattleKey) -> VoteStats {
    key.item_ids()
        .into_iter()
        .map(|id| (id, ItemTally::default()))
        .collect()
}

/// Last known aggregate of a battle, persisted per battle key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleResult {
    pub battle_key: BattleKey,
    pub vote_stats: VoteStats,
    pub total_votes: u64,
    #[serde(default)]
    pub winners: Vec<ItemId>,
    /// Epoch milliseconds of the last write.
    pub timestamp: i64,
}

/// The battle currently on screen, persisted so a restart resumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentBattle {
    pub item_ids: Vec<ItemId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_stats_round_trip_with_numeric_keys() {
        let mut stats = VoteStats::new();
        stats.insert(25, ItemTally { votes: 3, percentage: 75.0 });
        stats.insert(1, ItemTally { votes: 1, percentage: 25.0 });
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["25"]["votes"], 3);

        let parsed: VoteStats = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, stats);
    }

    #[test]
    fn tally_percentage_defaults_to_zero() {
        let tally: ItemTally = serde_json::from_str(r#"{"votes":4}"#).unwrap();
        assert_eq!(tally, ItemTally { votes: 4, percentage: 0.0 });
    }

    #[test]
    fn vote_record_wire_names() {
        let vote = VoteRecord {
            item_id: 25,
            user_id: "abc".to_string(),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&vote).unwrap();
        assert_eq!(json["itemId"], 25);
        assert_eq!(json["userId"], "abc");
        assert_eq!(vote.dedup_key(), "abc-25-1700000000000");
    }

    #[test]
    fn leader_and_tie() {
        let mut state = BattleState::seeded(&BattleKey::from("1_vs_25"));
        assert_eq!(state.vote_stats.len(), 2);
        assert_eq!(state.leader(), None);
        assert!(!state.is_tied());

        state.winners = vec![25];
        assert_eq!(state.leader(), Some(25));

        state.winners = vec![1, 25];
        assert!(state.is_tied());
        assert_eq!(state.leader(), None);
    }
}
