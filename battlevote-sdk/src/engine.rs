//! Vote reconciliation.
//!
//! The [`Reconciler`] is the synchronous core: it owns the [`BattleState`] of
//! the active battle and folds local votes, remote votes, battle resets and
//! tally snapshots into it, each remote vote at most once. [`VotingEngine`]
//! wires a reconciler to a [`Channel`], the shared store and the presentation
//! layer (state snapshots over `watch`, notices over `broadcast`).
//!
//! Every mutation is a two-phase update under one lock: apply the raw tally
//! change, then recompute totals, percentages and winners from it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::channel::{Channel, Envelope, MessageKind, OutboundMessage, Subscription};
use crate::error::VoteError;
use crate::event::Notice;
use crate::key::BattleKey;
use crate::store::BattleStore;
use crate::tally::{aggregate, standing_change};
use crate::types::{BattleResult, BattleState, ItemId, VoteRecord, VoteStats, seed_stats};

/// Battle state plus the bookkeeping needed to fold messages exactly once.
pub struct Reconciler {
    store: BattleStore,
    key: BattleKey,
    state: BattleState,
    /// Dedup keys of remote votes already folded into `state`.
    seen: HashSet<String>,
    /// When the relay last reset this battle. Stored results from before
    /// then are stale.
    reset_at: Option<i64>,
}

impl Reconciler {
    /// An idle reconciler over `store`. Nothing is tallied until
    /// [`initialize`](Self::initialize) picks a battle.
    pub fn new(store: BattleStore) -> Self {
        Self {
            store,
            key: BattleKey::default(),
            state: BattleState::default(),
            seen: HashSet::new(),
            reset_at: None,
        }
    }

    /// Active battle; empty before the first `initialize`.
    pub fn key(&self) -> &BattleKey {
        &self.key
    }

    /// Current tallies.
    pub fn state(&self) -> &BattleState {
        &self.state
    }

    /// Whether an own vote would be accepted right now.
    pub fn may_vote(&self) -> bool {
        !self.state.has_voted && !self.store.has_voted(&self.key)
    }

    /// Enter `key`: zero tallies for its items, overlaid with any stored
    /// result, and the voted flag from the store.
    pub fn initialize(&mut self, key: BattleKey) {
        let mut stats = seed_stats(&key);
        if let Some(result) = self.store.result(&key) {
            stats.extend(result.vote_stats);
        }
        let agg = aggregate(&stats);
        self.state = BattleState {
            user_vote: None,
            vote_stats: agg.vote_stats,
            total_votes: agg.total_votes,
            winners: agg.winners,
            has_voted: self.store.has_voted(&key),
        };
        self.seen.clear();
        self.reset_at = None;
        tracing::debug!(battle = %key, total = self.state.total_votes, "Battle initialized");
        self.key = key;
    }

    /// Count this client's own vote. Persists the result and marks the
    /// battle voted.
    pub fn record_own_vote(&mut self, item: ItemId) -> Result<Vec<Notice>, VoteError> {
        if !self.may_vote() {
            return Err(VoteError::AlreadyVoted);
        }
        let mut stats = self.state.vote_stats.clone();
        stats.entry(item).or_default().votes += 1;
        let fired = self.recompute(stats);
        self.state.user_vote = Some(item);
        self.state.has_voted = true;
        self.store.mark_voted(&self.key);
        Ok(fired)
    }

    /// Fold one inbound message. `self_id` is the identity our own votes
    /// carry; their echoes are skipped.
    ///
    /// Errors only on undecodable payloads; the state is untouched then.
    pub fn apply_message(
        &mut self,
        envelope: &Envelope,
        self_id: Option<&str>,
    ) -> anyhow::Result<Vec<Notice>> {
        if let Some(scope) = envelope.scope() {
            if scope != self.key.as_str() {
                tracing::debug!(scope, battle = %self.key, "Ignoring message for another battle");
                return Ok(Vec::new());
            }
        }

        match &envelope.kind {
            MessageKind::Vote => {
                let vote: VoteRecord = envelope.payload_as().context("invalid vote payload")?;
                if self_id == Some(vote.user_id.as_str()) {
                    return Ok(Vec::new());
                }
                if !self.seen.insert(vote.dedup_key()) {
                    tracing::debug!(vote = %vote.dedup_key(), "Duplicate vote ignored");
                    return Ok(Vec::new());
                }
                let mut stats = self.state.vote_stats.clone();
                stats.entry(vote.item_id).or_default().votes += 1;
                Ok(self.recompute(stats))
            }
            MessageKind::NewBattle => {
                tracing::info!(battle = %self.key, "Battle reset by relay");
                self.state = BattleState::seeded(&self.key);
                // The store still remembers this device's vote for the key.
                self.state.has_voted = self.store.has_voted(&self.key);
                self.seen.clear();
                // Everything stored so far predates the reset, clock skew included.
                let last_saved = self.store.result(&self.key).map_or(i64::MIN, |r| r.timestamp);
                self.reset_at = Some(now_ms().max(last_saved));
                Ok(Vec::new())
            }
            MessageKind::Stats => {
                let snapshot: VoteStats =
                    envelope.payload_as().context("invalid stats payload")?;
                let mut stats = seed_stats(&self.key);
                stats.extend(snapshot);
                Ok(self.recompute(stats))
            }
            MessageKind::Heartbeat | MessageKind::JoinBattle | MessageKind::Unknown(_) => {
                Ok(Vec::new())
            }
        }
    }

    /// Overlay what other tabs wrote to the store for the active battle.
    /// Results saved before the last relay reset are skipped. Returns
    /// whether the state changed.
    pub fn refresh_from_storage(&mut self) -> bool {
        if self.key.is_empty() {
            return false;
        }
        let before = self.state.clone();
        self.state.has_voted = self.store.has_voted(&self.key) || self.state.user_vote.is_some();
        let stored = self
            .store
            .result(&self.key)
            .filter(|result| self.reset_at.is_none_or(|reset| result.timestamp > reset));
        if let Some(result) = stored {
            let mut stats = seed_stats(&self.key);
            stats.extend(result.vote_stats);
            let agg = aggregate(&stats);
            self.state.vote_stats = agg.vote_stats;
            self.state.total_votes = agg.total_votes;
            self.state.winners = agg.winners;
        }
        self.state != before
    }

    /// Second phase of every update: derive aggregates from `stats`, persist
    /// them if they changed, and report a winner/tie transition.
    fn recompute(&mut self, stats: VoteStats) -> Vec<Notice> {
        let agg = aggregate(&stats);
        let changed =
            agg.vote_stats != self.state.vote_stats || agg.total_votes != self.state.total_votes;
        let notice = standing_change(&self.state.winners, &agg.winners);

        self.state.vote_stats = agg.vote_stats;
        self.state.total_votes = agg.total_votes;
        self.state.winners = agg.winners;

        if changed && !self.key.is_empty() {
            self.store.save_result(&BattleResult {
                battle_key: self.key.clone(),
                vote_stats: self.state.vote_stats.clone(),
                total_votes: self.state.total_votes,
                winners: self.state.winners.clone(),
                timestamp: self.save_time(),
            });
        }
        notice.into_iter().collect()
    }

    /// Post-reset saves must sort after the reset, even within one
    /// millisecond of it.
    fn save_time(&self) -> i64 {
        let now = now_ms();
        match self.reset_at {
            Some(reset) => now.max(reset + 1),
            None => now,
        }
    }
}

/// Live voting view of one battle at a time.
///
/// Cheap to clone. The message subscription lives as long as the last clone.
#[derive(Clone)]
pub struct VotingEngine {
    core: Arc<Mutex<Reconciler>>,
    channel: Channel,
    state_tx: Arc<watch::Sender<BattleState>>,
    notices: broadcast::Sender<Notice>,
    _subscription: Arc<Subscription>,
}

impl VotingEngine {
    /// Attach an engine to `channel`. Notices go to `notices`, which the
    /// session may share.
    pub fn new(channel: Channel, store: BattleStore, notices: broadcast::Sender<Notice>) -> Self {
        let core = Arc::new(Mutex::new(Reconciler::new(store)));
        let (state_tx, _) = watch::channel(BattleState::default());
        let state_tx = Arc::new(state_tx);

        let subscription = {
            let core = core.clone();
            let state_tx = state_tx.clone();
            let notices = notices.clone();
            let weak = channel.downgrade();
            channel.subscribe(move |envelope: &Envelope| {
                let self_id = weak.upgrade().and_then(|c| c.user_id());
                let (state, fired) = {
                    let mut core = core.lock();
                    let fired = core.apply_message(envelope, self_id.as_deref())?;
                    (core.state().clone(), fired)
                };
                publish(&state_tx, state);
                emit(&notices, fired);
                Ok(())
            })
        };

        Self {
            core,
            channel,
            state_tx,
            notices,
            _subscription: Arc::new(subscription),
        }
    }

    /// Switch to `key` and scope the channel to it.
    pub fn initialize(&self, key: BattleKey) {
        let state = {
            let mut core = self.core.lock();
            core.initialize(key.clone());
            core.state().clone()
        };
        self.channel.set_battle_id(key);
        publish(&self.state_tx, state);
    }

    /// Vote for `item` in the active battle and broadcast the vote.
    pub fn cast_vote(&self, item: ItemId) -> Result<(), VoteError> {
        if !self.channel.is_connected() {
            return Err(VoteError::NotConnected);
        }
        let Some(user_id) = self.channel.user_id() else {
            return Err(VoteError::IdentityUnresolved);
        };
        let (state, fired) = {
            let mut core = self.core.lock();
            let fired = core.record_own_vote(item)?;
            (core.state().clone(), fired)
        };

        tracing::info!(item, "Vote cast");
        self.channel.send(OutboundMessage::Vote(VoteRecord {
            item_id: item,
            user_id,
            timestamp: now_ms(),
        }));
        publish(&self.state_tx, state);
        emit(&self.notices, [Notice::VoteConfirmed { item }]);
        emit(&self.notices, fired);
        Ok(())
    }

    /// Re-read the voted flag and stored result of the active battle.
    pub fn refresh_from_storage(&self) {
        refresh(&self.core, &self.state_tx);
    }

    /// Poll the store every `every` for votes cast in other tabs.
    pub fn spawn_storage_sync(&self, every: Duration) -> JoinHandle<()> {
        let core = self.core.clone();
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                refresh(&core, &state_tx);
            }
        })
    }

    pub fn battle_key(&self) -> BattleKey {
        self.core.lock().key().clone()
    }

    /// Latest state snapshot.
    pub fn state(&self) -> BattleState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BattleState> {
        self.state_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Connected, identified, and not yet voted in this battle.
    pub fn can_vote(&self) -> bool {
        self.channel.is_connected()
            && self.channel.user_id().is_some()
            && self.core.lock().may_vote()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

fn refresh(core: &Mutex<Reconciler>, state_tx: &watch::Sender<BattleState>) {
    let state = {
        let mut core = core.lock();
        if !core.refresh_from_storage() {
            return;
        }
        core.state().clone()
    };
    tracing::debug!(total = state.total_votes, "Battle state refreshed from storage");
    publish(state_tx, state);
}

fn publish(state_tx: &watch::Sender<BattleState>, state: BattleState) {
    state_tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
}

fn emit(notices: &broadcast::Sender<Notice>, fired: impl IntoIterator<Item = Notice>) {
    for notice in fired {
        tracing::info!(%notice, "Notice");
        // No receivers is fine; nobody is watching.
        let _ = notices.send(notice);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemTally;
    use serde_json::json;

    fn key() -> BattleKey {
        BattleKey::from_items(&[1, 25])
    }

    fn ready() -> Reconciler {
        let mut core = Reconciler::new(BattleStore::open_memory().unwrap());
        core.initialize(key());
        core
    }

    fn vote(user: &str, item: ItemId, ts: i64) -> Envelope {
        Envelope {
            kind: MessageKind::Vote,
            payload: json!({ "itemId": item, "userId": user, "timestamp": ts }),
            battle_id: Some(key().to_string()),
            user_id: user.to_string(),
            timestamp: ts,
        }
    }

    fn kind(kind: MessageKind, payload: serde_json::Value) -> Envelope {
        Envelope {
            kind,
            payload,
            battle_id: None,
            user_id: "relay".to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn initialize_seeds_every_item() {
        let core = ready();
        let state = core.state();
        assert_eq!(state.vote_stats.keys().copied().collect::<Vec<_>>(), vec![1, 25]);
        assert_eq!(state.total_votes, 0);
        assert!(state.winners.is_empty());
        assert!(!state.has_voted);
        assert_eq!(state.user_vote, None);
    }

    #[test]
    fn initialize_overlays_stored_result() {
        let store = BattleStore::open_memory().unwrap();
        let mut stats = VoteStats::new();
        stats.insert(25, ItemTally { votes: 3, percentage: 0.0 });
        store.save_result(&BattleResult {
            battle_key: key(),
            vote_stats: stats,
            total_votes: 3,
            winners: vec![25],
            timestamp: 1,
        });
        store.mark_voted(&key());

        let mut core = Reconciler::new(store);
        core.initialize(key());
        let state = core.state();
        assert_eq!(state.vote_stats[&1].votes, 0);
        assert_eq!(state.vote_stats[&25].percentage, 100.0);
        assert_eq!(state.winners, vec![25]);
        assert!(state.has_voted);
    }

    #[test]
    fn own_vote_counts_once() {
        let mut core = ready();
        let fired = core.record_own_vote(25).unwrap();
        assert_eq!(fired, vec![Notice::Leader { item: 25 }]);
        assert_eq!(core.state().user_vote, Some(25));
        assert!(core.state().has_voted);
        assert_eq!(core.record_own_vote(1), Err(VoteError::AlreadyVoted));
        assert_eq!(core.state().total_votes, 1);
        assert!(core.store.has_voted(&key()));
        assert_eq!(core.store.result(&key()).unwrap().total_votes, 1);
    }

    #[test]
    fn echo_is_not_counted() {
        let mut core = ready();
        core.record_own_vote(1).unwrap();
        let fired = core.apply_message(&vote("me", 1, 10), Some("me")).unwrap();
        assert!(fired.is_empty());
        assert_eq!(core.state().vote_stats[&1].votes, 1);
    }

    #[test]
    fn duplicate_remote_votes_fold_once() {
        let mut core = ready();
        core.apply_message(&vote("u1", 25, 10), Some("me")).unwrap();
        core.apply_message(&vote("u1", 25, 10), Some("me")).unwrap();
        assert_eq!(core.state().vote_stats[&25].votes, 1);

        // Same user, new timestamp: a distinct vote.
        core.apply_message(&vote("u1", 25, 11), Some("me")).unwrap();
        assert_eq!(core.state().vote_stats[&25].votes, 2);
    }

    #[test]
    fn tie_then_leader_notices() {
        let mut core = ready();
        let fired = core.apply_message(&vote("a", 1, 1), None).unwrap();
        assert_eq!(fired, vec![Notice::Leader { item: 1 }]);
        let fired = core.apply_message(&vote("b", 25, 2), None).unwrap();
        assert_eq!(fired, vec![Notice::Tie { items: vec![1, 25] }]);
        let fired = core.apply_message(&vote("c", 25, 3), None).unwrap();
        assert_eq!(fired, vec![Notice::Leader { item: 25 }]);
        let fired = core.apply_message(&vote("d", 25, 4), None).unwrap();
        assert!(fired.is_empty());
    }

    #[test]
    fn foreign_scope_is_ignored() {
        let mut core = ready();
        let mut env = vote("u1", 1, 10);
        env.battle_id = Some("3_vs_4".to_string());
        assert!(core.apply_message(&env, None).unwrap().is_empty());
        assert_eq!(core.state().total_votes, 0);
    }

    #[test]
    fn votes_for_unlisted_items_get_an_entry() {
        let mut core = ready();
        core.apply_message(&vote("u1", 7, 10), None).unwrap();
        assert_eq!(core.state().vote_stats[&7].votes, 1);
        assert_eq!(core.state().winners, vec![7]);
    }

    #[test]
    fn new_battle_resets_without_touching_store() {
        let mut core = ready();
        core.record_own_vote(1).unwrap();
        core.apply_message(&vote("u1", 1, 10), None).unwrap();

        core.apply_message(&kind(MessageKind::NewBattle, json!({ "itemIds": [1, 25] })), None)
            .unwrap();
        let state = core.state().clone();
        assert_eq!(state.total_votes, 0);
        assert!(state.winners.is_empty());
        // Still marked voted in the store, so the flag survives the reset.
        assert!(state.has_voted);
        assert_eq!(state.user_vote, None);
        assert_eq!(core.record_own_vote(25), Err(VoteError::AlreadyVoted));
        assert_eq!(state.vote_stats.len(), 2);
        assert_eq!(core.store.result(&key()).unwrap().total_votes, 2);

        // Dedup set was cleared with it.
        core.apply_message(&vote("u1", 1, 10), None).unwrap();
        assert_eq!(core.state().vote_stats[&1].votes, 1);
    }

    #[test]
    fn new_battle_reopens_voting_for_non_voters() {
        let mut core = ready();
        core.apply_message(&vote("u1", 1, 10), None).unwrap();
        core.apply_message(&kind(MessageKind::NewBattle, json!({})), None)
            .unwrap();
        assert!(!core.state().has_voted);
        assert!(core.may_vote());
        core.record_own_vote(25).unwrap();
        assert_eq!(core.state().total_votes, 1);
    }

    #[test]
    fn refresh_after_reset_ignores_stale_result() {
        let mut core = ready();
        core.apply_message(&vote("u1", 25, 10), None).unwrap();
        core.apply_message(&kind(MessageKind::NewBattle, json!({})), None)
            .unwrap();
        assert_eq!(core.state().total_votes, 0);

        assert!(!core.refresh_from_storage());
        assert_eq!(core.state().total_votes, 0);

        // Redelivered after the reset: counted once, on a clean slate.
        core.apply_message(&vote("u1", 25, 10), None).unwrap();
        assert_eq!(core.state().total_votes, 1);
        assert_eq!(core.state().vote_stats[&25].votes, 1);

        // What was saved after the reset is picked up again.
        core.refresh_from_storage();
        assert_eq!(core.state().total_votes, 1);
        assert_eq!(core.store.result(&key()).unwrap().total_votes, 1);
    }

    #[test]
    fn results_from_other_tabs_after_reset_are_overlaid() {
        let store = BattleStore::open_memory().unwrap();
        let mut tab = Reconciler::new(store.clone());
        tab.initialize(key());
        tab.apply_message(&kind(MessageKind::NewBattle, json!({})), None)
            .unwrap();

        let mut stats = VoteStats::new();
        stats.insert(1, ItemTally { votes: 2, percentage: 0.0 });
        store.save_result(&BattleResult {
            battle_key: key(),
            vote_stats: stats,
            total_votes: 2,
            winners: vec![1],
            timestamp: tab.reset_at.unwrap() + 1,
        });
        assert!(tab.refresh_from_storage());
        assert_eq!(tab.state().vote_stats[&1].votes, 2);

        // Entering the battle again forgets the reset.
        tab.initialize(key());
        assert_eq!(tab.reset_at, None);
    }

    #[test]
    fn stats_snapshot_replaces_tallies() {
        let mut core = ready();
        core.apply_message(&vote("u1", 1, 10), None).unwrap();
        let fired = core
            .apply_message(
                &kind(MessageKind::Stats, json!({ "25": { "votes": 4, "percentage": 12.0 } })),
                None,
            )
            .unwrap();
        // The lead moved from 1 to 25; still exactly one winner, so no notice.
        assert!(fired.is_empty());
        let state = core.state();
        assert_eq!(state.vote_stats[&1].votes, 0);
        assert_eq!(state.vote_stats[&25].percentage, 100.0);
        assert_eq!(state.total_votes, 4);
        assert_eq!(core.store.result(&key()).unwrap().total_votes, 4);
    }

    #[test]
    fn bad_payloads_error_without_mutating() {
        let mut core = ready();
        let env = kind(MessageKind::Vote, json!({ "itemId": "nope" }));
        assert!(core.apply_message(&env, None).is_err());
        assert_eq!(core.state(), &BattleState::seeded(&key()));
    }

    #[test]
    fn unchanged_stats_do_not_rewrite_the_store() {
        let mut core = ready();
        core.apply_message(&vote("u1", 1, 10), None).unwrap();
        let mut stored = core.store.result(&key()).unwrap();
        stored.timestamp = 1;
        core.store.save_result(&stored);

        let stats = core.state().vote_stats.clone();
        let fired = core.recompute(stats);
        assert!(fired.is_empty());
        assert_eq!(core.store.result(&key()).unwrap().timestamp, 1);
    }

    #[test]
    fn refresh_picks_up_other_tabs() {
        let store = BattleStore::open_memory().unwrap();
        let mut tab_a = Reconciler::new(store.clone());
        let mut tab_b = Reconciler::new(store);
        tab_a.initialize(key());
        tab_b.initialize(key());

        tab_a.record_own_vote(1).unwrap();
        assert!(!tab_b.state().has_voted);

        assert!(tab_b.refresh_from_storage());
        assert!(tab_b.state().has_voted);
        assert_eq!(tab_b.state().vote_stats[&1].votes, 1);
        assert_eq!(tab_b.state().user_vote, None);
        assert!(!tab_b.refresh_from_storage());
        assert_eq!(tab_b.record_own_vote(25), Err(VoteError::AlreadyVoted));
    }
}
