//! Durable per-device battle state backed by SQLite.
//!
//! Values are JSON documents stored under a handful of logical keys in a
//! single key-value table:
//!
//! ```text
//! "userId"         → "…"                              (device identity)
//! "votedBattles"   → ["1_vs_25", …]                   (battles voted in)
//! "currentBattle"  → { "itemIds": [1, 25] }           (battle on screen)
//! "battleResults"  → { "1_vs_25": BattleResult, … }   (last known tallies)
//! ```
//!
//! Every tab on the device shares these entries: clones of a store share one
//! connection, and stores opened on the same path share the file (WAL mode).
//! No operation here returns an error; failures are logged and degrade to
//! "no data" on reads and a skipped write on writes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::key::BattleKey;
use crate::types::{BattleResult, CurrentBattle};

const KEY_USER_ID: &str = "userId";
const KEY_VOTED_BATTLES: &str = "votedBattles";
const KEY_CURRENT_BATTLE: &str = "currentBattle";
const KEY_BATTLE_RESULTS: &str = "battleResults";

/// Handle to the shared battle store. Cheap to clone.
#[derive(Clone)]
pub struct BattleStore {
    conn: Arc<Mutex<Connection>>,
}

impl BattleStore {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory store (for testing and offline runs).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(2))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Votes ──────────────────────────────────────────────────────────

    /// Whether this device already voted in `key`.
    pub fn has_voted(&self, key: &BattleKey) -> bool {
        let conn = self.conn.lock();
        match read_json::<Vec<String>>(&conn, KEY_VOTED_BATTLES) {
            Ok(voted) => voted.unwrap_or_default().iter().any(|k| k == key.as_str()),
            Err(e) => {
                tracing::warn!(battle = %key, "Failed to read voted battles: {e}");
                false
            }
        }
    }

    /// Record a vote in `key`. Recording the same battle twice is a no-op.
    pub fn mark_voted(&self, key: &BattleKey) {
        if let Err(e) = self.try_mark_voted(key) {
            tracing::warn!(battle = %key, "Failed to mark battle as voted: {e}");
        }
    }

    fn try_mark_voted(&self, key: &BattleKey) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut voted: Vec<String> = read_json(&tx, KEY_VOTED_BATTLES)?.unwrap_or_default();
        if !voted.iter().any(|k| k == key.as_str()) {
            voted.push(key.to_string());
            write_json(&tx, KEY_VOTED_BATTLES, &voted)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Results ────────────────────────────────────────────────────────

    /// Last saved result for `key`, if any.
    pub fn result(&self, key: &BattleKey) -> Option<BattleResult> {
        let conn = self.conn.lock();
        match read_json::<BTreeMap<String, BattleResult>>(&conn, KEY_BATTLE_RESULTS) {
            Ok(results) => results.and_then(|mut r| r.remove(key.as_str())),
            Err(e) => {
                tracing::warn!(battle = %key, "Failed to read battle results: {e}");
                None
            }
        }
    }

    /// Upsert `result` by its battle key, leaving other battles untouched.
    pub fn save_result(&self, result: &BattleResult) {
        if let Err(e) = self.try_save_result(result) {
            tracing::warn!(battle = %result.battle_key, "Failed to save battle result: {e}");
        }
    }

    fn try_save_result(&self, result: &BattleResult) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut results: BTreeMap<String, BattleResult> =
            read_json(&tx, KEY_BATTLE_RESULTS)?.unwrap_or_default();
        results.insert(result.battle_key.to_string(), result.clone());
        write_json(&tx, KEY_BATTLE_RESULTS, &results)?;
        tx.commit()?;
        Ok(())
    }

    // ── Session ────────────────────────────────────────────────────────

    pub fn current_battle(&self) -> Option<CurrentBattle> {
        let conn = self.conn.lock();
        read_json(&conn, KEY_CURRENT_BATTLE).unwrap_or_else(|e| {
            tracing::warn!("Failed to load current battle: {e}");
            None
        })
    }

    pub fn save_current_battle(&self, battle: &CurrentBattle) {
        let conn = self.conn.lock();
        if let Err(e) = write_json(&conn, KEY_CURRENT_BATTLE, battle) {
            tracing::warn!("Failed to save current battle: {e}");
        }
    }

    // ── Identity ───────────────────────────────────────────────────────

    pub fn user_id(&self) -> Option<String> {
        let conn = self.conn.lock();
        read_json::<String>(&conn, KEY_USER_ID)
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read user id: {e}");
                None
            })
            .filter(|id| !id.is_empty())
    }

    pub fn set_user_id(&self, user_id: &str) {
        let conn = self.conn.lock();
        if let Err(e) = write_json(&conn, KEY_USER_ID, &user_id) {
            tracing::warn!("Failed to save user id: {e}");
        }
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &str, value: &str) {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .unwrap();
    }
}

fn read_json<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>, StoreError> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn write_json<T: Serialize + ?Sized>(conn: &Connection, key: &str, value: &T) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, raw],
    )?;
    Ok(())
}
