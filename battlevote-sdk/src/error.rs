//! Error types for each SDK concern.
//!
//! None of these are fatal: the worst outcome of any of them is a temporarily
//! read-only voting view.

use crate::types::ItemId;

/// Failures establishing the relay channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to connect to voting relay at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },
    #[error("connection to voting relay at {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// The device identity could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("device fingerprint unavailable: {0}")]
    Unavailable(String),
}

/// Raised inside the store; never escapes its public operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt stored value: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a vote was not cast. The battle state is untouched in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    #[error("not connected to the voting relay")]
    NotConnected,
    #[error("user identity not resolved yet")]
    IdentityUnresolved,
    #[error("already voted in this battle")]
    AlreadyVoted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot draw {size} distinct items from ids 1..={max}")]
    BattlefieldTooLarge { size: usize, max: ItemId },
    #[error("a battle needs at least {min} items, got {got}")]
    TooFewItems { min: usize, got: usize },
}

/// Upstream item fetch failures, propagated to the presentation layer.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("item {0} not found")]
    NotFound(ItemId),
    #[error("item service returned HTTP {status} for item {id}")]
    Status { id: ItemId, status: u16 },
    #[error("item request failed: {0}")]
    Http(#[from] reqwest::Error),
}
