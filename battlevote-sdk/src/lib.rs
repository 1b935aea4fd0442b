//! Client SDK for real-time item battles.
//!
//! Several clients vote on a shared battle between a few items and watch the
//! tallies converge. The SDK turns an unreliable, echo-prone relay stream into
//! one consistent view of vote counts, percentages and winner/tie status,
//! backed by durable per-device state.
//!
//! The main pieces:
//!
//! - [`channel::Channel`]: reconnecting duplex channel to a relay, scoped to
//!   one battle at a time.
//! - [`engine::VotingEngine`]: folds local and remote votes into
//!   [`types::BattleState`], exactly once each.
//! - [`store::BattleStore`]: SQLite-backed state shared by every tab on the
//!   device.
//! - [`session::BattleSession`]: which battle is active, persisted across
//!   restarts.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod identity;
pub mod items;
pub mod key;
pub mod session;
pub mod store;
pub mod tally;
pub mod types;

pub use channel::Channel;
pub use config::ClientConfig;
pub use engine::VotingEngine;
pub use key::BattleKey;
pub use store::BattleStore;
