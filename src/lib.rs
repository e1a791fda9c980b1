//! guildr: a relay and client library for a federated, Discord-style chat
//! protocol built on per-guild, append-only, hash-linked signed logs.
//!
//! A guild is defined by its genesis event; every structural change and
//! every message is a signed event chained to the previous event's id. The
//! relay assigns sequence numbers, validates against reduced guild state,
//! persists, and fans out to subscribers; clients rebuild the same state
//! with the same reducer and may gossip events peer-to-peer.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod event;
pub mod proto;
pub mod retention;
pub mod state;
pub mod store;
pub mod validate;
pub mod ws;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
