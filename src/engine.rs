//! Per-guild sequencing engine and broadcast fan-out.
//!
//! All ingest steps for one event — head read, seq assignment, signature
//! verification, state lookup or rebuild, validation, append, cache update,
//! broadcast enqueue — run inside that guild's lock, so concurrent publishes
//! to one guild serialize while different guilds proceed in parallel.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::event::{self, Event, EventBody};
use crate::proto::{self, ErrorCode, Publish};
use crate::state::GuildState;
use crate::store::LogStore;
use crate::validate::validate_event;

/// Why a publish was not appended.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("{0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// The wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            IngestError::InvalidSignature => ErrorCode::InvalidSignature,
            IngestError::Validation(_) => ErrorCode::ValidationFailed,
            IngestError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// One live subscription on a socket.
#[derive(Debug, Clone)]
pub struct SubSpec {
    pub guild_id: String,
    /// Accepted for forward compatibility; fan-out is per guild because
    /// structural events carry no channel and replicas need them all.
    pub channels: Option<Vec<String>>,
}

struct Connection {
    tx: mpsc::UnboundedSender<String>,
    subs: HashMap<String, SubSpec>,
}

/// Registry of open sockets and their subscriptions. Broadcast reads it;
/// SUB/UNSUB and socket close mutate it.
#[derive(Default)]
pub struct Registry {
    conns: DashMap<u64, Connection>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket's outbound queue, returning its connection id.
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(
            id,
            Connection {
                tx,
                subs: HashMap::new(),
            },
        );
        id
    }

    /// Drop a socket and garbage-collect its subscriptions.
    pub fn unregister(&self, conn_id: u64) {
        self.conns.remove(&conn_id);
    }

    pub fn subscribe(&self, conn_id: u64, sub_id: String, spec: SubSpec) {
        if let Some(mut conn) = self.conns.get_mut(&conn_id) {
            conn.subs.insert(sub_id, spec);
        }
    }

    pub fn unsubscribe(&self, conn_id: u64, sub_id: &str) {
        if let Some(mut conn) = self.conns.get_mut(&conn_id) {
            conn.subs.remove(sub_id);
        }
    }

    /// Queue a frame to one socket, best effort.
    pub fn send_to(&self, conn_id: u64, frame: String) {
        if let Some(conn) = self.conns.get(&conn_id) {
            let _ = conn.tx.send(frame);
        }
    }

    /// Queue a frame to every socket subscribed to `guild_id`. The
    /// publishing socket always receives exactly one copy, subscribed or
    /// not, so a publish doubles as its own acknowledgement.
    pub fn broadcast(&self, guild_id: &str, frame: &str, publisher: Option<u64>) {
        for conn in self.conns.iter() {
            let subscribed = conn
                .subs
                .values()
                .any(|spec| spec.guild_id == guild_id);
            if subscribed || publisher == Some(*conn.key()) {
                let _ = conn.tx.send(frame.to_string());
            }
        }
    }
}

/// The relay's sequencing engine.
pub struct Engine {
    store: Arc<dyn LogStore>,
    registry: Arc<Registry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    states: DashMap<String, GuildState>,
    relay_key: Option<String>,
    relay_name: String,
}

impl Engine {
    pub fn new(store: Arc<dyn LogStore>, registry: Arc<Registry>, relay_key: Option<String>) -> Self {
        Self {
            store,
            registry,
            locks: DashMap::new(),
            states: DashMap::new(),
            relay_key,
            relay_name: "guildr".to_string(),
        }
    }

    /// Override the name advertised in `HELLO_OK`.
    pub fn with_relay_name(mut self, name: String) -> Self {
        self.relay_name = name;
        self
    }

    /// Name advertised in `HELLO_OK`.
    pub fn relay_name(&self) -> &str {
        &self.relay_name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Public key allowed to author checkpoints on this relay.
    pub fn relay_key(&self) -> Option<&str> {
        self.relay_key.as_deref()
    }

    /// Ingest with a panic guard: a poisoned publish surfaces as
    /// `INTERNAL_ERROR` instead of tearing down the socket task.
    pub async fn ingest_guarded(
        &self,
        publish: Publish,
        publisher: Option<u64>,
    ) -> Result<Event, IngestError> {
        match AssertUnwindSafe(self.ingest(publish, publisher))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("ingest panicked; reporting internal error");
                Err(IngestError::Internal("ingest panicked".into()))
            }
        }
    }

    /// Serialize, sequence, validate, append, and broadcast one publish.
    pub async fn ingest(
        &self,
        publish: Publish,
        publisher: Option<u64>,
    ) -> Result<Event, IngestError> {
        let guild_id = publish.body.guild_id().to_string();
        let lock = self
            .locks
            .entry(guild_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let head = self
            .store
            .head(&guild_id)
            .map_err(|e| IngestError::Internal(e.to_string()))?;
        let (seq, prev_hash) = match &head {
            Some(h) => (h.seq + 1, Some(h.id.clone())),
            None => (0, None),
        };
        let ev = Event::assemble(
            seq,
            prev_hash,
            publish.created_at,
            publish.author,
            publish.body,
            publish.signature,
        );
        if !event::verify_signature(&ev) {
            return Err(IngestError::InvalidSignature);
        }

        let state = if seq == 0 {
            if !matches!(ev.body, EventBody::GuildCreate { .. }) {
                return Err(IngestError::Validation(format!(
                    "first event of a guild must be GUILD_CREATE, got {}",
                    ev.body.kind()
                )));
            }
            if ev.body.guild_id() != ev.id {
                return Err(IngestError::Validation(
                    "genesis guildId must equal the genesis event id".into(),
                ));
            }
            None
        } else {
            if matches!(ev.body, EventBody::GuildCreate { .. }) {
                return Err(IngestError::Validation(
                    "GUILD_CREATE is only valid at seq 0".into(),
                ));
            }
            let state = self.state_for(&guild_id, seq)?;
            validate_event(&state, &ev, self.relay_key.as_deref())
                .map_err(IngestError::Validation)?;
            Some(state)
        };

        if let Err(e) = self.store.append(&guild_id, &ev) {
            // Drop the cached state so the next ingest rebuilds from the log
            // instead of trusting a head the store may not have taken.
            self.states.remove(&guild_id);
            return Err(IngestError::Internal(e.to_string()));
        }

        match state {
            None => {
                let seeded = GuildState::from_genesis(&ev)
                    .map_err(|e| IngestError::Internal(e.to_string()))?;
                self.states.insert(guild_id.clone(), seeded);
            }
            Some(mut st) => {
                st.apply(&ev);
                self.states.insert(guild_id.clone(), st);
            }
        }

        debug!(guild = %guild_id, seq, kind = ev.body.kind(), "appended");
        self.registry
            .broadcast(&guild_id, &proto::event_frame(&ev), publisher);
        Ok(ev)
    }

    /// State at `seq - 1`: the cache when fresh, otherwise a full rebuild.
    /// The cache is a shortcut, never an authority — on any doubt the
    /// rebuild wins and replaces it.
    fn state_for(&self, guild_id: &str, seq: u64) -> Result<GuildState, IngestError> {
        if let Some(cached) = self.states.get(guild_id) {
            if cached.head_seq + 1 == seq {
                return Ok(cached.clone());
            }
        }
        let log = self
            .store
            .get_log(guild_id)
            .map_err(|e| IngestError::Internal(e.to_string()))?;
        if log.is_empty() {
            return Err(IngestError::Validation(format!(
                "unknown guild {guild_id}"
            )));
        }
        let state = GuildState::fold(&log)
            .map_err(|e| IngestError::Internal(format!("state rebuild failed: {e}")))?;
        self.states.insert(guild_id.to_string(), state.clone());
        Ok(state)
    }

    /// Build the current state of a guild outside the ingest path (used by
    /// the retention loop). Returns `None` for unknown guilds.
    pub fn rebuild_state(&self, guild_id: &str) -> anyhow::Result<Option<GuildState>> {
        let log = self.store.get_log(guild_id)?;
        if log.is_empty() {
            return Ok(None);
        }
        Ok(Some(GuildState::fold(&log)?))
    }

    /// Acquire a guild's ingest lock, creating it lazily. The retention
    /// loop takes it around delete batches so ingest never interleaves.
    pub async fn lock_guild(&self, guild_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(guild_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Events for a snapshot, plus the seq of the relay's true log end.
    pub fn snapshot(
        &self,
        guild_id: &str,
        from_seq: Option<u64>,
        limit: Option<usize>,
    ) -> anyhow::Result<(Vec<Event>, Option<u64>)> {
        let log = self.store.get_log(guild_id)?;
        let end_seq = log.last().map(|ev| ev.seq);
        let mut events = log;
        if let Some(from) = from_seq {
            events.retain(|ev| ev.seq >= from);
        }
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok((events, end_seq))
    }
}
