//! Client replica: mirrors guild state with the same reducer the relay
//! runs, over one WebSocket per configured relay, with optional peer-to-peer
//! gossip of raw `EVENT` frames.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::crypto::Keys;
use crate::event::{
    self, channel_id, compute_event_id, genesis_event, sign_body, Access, ChannelKind, Event,
    EventBody, Retention,
};
use crate::now_ms;
use crate::proto::{self, Hello, Publish, Snapshot, Sub, PROTOCOL};
use crate::state::GuildState;

/// Reconnect backoff: base 1 s, doubled per failure, capped at 30 s.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Dedup FIFO capacity and the size it evicts down to on overflow.
const SEEN_CAP: usize = 1_000;
const SEEN_FLOOR: usize = 900;

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// Bounded dedup set over event ids, FIFO eviction.
struct SeenIds {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenIds {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    /// Record an id; returns false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > SEEN_CAP {
            while self.order.len() > SEEN_FLOOR {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// What the replica did with one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Applied on top of the current head.
    Applied,
    /// Already seen; dropped.
    Duplicate,
    /// Bad signature or id; silently dropped (relay bug or malicious peer).
    Invalid,
    /// Out of order; the next snapshot cycle resynchronizes.
    Gap,
}

/// Pure replica state machine, shared by the relay client and peer sockets.
pub struct Replica {
    states: HashMap<String, GuildState>,
    seen: SeenIds,
    /// Highest `(seq, id)` observed per guild. Snapshots that contradict a
    /// pinned id are refused, so a relay cannot rewrite observed history.
    pins: HashMap<String, (u64, String)>,
}

impl Replica {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            seen: SeenIds::new(),
            pins: HashMap::new(),
        }
    }

    pub fn state(&self, guild_id: &str) -> Option<&GuildState> {
        self.states.get(guild_id)
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Handle one live `EVENT`.
    pub fn on_event(&mut self, ev: &Event) -> EventOutcome {
        if !self.seen.insert(&ev.id) {
            return EventOutcome::Duplicate;
        }
        if compute_event_id(ev) != ev.id || !event::verify_signature(ev) {
            debug!(id = %ev.id, "dropping event with bad id or signature");
            return EventOutcome::Invalid;
        }
        let guild_id = ev.body.guild_id().to_string();
        match self.states.get_mut(&guild_id) {
            None => {
                if ev.seq == 0 {
                    match GuildState::from_genesis(ev) {
                        Ok(state) => {
                            self.states.insert(guild_id.clone(), state);
                            self.pins.insert(guild_id, (0, ev.id.clone()));
                            EventOutcome::Applied
                        }
                        Err(_) => EventOutcome::Invalid,
                    }
                } else {
                    debug!(guild = %guild_id, seq = ev.seq, "gap: no local state");
                    EventOutcome::Gap
                }
            }
            Some(state) => {
                if ev.seq == state.head_seq + 1
                    && ev.prev_hash.as_deref() == Some(state.head_hash.as_str())
                {
                    state.apply(ev);
                    self.pins.insert(guild_id, (ev.seq, ev.id.clone()));
                    EventOutcome::Applied
                } else {
                    debug!(
                        guild = %guild_id,
                        seq = ev.seq,
                        head = state.head_seq,
                        "gap: awaiting snapshot"
                    );
                    EventOutcome::Gap
                }
            }
        }
    }

    /// Handle a `SNAPSHOT`: verify the (possibly pruned) chain, check it
    /// against the pinned head, and fully replace the guild's state.
    pub fn on_snapshot(&mut self, guild_id: &str, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        if events[0].body.guild_id() != guild_id {
            return Err(anyhow!("snapshot events belong to a different guild"));
        }
        if !event::validate_pruned_chain(events) {
            return Err(anyhow!("snapshot chain does not verify"));
        }
        if let Some((pin_seq, pin_id)) = self.pins.get(guild_id) {
            if let Some(at_pin) = events.iter().find(|ev| ev.seq == *pin_seq) {
                if at_pin.id != *pin_id {
                    return Err(anyhow!("snapshot contradicts pinned head at seq {pin_seq}"));
                }
            }
        }
        let state = GuildState::fold(events)?;
        for ev in events {
            self.seen.insert(&ev.id);
        }
        let last = events.last().expect("non-empty");
        self.pins
            .insert(guild_id.to_string(), (last.seq, last.id.clone()));
        self.states.insert(guild_id.to_string(), state);
        Ok(())
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Open peer sockets for gossip forwarding.
#[derive(Default)]
pub struct PeerSet {
    peers: DashMap<u64, mpsc::UnboundedSender<String>>,
    next_id: AtomicU64,
}

impl PeerSet {
    fn add(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers.insert(id, tx);
        id
    }

    fn remove(&self, id: u64) {
        self.peers.remove(&id);
    }

    /// Forward a raw frame to every open peer except the sender.
    fn forward(&self, from: Option<u64>, frame: &str) {
        for peer in self.peers.iter() {
            if Some(*peer.key()) != from {
                let _ = peer.value().send(frame.to_string());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// A chat client: relay connections, the local replica, publish helpers,
/// and optional peer serving.
pub struct Client {
    keys: Keys,
    relays: Vec<String>,
    replica: Arc<Mutex<Replica>>,
    conns: Arc<DashMap<String, mpsc::UnboundedSender<String>>>,
    subs: Arc<DashMap<String, String>>,
    peers: Arc<PeerSet>,
    emit: mpsc::UnboundedSender<Event>,
    next_sub: AtomicU64,
}

impl Client {
    /// Build a client; the receiver yields every event applied locally.
    pub fn new(keys: Keys, relays: Vec<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (emit, events) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            keys,
            relays,
            replica: Arc::new(Mutex::new(Replica::new())),
            conns: Arc::new(DashMap::new()),
            subs: Arc::new(DashMap::new()),
            peers: Arc::new(PeerSet::default()),
            emit,
            next_sub: AtomicU64::new(1),
        });
        (client, events)
    }

    pub fn public_hex(&self) -> String {
        self.keys.public_hex()
    }

    /// Snapshot of the local replica's view of one guild.
    pub fn state(&self, guild_id: &str) -> Option<GuildState> {
        self.replica.lock().expect("replica lock").state(guild_id).cloned()
    }

    /// Spawn one reconnecting transport task per configured relay.
    pub fn connect(self: &Arc<Self>) {
        for relay in self.relays.clone() {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                client.run_relay(relay).await;
            });
        }
    }

    /// Maintain one relay connection forever, with exponential backoff.
    async fn run_relay(self: Arc<Self>, relay: String) {
        if let Err(e) = Url::parse(&relay) {
            warn!(%relay, "bad relay url: {e}");
            return;
        }
        let mut backoff = BACKOFF_BASE;
        loop {
            match tokio_tungstenite::connect_async(relay.as_str()).await {
                Ok((socket, _)) => {
                    backoff = BACKOFF_BASE;
                    self.drive_socket(&relay, socket).await;
                    self.conns.remove(&relay);
                    debug!(%relay, "relay disconnected");
                }
                Err(e) => {
                    warn!(%relay, "connect failed: {e}");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn drive_socket(
        &self,
        relay: &str,
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.conns.insert(relay.to_string(), tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        let hello = Hello {
            protocol: PROTOCOL.to_string(),
            client_name: Some("guildr-client".to_string()),
            client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };
        let _ = tx.send(proto::frame("HELLO", &hello));
        // Re-issue every tracked subscription so a reconnect resyncs.
        for entry in self.subs.iter() {
            let _ = tx.send(sub_frame(entry.value(), entry.key()));
        }

        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(txt) = msg {
                self.handle_frame(&txt);
            }
        }
        writer.abort();
    }

    /// Handle one frame from a relay connection.
    fn handle_frame(&self, text: &str) {
        let Ok((kind, payload)) = proto::parse(text) else {
            debug!("ignoring unparseable frame");
            return;
        };
        match kind.as_str() {
            "EVENT" => {
                if let Ok(ev) = serde_json::from_value::<Event>(payload) {
                    self.ingest_event(ev, text, None);
                }
            }
            "SNAPSHOT" => {
                if let Ok(snapshot) = serde_json::from_value::<Snapshot>(payload) {
                    let mut replica = self.replica.lock().expect("replica lock");
                    if let Err(e) = replica.on_snapshot(&snapshot.guild_id, &snapshot.events) {
                        warn!(guild = %snapshot.guild_id, "snapshot rejected: {e}");
                    }
                }
            }
            "ERROR" => {
                warn!("relay error: {text}");
            }
            "HELLO_OK" => {
                debug!("relay handshake complete");
            }
            _ => {}
        }
    }

    /// Dedup, verify, apply, emit, and gossip one event frame.
    fn ingest_event(&self, ev: Event, raw: &str, from_peer: Option<u64>) {
        let outcome = self.replica.lock().expect("replica lock").on_event(&ev);
        if outcome == EventOutcome::Applied {
            let _ = self.emit.send(ev);
            self.peers.forward(from_peer, raw);
        }
    }

    fn next_sub_id(&self) -> String {
        format!("sub-{}", self.next_sub.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to a guild on every connected relay and remember it for
    /// reconnects.
    pub fn subscribe(&self, guild_id: &str) {
        let sub_id = self
            .subs
            .entry(guild_id.to_string())
            .or_insert_with(|| self.next_sub_id())
            .clone();
        for conn in self.conns.iter() {
            let _ = conn.value().send(sub_frame(&sub_id, guild_id));
        }
    }

    /// Sign and send a publish to one connected relay.
    pub fn publish(&self, body: EventBody, created_at: u64) -> Result<()> {
        let publish = Publish {
            signature: sign_body(&self.keys, &body, created_at),
            author: self.keys.public_hex(),
            body,
            created_at,
        };
        let frame = proto::frame("PUBLISH", &publish);
        let conn = self
            .conns
            .iter()
            .next()
            .ok_or_else(|| anyhow!("no relay connected"))?;
        conn.value()
            .send(frame)
            .map_err(|_| anyhow!("relay connection closed"))?;
        Ok(())
    }

    /// Create a guild; returns the guild id and subscribes to it. Signing
    /// is deterministic, so re-signing the filled-in genesis body inside
    /// `publish` reproduces the signature the id was derived under.
    pub fn create_guild(
        &self,
        name: &str,
        description: Option<String>,
        access: Access,
    ) -> Result<String> {
        let g = genesis_event(&self.keys, name, description, access, now_ms());
        let guild_id = g.id.clone();
        self.publish(g.body, g.created_at)?;
        self.subscribe(&guild_id);
        Ok(guild_id)
    }

    /// Create a channel with a random creation salt; returns its id.
    pub fn create_channel(
        &self,
        guild_id: &str,
        name: &str,
        kind: ChannelKind,
        retention: Option<Retention>,
    ) -> Result<String> {
        let salt = random_hex(8);
        let cid = channel_id(guild_id, name, kind, &salt);
        self.publish(
            EventBody::ChannelCreate {
                guild_id: guild_id.to_string(),
                channel_id: cid.clone(),
                name: name.to_string(),
                kind,
                retention,
            },
            now_ms(),
        )?;
        Ok(cid)
    }

    /// Post a message; returns its client-chosen id. The random message id
    /// is also the only replay protection the protocol offers.
    pub fn send_message(
        &self,
        guild_id: &str,
        channel_id: &str,
        content: &str,
        reply_to: Option<String>,
    ) -> Result<String> {
        let message_id = random_hex(16);
        self.publish(
            EventBody::Message {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
                message_id: message_id.clone(),
                content: content.to_string(),
                reply_to,
            },
            now_ms(),
        )?;
        Ok(message_id)
    }

    pub fn edit_message(&self, guild_id: &str, channel_id: &str, message_id: &str, new_content: &str) -> Result<()> {
        self.publish(
            EventBody::EditMessage {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
                message_id: message_id.to_string(),
                new_content: new_content.to_string(),
            },
            now_ms(),
        )
    }

    pub fn delete_message(&self, guild_id: &str, channel_id: &str, message_id: &str, reason: Option<String>) -> Result<()> {
        self.publish(
            EventBody::DeleteMessage {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
                message_id: message_id.to_string(),
                reason,
            },
            now_ms(),
        )
    }

    pub fn assign_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> Result<()> {
        self.publish(
            EventBody::RoleAssign {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
                role_id: role_id.to_string(),
            },
            now_ms(),
        )
    }

    pub fn revoke_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> Result<()> {
        self.publish(
            EventBody::RoleRevoke {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
                role_id: role_id.to_string(),
            },
            now_ms(),
        )
    }

    pub fn ban_user(&self, guild_id: &str, user_id: &str, reason: Option<String>) -> Result<()> {
        self.publish(
            EventBody::BanUser {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
                reason,
            },
            now_ms(),
        )
    }

    pub fn unban_user(&self, guild_id: &str, user_id: &str) -> Result<()> {
        self.publish(
            EventBody::UnbanUser {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
            },
            now_ms(),
        )
    }

    pub fn update_retention(&self, guild_id: &str, channel_id: &str, retention: Retention) -> Result<()> {
        self.publish(
            EventBody::EphemeralPolicyUpdate {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
                retention,
            },
            now_ms(),
        )
    }

    /// Fork a guild: a fresh genesis followed by a `FORK_FROM` anchor
    /// naming the parent's id, seq, and root hash. Returns the new guild id.
    pub fn fork_guild(
        &self,
        name: &str,
        parent: &GuildState,
        note: Option<String>,
    ) -> Result<String> {
        let guild_id = self.create_guild(name, None, parent.access)?;
        self.publish(
            EventBody::ForkFrom {
                guild_id: guild_id.clone(),
                parent_guild_id: parent.guild_id.clone(),
                parent_seq: parent.head_seq,
                parent_root_hash: parent.root_hash(),
                note,
            },
            now_ms(),
        )?;
        Ok(guild_id)
    }

    /// Serve peer sockets: inbound `EVENT` frames feed the replica and are
    /// gossip-forwarded to every other open peer.
    pub async fn serve_peers(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let client = Arc::clone(&self);
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(socket) => client.drive_peer(socket).await,
                    Err(e) => debug!(%addr, "peer handshake failed: {e}"),
                }
            });
        }
    }

    async fn drive_peer(
        &self,
        socket: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let peer_id = self.peers.add(tx);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(txt) = msg {
                if let Ok((kind, payload)) = proto::parse(&txt) {
                    if kind == "EVENT" {
                        if let Ok(ev) = serde_json::from_value::<Event>(payload) {
                            self.ingest_event(ev, &txt, Some(peer_id));
                        }
                    }
                }
            }
        }
        self.peers.remove(peer_id);
        writer.abort();
    }
}

fn sub_frame(sub_id: &str, guild_id: &str) -> String {
    proto::frame(
        "SUB",
        &Sub {
            sub_id: sub_id.to_string(),
            guild_id: guild_id.to_string(),
            channels: None,
            from_seq: None,
            limit: None,
        },
    )
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
    hex::encode(buf)
}
