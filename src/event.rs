//! Guild log event model and chain rules.
//!
//! An event's id is the SHA-256 of its canonical form minus `id` and
//! `signature`; the signature covers only `{body, author, createdAt}` so a
//! relay can assign `seq`/`prevHash` on the author's behalf. Tampering with
//! the assigned fields is still caught by the id hash.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{codec, crypto};

/// Channel retention policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Retention {
    pub mode: RetentionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
}

impl Retention {
    /// Policy that never expires messages.
    pub fn infinite() -> Self {
        Self {
            mode: RetentionMode::Infinite,
            days: None,
            seconds: None,
        }
    }

    /// Time-to-live policy in seconds.
    pub fn ttl(seconds: u64) -> Self {
        Self {
            mode: RetentionMode::Ttl,
            days: None,
            seconds: Some(seconds),
        }
    }

    /// Rolling window policy in days.
    pub fn rolling_window(days: u64) -> Self {
        Self {
            mode: RetentionMode::RollingWindow,
            days: Some(days),
            seconds: None,
        }
    }

    /// Message lifetime in milliseconds, or `None` for infinite retention.
    pub fn window_ms(&self) -> Option<u64> {
        match self.mode {
            RetentionMode::Infinite => None,
            RetentionMode::Ttl => Some(self.seconds.unwrap_or(0).saturating_mul(1_000)),
            RetentionMode::RollingWindow => {
                Some(self.days.unwrap_or(0).saturating_mul(86_400_000))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RetentionMode {
    #[serde(rename = "infinite")]
    Infinite,
    #[serde(rename = "rolling-window")]
    RollingWindow,
    #[serde(rename = "ttl")]
    Ttl,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelKind {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "voice")]
    Voice,
    #[serde(rename = "ephemeral-text")]
    EphemeralText,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Access {
    #[default]
    #[serde(rename = "public")]
    Public,
    #[serde(rename = "private")]
    Private,
}

/// Tagged union of event bodies. Every body carries the guild it belongs
/// to; for `GUILD_CREATE` the carried `guildId` must equal the genesis
/// event's own id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventBody {
    #[serde(rename = "GUILD_CREATE", rename_all = "camelCase")]
    GuildCreate {
        guild_id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default)]
        access: Access,
    },
    #[serde(rename = "CHANNEL_CREATE", rename_all = "camelCase")]
    ChannelCreate {
        guild_id: String,
        channel_id: String,
        name: String,
        kind: ChannelKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        retention: Option<Retention>,
    },
    #[serde(rename = "EPHEMERAL_POLICY_UPDATE", rename_all = "camelCase")]
    EphemeralPolicyUpdate {
        guild_id: String,
        channel_id: String,
        retention: Retention,
    },
    #[serde(rename = "ROLE_ASSIGN", rename_all = "camelCase")]
    RoleAssign {
        guild_id: String,
        user_id: String,
        role_id: String,
    },
    #[serde(rename = "ROLE_REVOKE", rename_all = "camelCase")]
    RoleRevoke {
        guild_id: String,
        user_id: String,
        role_id: String,
    },
    #[serde(rename = "BAN_USER", rename_all = "camelCase")]
    BanUser {
        guild_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "UNBAN_USER", rename_all = "camelCase")]
    UnbanUser { guild_id: String, user_id: String },
    #[serde(rename = "MESSAGE", rename_all = "camelCase")]
    Message {
        guild_id: String,
        channel_id: String,
        message_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    #[serde(rename = "EDIT_MESSAGE", rename_all = "camelCase")]
    EditMessage {
        guild_id: String,
        channel_id: String,
        message_id: String,
        new_content: String,
    },
    #[serde(rename = "DELETE_MESSAGE", rename_all = "camelCase")]
    DeleteMessage {
        guild_id: String,
        channel_id: String,
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "FORK_FROM", rename_all = "camelCase")]
    ForkFrom {
        guild_id: String,
        parent_guild_id: String,
        parent_seq: u64,
        parent_root_hash: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    #[serde(rename = "CHECKPOINT", rename_all = "camelCase")]
    Checkpoint {
        guild_id: String,
        seq: u64,
        root_hash: String,
        state: Value,
    },
}

impl EventBody {
    /// The guild this body belongs to.
    pub fn guild_id(&self) -> &str {
        match self {
            EventBody::GuildCreate { guild_id, .. }
            | EventBody::ChannelCreate { guild_id, .. }
            | EventBody::EphemeralPolicyUpdate { guild_id, .. }
            | EventBody::RoleAssign { guild_id, .. }
            | EventBody::RoleRevoke { guild_id, .. }
            | EventBody::BanUser { guild_id, .. }
            | EventBody::UnbanUser { guild_id, .. }
            | EventBody::Message { guild_id, .. }
            | EventBody::EditMessage { guild_id, .. }
            | EventBody::DeleteMessage { guild_id, .. }
            | EventBody::ForkFrom { guild_id, .. }
            | EventBody::Checkpoint { guild_id, .. } => guild_id,
        }
    }

    /// Wire tag of this body, for logging and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::GuildCreate { .. } => "GUILD_CREATE",
            EventBody::ChannelCreate { .. } => "CHANNEL_CREATE",
            EventBody::EphemeralPolicyUpdate { .. } => "EPHEMERAL_POLICY_UPDATE",
            EventBody::RoleAssign { .. } => "ROLE_ASSIGN",
            EventBody::RoleRevoke { .. } => "ROLE_REVOKE",
            EventBody::BanUser { .. } => "BAN_USER",
            EventBody::UnbanUser { .. } => "UNBAN_USER",
            EventBody::Message { .. } => "MESSAGE",
            EventBody::EditMessage { .. } => "EDIT_MESSAGE",
            EventBody::DeleteMessage { .. } => "DELETE_MESSAGE",
            EventBody::ForkFrom { .. } => "FORK_FROM",
            EventBody::Checkpoint { .. } => "CHECKPOINT",
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, EventBody::Message { .. })
    }
}

/// A single record in a guild log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hex SHA-256 of the canonical unsigned form.
    pub id: String,
    /// Dense per-guild sequence number starting at 0.
    pub seq: u64,
    /// Id of the previous event; `null` only at seq 0.
    pub prev_hash: Option<String>,
    /// Milliseconds since epoch, informational only.
    pub created_at: u64,
    /// Author public key, hex.
    pub author: String,
    pub body: EventBody,
    /// Compact ECDSA signature over `{body, author, createdAt}`, hex.
    pub signature: String,
}

impl Event {
    /// Build an event from relay-assigned chain position plus the signed
    /// publish fields, computing its id.
    pub fn assemble(
        seq: u64,
        prev_hash: Option<String>,
        created_at: u64,
        author: String,
        body: EventBody,
        signature: String,
    ) -> Self {
        let mut ev = Self {
            id: String::new(),
            seq,
            prev_hash,
            created_at,
            author,
            body,
            signature,
        };
        ev.id = compute_event_id(&ev);
        ev
    }
}

/// Recompute an event's id from its canonical unsigned form.
///
/// For `GUILD_CREATE` the body's `guildId` is blanked before hashing: the
/// genesis event's id IS the guild id, so including it would make the hash
/// self-referential. Authors therefore compute the id first (seq 0 and a
/// null prevHash are fixed for genesis) and then fill the field in.
pub fn compute_event_id(ev: &Event) -> String {
    let mut body = serde_json::to_value(&ev.body).expect("body serializes");
    if matches!(ev.body, EventBody::GuildCreate { .. }) {
        body["guildId"] = Value::String(String::new());
    }
    let unsigned = json!({
        "seq": ev.seq,
        "prevHash": ev.prev_hash,
        "createdAt": ev.created_at,
        "author": ev.author,
        "body": body,
    });
    codec::hash_hex(&unsigned)
}

/// Compose and sign a genesis event, resolving the guild id fixpoint.
pub fn genesis_event(
    keys: &crypto::Keys,
    name: &str,
    description: Option<String>,
    access: Access,
    created_at: u64,
) -> Event {
    let body = EventBody::GuildCreate {
        guild_id: String::new(),
        name: name.to_string(),
        description,
        access,
    };
    // The id ignores the genesis guildId, so signing after filling it in
    // still matches what subscribers verify.
    let probe = Event::assemble(0, None, created_at, keys.public_hex(), body, String::new());
    let guild_id = probe.id.clone();
    let body = match probe.body {
        EventBody::GuildCreate {
            name,
            description,
            access,
            ..
        } => EventBody::GuildCreate {
            guild_id,
            name,
            description,
            access,
        },
        _ => unreachable!(),
    };
    let signature = sign_body(keys, &body, created_at);
    Event::assemble(0, None, created_at, keys.public_hex(), body, signature)
}

/// Digest signed by the author. Deliberately excludes `seq`/`prevHash`.
pub fn signing_digest(body: &EventBody, author: &str, created_at: u64) -> [u8; 32] {
    codec::hash(&json!({
        "body": body,
        "author": author,
        "createdAt": created_at,
    }))
}

/// Verify an event's signature against its author key.
pub fn verify_signature(ev: &Event) -> bool {
    let digest = signing_digest(&ev.body, &ev.author, ev.created_at);
    crypto::verify(&ev.author, &digest, &ev.signature)
}

/// Sign a body for publication with the given keys.
pub fn sign_body(keys: &crypto::Keys, body: &EventBody, created_at: u64) -> String {
    keys.sign(&signing_digest(body, &keys.public_hex(), created_at))
}

/// Derive a channel id from its defining fields plus a creation salt.
///
/// Uniqueness within a guild is a convention, not hash-enforced: the reducer
/// is last-writer-wins on channel id.
pub fn channel_id(guild_id: &str, name: &str, kind: ChannelKind, salt: &str) -> String {
    codec::hash_hex(&json!({
        "guildId": guild_id,
        "name": name,
        "kind": kind,
        "salt": salt,
    }))
}

/// Strict chain integrity: dense seqs from 0, correct prevHash links,
/// recomputable ids, valid signatures, and consistent guild ids with the
/// genesis guildId equal to the genesis event id.
pub fn validate_chain(events: &[Event]) -> bool {
    let Some(genesis) = events.first() else {
        return true;
    };
    if !genesis_ok(genesis) {
        return false;
    }
    let guild_id = genesis.body.guild_id().to_string();
    let mut prev: Option<&Event> = None;
    for (i, ev) in events.iter().enumerate() {
        if ev.seq != i as u64 {
            return false;
        }
        if !link_ok(prev, ev) || !event_ok(ev) {
            return false;
        }
        if i > 0 && !non_genesis_ok(ev, &guild_id) {
            return false;
        }
        prev = Some(ev);
    }
    true
}

/// Relaxed chain rule for logs that have had messages pruned: seqs strictly
/// increase, prevHash must link wherever two consecutive seqs both survive,
/// and every surviving event still hashes and verifies. Clients treat the
/// gaps as retention, not tampering.
pub fn validate_pruned_chain(events: &[Event]) -> bool {
    let Some(genesis) = events.first() else {
        return true;
    };
    // Genesis is structural and can never be pruned away.
    if genesis.seq != 0 || !genesis_ok(genesis) || !event_ok(genesis) {
        return false;
    }
    let guild_id = genesis.body.guild_id().to_string();
    let mut prev = genesis;
    for ev in &events[1..] {
        if ev.seq <= prev.seq {
            return false;
        }
        if ev.seq == prev.seq + 1 && ev.prev_hash.as_deref() != Some(prev.id.as_str()) {
            return false;
        }
        if ev.prev_hash.is_none() || !event_ok(ev) || !non_genesis_ok(ev, &guild_id) {
            return false;
        }
        prev = ev;
    }
    true
}

fn genesis_ok(genesis: &Event) -> bool {
    matches!(genesis.body, EventBody::GuildCreate { .. })
        && genesis.prev_hash.is_none()
        && genesis.body.guild_id() == genesis.id
}

fn link_ok(prev: Option<&Event>, ev: &Event) -> bool {
    match prev {
        None => ev.prev_hash.is_none(),
        Some(p) => ev.prev_hash.as_deref() == Some(p.id.as_str()),
    }
}

fn event_ok(ev: &Event) -> bool {
    compute_event_id(ev) == ev.id && verify_signature(ev)
}

fn non_genesis_ok(ev: &Event, guild_id: &str) -> bool {
    !matches!(ev.body, EventBody::GuildCreate { .. }) && ev.body.guild_id() == guild_id
}
