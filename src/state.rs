//! Deterministic guild state reducer.
//!
//! State is derived purely from the ordered log: folding the same events
//! always yields byte-identical canonical state, which is what checkpoint
//! root hashes and cross-implementation interop rely on.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::event::{Access, ChannelKind, Event, EventBody, Retention};

/// A channel as seen by the reducer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub kind: ChannelKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,
}

/// A named role. No core event mints these yet; the map exists so state
/// serialization is forward-compatible with role definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleInfo {
    pub name: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub roles: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub joined_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BanInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub banned_at: u64,
}

/// Reduced structural view of one guild at some head.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuildState {
    pub guild_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub access: Access,
    pub owner_id: String,
    pub created_at: u64,
    pub head_seq: u64,
    pub head_hash: String,
    pub channels: BTreeMap<String, ChannelInfo>,
    pub roles: BTreeMap<String, RoleInfo>,
    pub members: BTreeMap<String, MemberInfo>,
    pub bans: BTreeMap<String, BanInfo>,
}

impl GuildState {
    /// Seed state from a genesis event. The author becomes the permanent
    /// owner, with a member record carrying the `owner` role.
    pub fn from_genesis(genesis: &Event) -> Result<Self> {
        let EventBody::GuildCreate {
            guild_id,
            name,
            description,
            access,
        } = &genesis.body
        else {
            return Err(anyhow!("not a genesis event: {}", genesis.body.kind()));
        };
        if genesis.seq != 0 {
            return Err(anyhow!("genesis event must be seq 0"));
        }
        let mut members = BTreeMap::new();
        members.insert(
            genesis.author.clone(),
            MemberInfo {
                roles: BTreeSet::from(["owner".to_string()]),
                nickname: None,
                joined_at: genesis.created_at,
            },
        );
        Ok(Self {
            guild_id: guild_id.clone(),
            name: name.clone(),
            description: description.clone(),
            access: *access,
            owner_id: genesis.author.clone(),
            created_at: genesis.created_at,
            head_seq: genesis.seq,
            head_hash: genesis.id.clone(),
            channels: BTreeMap::new(),
            roles: BTreeMap::new(),
            members,
            bans: BTreeMap::new(),
        })
    }

    /// Apply one event. Message-type events, forks, and checkpoints touch
    /// only the head; everything else updates exactly the mapping its type
    /// owns.
    pub fn apply(&mut self, ev: &Event) {
        match &ev.body {
            EventBody::ChannelCreate {
                channel_id,
                name,
                kind,
                retention,
                ..
            } => {
                self.channels.insert(
                    channel_id.clone(),
                    ChannelInfo {
                        name: name.clone(),
                        kind: *kind,
                        retention: retention.clone(),
                    },
                );
            }
            EventBody::EphemeralPolicyUpdate {
                channel_id,
                retention,
                ..
            } => {
                if let Some(channel) = self.channels.get_mut(channel_id) {
                    channel.retention = Some(retention.clone());
                }
            }
            EventBody::RoleAssign {
                user_id, role_id, ..
            } => {
                self.members
                    .entry(user_id.clone())
                    .or_insert_with(|| MemberInfo {
                        roles: BTreeSet::new(),
                        nickname: None,
                        joined_at: ev.created_at,
                    })
                    .roles
                    .insert(role_id.clone());
            }
            EventBody::RoleRevoke {
                user_id, role_id, ..
            } => {
                if let Some(member) = self.members.get_mut(user_id) {
                    member.roles.remove(role_id);
                }
            }
            EventBody::BanUser {
                user_id, reason, ..
            } => {
                self.bans.insert(
                    user_id.clone(),
                    BanInfo {
                        reason: reason.clone(),
                        banned_at: ev.created_at,
                    },
                );
                self.members.remove(user_id);
            }
            EventBody::UnbanUser { user_id, .. } => {
                self.bans.remove(user_id);
            }
            EventBody::GuildCreate { .. }
            | EventBody::Message { .. }
            | EventBody::EditMessage { .. }
            | EventBody::DeleteMessage { .. }
            | EventBody::ForkFrom { .. }
            | EventBody::Checkpoint { .. } => {}
        }
        self.head_seq = ev.seq;
        self.head_hash = ev.id.clone();
    }

    /// Fold an ordered log into state. The first event must be genesis.
    pub fn fold(events: &[Event]) -> Result<Self> {
        let genesis = events.first().ok_or_else(|| anyhow!("empty log"))?;
        let mut state = Self::from_genesis(genesis)?;
        for ev in &events[1..] {
            state.apply(ev);
        }
        Ok(state)
    }

    /// Serialize to the JSON value embedded in checkpoints.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("state serializes")
    }

    /// Canonical byte form; two equal states are byte-identical here.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        codec::canonical(&self.to_value())
    }

    /// Hash of the canonical state, as carried in `CHECKPOINT.rootHash`.
    pub fn root_hash(&self) -> String {
        codec::hash_hex(&self.to_value())
    }
}

/// Rehydrate state from a checkpoint's embedded snapshot.
pub fn deserialize_state(value: &Value) -> Result<GuildState> {
    serde_json::from_value(value.clone()).map_err(|e| anyhow!("bad checkpoint state: {e}"))
}
