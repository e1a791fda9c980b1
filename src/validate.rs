//! Permission and eligibility checks, run by the relay between signature
//! verification and append. Failure text travels back to the publisher in a
//! `VALIDATION_FAILED` error frame.

use crate::codec;
use crate::event::{Event, EventBody};
use crate::state::{deserialize_state, GuildState};

/// Decide whether `ev` may be appended on top of `state`.
pub fn validate_event(
    state: &GuildState,
    ev: &Event,
    relay_key: Option<&str>,
) -> Result<(), String> {
    if ev.body.guild_id() != state.guild_id {
        return Err(format!(
            "event guild {} does not match log {}",
            ev.body.guild_id(),
            state.guild_id
        ));
    }
    match &ev.body {
        EventBody::ChannelCreate { .. }
        | EventBody::EphemeralPolicyUpdate { .. }
        | EventBody::RoleAssign { .. }
        | EventBody::RoleRevoke { .. }
        | EventBody::BanUser { .. }
        | EventBody::UnbanUser { .. } => require_moderator(state, ev),
        EventBody::Message { channel_id, .. } => {
            if !state.channels.contains_key(channel_id) {
                return Err(format!("unknown channel {channel_id}"));
            }
            if state.bans.contains_key(&ev.author) {
                return Err("author is banned".into());
            }
            if state.access == crate::event::Access::Private
                && !state.members.contains_key(&ev.author)
            {
                return Err("guild is private; author is not a member".into());
            }
            Ok(())
        }
        EventBody::Checkpoint {
            seq,
            root_hash,
            state: snapshot,
            ..
        } => {
            if relay_key != Some(ev.author.as_str()) {
                return Err("checkpoint not authored by this relay".into());
            }
            if *seq != ev.seq {
                return Err(format!("checkpoint claims seq {seq}, assigned {}", ev.seq));
            }
            if *root_hash != codec::hash_hex(snapshot) {
                return Err("checkpoint rootHash does not match state".into());
            }
            deserialize_state(snapshot).map_err(|e| e.to_string())?;
            Ok(())
        }
        // Edits, deletes, forks, and genesis carry no extra restrictions
        // beyond the chain rules.
        EventBody::GuildCreate { .. }
        | EventBody::EditMessage { .. }
        | EventBody::DeleteMessage { .. }
        | EventBody::ForkFrom { .. } => Ok(()),
    }
}

/// Privileged structural changes need the owner, or a member holding the
/// `owner` or `admin` role.
fn require_moderator(state: &GuildState, ev: &Event) -> Result<(), String> {
    if ev.author == state.owner_id {
        return Ok(());
    }
    if let Some(member) = state.members.get(&ev.author) {
        if member.roles.contains("owner") || member.roles.contains("admin") {
            return Ok(());
        }
    }
    Err(format!(
        "permission denied: {} requires owner or admin",
        ev.body.kind()
    ))
}
