//! Retention pruning and periodic state checkpoints.
//!
//! Two timers per relay instance. Prune deletes expired MESSAGE events from
//! channels with ttl or rolling-window retention; checkpoint publishes a
//! signed state snapshot through the normal sequencing path so it becomes
//! the next event in the chain. Both loops tolerate per-guild failures by
//! logging and moving on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::crypto::Keys;
use crate::engine::Engine;
use crate::event::{sign_body, Event, EventBody};
use crate::now_ms;
use crate::proto::Publish;

/// Spawn the prune and checkpoint timers. Overlapping iterations are
/// skipped rather than queued.
pub fn spawn(
    engine: Arc<Engine>,
    relay_keys: Keys,
    prune_every: Duration,
    checkpoint_every: Duration,
) -> Vec<JoinHandle<()>> {
    let prune_engine = engine.clone();
    let prune = tokio::spawn(async move {
        // interval_at: the first pass runs one period after boot, not at it.
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + prune_every, prune_every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            prune_all(&prune_engine, now_ms()).await;
        }
    });
    let checkpoint = tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(
            tokio::time::Instant::now() + checkpoint_every,
            checkpoint_every,
        );
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            checkpoint_all(&engine, &relay_keys).await;
        }
    });
    vec![prune, checkpoint]
}

/// Run one prune pass over every guild.
pub async fn prune_all(engine: &Engine, now: u64) {
    let guild_ids = match engine.store().get_guild_ids() {
        Ok(ids) => ids,
        Err(e) => {
            warn!("prune: listing guilds failed: {e}");
            return;
        }
    };
    for guild_id in guild_ids {
        match prune_guild(engine, &guild_id, now).await {
            Ok(0) => {}
            Ok(n) => debug!(guild = %guild_id, pruned = n, "retention prune"),
            Err(e) => warn!(guild = %guild_id, "prune failed: {e}"),
        }
    }
}

/// Delete expired messages from one guild under its ingest lock.
async fn prune_guild(engine: &Engine, guild_id: &str, now: u64) -> Result<usize> {
    let _guard = engine.lock_guild(guild_id).await;
    let Some(state) = engine.rebuild_state(guild_id)? else {
        return Ok(0);
    };
    let log = engine.store().get_log(guild_id)?;
    let mut pruned = 0;
    for ev in &log {
        let EventBody::Message { channel_id, .. } = &ev.body else {
            continue;
        };
        let Some(window) = state
            .channels
            .get(channel_id)
            .and_then(|chan| chan.retention.as_ref())
            .and_then(|retention| retention.window_ms())
        else {
            continue;
        };
        if now.saturating_sub(ev.created_at) > window {
            engine.store().delete_event(guild_id, ev.seq)?;
            pruned += 1;
        }
    }
    Ok(pruned)
}

/// Run one checkpoint pass over every guild.
pub async fn checkpoint_all(engine: &Engine, relay_keys: &Keys) {
    let guild_ids = match engine.store().get_guild_ids() {
        Ok(ids) => ids,
        Err(e) => {
            warn!("checkpoint: listing guilds failed: {e}");
            return;
        }
    };
    for guild_id in guild_ids {
        match checkpoint_guild(engine, relay_keys, &guild_id).await {
            Ok(Some(ev)) => debug!(guild = %guild_id, seq = ev.seq, "checkpointed"),
            Ok(None) => {}
            Err(e) => warn!(guild = %guild_id, "checkpoint failed: {e}"),
        }
    }
}

/// Publish a signed state snapshot for one guild, unless its log is empty
/// or already ends in a checkpoint.
pub async fn checkpoint_guild(
    engine: &Engine,
    relay_keys: &Keys,
    guild_id: &str,
) -> Result<Option<Event>> {
    let Some(last) = engine.store().get_last_event(guild_id)? else {
        return Ok(None);
    };
    if matches!(last.body, EventBody::Checkpoint { .. }) {
        return Ok(None);
    }
    let Some(state) = engine.rebuild_state(guild_id)? else {
        return Ok(None);
    };
    let head = engine
        .store()
        .head(guild_id)?
        .ok_or_else(|| anyhow::anyhow!("guild has events but no head"))?;
    let body = EventBody::Checkpoint {
        guild_id: guild_id.to_string(),
        seq: head.seq + 1,
        root_hash: state.root_hash(),
        state: state.to_value(),
    };
    let created_at = now_ms();
    let publish = Publish {
        signature: sign_body(relay_keys, &body, created_at),
        author: relay_keys.public_hex(),
        body,
        created_at,
    };
    // The relay is its own author here; the checkpoint flows through the
    // same sequencing path and broadcast as any client publish.
    let ev = engine
        .ingest(publish, None)
        .await
        .map_err(|e| anyhow::anyhow!("checkpoint rejected: {e}"))?;
    Ok(Some(ev))
}
