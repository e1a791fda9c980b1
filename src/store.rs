//! Append-only guild log storage.
//!
//! The store is a passive sink: the sequencing engine guarantees that
//! appends arrive with the next expected seq, and the store never re-checks
//! the chain. Deletes are only ever issued for MESSAGE events by the
//! retention loop, so surviving logs stay structurally consistent.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde_json::to_writer;

use crate::event::Event;

/// Chain head pointer: seq and id of the last appended event. Tracked
/// separately from the log so pruning the newest message cannot roll the
/// sequence counter back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub seq: u64,
    pub id: String,
}

/// Abstract capability over per-guild, append-only event logs.
pub trait LogStore: Send + Sync {
    /// Append the next event of a guild's log.
    fn append(&self, guild_id: &str, event: &Event) -> Result<()>;
    /// All surviving events of a guild in ascending seq; empty when unknown.
    fn get_log(&self, guild_id: &str) -> Result<Vec<Event>>;
    /// The surviving event with the greatest seq.
    fn get_last_event(&self, guild_id: &str) -> Result<Option<Event>>;
    /// The append head, which may outlive the event it points at.
    fn head(&self, guild_id: &str) -> Result<Option<Head>>;
    /// All guild ids with at least one appended event.
    fn get_guild_ids(&self) -> Result<Vec<String>>;
    /// Remove one event, leaving a gap. Idempotent.
    fn delete_event(&self, guild_id: &str, seq: u64) -> Result<()>;
    /// Flush and release resources.
    fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryLog {
    events: BTreeMap<u64, Event>,
    head: Option<Head>,
}

/// Process-memory backing, used by tests and embeddable clients.
#[derive(Default)]
pub struct MemoryStore {
    guilds: Mutex<HashMap<String, MemoryLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn append(&self, guild_id: &str, event: &Event) -> Result<()> {
        let mut guilds = self.guilds.lock().expect("store lock");
        let log = guilds.entry(guild_id.to_string()).or_default();
        log.events.insert(event.seq, event.clone());
        log.head = Some(Head {
            seq: event.seq,
            id: event.id.clone(),
        });
        Ok(())
    }

    fn get_log(&self, guild_id: &str) -> Result<Vec<Event>> {
        let guilds = self.guilds.lock().expect("store lock");
        Ok(guilds
            .get(guild_id)
            .map(|log| log.events.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_last_event(&self, guild_id: &str) -> Result<Option<Event>> {
        let guilds = self.guilds.lock().expect("store lock");
        Ok(guilds
            .get(guild_id)
            .and_then(|log| log.events.values().next_back().cloned()))
    }

    fn head(&self, guild_id: &str) -> Result<Option<Head>> {
        let guilds = self.guilds.lock().expect("store lock");
        Ok(guilds.get(guild_id).and_then(|log| log.head.clone()))
    }

    fn get_guild_ids(&self) -> Result<Vec<String>> {
        let guilds = self.guilds.lock().expect("store lock");
        let mut ids: Vec<String> = guilds.keys().cloned().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete_event(&self, guild_id: &str, seq: u64) -> Result<()> {
        let mut guilds = self.guilds.lock().expect("store lock");
        if let Some(log) = guilds.get_mut(guild_id) {
            log.events.remove(&seq);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed store: one JSON document per event under
/// `guilds/<guildId>/<10-digit seq>.json`, plus a `head` pointer file.
/// Writes go through a temp file and an atomic rename.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("guilds"))?;
        Ok(())
    }

    fn guild_dir(&self, guild_id: &str) -> Result<PathBuf> {
        // Guild ids are hex hashes; refuse anything that could traverse.
        if guild_id.is_empty() || !guild_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!("invalid guild id"));
        }
        Ok(self.root.join("guilds").join(guild_id))
    }

    fn event_path(&self, guild_id: &str, seq: u64) -> Result<PathBuf> {
        Ok(self.guild_dir(guild_id)?.join(format!("{seq:010}.json")))
    }

    fn write_atomic(&self, path: &PathBuf, write: impl FnOnce(&fs::File) -> Result<()>) -> Result<()> {
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        write(tmp.as_file())?;
        tmp.persist(path).context("persisting store file")?;
        Ok(())
    }
}

impl LogStore for FileStore {
    fn append(&self, guild_id: &str, event: &Event) -> Result<()> {
        let path = self.event_path(guild_id, event.seq)?;
        self.write_atomic(&path, |f| {
            to_writer(f, event)?;
            Ok(())
        })?;
        let head = self.guild_dir(guild_id)?.join("head");
        let pointer = format!("{}\n{}\n", event.seq, event.id);
        self.write_atomic(&head, |mut f| {
            use std::io::Write;
            f.write_all(pointer.as_bytes())?;
            Ok(())
        })
    }

    fn get_log(&self, guild_id: &str) -> Result<Vec<Event>> {
        let dir = self.guild_dir(guild_id)?;
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut names: Vec<String> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".json"))
            .collect();
        // Zero-padded seq filenames sort in log order.
        names.sort_unstable();
        let mut events = Vec::with_capacity(names.len());
        for name in names {
            let data = fs::read_to_string(dir.join(&name))?;
            events.push(serde_json::from_str(&data).context("parsing stored event")?);
        }
        Ok(events)
    }

    fn get_last_event(&self, guild_id: &str) -> Result<Option<Event>> {
        if let Some(head) = self.head(guild_id)? {
            let path = self.event_path(guild_id, head.seq)?;
            if path.exists() {
                let data = fs::read_to_string(path)?;
                return Ok(Some(serde_json::from_str(&data)?));
            }
        }
        Ok(self.get_log(guild_id)?.pop())
    }

    fn head(&self, guild_id: &str) -> Result<Option<Head>> {
        let path = self.guild_dir(guild_id)?.join("head");
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)?;
        let mut lines = data.lines();
        let seq = lines
            .next()
            .ok_or_else(|| anyhow!("empty head pointer"))?
            .trim()
            .parse()
            .context("parsing head seq")?;
        let id = lines
            .next()
            .ok_or_else(|| anyhow!("head pointer missing id"))?
            .trim()
            .to_string();
        Ok(Some(Head { seq, id }))
    }

    fn get_guild_ids(&self) -> Result<Vec<String>> {
        let dir = self.root.join("guilds");
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut ids: Vec<String> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete_event(&self, guild_id: &str, seq: u64) -> Result<()> {
        let path = self.event_path(guild_id, seq)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keys;
    use crate::event::{genesis_event, sign_body, Access, EventBody};
    use tempfile::TempDir;

    fn sample_log(n: u64) -> (String, Vec<Event>) {
        let keys = Keys::generate();
        let genesis = genesis_event(&keys, "G", None, Access::Public, 1_000);
        let gid = genesis.id.clone();
        let mut events = vec![genesis];
        for i in 1..=n {
            let prev = events.last().unwrap();
            let body = EventBody::Message {
                guild_id: gid.clone(),
                channel_id: "c".into(),
                message_id: format!("m{i}"),
                content: "hi".into(),
                reply_to: None,
            };
            let sig = sign_body(&keys, &body, 1_000 + i);
            events.push(Event::assemble(
                i,
                Some(prev.id.clone()),
                1_000 + i,
                keys.public_hex(),
                body,
                sig,
            ));
        }
        (gid, events)
    }

    fn check_round_trip(store: &dyn LogStore) {
        let (gid, events) = sample_log(3);
        for ev in &events {
            store.append(&gid, ev).unwrap();
        }
        assert_eq!(store.get_log(&gid).unwrap(), events);
        assert_eq!(store.get_last_event(&gid).unwrap().unwrap(), events[3]);
        assert_eq!(
            store.head(&gid).unwrap().unwrap(),
            Head {
                seq: 3,
                id: events[3].id.clone()
            }
        );
        assert_eq!(store.get_guild_ids().unwrap(), vec![gid.clone()]);
    }

    fn check_delete_leaves_gap(store: &dyn LogStore) {
        let (gid, events) = sample_log(3);
        for ev in &events {
            store.append(&gid, ev).unwrap();
        }
        store.delete_event(&gid, 2).unwrap();
        let log = store.get_log(&gid).unwrap();
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 3]);
        // Deleting again is a no-op.
        store.delete_event(&gid, 2).unwrap();
        assert_eq!(store.get_log(&gid).unwrap().len(), 3);
    }

    fn check_head_survives_head_delete(store: &dyn LogStore) {
        let (gid, events) = sample_log(2);
        for ev in &events {
            store.append(&gid, ev).unwrap();
        }
        store.delete_event(&gid, 2).unwrap();
        // The pointer still names the pruned head, so seq 2 is never reused.
        assert_eq!(store.head(&gid).unwrap().unwrap().seq, 2);
        assert_eq!(store.get_last_event(&gid).unwrap().unwrap().seq, 1);
    }

    #[test]
    fn memory_round_trip() {
        check_round_trip(&MemoryStore::new());
    }

    #[test]
    fn memory_delete_leaves_gap() {
        check_delete_leaves_gap(&MemoryStore::new());
    }

    #[test]
    fn memory_head_survives_head_delete() {
        check_head_survives_head_delete(&MemoryStore::new());
    }

    #[test]
    fn memory_unknown_guild_is_empty() {
        let store = MemoryStore::new();
        assert!(store.get_log("ab").unwrap().is_empty());
        assert!(store.get_last_event("ab").unwrap().is_none());
        assert!(store.head("ab").unwrap().is_none());
        assert!(store.get_guild_ids().unwrap().is_empty());
    }

    fn file_store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn file_round_trip() {
        let (_dir, store) = file_store();
        check_round_trip(&store);
    }

    #[test]
    fn file_delete_leaves_gap() {
        let (_dir, store) = file_store();
        check_delete_leaves_gap(&store);
    }

    #[test]
    fn file_head_survives_head_delete() {
        let (_dir, store) = file_store();
        check_head_survives_head_delete(&store);
    }

    #[test]
    fn file_layout_uses_padded_seqs() {
        let (dir, store) = file_store();
        let (gid, events) = sample_log(1);
        for ev in &events {
            store.append(&gid, ev).unwrap();
        }
        assert!(dir
            .path()
            .join("guilds")
            .join(&gid)
            .join("0000000001.json")
            .exists());
        let head = std::fs::read_to_string(dir.path().join("guilds").join(&gid).join("head"))
            .unwrap();
        assert!(head.starts_with("1\n"));
    }

    #[test]
    fn file_rejects_traversal_guild_ids() {
        let (_dir, store) = file_store();
        let (_, events) = sample_log(0);
        assert!(store.append("../evil", &events[0]).is_err());
        assert!(store.get_log("").is_err());
    }

    #[test]
    fn file_store_reopens() {
        let dir = TempDir::new().unwrap();
        let (gid, events) = sample_log(2);
        {
            let store = FileStore::new(dir.path().to_path_buf());
            store.init().unwrap();
            for ev in &events {
                store.append(&gid, ev).unwrap();
            }
            store.close().unwrap();
        }
        let store = FileStore::new(dir.path().to_path_buf());
        assert_eq!(store.get_log(&gid).unwrap(), events);
        assert_eq!(store.head(&gid).unwrap().unwrap().seq, 2);
    }
}
