//! Relay configuration from environment variables and optional `.env` files.

use std::time::Duration;
use std::{env, fs, path::PathBuf};

use anyhow::{Context, Result};

use crate::crypto::Keys;

/// Default WebSocket port.
pub const DEFAULT_PORT: u16 = 7447;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// WebSocket listen port (`PORT`).
    pub port: u16,
    /// Database directory (`DB`).
    pub db: PathBuf,
    /// Name advertised in `HELLO_OK` (`RELAY_NAME`).
    pub relay_name: String,
    /// Hex secret key for checkpoint signing (`RELAY_SECRET`); generated
    /// and persisted under the database directory when absent.
    pub relay_secret: Option<String>,
    /// Retention prune cadence (`PRUNE_INTERVAL_SECS`).
    pub prune_interval: Duration,
    /// Checkpoint cadence (`CHECKPOINT_INTERVAL_SECS`).
    pub checkpoint_interval: Duration,
}

impl Settings {
    /// Load settings, reading the `.env` file first when it exists.
    pub fn from_env(env_file: &str) -> Result<Self> {
        let _ = dotenvy::from_filename(env_file);
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().context("parsing PORT")?,
            Err(_) => DEFAULT_PORT,
        };
        let db = PathBuf::from(env::var("DB").unwrap_or_else(|_| "./relay-db".into()));
        let relay_name = env::var("RELAY_NAME").unwrap_or_else(|_| "guildr".into());
        let relay_secret = env::var("RELAY_SECRET").ok().filter(|s| !s.is_empty());
        Ok(Self {
            port,
            db,
            relay_name,
            relay_secret,
            prune_interval: secs_var("PRUNE_INTERVAL_SECS", 60)?,
            checkpoint_interval: secs_var("CHECKPOINT_INTERVAL_SECS", 60)?,
        })
    }

    /// The relay's signing keys: from `RELAY_SECRET` when set, otherwise
    /// loaded from `<db>/relay.key`, generating and persisting a fresh key
    /// on first start so checkpoints stay attributable across restarts.
    pub fn relay_keys(&self) -> Result<Keys> {
        if let Some(secret) = &self.relay_secret {
            return Keys::from_secret_hex(secret);
        }
        let path = self.db.join("relay.key");
        if path.exists() {
            let secret = fs::read_to_string(&path).context("reading relay key")?;
            return Keys::from_secret_hex(secret.trim());
        }
        let keys = Keys::generate();
        fs::create_dir_all(&self.db)?;
        fs::write(&path, keys.secret_hex()).context("persisting relay key")?;
        Ok(keys)
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw.parse().with_context(|| format!("parsing {name}"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}
