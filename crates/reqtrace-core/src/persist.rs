//! Debounced snapshot persistence over a durable key-value port.
//!
//! Every store mutation arms (or re-arms) a single debounce timer so bursts
//! of mutations produce one write. Write failures are logged and never
//! surfaced to observers; the in-memory store stays authoritative. Mutations
//! between the last successful flush and a crash are lost, an accepted
//! trade-off against write amplification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::PersistConfig;
use crate::error::PersistError;
use crate::record::RequestRecord;

/// Durable key-value port.
///
/// The snapshot lives under one fixed key; auxiliary metadata under another.
pub trait KeyValuePort: Send + Sync {
    /// Read a value; absence is not an error.
    fn get(&self, key: &str) -> Result<Option<String>, PersistError>;

    /// Write a value.
    fn set(&self, key: &str, value: &str) -> Result<(), PersistError>;
}

/// In-memory port for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValuePort for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, PersistError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| PersistError::Database("kv mutex poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PersistError::Database("kv mutex poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// SQLite-backed port: a single `kv` table keyed by name.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> Result<Self, PersistError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self, PersistError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, PersistError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS kv (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL,
                 updated_at INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PersistError> {
        self.conn
            .lock()
            .map_err(|_| PersistError::Database("sqlite mutex poisoned".to_string()))
    }
}

impl KeyValuePort for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>, PersistError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
        let now_ms = crate::clock::SystemClock.now_ms();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            rusqlite::params![key, value, now_ms],
        )?;
        Ok(())
    }
}

/// Single re-armable debounce timer, as clock-driven state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Debouncer {
    due_at: Option<i64>,
}

impl Debouncer {
    /// Arm (or re-arm) the timer for `now + quiet_ms`.
    pub fn arm(&mut self, now_ms: i64, quiet_ms: i64) {
        self.due_at = Some(now_ms.saturating_add(quiet_ms.max(0)));
    }

    /// Whether the quiet period has elapsed.
    #[must_use]
    pub fn due(&self, now_ms: i64) -> bool {
        self.due_at.is_some_and(|due| now_ms >= due)
    }

    /// Clear the timer.
    pub fn disarm(&mut self) {
        self.due_at = None;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.due_at.is_some()
    }
}

/// Auxiliary metadata written alongside the snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// When the snapshot was last flushed (epoch ms).
    pub flushed_at_ms: i64,
    /// Record count at flush time.
    pub record_count: usize,
}

/// Debounced snapshot writer/reader.
pub struct PersistenceManager {
    port: Arc<dyn KeyValuePort>,
    clock: Arc<dyn Clock>,
    records_key: String,
    meta_key: String,
    quiet_ms: i64,
    debouncer: Debouncer,
}

impl PersistenceManager {
    #[must_use]
    pub fn new(config: &PersistConfig, port: Arc<dyn KeyValuePort>, clock: Arc<dyn Clock>) -> Self {
        Self {
            port,
            clock,
            records_key: config.records_key.clone(),
            meta_key: config.meta_key.clone(),
            quiet_ms: config.debounce_ms,
            debouncer: Debouncer::default(),
        }
    }

    /// Arm or re-arm the debounce timer. Called on every store mutation.
    pub fn schedule_flush(&mut self) {
        self.debouncer.arm(self.clock.now_ms(), self.quiet_ms);
    }

    /// Whether a flush is pending.
    #[must_use]
    pub fn flush_pending(&self) -> bool {
        self.debouncer.is_armed()
    }

    /// Flush if the quiet period has elapsed. Returns true when a write was
    /// attempted (successful or not).
    pub fn poll(&mut self, records: &HashMap<String, RequestRecord>) -> bool {
        if !self.debouncer.due(self.clock.now_ms()) {
            return false;
        }
        self.flush(records);
        true
    }

    /// Serialize the full snapshot and write it through the port.
    ///
    /// The timer is cleared regardless of outcome; a failed write is retried
    /// only when the next mutation re-arms it.
    pub fn flush(&mut self, records: &HashMap<String, RequestRecord>) {
        self.debouncer.disarm();

        let payload = match serde_json::to_string(records) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Snapshot serialization failed; keeping in-memory state");
                return;
            }
        };
        if let Err(err) = self.port.set(&self.records_key, &payload) {
            warn!(error = %err, key = %self.records_key, "Snapshot write failed");
            return;
        }

        let meta = SnapshotMeta {
            flushed_at_ms: self.clock.now_ms(),
            record_count: records.len(),
        };
        match serde_json::to_string(&meta) {
            Ok(meta_payload) => {
                if let Err(err) = self.port.set(&self.meta_key, &meta_payload) {
                    warn!(error = %err, key = %self.meta_key, "Snapshot metadata write failed");
                }
            }
            Err(err) => warn!(error = %err, "Snapshot metadata serialization failed"),
        }
        debug!(records = records.len(), "Flushed record snapshot");
    }

    /// Read the persisted snapshot. Absence is a cold start, not an error.
    pub fn restore(&self) -> Result<HashMap<String, RequestRecord>, PersistError> {
        let Some(payload) = self.port.get(&self.records_key)? else {
            info!("No persisted snapshot; cold start");
            return Ok(HashMap::new());
        };
        let records: HashMap<String, RequestRecord> = serde_json::from_str(&payload)
            .map_err(|err| PersistError::Deserialize(err.to_string()))?;
        info!(records = records.len(), "Restored record snapshot");
        Ok(records)
    }

    /// Read the auxiliary snapshot metadata, if any.
    pub fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>, PersistError> {
        let Some(payload) = self.port.get(&self.meta_key)? else {
            return Ok(None);
        };
        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|err| PersistError::Deserialize(err.to_string()))
    }

}
