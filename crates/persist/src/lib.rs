//! kdelegate persistence: the status each delegation needs to resume after a
//! restart (trigger completion flags, activation/firing instants).
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use kdelegate_core::DelegationStatus;
use metrics::{counter, histogram};
use tracing::debug;

/// Status is kept while a delegation is in progress or was closed early, and
/// removed once it completes, so a later run under the same name starts fresh.
pub trait StatusStore: Send + Sync {
    fn load(&self, delegation: &str) -> Result<Option<DelegationStatus>>;
    fn save(&self, delegation: &str, status: &DelegationStatus) -> Result<()>;
    fn remove(&self, delegation: &str) -> Result<()>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// SQLite-backed store. Simple, synchronous; writes are rare (one per protocol transition).
pub struct SqliteStatusStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStatusStore {
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        Self::init(db, started)
    }

    fn init(db: rusqlite::Connection, started: std::time::Instant) -> Result<Self> {
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS delegation_status (
                name    TEXT PRIMARY KEY,
                status  TEXT NOT NULL,
                ts      INTEGER NOT NULL
            )",
            [],
        )
        .context("creating delegation_status table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }
}

impl StatusStore for SqliteStatusStore {
    fn load(&self, delegation: &str) -> Result<Option<DelegationStatus>> {
        let db = lock(&self.db);
        let mut stmt = db.prepare("SELECT status FROM delegation_status WHERE name = ?1")?;
        let mut rows = stmt.query([delegation])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let st = serde_json::from_str(&raw).with_context(|| format!("decoding status of {}", delegation))?;
                Ok(Some(st))
            }
            None => Ok(None),
        }
    }

    fn save(&self, delegation: &str, status: &DelegationStatus) -> Result<()> {
        let started = std::time::Instant::now();
        let raw = serde_json::to_string(status)?;
        let db = lock(&self.db);
        db.execute(
            "INSERT INTO delegation_status(name, status, ts) VALUES (?1, ?2, strftime('%s','now'))
             ON CONFLICT(name) DO UPDATE SET status = excluded.status, ts = excluded.ts",
            (delegation, &raw),
        )?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        debug!(delegation, "status saved");
        Ok(())
    }

    fn remove(&self, delegation: &str) -> Result<()> {
        lock(&self.db).execute("DELETE FROM delegation_status WHERE name = ?1", [delegation])?;
        Ok(())
    }
}

/// Process-local store; nothing survives the process.
#[derive(Default)]
pub struct MemoryStatusStore {
    map: Mutex<HashMap<String, DelegationStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self { Self::default() }
}

impl StatusStore for MemoryStatusStore {
    fn load(&self, delegation: &str) -> Result<Option<DelegationStatus>> {
        Ok(lock(&self.map).get(delegation).cloned())
    }

    fn save(&self, delegation: &str, status: &DelegationStatus) -> Result<()> {
        lock(&self.map).insert(delegation.to_string(), status.clone());
        Ok(())
    }

    fn remove(&self, delegation: &str) -> Result<()> {
        lock(&self.map).remove(delegation);
        Ok(())
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kdelegate");
        let _ = std::fs::create_dir_all(&p);
        p.push("status.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "kdelegate.db".to_string()
}
