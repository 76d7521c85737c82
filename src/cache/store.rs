//! Ordered key/value storage underneath the caches.
//!
//! Every operation runs inside a closure that receives a view of the store.
//! Write closures run in one transaction; returning an error rolls back every
//! change made through the view.
//!
//! Both stores accept an optional time-to-live. An entry older than the TTL
//! is invisible to reads, as if it had never been written, until it is
//! overwritten or purged.

use crate::error::{ReaderError, ReaderResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Stored payload plus free-form attributes describing it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entry {
    pub payload: Vec<u8>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Entry {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }
}

pub trait KvRead {
    fn get(&self, key: &str) -> ReaderResult<Option<Entry>>;

    /// Keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> ReaderResult<Vec<String>>;
}

pub trait KvWrite: KvRead {
    fn put(&mut self, key: &str, entry: &Entry) -> ReaderResult<()>;

    /// Returns whether the key existed.
    fn delete(&mut self, key: &str) -> ReaderResult<bool>;
}

pub trait KvStore: Send + Sync {
    /// Runs `f` against a consistent view. Returns `None` without calling `f`
    /// when the backing store does not exist yet.
    fn read<T>(&self, f: impl FnOnce(&dyn KvRead) -> ReaderResult<T>) -> ReaderResult<Option<T>>;

    /// Runs `f` in a single transaction, creating the backing store on demand.
    fn write<T>(&self, f: impl FnOnce(&mut dyn KvWrite) -> ReaderResult<T>) -> ReaderResult<T>;

    /// Physically removes entries past their TTL. Returns how many went.
    fn purge_expired(&self) -> ReaderResult<usize>;

    /// Deletes the backing store. Idempotent.
    fn destroy(&self) -> ReaderResult<()>;

    fn location(&self) -> String;
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Oldest write time still visible under `ttl`, or `None` when nothing expires.
fn expiry_cutoff(ttl: Option<Duration>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    now.checked_sub_signed(ttl)
}

/// SQLite file holding one `cache_entries` table.
pub struct SqliteKvStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    ttl: Option<Duration>,
}

impl SqliteKvStore {
    /// The file is not touched until the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `updated_at` lower bound in epoch milliseconds.
    fn cutoff_millis(&self) -> i64 {
        expiry_cutoff(self.ttl, Utc::now())
            .map(|cutoff| cutoff.timestamp_millis())
            .unwrap_or(i64::MIN)
    }

    fn lock(&self) -> ReaderResult<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| ReaderError::Storage("cache connection mutex poisoned".to_string()))
    }

    fn open(&self) -> ReaderResult<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                attributes TEXT NOT NULL DEFAULT '{}',
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        tracing::debug!(path = %self.path.display(), "opened cache database");
        Ok(conn)
    }
}

struct SqliteView<'c> {
    conn: &'c Connection,
    cutoff_ms: i64,
}

impl KvRead for SqliteView<'_> {
    fn get(&self, key: &str) -> ReaderResult<Option<Entry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT payload, attributes FROM cache_entries WHERE key = ?1 AND updated_at >= ?2",
        )?;
        let row: Option<(Vec<u8>, String)> = stmt
            .query_row(params![key, self.cutoff_ms], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((payload, attributes)) = row else {
            return Ok(None);
        };
        Ok(Some(Entry {
            payload,
            attributes: serde_json::from_str(&attributes)?,
        }))
    }

    fn keys_with_prefix(&self, prefix: &str) -> ReaderResult<Vec<String>> {
        let upper = format!("{prefix}\u{10FFFF}");
        let mut stmt = self.conn.prepare_cached(
            "SELECT key FROM cache_entries WHERE key >= ?1 AND key < ?2 AND updated_at >= ?3 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix, upper, self.cutoff_ms], |row| {
            row.get::<_, String>(0)
        })?;
        let mut keys = Vec::new();
        for key in rows {
            let key = key?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

impl KvWrite for SqliteView<'_> {
    fn put(&mut self, key: &str, entry: &Entry) -> ReaderResult<()> {
        let attributes = serde_json::to_string(&entry.attributes)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, payload, attributes, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![key, entry.payload, attributes, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> ReaderResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }
}

impl KvStore for SqliteKvStore {
    fn read<T>(&self, f: impl FnOnce(&dyn KvRead) -> ReaderResult<T>) -> ReaderResult<Option<T>> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            if !self.path.exists() {
                return Ok(None);
            }
            *guard = Some(self.open()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };
        let tx = conn.transaction()?;
        let value = f(&SqliteView {
            conn: &tx,
            cutoff_ms: self.cutoff_millis(),
        })?;
        tx.commit()?;
        Ok(Some(value))
    }

    fn write<T>(&self, f: impl FnOnce(&mut dyn KvWrite) -> ReaderResult<T>) -> ReaderResult<T> {
        let mut guard = self.lock()?;
        if guard.is_none() || !self.path.exists() {
            *guard = Some(self.open()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(ReaderError::Storage(format!(
                "cache database {} is not open",
                self.path.display()
            )));
        };
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&mut SqliteView {
            conn: &tx,
            cutoff_ms: self.cutoff_millis(),
        });
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "rolling back cache write"
                );
                tx.rollback()?;
                Err(err)
            }
        }
    }

    fn purge_expired(&self) -> ReaderResult<usize> {
        if self.ttl.is_none() {
            return Ok(0);
        }
        let cutoff_ms = self.cutoff_millis();
        let mut guard = self.lock()?;
        if guard.is_none() {
            if !self.path.exists() {
                return Ok(0);
            }
            *guard = Some(self.open()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Ok(0);
        };
        let purged = conn.execute(
            "DELETE FROM cache_entries WHERE updated_at < ?1",
            params![cutoff_ms],
        )?;
        if purged > 0 {
            tracing::debug!(path = %self.path.display(), purged, "purged expired cache entries");
        }
        Ok(purged)
    }

    fn destroy(&self) -> ReaderResult<()> {
        let mut guard = self.lock()?;
        // Close before unlinking so no handle keeps writing to a deleted file.
        guard.take();
        for suffix in ["", "-journal", "-wal", "-shm"] {
            let mut name = self.path.clone().into_os_string();
            name.push(suffix);
            match std::fs::remove_file(PathBuf::from(name)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        tracing::info!(path = %self.path.display(), "removed cache database");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone)]
struct StampedEntry {
    entry: Entry,
    written_at: DateTime<Utc>,
}

struct MemoryView<'m> {
    entries: &'m mut BTreeMap<String, StampedEntry>,
    cutoff: Option<DateTime<Utc>>,
}

impl MemoryView<'_> {
    fn is_live(&self, stamped: &StampedEntry) -> bool {
        self.cutoff
            .map_or(true, |cutoff| stamped.written_at >= cutoff)
    }
}

impl KvRead for MemoryView<'_> {
    fn get(&self, key: &str) -> ReaderResult<Option<Entry>> {
        Ok(self
            .entries
            .get(key)
            .filter(|stamped| self.is_live(stamped))
            .map(|stamped| stamped.entry.clone()))
    }

    fn keys_with_prefix(&self, prefix: &str) -> ReaderResult<Vec<String>> {
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, stamped)| self.is_live(stamped))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

impl KvWrite for MemoryView<'_> {
    fn put(&mut self, key: &str, entry: &Entry) -> ReaderResult<()> {
        self.entries.insert(
            key.to_string(),
            StampedEntry {
                entry: entry.clone(),
                written_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn delete(&mut self, key: &str) -> ReaderResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

type MemoryEntries = BTreeMap<String, StampedEntry>;

/// In-process store; absent until the first write, like an unopened file.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<Option<MemoryEntries>>,
    ttl: Option<Duration>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    fn lock(&self) -> ReaderResult<MutexGuard<'_, Option<MemoryEntries>>> {
        self.entries
            .lock()
            .map_err(|_| ReaderError::Storage("memory cache mutex poisoned".to_string()))
    }
}

impl KvStore for MemoryKvStore {
    fn read<T>(&self, f: impl FnOnce(&dyn KvRead) -> ReaderResult<T>) -> ReaderResult<Option<T>> {
        let cutoff = expiry_cutoff(self.ttl, Utc::now());
        let mut guard = self.lock()?;
        match guard.as_mut() {
            Some(entries) => f(&MemoryView { entries, cutoff }).map(Some),
            None => Ok(None),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&mut dyn KvWrite) -> ReaderResult<T>) -> ReaderResult<T> {
        let cutoff = expiry_cutoff(self.ttl, Utc::now());
        let mut guard = self.lock()?;
        let mut staged = guard.clone().unwrap_or_default();
        let value = f(&mut MemoryView {
            entries: &mut staged,
            cutoff,
        })?;
        *guard = Some(staged);
        Ok(value)
    }

    fn purge_expired(&self) -> ReaderResult<usize> {
        let Some(cutoff) = expiry_cutoff(self.ttl, Utc::now()) else {
            return Ok(0);
        };
        let mut guard = self.lock()?;
        let Some(entries) = guard.as_mut() else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|_, stamped| stamped.written_at >= cutoff);
        Ok(before - entries.len())
    }

    fn destroy(&self) -> ReaderResult<()> {
        self.lock()?.take();
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
