//! Key-value persistence with debounced writes

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Logical keys of the persisted state
pub const DOMAIN_COLORS_KEY: &str = "domainColors";
pub const FAVICON_CACHE_KEY: &str = "faviconCache";
pub const CLOSED_TABS_KEY: &str = "closedTabs";
pub const UI_PREFS_KEY: &str = "uiPrefs";
pub const CALENDAR_SETTINGS_KEY: &str = "calendarSettings";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Lock error")]
    Lock,
    #[error("Store unavailable")]
    Unavailable,
}

pub type ValueMap = BTreeMap<String, Value>;

/// Async-free key-value store contract (mirrors the browser storage area)
pub trait KeyValueStore: Send + Sync {
    /// Values present for `keys`; missing keys are simply absent
    fn get(&self, keys: &[&str]) -> Result<ValueMap, StorageError>;
    fn set(&self, values: ValueMap) -> Result<(), StorageError>;
    fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
    /// All entries whose key starts with `prefix`
    fn scan_prefix(&self, prefix: &str) -> Result<ValueMap, StorageError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Box<T> {
    fn get(&self, keys: &[&str]) -> Result<ValueMap, StorageError> {
        (**self).get(keys)
    }

    fn set(&self, values: ValueMap) -> Result<(), StorageError> {
        (**self).set(values)
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        (**self).remove(keys)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<ValueMap, StorageError> {
        (**self).scan_prefix(prefix)
    }
}

/// Read and deserialize one key
pub fn load_json<T, S>(store: &S, key: &str) -> Result<Option<T>, StorageError>
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    match store.get(&[key])?.remove(key) {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and write one key
pub fn store_json<T, S>(store: &S, key: &str, value: &T) -> Result<(), StorageError>
where
    T: Serialize,
    S: KeyValueStore + ?Sized,
{
    let mut values = ValueMap::new();
    values.insert(key.to_string(), serde_json::to_value(value)?);
    store.set(values)
}

/// SQLite-backed store
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
        "#,
        )?;

        Ok(())
    }

    /// Number of stored keys, for diagnostics
    pub fn count(&self) -> Result<i64, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;
        Ok(conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?)
    }
}

impl Clone for SqliteKvStore {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

fn parse_row(key: String, raw: String) -> Option<(String, Value)> {
    match serde_json::from_str(&raw) {
        Ok(value) => Some((key, value)),
        Err(e) => {
            log::warn!("Dropping unreadable stored value for {}: {}", key, e);
            None
        }
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, keys: &[&str]) -> Result<ValueMap, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;

        let mut values = ValueMap::new();
        for key in keys {
            let mut rows = stmt.query(params![key])?;
            if let Some(row) = rows.next()? {
                let raw: String = row.get(0)?;
                if let Some((key, value)) = parse_row(key.to_string(), raw) {
                    values.insert(key, value);
                }
            }
        }
        Ok(values)
    }

    fn set(&self, values: ValueMap) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::Lock)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, strftime('%s', 'now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )?;
            for (key, value) in &values {
                stmt.execute(params![key, serde_json::to_string(value)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::Lock)?;
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<ValueMap, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            let key: String = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((key, raw))
        })?;

        let mut values = ValueMap::new();
        for row in rows {
            let (key, raw) = row?;
            if let Some((key, value)) = parse_row(key, raw) {
                values.insert(key, value);
            }
        }
        Ok(values)
    }
}

/// In-process store, used in tests and when the database cannot be opened
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<ValueMap>,
    failing: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (storage error simulation)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, keys: &[&str]) -> Result<ValueMap, StorageError> {
        let values = self.values.lock().map_err(|_| StorageError::Lock)?;
        Ok(keys
            .iter()
            .filter_map(|key| values.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect())
    }

    fn set(&self, new_values: ValueMap) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut values = self.values.lock().map_err(|_| StorageError::Lock)?;
        values.extend(new_values);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut values = self.values.lock().map_err(|_| StorageError::Lock)?;
        for key in keys {
            values.remove(*key);
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<ValueMap, StorageError> {
        let values = self.values.lock().map_err(|_| StorageError::Lock)?;
        Ok(values
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[derive(Debug, Default)]
struct PendingWrites {
    values: ValueMap,
    removals: BTreeSet<String>,
    since: Option<Instant>,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        self.values.is_empty() && self.removals.is_empty()
    }
}

/// Batches writes for a short window before hitting the inner store
///
/// Writes to distinct keys merge; a later write to the same key replaces the
/// pending value. Reads see pending values.
pub struct DebouncedStore<S> {
    inner: S,
    window: Duration,
    pending: Mutex<PendingWrites>,
}

impl<S: KeyValueStore> DebouncedStore<S> {
    pub fn new(inner: S, window: Duration) -> Self {
        Self {
            inner,
            window,
            pending: Mutex::new(PendingWrites::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|pending| !pending.is_empty())
            .unwrap_or(false)
    }

    /// Write everything pending now; returns the number of keys touched
    ///
    /// On failure the batch is put back (newer pending writes win) so a later
    /// flush can retry.
    pub fn flush(&self) -> Result<usize, StorageError> {
        let batch = {
            let mut pending = self.pending.lock().map_err(|_| StorageError::Lock)?;
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let touched = batch.values.len() + batch.removals.len();
        let removals: Vec<&str> = batch.removals.iter().map(String::as_str).collect();
        let result = if batch.values.is_empty() {
            Ok(())
        } else {
            self.inner.set(batch.values.clone())
        }
        .and_then(|_| {
            if removals.is_empty() {
                Ok(())
            } else {
                self.inner.remove(&removals)
            }
        });

        if let Err(e) = result {
            let mut pending = self.pending.lock().map_err(|_| StorageError::Lock)?;
            for (key, value) in batch.values {
                if !pending.removals.contains(&key) {
                    pending.values.entry(key).or_insert(value);
                }
            }
            for key in batch.removals {
                if !pending.values.contains_key(&key) {
                    pending.removals.insert(key);
                }
            }
            pending.since = pending.since.or(batch.since);
            return Err(e);
        }

        Ok(touched)
    }

    /// Flush when the oldest pending write is older than the window
    pub fn flush_if_due(&self, now: Instant) -> Result<usize, StorageError> {
        let due = {
            let pending = self.pending.lock().map_err(|_| StorageError::Lock)?;
            match pending.since {
                Some(since) => !pending.is_empty() && now.saturating_duration_since(since) >= self.window,
                None => false,
            }
        };
        if due {
            self.flush()
        } else {
            Ok(0)
        }
    }
}

impl<S: KeyValueStore> KeyValueStore for DebouncedStore<S> {
    fn get(&self, keys: &[&str]) -> Result<ValueMap, StorageError> {
        let pending = self.pending.lock().map_err(|_| StorageError::Lock)?;
        let missing: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|key| !pending.values.contains_key(*key) && !pending.removals.contains(*key))
            .collect();

        let mut values = if missing.is_empty() {
            ValueMap::new()
        } else {
            self.inner.get(&missing)?
        };
        for key in keys {
            if let Some(value) = pending.values.get(*key) {
                values.insert(key.to_string(), value.clone());
            }
        }
        Ok(values)
    }

    fn set(&self, values: ValueMap) -> Result<(), StorageError> {
        let mut pending = self.pending.lock().map_err(|_| StorageError::Lock)?;
        for (key, value) in values {
            pending.removals.remove(&key);
            pending.values.insert(key, value);
        }
        pending.since.get_or_insert_with(Instant::now);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut pending = self.pending.lock().map_err(|_| StorageError::Lock)?;
        for key in keys {
            pending.values.remove(*key);
            pending.removals.insert(key.to_string());
        }
        pending.since.get_or_insert_with(Instant::now);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<ValueMap, StorageError> {
        let pending = self.pending.lock().map_err(|_| StorageError::Lock)?;
        let mut values = self.inner.scan_prefix(prefix)?;
        values.retain(|key, _| !pending.removals.contains(key));
        for (key, value) in pending.values.iter() {
            if key.starts_with(prefix) {
                values.insert(key.clone(), value.clone());
            }
        }
        Ok(values)
    }
}
