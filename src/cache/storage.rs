//! Storage mediums: SQLite for durable multi-process use, memory for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{StorageEvent, StorageMedium};
use crate::error::{Error, Result};

const EVENT_CAPACITY: usize = 64;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

fn next_origin() -> u64 {
  NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed)
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> Error {
  Error::Storage(format!("Lock poisoned: {}", e))
}

/// SQLite-backed medium.
///
/// Every connection is its own context. Writes bump a per-key revision and
/// record the writing origin, so [`SqliteMedium::poll_changes`] can tell
/// foreign writes from our own.
pub struct SqliteMedium {
  conn: Mutex<Connection>,
  origin: String,
  seen: Mutex<HashMap<String, i64>>,
  events: broadcast::Sender<StorageEvent>,
}

/// Schema for the key/value table.
const MEDIUM_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_kv (
    key TEXT PRIMARY KEY,
    value TEXT,
    revision INTEGER NOT NULL,
    origin TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteMedium {
  /// Open the medium at the default location.
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open or create the medium at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let medium = Self {
      conn: Mutex::new(conn),
      origin: format!("{}-{}", std::process::id(), next_origin()),
      seen: Mutex::new(HashMap::new()),
      events,
    };
    medium.run_migrations()?;
    medium.prime_revisions()?;

    Ok(medium)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("Could not determine data directory".into()))?;

    Ok(data_dir.join("docsync").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn.lock().map_err(lock_err)?;

    conn
      .execute_batch(MEDIUM_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(())
  }

  /// Record current revisions so pre-existing rows are not reported as changes.
  fn prime_revisions(&self) -> Result<()> {
    let revisions = self.revisions()?;
    let mut seen = self.seen.lock().map_err(lock_err)?;
    *seen = revisions
      .into_iter()
      .map(|(key, revision, _)| (key, revision))
      .collect();
    Ok(())
  }

  fn revisions(&self) -> Result<Vec<(String, i64, String)>> {
    let conn = self.conn.lock().map_err(lock_err)?;

    let mut stmt = conn
      .prepare("SELECT key, revision, origin FROM cache_kv")
      .map_err(|e| Error::Storage(format!("Failed to prepare revision query: {}", e)))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| Error::Storage(format!("Failed to query revisions: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(rows)
  }

  fn write(&self, key: &str, value: Option<&str>) -> Result<()> {
    let conn = self.conn.lock().map_err(lock_err)?;

    let revision: i64 = conn
      .query_row(
        "INSERT INTO cache_kv (key, value, revision, origin, written_at)
         VALUES (?1, ?2, 1, ?3, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
           value = excluded.value,
           revision = cache_kv.revision + 1,
           origin = excluded.origin,
           written_at = excluded.written_at
         RETURNING revision",
        params![key, value, self.origin],
        |row| row.get(0),
      )
      .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))?;
    drop(conn);

    self
      .seen
      .lock()
      .map_err(lock_err)?
      .insert(key.to_string(), revision);
    Ok(())
  }

  /// Compare stored revisions with the last ones observed and broadcast an
  /// event for every key another connection has written since.
  pub fn poll_changes(&self) -> Result<Vec<StorageEvent>> {
    let revisions = self.revisions()?;
    let mut seen = self.seen.lock().map_err(lock_err)?;

    let mut changed = Vec::new();
    for (key, revision, origin) in revisions {
      if seen.get(&key) == Some(&revision) {
        continue;
      }
      seen.insert(key.clone(), revision);
      if origin != self.origin {
        changed.push(StorageEvent { key });
      }
    }
    drop(seen);

    for event in &changed {
      debug!(key = %event.key, "foreign write detected");
      // No receivers is fine.
      let _ = self.events.send(event.clone());
    }
    Ok(changed)
  }

  /// Poll for foreign writes every `interval` until the medium is dropped.
  pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let weak: Weak<Self> = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let Some(medium) = weak.upgrade() else {
          break;
        };
        if let Err(e) = medium.poll_changes() {
          warn!(error = %e, "cache watcher poll failed");
        }
      }
    })
  }
}

impl StorageMedium for SqliteMedium {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn.lock().map_err(lock_err)?;

    let value: Option<Option<String>> = conn
      .query_row(
        "SELECT value FROM cache_kv WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| Error::Storage(format!("Failed to read {}: {}", key, e)))?;

    Ok(value.flatten())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.write(key, Some(value))
  }

  /// Kept as a tombstone row so other connections observe the removal.
  fn remove(&self, key: &str) -> Result<()> {
    self.write(key, None)
  }

  fn events(&self) -> broadcast::Receiver<StorageEvent> {
    self.events.subscribe()
  }
}

struct SharedMemory {
  values: Mutex<HashMap<String, String>>,
  subscribers: Mutex<HashMap<u64, broadcast::Sender<StorageEvent>>>,
}

/// In-process medium whose handles behave like separate contexts.
///
/// `MemoryMedium::new()` creates the shared backing map; every
/// [`MemoryMedium::context`] is another view of it, and a write through one
/// handle is announced to all the others.
pub struct MemoryMedium {
  shared: Arc<SharedMemory>,
  origin: u64,
  events: broadcast::Sender<StorageEvent>,
  writes: AtomicUsize,
}

impl MemoryMedium {
  pub fn new() -> Self {
    let shared = Arc::new(SharedMemory {
      values: Mutex::new(HashMap::new()),
      subscribers: Mutex::new(HashMap::new()),
    });
    Self::attach(shared)
  }

  /// Another context over the same backing map.
  pub fn context(&self) -> Self {
    Self::attach(Arc::clone(&self.shared))
  }

  fn attach(shared: Arc<SharedMemory>) -> Self {
    let origin = next_origin();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    if let Ok(mut subs) = shared.subscribers.lock() {
      subs.insert(origin, events.clone());
    }
    Self {
      shared,
      origin,
      events,
      writes: AtomicUsize::new(0),
    }
  }

  /// Number of set/remove calls made through this handle.
  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  fn notify_others(&self, key: &str) -> Result<()> {
    let subs = self.shared.subscribers.lock().map_err(lock_err)?;
    for (origin, tx) in subs.iter() {
      if *origin != self.origin {
        let _ = tx.send(StorageEvent {
          key: key.to_string(),
        });
      }
    }
    Ok(())
  }
}

impl Default for MemoryMedium {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for MemoryMedium {
  fn drop(&mut self) {
    if let Ok(mut subs) = self.shared.subscribers.lock() {
      subs.remove(&self.origin);
    }
  }
}

impl StorageMedium for MemoryMedium {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self.shared.values.lock().map_err(lock_err)?;
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self
      .shared
      .values
      .lock()
      .map_err(lock_err)?
      .insert(key.to_string(), value.to_string());
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.notify_others(key)
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.shared.values.lock().map_err(lock_err)?.remove(key);
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.notify_others(key)
  }

  fn events(&self) -> broadcast::Receiver<StorageEvent> {
    self.events.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn memory_contexts_share_values() {
    let tab_a = MemoryMedium::new();
    let tab_b = tab_a.context();

    tab_a.set("cache_products", "[]").unwrap();
    assert_eq!(tab_b.get("cache_products").unwrap().as_deref(), Some("[]"));
    assert_eq!(tab_a.write_count(), 1);
    assert_eq!(tab_b.write_count(), 0);
  }

  #[test]
  fn memory_notifies_other_contexts_only() {
    let tab_a = MemoryMedium::new();
    let tab_b = tab_a.context();
    let mut rx_a = tab_a.events();
    let mut rx_b = tab_b.events();

    tab_a.set("cache_products", "[]").unwrap();

    assert_eq!(rx_b.try_recv().unwrap().key, "cache_products");
    assert!(rx_a.try_recv().is_err());
  }

  #[test]
  fn sqlite_round_trip_and_tombstone() {
    let dir = tempfile::tempdir().unwrap();
    let medium = SqliteMedium::open(&dir.path().join("cache.db")).unwrap();

    assert_eq!(medium.get("k").unwrap(), None);
    medium.set("k", "v1").unwrap();
    medium.set("k", "v2").unwrap();
    assert_eq!(medium.get("k").unwrap().as_deref(), Some("v2"));

    medium.remove("k").unwrap();
    assert_eq!(medium.get("k").unwrap(), None);
  }

  #[test]
  fn sqlite_reports_foreign_writes_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let first = SqliteMedium::open(&path).unwrap();
    let second = SqliteMedium::open(&path).unwrap();
    let mut rx = second.events();

    first.set("cache_products", "{}").unwrap();
    second.set("cache_other", "{}").unwrap();

    let changed = second.poll_changes().unwrap();
    assert_eq!(
      changed,
      vec![StorageEvent {
        key: "cache_products".into()
      }]
    );
    assert_eq!(rx.try_recv().unwrap().key, "cache_products");

    // Nothing new since the last poll.
    assert!(second.poll_changes().unwrap().is_empty());
    // Our own write is not reported back to us.
    assert!(first.poll_changes().unwrap().iter().all(|e| e.key != "cache_products"));
  }
}
