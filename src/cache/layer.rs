//! Typed cache layer over a storage medium.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::traits::{StorageEvent, StorageMedium};
use crate::document::Document;
use crate::error::{Error, Result};

/// Reads and writes one [`CacheEntry`] per collection.
///
/// Storage faults never escape: a failed or corrupt read is a miss and a
/// failed write is logged and dropped, so stale data stays available.
#[derive(Clone)]
pub struct LocalCacheStore {
  medium: Arc<dyn StorageMedium>,
}

impl LocalCacheStore {
  pub fn new(medium: Arc<dyn StorageMedium>) -> Self {
    Self { medium }
  }

  /// Storage key for a collection.
  pub fn key_for(collection: &str) -> String {
    format!("cache_{}", collection)
  }

  pub fn read(&self, collection: &str) -> Option<CacheEntry> {
    let key = Self::key_for(collection);
    let raw = match self.medium.get(&key) {
      Ok(Some(raw)) => raw,
      Ok(None) => {
        debug!(%key, "cache miss");
        return None;
      }
      Err(e) => {
        warn!(%key, error = %e, "cache read failed, treating as empty");
        return None;
      }
    };

    match decode(&raw) {
      Ok(entry) => {
        debug!(%key, "cache hit");
        Some(entry)
      }
      Err(e) => {
        warn!(%key, error = %e, "discarding unreadable cache entry");
        None
      }
    }
  }

  /// Replace the whole entry for `collection`.
  pub fn write(&self, collection: &str, entry: &CacheEntry) {
    let key = Self::key_for(collection);
    let encoded = match serde_json::to_string(entry) {
      Ok(encoded) => encoded,
      Err(e) => {
        warn!(%key, error = %e, "failed to encode cache entry");
        return;
      }
    };
    if let Err(e) = self.medium.set(&key, &encoded) {
      warn!(%key, error = %e, "cache write failed");
    }
  }

  pub fn clear(&self, collection: &str) {
    let key = Self::key_for(collection);
    if let Err(e) = self.medium.remove(&key) {
      warn!(%key, error = %e, "cache clear failed");
    }
  }

  /// Writes made by other contexts sharing the medium.
  pub fn events(&self) -> broadcast::Receiver<StorageEvent> {
    self.medium.events()
  }
}

/// Decode a persisted entry. A bare JSON array is the legacy flat layout.
fn decode(raw: &str) -> Result<CacheEntry> {
  match serde_json::from_str::<CacheEntry>(raw) {
    Ok(entry) => Ok(entry.normalized()),
    Err(entry_err) => serde_json::from_str::<Vec<Document>>(raw)
      .map(CacheEntry::flat)
      .map_err(|_| Error::StorageCorrupt(entry_err.to_string())),
  }
}
