//! Core traits and types for the persistent medium under the cache.

use tokio::sync::broadcast;

use crate::error::Result;

/// Notification that another context sharing the medium wrote `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
  pub key: String,
}

/// A durable string key/value medium shared between execution contexts.
///
/// Implementations notify through [`StorageMedium::events`] when a key is
/// changed by someone other than this handle. Delivery is best-effort:
/// events may be coalesced or dropped.
pub trait StorageMedium: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Replace the whole value stored under `key`.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;

  /// Subscribe to changes made by other contexts.
  fn events(&self) -> broadcast::Receiver<StorageEvent>;
}
