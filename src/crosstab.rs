//! Follow cache writes made by other contexts sharing the storage medium.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::StorageEvent;

/// Listens for foreign writes to one cache key.
///
/// Notifications are best-effort. When the receiver lags, some events were
/// lost, so the handler runs once to resynchronize.
pub struct CrossTabSync {
  key: String,
}

impl CrossTabSync {
  pub fn new(key: impl Into<String>) -> Self {
    Self { key: key.into() }
  }

  /// Whether `event` concerns our key.
  pub fn is_relevant(&self, event: &StorageEvent) -> bool {
    event.key == self.key
  }

  /// Run `on_change` for every relevant event until the medium goes away or
  /// `on_change` returns false.
  pub fn spawn<F>(self, mut events: broadcast::Receiver<StorageEvent>, mut on_change: F) -> JoinHandle<()>
  where
    F: FnMut() -> bool + Send + 'static,
  {
    tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(event) if self.is_relevant(&event) => {
            debug!(key = %self.key, "cache changed in another context");
            if !on_change() {
              break;
            }
          }
          Ok(_) => {}
          Err(RecvError::Lagged(missed)) => {
            warn!(key = %self.key, missed, "missed cache notifications, re-reading");
            if !on_change() {
              break;
            }
          }
          Err(RecvError::Closed) => break,
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[tokio::test]
  async fn ignores_other_keys() {
    let (tx, rx) = broadcast::channel(8);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let task = CrossTabSync::new("cache_products").spawn(rx, move || {
      counter.fetch_add(1, Ordering::SeqCst);
      true
    });

    tx.send(StorageEvent {
      key: "cache_orders".into(),
    })
    .unwrap();
    tx.send(StorageEvent {
      key: "cache_products".into(),
    })
    .unwrap();
    drop(tx);
    task.await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }
}
