use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::document::Timestamp;

/// Source of the `updatedAt` stamps an in-process store assigns.
pub trait Clock: Send + Sync {
  fn now(&self) -> Timestamp;
}

/// Wall-clock seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Timestamp {
    Utc::now().timestamp().max(0) as Timestamp
  }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicU64,
}

impl ManualClock {
  pub fn new(start: Timestamp) -> Self {
    Self {
      now: AtomicU64::new(start),
    }
  }

  pub fn advance(&self, secs: Timestamp) -> Timestamp {
    self.now.fetch_add(secs, Ordering::SeqCst) + secs
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Timestamp {
    self.now.load(Ordering::SeqCst)
  }
}
