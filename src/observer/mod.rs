//! Remote change detection.
//!
//! Two interchangeable strategies report the same thing, whether the cache
//! had to be refreshed:
//! - [`PushObserver`] filters full snapshots from a subscription by fingerprint
//! - [`PullObserver`] polls the newest `updatedAt` and reloads when it moved

mod pull;
mod push;

use std::time::Duration;

pub use pull::{PullObserver, DEFAULT_POLL_INTERVAL};
pub use push::PushObserver;

/// How an engine learns about remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  Push,
  Pull { interval: Duration },
}

impl Strategy {
  pub fn pull() -> Self {
    Strategy::Pull {
      interval: DEFAULT_POLL_INTERVAL,
    }
  }
}

impl Default for Strategy {
  fn default() -> Self {
    Strategy::Push
  }
}

/// Result of one change check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
  /// The cache was replaced and paging reset to page 1.
  Refreshed,
  /// The cache already matched the remote.
  Unchanged,
  /// Dropped: another check was in flight, or the engine was torn down.
  Skipped,
}

/// The active strategy of one engine.
#[derive(Debug)]
pub(crate) enum ChangeObserver {
  Push(PushObserver),
  Pull(PullObserver),
}

impl ChangeObserver {
  pub(crate) fn for_strategy(strategy: Strategy) -> Self {
    match strategy {
      Strategy::Push => ChangeObserver::Push(PushObserver::new()),
      Strategy::Pull { interval } => ChangeObserver::Pull(PullObserver::new(interval)),
    }
  }
}
