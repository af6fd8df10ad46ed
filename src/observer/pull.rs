use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use super::RefreshOutcome;
use crate::document::Timestamp;
use crate::error::Result;
use crate::remote::RemoteGateway;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic freshness probe.
///
/// Compares the remote's newest `updatedAt` with the newest cached one and
/// only reloads when the remote is ahead. This misses deletions and edits
/// that do not raise the maximum timestamp; those show up after the next
/// mutation from this engine or a forced check.
#[derive(Debug)]
pub struct PullObserver {
  interval: Duration,
  in_flight: AtomicBool,
  forced: AtomicBool,
}

/// Clears the in-flight flag however the check ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl PullObserver {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      in_flight: AtomicBool::new(false),
      forced: AtomicBool::new(false),
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// Make the next check reload regardless of timestamps.
  pub fn force_next(&self) {
    self.forced.store(true, Ordering::SeqCst);
  }

  pub fn is_in_flight(&self) -> bool {
    self.in_flight.load(Ordering::SeqCst)
  }

  /// Run one check. A call made while another is outstanding returns
  /// `Skipped` without touching the remote.
  pub async fn check<F, Fut>(
    &self,
    gateway: &dyn RemoteGateway,
    collection: &str,
    cached_newest: Option<Timestamp>,
    reload: F,
  ) -> Result<RefreshOutcome>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    if self
      .in_flight
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!(%collection, "pull check already in flight");
      return Ok(RefreshOutcome::Skipped);
    }
    let _guard = InFlight(&self.in_flight);

    let remote_newest = gateway.fetch_latest_timestamp(collection).await?;
    let forced = self.forced.swap(false, Ordering::SeqCst);
    let stale = forced || is_stale(remote_newest, cached_newest);
    debug!(
      %collection,
      ?remote_newest,
      ?cached_newest,
      forced,
      stale,
      "pull probe"
    );
    if !stale {
      return Ok(RefreshOutcome::Unchanged);
    }

    if let Err(e) = reload().await {
      if forced {
        self.forced.store(true, Ordering::SeqCst);
      }
      return Err(e);
    }
    Ok(RefreshOutcome::Refreshed)
  }
}

impl Default for PullObserver {
  fn default() -> Self {
    Self::new(DEFAULT_POLL_INTERVAL)
  }
}

/// The remote is ahead when it has a newer maximum, or when one side is empty
/// and the other is not.
fn is_stale(remote: Option<Timestamp>, cached: Option<Timestamp>) -> bool {
  match (remote, cached) {
    (Some(remote), Some(cached)) => remote > cached,
    (Some(_), None) | (None, Some(_)) => true,
    (None, None) => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::{Document, Fields};
  use crate::remote::MemoryGateway;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;

  #[test]
  fn staleness_rules() {
    assert!(is_stale(Some(5), Some(4)));
    assert!(!is_stale(Some(5), Some(5)));
    assert!(!is_stale(Some(3), Some(5)));
    assert!(is_stale(Some(1), None));
    assert!(is_stale(None, Some(1)));
    assert!(!is_stale(None, None));
  }

  #[tokio::test]
  async fn reloads_only_when_remote_is_newer() {
    let gw = MemoryGateway::new();
    gw.seed("products", [Document::new("a", 10, Fields::new())]);
    let pull = PullObserver::default();
    let reloads = AtomicUsize::new(0);

    let outcome = pull
      .check(&gw, "products", Some(10), || async {
        reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
      })
      .await
      .unwrap();
    assert_eq!(outcome, RefreshOutcome::Unchanged);

    let outcome = pull
      .check(&gw, "products", Some(9), || async {
        reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
      })
      .await
      .unwrap();
    assert_eq!(outcome, RefreshOutcome::Refreshed);
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn forced_check_reloads_once() {
    let gw = MemoryGateway::new();
    gw.seed("products", [Document::new("a", 10, Fields::new())]);
    let pull = PullObserver::default();
    pull.force_next();

    let first = pull
      .check(&gw, "products", Some(10), || async { Ok(()) })
      .await
      .unwrap();
    let second = pull
      .check(&gw, "products", Some(10), || async { Ok(()) })
      .await
      .unwrap();
    assert_eq!(first, RefreshOutcome::Refreshed);
    assert_eq!(second, RefreshOutcome::Unchanged);
  }

  #[tokio::test(start_paused = true)]
  async fn overlapping_checks_collapse() {
    let gw = Arc::new(MemoryGateway::new());
    gw.seed("products", [Document::new("a", 10, Fields::new())]);
    gw.set_latency(Duration::from_millis(50));
    let pull = Arc::new(PullObserver::default());

    let (first, second) = tokio::join!(
      pull.check(gw.as_ref(), "products", None, || async { Ok(()) }),
      pull.check(gw.as_ref(), "products", None, || async { Ok(()) }),
    );
    assert_eq!(first.unwrap(), RefreshOutcome::Refreshed);
    assert_eq!(second.unwrap(), RefreshOutcome::Skipped);
    assert_eq!(gw.calls().latest, 1);
    assert!(!pull.is_in_flight());
  }
}
