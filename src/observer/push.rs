use std::sync::Mutex;

use tracing::debug;

use crate::document::{self, Document, Fingerprint};

/// Gate for snapshots arriving from a standing subscription.
///
/// Only a snapshot whose fingerprint differs from the last one applied gets
/// through; repeated pushes of the same state cost nothing.
#[derive(Debug, Default)]
pub struct PushObserver {
  last: Mutex<Option<Fingerprint>>,
}

impl PushObserver {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record the state the cache already holds.
  pub fn seed(&self, fingerprint: Fingerprint) {
    *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(fingerprint);
  }

  /// Forget the applied state so the next snapshot always goes through.
  pub fn reset(&self) {
    *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
  }

  /// Returns the canonical snapshot when it differs from the last applied one.
  pub fn accept(&self, snapshot: Vec<Document>) -> Option<Vec<Document>> {
    let snapshot = document::normalize(snapshot);
    let incoming = Fingerprint::of(&snapshot);

    let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
    let changed = last.as_ref() != Some(&incoming);
    debug!(
      fingerprint = %incoming.digest(),
      documents = snapshot.len(),
      changed,
      "compared pushed snapshot"
    );
    if !changed {
      return None;
    }
    *last = Some(incoming);
    Some(snapshot)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::Fields;

  fn doc(id: &str, ts: u64) -> Document {
    Document::new(id, ts, Fields::new())
  }

  #[test]
  fn same_snapshot_is_accepted_once() {
    let push = PushObserver::new();
    assert!(push.accept(vec![doc("a", 1), doc("b", 2)]).is_some());
    assert!(push.accept(vec![doc("b", 2), doc("a", 1)]).is_none());
    assert!(push.accept(vec![doc("a", 3), doc("b", 2)]).is_some());
  }

  #[test]
  fn seeded_state_suppresses_first_push() {
    let push = PushObserver::new();
    push.seed(Fingerprint::of(&[doc("a", 1)]));
    assert!(push.accept(vec![doc("a", 1)]).is_none());

    push.reset();
    assert!(push.accept(vec![doc("a", 1)]).is_some());
  }

  #[test]
  fn empty_snapshot_counts_as_change_from_unknown() {
    let push = PushObserver::new();
    assert_eq!(push.accept(Vec::new()), Some(Vec::new()));
    assert_eq!(push.accept(Vec::new()), None);
  }
}
