//! Error types for the sync engine.

use thiserror::Error;

use crate::document::DocumentId;

/// Everything that can go wrong between the cache, the remote store and the engine.
///
/// Storage variants never escape the cache layer: they are logged and the
/// entry is treated as absent. `Cancelled` is dropped by the engine once it
/// has been torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
  #[error("persisted cache is corrupt: {0}")]
  StorageCorrupt(String),

  #[error("storage medium failure: {0}")]
  Storage(String),

  #[error("remote store unavailable: {0}")]
  RemoteUnavailable(String),

  #[error("document not found: {0}")]
  NotFound(DocumentId),

  #[error("operation cancelled: engine torn down")]
  Cancelled,

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),
}

impl Error {
  /// Build a `RemoteUnavailable` from any displayable transport error.
  pub fn remote(err: impl std::fmt::Display) -> Self {
    Error::RemoteUnavailable(err.to_string())
  }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn error_display() {
    let err = Error::NotFound("abc".into());
    assert_eq!(err.to_string(), "document not found: abc");

    let err = Error::remote("connection refused");
    assert_eq!(
      err.to_string(),
      "remote store unavailable: connection refused"
    );
  }
}
