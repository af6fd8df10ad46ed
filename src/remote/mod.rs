//! The remote document store, seen through one async trait.

mod clock;
mod http;
mod memory;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::document::{Document, DocumentId, Fields, Timestamp};
use crate::error::Result;

pub use clock::{Clock, ManualClock, SystemClock};
pub use http::HttpGateway;
pub use memory::{CallCounts, MemoryGateway};

/// Opaque continuation token marking the last document of a fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// One page of a cursor query.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
  pub documents: Vec<Document>,
  /// Absent when this page is the last one.
  pub next: Option<Cursor>,
}

/// Operations the engine needs from the remote store.
///
/// Every listing is ordered newest `updatedAt` first with ties broken by
/// ascending id.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
  async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>>;

  async fn fetch_page(
    &self,
    collection: &str,
    page_size: usize,
    after: Option<&Cursor>,
  ) -> Result<Page>;

  /// Newest `updatedAt` in the collection; `None` only when it is empty.
  async fn fetch_latest_timestamp(&self, collection: &str) -> Result<Option<Timestamp>>;

  /// Number of documents in the collection.
  async fn count(&self, collection: &str) -> Result<u64>;

  /// The store assigns the id and stamps `updatedAt`.
  async fn create(&self, collection: &str, fields: Fields) -> Result<DocumentId>;

  /// Merge `fields` into the document and re-stamp it.
  async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

  async fn delete(&self, collection: &str, id: &str) -> Result<()>;

  /// Complete snapshots: once immediately, then after every change.
  async fn subscribe(&self, collection: &str) -> Result<Subscription>;

  /// Whether cursors stay valid across process restarts.
  fn cursors_portable(&self) -> bool {
    false
  }
}

/// A standing feed of full collection snapshots.
///
/// Dropping it, or calling [`Subscription::unsubscribe`], ends the feed.
pub struct Subscription {
  rx: mpsc::UnboundedReceiver<Vec<Document>>,
  cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
  pub fn new(
    rx: mpsc::UnboundedReceiver<Vec<Document>>,
    cancel: impl FnOnce() + Send + 'static,
  ) -> Self {
    Self {
      rx,
      cancel: Some(Box::new(cancel)),
    }
  }

  pub fn unsubscribe(self) {
    drop(self);
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

impl Stream for Subscription {
  type Item = Vec<Document>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}
