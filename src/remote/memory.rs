//! In-process remote store.
//!
//! Behaves like the real collaborator as far as the engine can tell: server
//! assigned ids, server stamped `updatedAt`, keyset cursors and full-snapshot
//! subscriptions. It can also be switched offline and slowed down, and counts
//! every call it receives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::{Cursor, Page, RemoteGateway, Subscription};
use crate::document::{self, Document, DocumentId, Fields, Timestamp};
use crate::error::{Error, Result};

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<Document>>)>>;

#[derive(Default)]
struct State {
  collections: HashMap<String, HashMap<DocumentId, Document>>,
  subscribers: Subscribers,
}

/// Number of calls received, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
  pub fetch_all: usize,
  pub fetch_page: usize,
  pub latest: usize,
  pub count: usize,
  pub mutations: usize,
  pub subscribe: usize,
}

impl CallCounts {
  /// Calls that read from the store.
  pub fn reads(&self) -> usize {
    self.fetch_all + self.fetch_page + self.latest + self.count
  }
}

#[derive(Default)]
struct Counters {
  fetch_all: AtomicUsize,
  fetch_page: AtomicUsize,
  latest: AtomicUsize,
  count: AtomicUsize,
  mutations: AtomicUsize,
  subscribe: AtomicUsize,
}

pub struct MemoryGateway {
  state: Arc<Mutex<State>>,
  clock: Arc<dyn Clock>,
  next_id: AtomicU64,
  next_subscriber: AtomicU64,
  offline: Mutex<bool>,
  latency: Mutex<Duration>,
  portable_cursors: bool,
  counters: Counters,
}

impl MemoryGateway {
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self {
      state: Arc::new(Mutex::new(State::default())),
      clock,
      next_id: AtomicU64::new(1),
      next_subscriber: AtomicU64::new(1),
      offline: Mutex::new(false),
      latency: Mutex::new(Duration::ZERO),
      portable_cursors: false,
      counters: Counters::default(),
    }
  }

  /// Declare cursors valid across restarts.
  pub fn with_portable_cursors(mut self, portable: bool) -> Self {
    self.portable_cursors = portable;
    self
  }

  /// Place documents directly, as if written by someone else.
  pub fn seed(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
    if let Ok(mut state) = self.state.lock() {
      let docs = state.collections.entry(collection.to_string()).or_default();
      for doc in documents {
        docs.insert(doc.id.clone(), doc);
      }
      notify(&mut state, collection);
    }
  }

  /// Make every call fail with `RemoteUnavailable` until turned back on.
  pub fn set_offline(&self, offline: bool) {
    if let Ok(mut flag) = self.offline.lock() {
      *flag = offline;
    }
  }

  /// Delay every call by `latency`.
  pub fn set_latency(&self, latency: Duration) {
    if let Ok(mut l) = self.latency.lock() {
      *l = latency;
    }
  }

  pub fn calls(&self) -> CallCounts {
    let c = &self.counters;
    CallCounts {
      fetch_all: c.fetch_all.load(Ordering::SeqCst),
      fetch_page: c.fetch_page.load(Ordering::SeqCst),
      latest: c.latest.load(Ordering::SeqCst),
      count: c.count.load(Ordering::SeqCst),
      mutations: c.mutations.load(Ordering::SeqCst),
      subscribe: c.subscribe.load(Ordering::SeqCst),
    }
  }

  /// Current live subscriptions on `collection`.
  pub fn subscriber_count(&self, collection: &str) -> usize {
    self
      .state
      .lock()
      .map(|s| s.subscribers.get(collection).map_or(0, Vec::len))
      .unwrap_or(0)
  }

  async fn enter(&self, counter: &AtomicUsize) -> Result<()> {
    counter.fetch_add(1, Ordering::SeqCst);
    let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    let offline = self.offline.lock().map(|o| *o).unwrap_or(false);
    if offline {
      return Err(Error::RemoteUnavailable("remote store is offline".into()));
    }
    Ok(())
  }

  fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
    self
      .state
      .lock()
      .map_err(|e| Error::RemoteUnavailable(format!("Lock poisoned: {}", e)))
  }
}

impl Default for MemoryGateway {
  fn default() -> Self {
    Self::new()
  }
}

fn ordered(state: &State, collection: &str) -> Vec<Document> {
  let docs = state
    .collections
    .get(collection)
    .map(|docs| docs.values().cloned().collect())
    .unwrap_or_default();
  document::normalize(docs)
}

fn notify(state: &mut State, collection: &str) {
  let snapshot = ordered(state, collection);
  if let Some(subs) = state.subscribers.get_mut(collection) {
    subs.retain(|(_, tx)| tx.send(snapshot.clone()).is_ok());
  }
}

fn encode_cursor(doc: &Document) -> Cursor {
  Cursor::new(format!("{}:{}", doc.updated_at, doc.id))
}

fn decode_cursor(cursor: &Cursor) -> Result<(Timestamp, String)> {
  let (ts, id) = cursor
    .as_str()
    .split_once(':')
    .ok_or_else(|| Error::RemoteUnavailable(format!("malformed cursor {}", cursor.as_str())))?;
  let ts = ts
    .parse()
    .map_err(|_| Error::RemoteUnavailable(format!("malformed cursor {}", cursor.as_str())))?;
  Ok((ts, id.to_string()))
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
  async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>> {
    self.enter(&self.counters.fetch_all).await?;
    Ok(ordered(&*self.state()?, collection))
  }

  async fn fetch_page(
    &self,
    collection: &str,
    page_size: usize,
    after: Option<&Cursor>,
  ) -> Result<Page> {
    self.enter(&self.counters.fetch_page).await?;
    let all = ordered(&*self.state()?, collection);

    let start = match after {
      None => 0,
      Some(cursor) => {
        let (ts, id) = decode_cursor(cursor)?;
        // First document strictly after the cursor position.
        all
          .iter()
          .position(|d| d.updated_at < ts || (d.updated_at == ts && d.id > id))
          .unwrap_or(all.len())
      }
    };

    let documents: Vec<Document> = all.iter().skip(start).take(page_size).cloned().collect();
    let next = if start + documents.len() < all.len() {
      documents.last().map(encode_cursor)
    } else {
      None
    };
    Ok(Page { documents, next })
  }

  async fn fetch_latest_timestamp(&self, collection: &str) -> Result<Option<Timestamp>> {
    self.enter(&self.counters.latest).await?;
    let state = self.state()?;
    Ok(
      state
        .collections
        .get(collection)
        .and_then(|docs| docs.values().map(|d| d.updated_at).max()),
    )
  }

  async fn count(&self, collection: &str) -> Result<u64> {
    self.enter(&self.counters.count).await?;
    let state = self.state()?;
    Ok(state.collections.get(collection).map_or(0, |d| d.len() as u64))
  }

  async fn create(&self, collection: &str, fields: Fields) -> Result<DocumentId> {
    self.enter(&self.counters.mutations).await?;
    let id = format!("doc-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst));
    let doc = Document::new(id.clone(), self.clock.now(), fields);

    let mut state = self.state()?;
    state
      .collections
      .entry(collection.to_string())
      .or_default()
      .insert(id.clone(), doc);
    notify(&mut state, collection);
    debug!(%collection, %id, "created");
    Ok(id)
  }

  async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
    self.enter(&self.counters.mutations).await?;
    let now = self.clock.now();

    let mut state = self.state()?;
    let docs = state
      .collections
      .get_mut(collection)
      .ok_or_else(|| Error::NotFound(id.to_string()))?;
    let current = docs.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
    let next = current.patched(&fields, now);
    docs.insert(id.to_string(), next);
    notify(&mut state, collection);
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<()> {
    self.enter(&self.counters.mutations).await?;

    let mut state = self.state()?;
    state
      .collections
      .get_mut(collection)
      .and_then(|docs| docs.remove(id))
      .ok_or_else(|| Error::NotFound(id.to_string()))?;
    notify(&mut state, collection);
    Ok(())
  }

  async fn subscribe(&self, collection: &str) -> Result<Subscription> {
    self.enter(&self.counters.subscribe).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let token = self.next_subscriber.fetch_add(1, Ordering::SeqCst);

    {
      let mut state = self.state()?;
      let _ = tx.send(ordered(&state, collection));
      state
        .subscribers
        .entry(collection.to_string())
        .or_default()
        .push((token, tx));
    }

    let state = Arc::clone(&self.state);
    let collection = collection.to_string();
    Ok(Subscription::new(rx, move || {
      if let Ok(mut state) = state.lock() {
        if let Some(subs) = state.subscribers.get_mut(&collection) {
          subs.retain(|(t, _)| *t != token);
        }
      }
    }))
  }

  fn cursors_portable(&self) -> bool {
    self.portable_cursors
  }
}
