//! The sync engine: one collection, one cache entry, and the observers that
//! keep it current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, FlatEntry, LocalCacheStore, StorageMedium};
use crate::config::SyncConfig;
use crate::crosstab::CrossTabSync;
use crate::document::{Document, DocumentId, Fields};
use crate::error::{Error, Result};
use crate::observer::{ChangeObserver, RefreshOutcome, Strategy};
use crate::pagination::{PagePlan, PaginationController, PaginationMode};
use crate::remote::RemoteGateway;

pub const DEFAULT_PAGE_SIZE: usize = 10;

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct PageView {
  pub page: u32,
  pub total_pages: u32,
  pub has_more: bool,
  pub documents: Vec<Document>,
}

impl Default for PageView {
  fn default() -> Self {
    Self {
      page: 1,
      total_pages: 1,
      has_more: false,
      documents: Vec::new(),
    }
  }
}

impl PageView {
  fn of(pager: &PaginationController) -> Self {
    Self {
      page: pager.current_page(),
      total_pages: pager.total_pages(),
      has_more: pager.has_more(),
      documents: pager.page_data().to_vec(),
    }
  }
}

pub struct SyncEngineBuilder {
  collection: String,
  medium: Arc<dyn StorageMedium>,
  gateway: Arc<dyn RemoteGateway>,
  page_size: usize,
  strategy: Strategy,
  pagination: PaginationMode,
}

impl SyncEngineBuilder {
  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  pub fn strategy(mut self, strategy: Strategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn pagination(mut self, pagination: PaginationMode) -> Self {
    self.pagination = pagination;
    self
  }

  pub fn build(self) -> Result<SyncEngine> {
    if self.collection.trim().is_empty() {
      return Err(Error::InvalidConfig("collection name is empty".into()));
    }
    if self.page_size == 0 {
      return Err(Error::InvalidConfig("page size must be positive".into()));
    }
    if let Strategy::Pull { interval } = self.strategy {
      if interval.is_zero() {
        return Err(Error::InvalidConfig("poll interval must be positive".into()));
      }
    }

    let pager = PaginationController::new(self.pagination, self.page_size);
    let (view, _) = watch::channel(PageView::of(&pager));
    let portable_cursors = self.gateway.cursors_portable();

    Ok(SyncEngine {
      inner: Arc::new(Inner {
        key: LocalCacheStore::key_for(&self.collection),
        collection: self.collection,
        store: LocalCacheStore::new(self.medium),
        gateway: self.gateway,
        observer: ChangeObserver::for_strategy(self.strategy),
        portable_cursors,
        pager: Mutex::new(pager),
        view,
        closed: AtomicBool::new(false),
        tasks: Mutex::new(Vec::new()),
      }),
    })
  }
}

/// Mirrors one remote collection into the local cache and pages through it.
///
/// Reads never wait on the remote: they are served from the cache seeded in
/// [`SyncEngine::initialize`]. Mutations go to the remote first and only
/// show up locally once they have been read back.
///
/// Cache writes are last-writer-wins. Two refreshes resolving out of order
/// can leave the older snapshot in place until the next change or refresh.
pub struct SyncEngine {
  inner: Arc<Inner>,
}

struct Inner {
  collection: String,
  key: String,
  store: LocalCacheStore,
  gateway: Arc<dyn RemoteGateway>,
  observer: ChangeObserver,
  portable_cursors: bool,
  pager: Mutex<PaginationController>,
  view: watch::Sender<PageView>,
  closed: AtomicBool,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
  pub fn builder(
    collection: impl Into<String>,
    medium: Arc<dyn StorageMedium>,
    gateway: Arc<dyn RemoteGateway>,
  ) -> SyncEngineBuilder {
    SyncEngineBuilder {
      collection: collection.into(),
      medium,
      gateway,
      page_size: DEFAULT_PAGE_SIZE,
      strategy: Strategy::default(),
      pagination: PaginationMode::default(),
    }
  }

  pub fn from_config(
    config: &SyncConfig,
    medium: Arc<dyn StorageMedium>,
    gateway: Arc<dyn RemoteGateway>,
  ) -> Result<Self> {
    Self::builder(config.collection.clone(), medium, gateway)
      .page_size(config.page_size)
      .strategy(config.strategy())
      .pagination(config.pagination.into())
      .build()
  }

  pub fn collection(&self) -> &str {
    &self.inner.collection
  }

  /// Seed state from the local cache, then start following remote changes
  /// and writes made by other contexts.
  ///
  /// The cache read is synchronous so that data is available before any
  /// remote call completes, including fully offline. Must be called from
  /// within a tokio runtime.
  pub fn initialize(&self) {
    let inner = &self.inner;
    if inner.is_closed() {
      return;
    }
    inner.rehydrate();
    if !inner.tasks().is_empty() {
      return;
    }
    info!(collection = %inner.collection, "engine initialized from cache");

    let weak = Arc::downgrade(inner);
    let observer_task = match &inner.observer {
      ChangeObserver::Push(_) => tokio::spawn(run_push(weak.clone())),
      ChangeObserver::Pull(pull) => tokio::spawn(run_pull(weak.clone(), pull.interval())),
    };

    let crosstab = CrossTabSync::new(inner.key.clone());
    let crosstab_task = crosstab.spawn(inner.store.events(), move || match weak.upgrade() {
      Some(inner) if !inner.is_closed() => {
        inner.rehydrate();
        true
      }
      _ => false,
    });

    let mut tasks = inner.tasks();
    tasks.push(observer_task);
    tasks.push(crosstab_task);
  }

  /// Seed state from the local cache without starting any background work.
  ///
  /// For one-shot callers that follow up with [`SyncEngine::refresh`]; no
  /// observer check can be in flight to make that refresh skip.
  pub fn load_cached(&self) {
    if !self.inner.is_closed() {
      self.inner.rehydrate();
    }
  }

  /// Force the active observer's check now.
  pub async fn refresh(&self) -> Result<RefreshOutcome> {
    discard_cancelled(self.inner.refresh().await, RefreshOutcome::Skipped)
  }

  pub async fn add(&self, fields: Fields) -> Result<DocumentId> {
    let id = self
      .inner
      .gateway
      .create(&self.inner.collection, fields)
      .await?;
    info!(collection = %self.inner.collection, %id, "document added");
    self.inner.after_mutation().await;
    Ok(id)
  }

  pub async fn update(&self, id: &str, fields: Fields) -> Result<()> {
    self
      .inner
      .gateway
      .update(&self.inner.collection, id, fields)
      .await?;
    info!(collection = %self.inner.collection, %id, "document updated");
    self.inner.after_mutation().await;
    Ok(())
  }

  pub async fn delete(&self, id: &str) -> Result<()> {
    self
      .inner
      .gateway
      .delete(&self.inner.collection, id)
      .await?;
    info!(collection = %self.inner.collection, %id, "document deleted");
    self.inner.after_mutation().await;
    Ok(())
  }

  /// Move to page `page`; returns whether the current page changed.
  ///
  /// Out-of-range pages are rejected without any state change. In cursor
  /// mode this may fetch pages from the remote to rebuild missing cursors.
  pub async fn go_to_page(&self, page: u32) -> Result<bool> {
    discard_cancelled(self.inner.go_to_page(page).await, false)
  }

  pub async fn next_page(&self) -> Result<bool> {
    self.go_to_page(self.current_page() + 1).await
  }

  pub async fn prev_page(&self) -> Result<bool> {
    match self.current_page().checked_sub(1) {
      Some(page) => self.go_to_page(page).await,
      None => Ok(false),
    }
  }

  pub fn current_page(&self) -> u32 {
    self.inner.pager().current_page()
  }

  pub fn total_pages(&self) -> u32 {
    self.inner.pager().total_pages()
  }

  pub fn has_more(&self) -> bool {
    self.inner.pager().has_more()
  }

  pub fn page_data(&self) -> Vec<Document> {
    self.inner.pager().page_data().to_vec()
  }

  /// Number of documents known, exact in flat mode, estimated when paged.
  pub fn total_count(&self) -> Option<u64> {
    self.inner.pager().total_count()
  }

  pub fn view(&self) -> PageView {
    PageView::of(&self.inner.pager())
  }

  /// Receive a new [`PageView`] every time the visible page changes.
  pub fn subscribe(&self) -> watch::Receiver<PageView> {
    self.inner.view.subscribe()
  }

  /// Detach observers and cross-context sync. Later completions are dropped.
  pub fn teardown(&self) {
    if self.inner.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    for task in self.inner.tasks().drain(..) {
      task.abort();
    }
    info!(collection = %self.inner.collection, "engine torn down");
  }

  pub fn is_torn_down(&self) -> bool {
    self.inner.is_closed()
  }
}

impl Drop for SyncEngine {
  fn drop(&mut self) {
    self.teardown();
  }
}

fn discard_cancelled<T>(result: Result<T>, dropped: T) -> Result<T> {
  match result {
    Err(Error::Cancelled) => Ok(dropped),
    other => other,
  }
}

async fn run_push(weak: Weak<Inner>) {
  let subscription = {
    let Some(inner) = weak.upgrade() else {
      return;
    };
    match inner.gateway.subscribe(&inner.collection).await {
      Ok(sub) => sub,
      Err(e) => {
        warn!(collection = %inner.collection, error = %e, "subscribe failed, relying on explicit refresh");
        return;
      }
    }
  };

  let mut subscription = subscription;
  while let Some(snapshot) = subscription.next().await {
    let Some(inner) = weak.upgrade() else {
      break;
    };
    match inner.apply_push(snapshot).await {
      Ok(_) => {}
      Err(Error::Cancelled) => break,
      Err(e) => warn!(collection = %inner.collection, error = %e, "failed to apply pushed snapshot"),
    }
  }
  debug!("push subscription ended");
}

async fn run_pull(weak: Weak<Inner>, interval: std::time::Duration) {
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
  loop {
    ticker.tick().await;
    let Some(inner) = weak.upgrade() else {
      break;
    };
    match inner.refresh().await {
      Ok(outcome) => debug!(collection = %inner.collection, ?outcome, "periodic pull"),
      Err(Error::Cancelled) => break,
      // Stale data stays visible until a later check succeeds.
      Err(e) => warn!(collection = %inner.collection, error = %e, "periodic pull failed"),
    }
  }
}

impl Inner {
  fn pager(&self) -> MutexGuard<'_, PaginationController> {
    self.pager.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    self.tasks.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  fn ensure_open(&self) -> Result<()> {
    if self.is_closed() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }

  fn publish(&self, view: PageView) {
    self.view.send_replace(view);
  }

  fn persist(&self, pager: &PaginationController) {
    self
      .store
      .write(&self.collection, &pager.entry(self.portable_cursors));
  }

  /// Re-read the persisted entry and republish the current page.
  fn rehydrate(&self) {
    let entry = self.store.read(&self.collection);
    let mut pager = self.pager();
    let mode = pager.mode();
    let entry = match (entry, mode) {
      (Some(entry), _) => entry,
      (None, PaginationMode::FlatSlice) => CacheEntry::flat(Vec::new()),
      (None, PaginationMode::CursorPaged) => CacheEntry::Paged(Default::default()),
    };

    let fingerprint = entry.as_flat().map(FlatEntry::fingerprint);
    if !pager.load(entry) {
      warn!(collection = %self.collection, ?mode, "cached entry has the wrong shape, ignoring");
    } else if let (ChangeObserver::Push(push), Some(fingerprint)) = (&self.observer, fingerprint) {
      push.seed(fingerprint);
    }
    let view = PageView::of(&pager);
    drop(pager);
    debug!(collection = %self.collection, page = view.page, "republished page from cache");
    self.publish(view);
  }

  async fn refresh(&self) -> Result<RefreshOutcome> {
    self.ensure_open()?;
    match &self.observer {
      ChangeObserver::Push(_) => {
        let snapshot = self.gateway.fetch_all(&self.collection).await?;
        self.apply_push(snapshot).await
      }
      ChangeObserver::Pull(pull) => {
        let cached_newest = self.pager().newest_timestamp();
        pull
          .check(
            self.gateway.as_ref(),
            &self.collection,
            cached_newest,
            || self.reload(),
          )
          .await
      }
    }
  }

  async fn apply_push(&self, snapshot: Vec<Document>) -> Result<RefreshOutcome> {
    self.ensure_open()?;
    let ChangeObserver::Push(push) = &self.observer else {
      return Ok(RefreshOutcome::Unchanged);
    };
    let Some(snapshot) = push.accept(snapshot) else {
      return Ok(RefreshOutcome::Unchanged);
    };

    let mode = self.pager().mode();
    let applied = match mode {
      PaginationMode::FlatSlice => self.apply_flat(snapshot),
      // Pages are fetched on demand; a changed snapshot only invalidates them.
      PaginationMode::CursorPaged => self.reload().await,
    };
    if let Err(e) = applied {
      // Let the same snapshot through again next time.
      push.reset();
      return Err(e);
    }
    Ok(RefreshOutcome::Refreshed)
  }

  /// Replace the whole mirrored list with a confirmed remote snapshot.
  fn apply_flat(&self, documents: Vec<Document>) -> Result<()> {
    let entry = FlatEntry::new(documents);
    if let ChangeObserver::Push(push) = &self.observer {
      push.seed(entry.fingerprint());
    }

    let mut pager = self.pager();
    self.ensure_open()?;
    pager.replace_flat(entry);
    self.persist(&pager);
    let view = PageView::of(&pager);
    drop(pager);

    info!(
      collection = %self.collection,
      documents = view.documents.len(),
      total_pages = view.total_pages,
      "cache refreshed"
    );
    self.publish(view);
    Ok(())
  }

  /// Reload from the remote: the whole list in flat mode, the count and
  /// page 1 in cursor mode.
  async fn reload(&self) -> Result<()> {
    let mode = self.pager().mode();
    match mode {
      PaginationMode::FlatSlice => {
        let documents = self.gateway.fetch_all(&self.collection).await?;
        self.apply_flat(documents)
      }
      PaginationMode::CursorPaged => {
        let count = self.gateway.count(&self.collection).await?;
        let first = self
          .gateway
          .fetch_page(&self.collection, self.page_size(), None)
          .await?;

        let view = {
          let mut pager = self.pager();
          self.ensure_open()?;
          pager.invalidate();
          pager.set_total_count(count);
          pager.apply_page(1, first);
          self.persist(&pager);
          PageView::of(&pager)
        };

        info!(collection = %self.collection, count, "paged cache reset");
        self.publish(view);
        Ok(())
      }
    }
  }

  fn page_size(&self) -> usize {
    self.pager().page_size()
  }

  async fn after_mutation(&self) {
    if self.is_closed() {
      return;
    }
    if let ChangeObserver::Push(push) = &self.observer {
      push.reset();
    }

    match self.reload().await {
      Ok(()) => {}
      Err(Error::Cancelled) => {}
      Err(e) => {
        warn!(collection = %self.collection, error = %e, "reload after mutation failed");
        if let ChangeObserver::Pull(pull) = &self.observer {
          pull.force_next();
        }
        let view = {
          let mut pager = self.pager();
          if pager.current_page() != 1 {
            pager.go_to_page(1);
          }
          PageView::of(&pager)
        };
        self.publish(view);
      }
    }
  }

  async fn go_to_page(&self, page: u32) -> Result<bool> {
    self.ensure_open()?;
    // Each fetch moves the replay one page forward, so `page` fetches suffice.
    for _ in 0..=page {
      let plan = self.pager().plan(page);
      match plan {
        None | Some(PagePlan::Stay) => return Ok(false),
        Some(PagePlan::Serve) => {
          let mut pager = self.pager();
          let moved = pager.go_to_page(page);
          let view = PageView::of(&pager);
          drop(pager);
          if moved {
            self.publish(view);
          }
          return Ok(moved);
        }
        Some(PagePlan::Fetch { page: fetch, after }) => {
          debug!(collection = %self.collection, page = fetch, "fetching page");
          let fetched = self
            .gateway
            .fetch_page(&self.collection, self.page_size(), after.as_ref())
            .await?;
          let reached_end = fetched.next.is_none();

          let stored = {
            let mut pager = self.pager();
            self.ensure_open()?;
            let stored = pager.apply_page(fetch, fetched);
            self.persist(&pager);
            stored
          };

          if !stored || (reached_end && fetch < page) {
            debug!(collection = %self.collection, page, "page lies past the end");
            return Ok(false);
          }
        }
      }
    }
    Ok(false)
  }
}
