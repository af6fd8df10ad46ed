//! The persisted shape of one collection's cache.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::{self, Document, Fingerprint, Timestamp};
use crate::remote::Cursor;

/// One committed snapshot of a collection's cache.
///
/// An engine picks one shape and sticks to it: `Flat` when the whole
/// collection is mirrored, `Paged` when only visited pages are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheEntry {
  Flat(FlatEntry),
  Paged(PagedEntry),
}

impl CacheEntry {
  pub fn flat(documents: Vec<Document>) -> Self {
    CacheEntry::Flat(FlatEntry::new(documents))
  }

  /// Re-establish ordering and id uniqueness after reading untrusted input.
  pub fn normalized(self) -> Self {
    match self {
      CacheEntry::Flat(flat) => CacheEntry::Flat(FlatEntry::new(flat.documents)),
      CacheEntry::Paged(paged) => CacheEntry::Paged(paged.normalized()),
    }
  }

  pub fn newest_timestamp(&self) -> Option<Timestamp> {
    match self {
      CacheEntry::Flat(flat) => flat.newest_timestamp(),
      CacheEntry::Paged(paged) => paged.newest_timestamp(),
    }
  }

  pub fn as_flat(&self) -> Option<&FlatEntry> {
    match self {
      CacheEntry::Flat(flat) => Some(flat),
      CacheEntry::Paged(_) => None,
    }
  }
}

/// The whole collection, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatEntry {
  documents: Vec<Document>,
}

impl FlatEntry {
  pub fn new(documents: Vec<Document>) -> Self {
    Self {
      documents: document::normalize(documents),
    }
  }

  pub fn documents(&self) -> &[Document] {
    &self.documents
  }

  pub fn len(&self) -> usize {
    self.documents.len()
  }

  pub fn is_empty(&self) -> bool {
    self.documents.is_empty()
  }

  pub fn newest_timestamp(&self) -> Option<Timestamp> {
    self.documents.first().map(|d| d.updated_at)
  }

  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint::of(&self.documents)
  }
}

/// Visited pages only, keyed by 1-based page number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedEntry {
  pages: BTreeMap<u32, Vec<Document>>,
  /// Cursor produced when page `n` was fetched, i.e. the start of page `n + 1`.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  cursors: BTreeMap<u32, Cursor>,
  /// Page that came back without a next cursor.
  #[serde(default)]
  last_page: Option<u32>,
  #[serde(default)]
  total_count: Option<u64>,
}

impl PagedEntry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn page(&self, page: u32) -> Option<&[Document]> {
    self.pages.get(&page).map(Vec::as_slice)
  }

  pub fn contains_page(&self, page: u32) -> bool {
    self.pages.contains_key(&page)
  }

  pub fn cursor_after(&self, page: u32) -> Option<&Cursor> {
    self.cursors.get(&page)
  }

  pub fn last_page(&self) -> Option<u32> {
    self.last_page
  }

  pub fn total_count(&self) -> Option<u64> {
    self.total_count
  }

  pub fn set_total_count(&mut self, count: u64) {
    self.total_count = Some(count);
  }

  pub fn page_numbers(&self) -> impl Iterator<Item = u32> + '_ {
    self.pages.keys().copied()
  }

  /// Store a freshly fetched page and the cursor that follows it.
  ///
  /// Any other cached page sharing an id with the new one is stale and is
  /// evicted together with its cursor.
  pub fn insert_page(&mut self, page: u32, documents: Vec<Document>, next: Option<Cursor>) {
    let documents = document::normalize(documents);

    let stale: Vec<u32> = self
      .pages
      .iter()
      .filter(|(n, docs)| {
        **n != page
          && docs
            .iter()
            .any(|d| documents.iter().any(|fresh| fresh.id == d.id))
      })
      .map(|(n, _)| *n)
      .collect();
    for n in stale {
      self.pages.remove(&n);
      self.cursors.remove(&n);
      if self.last_page == Some(n) {
        self.last_page = None;
      }
    }

    match next {
      Some(cursor) => {
        self.cursors.insert(page, cursor);
        if self.last_page == Some(page) {
          self.last_page = None;
        }
      }
      None => {
        self.cursors.remove(&page);
        self.last_page = Some(page);
      }
    }
    self.pages.insert(page, documents);
  }

  /// Remember a cursor without caching the page body.
  pub fn insert_cursor(&mut self, page: u32, cursor: Cursor) {
    self.cursors.insert(page, cursor);
  }

  /// Copy suitable for persistence when cursors cannot outlive this process.
  pub fn without_cursors(&self) -> Self {
    Self {
      pages: self.pages.clone(),
      cursors: BTreeMap::new(),
      last_page: self.last_page,
      total_count: self.total_count,
    }
  }

  pub fn newest_timestamp(&self) -> Option<Timestamp> {
    self
      .pages
      .values()
      .filter_map(|docs| docs.first())
      .map(|d| d.updated_at)
      .max()
  }

  fn normalized(self) -> Self {
    let mut out = PagedEntry {
      total_count: self.total_count,
      ..Default::default()
    };
    for (page, docs) in self.pages {
      let next = self.cursors.get(&page).cloned();
      out.insert_page(page, docs, next);
    }
    out.last_page = self.last_page.filter(|n| out.pages.contains_key(n));
    out
  }
}
