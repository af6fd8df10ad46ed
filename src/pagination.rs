//! Page bookkeeping over either a fully mirrored list or cursor-fetched pages.
//!
//! The controller never performs I/O. In cursor mode [`PaginationController::plan`]
//! says which fetch is needed to reach a page and the engine feeds the result
//! back through [`PaginationController::apply_page`].

use crate::cache::{CacheEntry, FlatEntry, PagedEntry};
use crate::document::{Document, Timestamp};
use crate::remote::{Cursor, Page};

/// How an engine pages through its collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PaginationMode {
  /// Mirror the whole collection and slice it locally.
  #[default]
  FlatSlice,
  /// Fetch pages on demand with gateway cursors and cache visited pages.
  CursorPaged,
}

/// What it takes to show a requested page.
#[derive(Debug, Clone, PartialEq)]
pub enum PagePlan {
  /// Already on that page.
  Stay,
  /// The page can be served from memory.
  Serve,
  /// Fetch `page` starting after `after`, then plan again.
  Fetch { page: u32, after: Option<Cursor> },
}

#[derive(Debug, Clone)]
enum Source {
  Flat(FlatEntry),
  Paged(PagedEntry),
}

#[derive(Debug, Clone)]
pub struct PaginationController {
  page_size: usize,
  current: u32,
  source: Source,
}

fn pages_for(count: u64, page_size: usize) -> u32 {
  let size = page_size.max(1) as u64;
  count.div_ceil(size).max(1) as u32
}

impl PaginationController {
  pub fn new(mode: PaginationMode, page_size: usize) -> Self {
    let source = match mode {
      PaginationMode::FlatSlice => Source::Flat(FlatEntry::default()),
      PaginationMode::CursorPaged => Source::Paged(PagedEntry::new()),
    };
    Self {
      page_size: page_size.max(1),
      current: 1,
      source,
    }
  }

  pub fn mode(&self) -> PaginationMode {
    match self.source {
      Source::Flat(_) => PaginationMode::FlatSlice,
      Source::Paged(_) => PaginationMode::CursorPaged,
    }
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn current_page(&self) -> u32 {
    self.current
  }

  /// Never less than 1, even for an empty collection.
  pub fn total_pages(&self) -> u32 {
    match &self.source {
      Source::Flat(flat) => pages_for(flat.len() as u64, self.page_size),
      Source::Paged(paged) => match paged.total_count() {
        Some(count) => pages_for(count, self.page_size),
        None => {
          let highest = paged.page_numbers().max().unwrap_or(1);
          let beyond = paged.cursor_after(highest).is_some() as u32;
          (highest + beyond).max(1)
        }
      },
    }
  }

  pub fn page_data(&self) -> &[Document] {
    match &self.source {
      Source::Flat(flat) => {
        let docs = flat.documents();
        let start = (self.current as usize - 1) * self.page_size;
        if start >= docs.len() {
          return &[];
        }
        let end = (start + self.page_size).min(docs.len());
        &docs[start..end]
      }
      Source::Paged(paged) => paged.page(self.current).unwrap_or(&[]),
    }
  }

  pub fn has_more(&self) -> bool {
    match &self.source {
      Source::Flat(_) => self.current < self.total_pages(),
      Source::Paged(paged) => {
        if paged.last_page() == Some(self.current) {
          false
        } else if paged.cursor_after(self.current).is_some() {
          true
        } else {
          self.current < self.total_pages()
        }
      }
    }
  }

  pub fn newest_timestamp(&self) -> Option<Timestamp> {
    match &self.source {
      Source::Flat(flat) => flat.newest_timestamp(),
      Source::Paged(paged) => paged.newest_timestamp(),
    }
  }

  /// Document count: exact when mirrored, the last probe when paged.
  pub fn total_count(&self) -> Option<u64> {
    match &self.source {
      Source::Flat(flat) => Some(flat.len() as u64),
      Source::Paged(paged) => paged.total_count(),
    }
  }

  fn in_range(&self, page: u32) -> bool {
    page >= 1 && page <= self.total_pages()
  }

  /// Decide how to reach `page`. `None` means the page is out of range.
  pub fn plan(&self, page: u32) -> Option<PagePlan> {
    if !self.in_range(page) {
      return None;
    }
    if page == self.current {
      return Some(PagePlan::Stay);
    }
    match &self.source {
      Source::Flat(_) => Some(PagePlan::Serve),
      Source::Paged(paged) => {
        if paged.contains_page(page) {
          return Some(PagePlan::Serve);
        }
        // Replay from the closest page whose starting cursor we still hold.
        let start = (1..page)
          .rev()
          .find(|p| paged.cursor_after(*p).is_some())
          .map(|p| p + 1)
          .unwrap_or(1);
        let after = if start == 1 {
          None
        } else {
          paged.cursor_after(start - 1).cloned()
        };
        Some(PagePlan::Fetch { page: start, after })
      }
    }
  }

  /// Move to `page` if it is in range and servable without I/O.
  ///
  /// Returns whether the current page changed.
  pub fn go_to_page(&mut self, page: u32) -> bool {
    match self.plan(page) {
      Some(PagePlan::Serve) => {
        self.current = page;
        true
      }
      _ => false,
    }
  }

  pub fn next_page(&mut self) -> bool {
    self.go_to_page(self.current + 1)
  }

  pub fn prev_page(&mut self) -> bool {
    match self.current.checked_sub(1) {
      Some(page) => self.go_to_page(page),
      None => false,
    }
  }

  /// Record a fetched page. Returns false when the page turned out empty,
  /// meaning the collection shrank below it.
  pub fn apply_page(&mut self, page: u32, fetched: Page) -> bool {
    if let Source::Paged(paged) = &mut self.source {
      if fetched.documents.is_empty() && page > 1 {
        return false;
      }
      paged.insert_page(page, fetched.documents, fetched.next);
      true
    } else {
      false
    }
  }

  pub fn set_total_count(&mut self, count: u64) {
    if let Source::Paged(paged) = &mut self.source {
      paged.set_total_count(count);
    }
  }

  /// Replace the mirrored list and go back to page 1.
  pub fn replace_flat(&mut self, entry: FlatEntry) {
    self.source = Source::Flat(entry);
    self.current = 1;
  }

  /// Drop every cached page and cursor and go back to page 1.
  pub fn invalidate(&mut self) {
    self.current = 1;
    if let Source::Paged(paged) = &mut self.source {
      *paged = PagedEntry::new();
    }
  }

  /// Adopt an entry written elsewhere, staying on the current page when it
  /// still exists. Entries of the other shape are ignored.
  pub fn load(&mut self, entry: CacheEntry) -> bool {
    match (&mut self.source, entry) {
      (Source::Flat(flat), CacheEntry::Flat(incoming)) => {
        *flat = incoming;
      }
      (Source::Paged(paged), CacheEntry::Paged(mut incoming)) => {
        // A held cursor marks the end of the page it was fetched with, so it
        // only carries over to an identical page.
        for page in incoming.page_numbers().collect::<Vec<_>>() {
          if incoming.cursor_after(page).is_some() || incoming.last_page() == Some(page) {
            continue;
          }
          if incoming.page(page) != paged.page(page) {
            continue;
          }
          if let Some(cursor) = paged.cursor_after(page) {
            incoming.insert_cursor(page, cursor.clone());
          }
        }
        *paged = incoming;
      }
      _ => return false,
    }

    let still_there = match &self.source {
      Source::Flat(_) => self.current <= self.total_pages(),
      Source::Paged(paged) => paged.contains_page(self.current),
    };
    if !still_there {
      self.current = 1;
    }
    true
  }

  /// The entry to persist. Cursors are dropped unless they survive restarts.
  pub fn entry(&self, portable_cursors: bool) -> CacheEntry {
    match &self.source {
      Source::Flat(flat) => CacheEntry::Flat(flat.clone()),
      Source::Paged(paged) if portable_cursors => CacheEntry::Paged(paged.clone()),
      Source::Paged(paged) => CacheEntry::Paged(paged.without_cursors()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::Fields;

  fn docs(n: usize) -> Vec<Document> {
    (0..n)
      .map(|i| Document::new(format!("d{:03}", i), 1000 - i as u64, Fields::new()))
      .collect()
  }

  fn flat(n: usize, page_size: usize) -> PaginationController {
    let mut pc = PaginationController::new(PaginationMode::FlatSlice, page_size);
    pc.replace_flat(FlatEntry::new(docs(n)));
    pc
  }

  #[test]
  fn empty_collection_has_one_empty_page() {
    let pc = PaginationController::new(PaginationMode::FlatSlice, 10);
    assert_eq!(pc.total_pages(), 1);
    assert!(pc.page_data().is_empty());
    assert!(!pc.has_more());

    let pc = PaginationController::new(PaginationMode::CursorPaged, 10);
    assert_eq!(pc.total_pages(), 1);
    assert!(pc.page_data().is_empty());
  }

  #[test]
  fn last_flat_page_is_partial() {
    let mut pc = flat(25, 10);
    assert_eq!(pc.total_pages(), 3);
    assert!(pc.go_to_page(3));
    assert_eq!(pc.page_data().len(), 5);
    assert_eq!(pc.page_data()[0].id, "d020");
    assert!(!pc.has_more());
  }

  #[test]
  fn out_of_range_navigation_is_rejected() {
    let mut pc = flat(25, 10);
    assert!(pc.go_to_page(2));
    assert!(!pc.go_to_page(0));
    assert!(!pc.go_to_page(4));
    assert!(!pc.go_to_page(2));
    assert_eq!(pc.current_page(), 2);

    assert!(pc.prev_page());
    assert!(!pc.prev_page());
    assert_eq!(pc.current_page(), 1);
  }

  #[test]
  fn replacing_flat_resets_to_first_page() {
    let mut pc = flat(25, 10);
    pc.go_to_page(3);
    pc.replace_flat(FlatEntry::new(docs(4)));
    assert_eq!(pc.current_page(), 1);
    assert_eq!(pc.total_pages(), 1);
  }

  #[test]
  fn cursor_plan_replays_from_first_page() {
    let mut pc = PaginationController::new(PaginationMode::CursorPaged, 2);
    pc.set_total_count(6);

    assert_eq!(
      pc.plan(3),
      Some(PagePlan::Fetch {
        page: 1,
        after: None
      })
    );

    let all = docs(6);
    pc.apply_page(
      1,
      Page {
        documents: all[0..2].to_vec(),
        next: Some(Cursor::new("c1")),
      },
    );
    assert_eq!(
      pc.plan(3),
      Some(PagePlan::Fetch {
        page: 2,
        after: Some(Cursor::new("c1"))
      })
    );
    assert_eq!(pc.plan(1), Some(PagePlan::Stay));
    assert_eq!(pc.plan(4), None);
  }

  #[test]
  fn cached_page_is_served() {
    let mut pc = PaginationController::new(PaginationMode::CursorPaged, 2);
    pc.set_total_count(4);
    let all = docs(4);
    pc.apply_page(
      1,
      Page {
        documents: all[0..2].to_vec(),
        next: Some(Cursor::new("c1")),
      },
    );
    pc.apply_page(
      2,
      Page {
        documents: all[2..4].to_vec(),
        next: None,
      },
    );

    let persisted = pc.entry(false);
    let mut reloaded = PaginationController::new(PaginationMode::CursorPaged, 2);
    assert!(reloaded.load(persisted));

    assert_eq!(reloaded.plan(2), Some(PagePlan::Serve));
    assert!(reloaded.go_to_page(2));
    assert!(!reloaded.has_more());
  }

  #[test]
  fn empty_fetched_page_is_rejected() {
    let mut pc = PaginationController::new(PaginationMode::CursorPaged, 2);
    assert!(!pc.apply_page(
      2,
      Page {
        documents: Vec::new(),
        next: None
      }
    ));
    assert!(pc.apply_page(
      1,
      Page {
        documents: Vec::new(),
        next: None
      }
    ));
    assert_eq!(pc.total_pages(), 1);
  }

  fn first_page_entry(documents: Vec<Document>, count: u64) -> CacheEntry {
    let mut writer = PaginationController::new(PaginationMode::CursorPaged, 2);
    writer.set_total_count(count);
    writer.apply_page(
      1,
      Page {
        documents,
        next: Some(Cursor::new("theirs")),
      },
    );
    writer.entry(false)
  }

  #[test]
  fn held_cursor_survives_identical_page() {
    let all = docs(4);
    let mut pc = PaginationController::new(PaginationMode::CursorPaged, 2);
    pc.set_total_count(4);
    pc.apply_page(
      1,
      Page {
        documents: all[0..2].to_vec(),
        next: Some(Cursor::new("c1")),
      },
    );

    assert!(pc.load(first_page_entry(all[0..2].to_vec(), 4)));
    assert_eq!(
      pc.plan(2),
      Some(PagePlan::Fetch {
        page: 2,
        after: Some(Cursor::new("c1"))
      })
    );
  }

  #[test]
  fn held_cursor_is_dropped_when_page_changed() {
    let all = docs(4);
    let mut pc = PaginationController::new(PaginationMode::CursorPaged, 2);
    pc.set_total_count(4);
    pc.apply_page(
      1,
      Page {
        documents: all[0..2].to_vec(),
        next: Some(Cursor::new("c1")),
      },
    );

    // Someone else added a newer document: page 1 now ends one earlier.
    let newer = Document::new("new", 5000, Fields::new());
    assert!(pc.load(first_page_entry(vec![newer, all[0].clone()], 5)));
    assert_eq!(
      pc.plan(2),
      Some(PagePlan::Fetch {
        page: 1,
        after: None
      })
    );
  }

  #[test]
  fn shape_mismatch_is_ignored() {
    let mut pc = PaginationController::new(PaginationMode::CursorPaged, 2);
    assert!(!pc.load(CacheEntry::flat(docs(3))));
  }
}
