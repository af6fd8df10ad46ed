use std::collections::HashSet;

use docsync::cache::{CacheEntry, FlatEntry};
use docsync::document::{Document, Fields};
use docsync::pagination::{PaginationController, PaginationMode};
use proptest::prelude::*;

fn documents() -> impl Strategy<Value = Vec<Document>> {
  prop::collection::vec((0u8..30, 0u64..40), 0..60).prop_map(|raw| {
    raw
      .into_iter()
      .map(|(id, ts)| Document::new(format!("d{}", id), ts, Fields::new()))
      .collect()
  })
}

fn assert_canonical(docs: &[Document]) {
  for pair in docs.windows(2) {
    let (a, b) = (&pair[0], &pair[1]);
    assert!(
      a.updated_at > b.updated_at || (a.updated_at == b.updated_at && a.id < b.id),
      "{} ({}) before {} ({})",
      a.id,
      a.updated_at,
      b.id,
      b.updated_at
    );
  }
}

proptest! {
  #[test]
  fn flat_entries_are_ordered_and_unique(docs in documents()) {
    let entry = FlatEntry::new(docs.clone());
    assert_canonical(entry.documents());

    let ids: HashSet<_> = entry.documents().iter().map(|d| d.id.as_str()).collect();
    prop_assert_eq!(ids.len(), entry.len());
    let distinct: HashSet<_> = docs.iter().map(|d| d.id.as_str()).collect();
    prop_assert_eq!(distinct.len(), entry.len());
  }

  #[test]
  fn decoded_entries_are_normalized(docs in documents()) {
    // Bypass construction so the raw order reaches the decoder.
    let raw = serde_json::json!({ "flat": { "documents": docs } });
    let entry: CacheEntry = serde_json::from_value(raw).unwrap();
    let entry = entry.normalized();
    let flat = entry.as_flat().unwrap();
    assert_canonical(flat.documents());
  }

  #[test]
  fn last_page_holds_the_remainder(docs in documents(), page_size in 1usize..12) {
    let entry = FlatEntry::new(docs);
    let n = entry.len();
    let mut pager = PaginationController::new(PaginationMode::FlatSlice, page_size);
    pager.replace_flat(entry);

    let total = pager.total_pages() as usize;
    prop_assert_eq!(total, n.div_ceil(page_size).max(1));

    if total > 1 {
      prop_assert!(pager.go_to_page(total as u32));
    }
    let expected = if n == 0 { 0 } else { n - (total - 1) * page_size };
    prop_assert_eq!(pager.page_data().len(), expected);
    prop_assert!(!pager.has_more());
    prop_assert!(!pager.go_to_page(total as u32 + 1));
  }
}
