//! Documents, their canonical ordering, and change fingerprints.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Collection-scoped document identifier.
pub type DocumentId = String;

/// Logical seconds since the epoch.
pub type Timestamp = u64;

/// Arbitrary user fields of a document.
pub type Fields = Map<String, Value>;

/// An immutable snapshot of one remote document.
///
/// Serialized flat: `{"id": "..", "updatedAt": 17, "name": "..", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: DocumentId,
  #[serde(rename = "updatedAt", deserialize_with = "deserialize_timestamp")]
  pub updated_at: Timestamp,
  #[serde(flatten)]
  pub fields: Fields,
}

impl Document {
  /// `id` and `updatedAt` belong to the store and are dropped from `fields`.
  pub fn new(id: impl Into<DocumentId>, updated_at: Timestamp, mut fields: Fields) -> Self {
    fields.remove("id");
    fields.remove("updatedAt");
    Self {
      id: id.into(),
      updated_at,
      fields,
    }
  }

  /// Look up a user field.
  pub fn field(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  /// Produce the snapshot that results from merging `changes` over this one.
  pub fn patched(&self, changes: &Fields, updated_at: Timestamp) -> Self {
    let mut fields = self.fields.clone();
    for (key, value) in changes {
      fields.insert(key.clone(), value.clone());
    }
    Self::new(self.id.clone(), updated_at, fields)
  }
}

/// Accept either a plain number or the `{"seconds": n}` shape older stores wrote.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Seconds(Timestamp),
    Wrapped { seconds: Timestamp },
  }

  Ok(match Raw::deserialize(deserializer)? {
    Raw::Seconds(s) | Raw::Wrapped { seconds: s } => s,
  })
}

/// Newest `updatedAt` first, ties broken by ascending `id`.
pub fn canonical_order(a: &Document, b: &Document) -> Ordering {
  b.updated_at
    .cmp(&a.updated_at)
    .then_with(|| a.id.cmp(&b.id))
}

/// Sort into canonical order and drop duplicate ids, keeping the newest snapshot.
///
/// When two snapshots of one id carry the same timestamp the later one in
/// `documents` wins.
pub fn normalize(documents: Vec<Document>) -> Vec<Document> {
  let mut latest: HashMap<DocumentId, Document> = HashMap::with_capacity(documents.len());
  for doc in documents {
    match latest.get(&doc.id) {
      Some(existing) if existing.updated_at > doc.updated_at => {}
      _ => {
        latest.insert(doc.id.clone(), doc);
      }
    }
  }

  let mut out: Vec<Document> = latest.into_values().collect();
  out.sort_by(canonical_order);
  out
}

/// Newest `updatedAt` among `documents`, if any.
pub fn newest_timestamp(documents: &[Document]) -> Option<Timestamp> {
  documents.iter().map(|d| d.updated_at).max()
}

/// The ordered `(id, updatedAt)` pairs of a snapshot.
///
/// Two snapshots with equal fingerprints are treated as the same collection
/// state without comparing document bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint(Vec<(DocumentId, Timestamp)>);

impl Fingerprint {
  /// Fingerprint of an already ordered snapshot.
  pub fn of(documents: &[Document]) -> Self {
    Self(
      documents
        .iter()
        .map(|d| (d.id.clone(), d.updated_at))
        .collect(),
    )
  }

  /// Short stable digest, for log lines.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    for (id, ts) in &self.0 {
      hasher.update(id.as_bytes());
      hasher.update([0u8]);
      hasher.update(ts.to_be_bytes());
    }
    let full = hex::encode(hasher.finalize());
    full[..12].to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn doc(id: &str, ts: Timestamp) -> Document {
    Document::new(id, ts, Fields::new())
  }

  #[test]
  fn serializes_flat() {
    let mut fields = Fields::new();
    fields.insert("name".into(), json!("Lamp"));
    let d = Document::new("a1", 42, fields);

    let value = serde_json::to_value(&d).unwrap();
    assert_eq!(value, json!({"id": "a1", "updatedAt": 42, "name": "Lamp"}));

    let back: Document = serde_json::from_value(value).unwrap();
    assert_eq!(back, d);
  }

  #[test]
  fn reads_wrapped_seconds() {
    let d: Document =
      serde_json::from_value(json!({"id": "x", "updatedAt": {"seconds": 9}, "price": 5})).unwrap();
    assert_eq!(d.updated_at, 9);
    assert_eq!(d.field("price"), Some(&json!(5)));
  }

  #[test]
  fn normalize_orders_and_dedupes() {
    let out = normalize(vec![
      doc("b", 5),
      doc("a", 5),
      doc("c", 9),
      doc("b", 3),
      doc("d", 1),
    ]);
    let ids: Vec<_> = out.iter().map(|d| (d.id.as_str(), d.updated_at)).collect();
    assert_eq!(ids, vec![("c", 9), ("a", 5), ("b", 5), ("d", 1)]);
  }

  #[test]
  fn patched_merges_fields_and_restamps() {
    let mut fields = Fields::new();
    fields.insert("name".into(), json!("Old"));
    fields.insert("price".into(), json!(3));
    let d = Document::new("p", 1, fields);

    let mut changes = Fields::new();
    changes.insert("price".into(), json!(7));
    changes.insert("id".into(), json!("hijack"));
    let next = d.patched(&changes, 8);

    assert_eq!(next.id, "p");
    assert!(next.field("id").is_none());
    assert_eq!(next.updated_at, 8);
    assert_eq!(next.field("name"), Some(&json!("Old")));
    assert_eq!(next.field("price"), Some(&json!(7)));
    // original snapshot untouched
    assert_eq!(d.field("price"), Some(&json!(3)));
  }

  #[test]
  fn fingerprint_ignores_bodies() {
    let mut a = doc("x", 1);
    let b = doc("x", 1);
    a.fields.insert("name".into(), json!("changed"));
    assert_eq!(Fingerprint::of(&[a]), Fingerprint::of(&[b]));
    assert_ne!(
      Fingerprint::of(&[doc("x", 1)]).digest(),
      Fingerprint::of(&[doc("x", 2)]).digest()
    );
  }
}
