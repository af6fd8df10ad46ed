//! Mirror a remote document collection into a local persistent cache.
//!
//! A [`SyncEngine`] serves reads from the cache immediately, keeps it current
//! through either a push subscription or periodic pulls, pages through it, and
//! follows cache writes made by other contexts sharing the same medium.

pub mod cache;
pub mod config;
pub mod crosstab;
pub mod document;
pub mod engine;
pub mod error;
pub mod observer;
pub mod pagination;
pub mod remote;

pub use cache::{LocalCacheStore, MemoryMedium, SqliteMedium, StorageMedium};
pub use config::{Config, SyncConfig};
pub use document::{Document, DocumentId, Fields, Timestamp};
pub use engine::{PageView, SyncEngine, SyncEngineBuilder, DEFAULT_PAGE_SIZE};
pub use error::{Error, Result};
pub use observer::{RefreshOutcome, Strategy};
pub use pagination::PaginationMode;
pub use remote::{HttpGateway, MemoryGateway, RemoteGateway};
