//! Local persistent cache for one collection at a time.
//!
//! - [`LocalCacheStore`] reads and writes whole [`CacheEntry`] snapshots
//! - corrupt or unreadable content is a cache miss, never an error
//! - mediums announce writes made by other contexts sharing them

mod entry;
mod layer;
mod storage;
mod traits;

pub use entry::{CacheEntry, FlatEntry, PagedEntry};
pub use layer::LocalCacheStore;
pub use storage::{MemoryMedium, SqliteMedium};
pub use traits::{StorageEvent, StorageMedium};
