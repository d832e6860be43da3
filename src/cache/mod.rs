//! Cache Module
//!
//! Disk cache engine: single-directory shards and the fanout cache that
//! spreads keys across them.

mod entry;
mod fanout;
mod shard;
mod stats;


// Re-export public types
pub use entry::CacheEntry;
pub use fanout::FanoutCache;
pub use shard::{Cache, DATABASE_FILE, ORPHAN_MIN_AGE};
pub use stats::CacheStats;
