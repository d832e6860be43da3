//! gzcache - A sharded disk cache with transparent gzip compression
//!
//! Binary values are gzip-compressed before they reach disk and
//! decompressed on the way back; other values are stored as-is.

pub mod cache;
pub mod config;
pub mod disk;
pub mod error;
pub mod factory;
pub mod telemetry;

pub use cache::{Cache, CacheStats, FanoutCache};
pub use config::{CacheConfig, DiskOptions, EvictionPolicy};
pub use disk::{Disk, FileDisk, GzipDisk, StoreMode, Value};
pub use error::{CacheError, Result};
pub use factory::{get_cache, get_cache_in};
pub use telemetry::init_tracing;
