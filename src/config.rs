//! Configuration Module
//!
//! Settings for opening a sharded disk cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// == Defaults ==
/// Root directory under which factory caches are created
pub const DEFAULT_CACHE_ROOT: &str = "data-unversioned/cache";

/// Number of shards used by factory caches
pub const DEFAULT_SHARDS: usize = 64;

/// Shard lock timeout used by factory caches
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Total size limit used by factory caches (300 GB)
pub const DEFAULT_SIZE_LIMIT: u64 = 300_000_000_000;

/// Values shorter than this are kept inline in the index
pub const DEFAULT_MIN_FILE_SIZE: u64 = 1 << 15;

/// Maximum number of entries evicted by a single set
pub const DEFAULT_CULL_LIMIT: usize = 10;

// == Eviction Policy ==
/// Order in which entries are evicted once a shard exceeds its size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Oldest stored entry first; reads do not change the order
    #[default]
    LeastRecentlyStored,
    /// Oldest accessed entry first; reads move the entry to the front
    LeastRecentlyUsed,
    /// Never evict
    None,
}

// == Disk Options ==
/// Options handed to a [`Disk`](crate::disk::Disk) when a shard opens it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOptions {
    /// Payloads at least this long are written to their own file
    pub min_file_size: u64,
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            min_file_size: DEFAULT_MIN_FILE_SIZE,
        }
    }
}

// == Cache Config ==
/// Settings for a [`FanoutCache`](crate::cache::FanoutCache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the shard subdirectories
    pub directory: PathBuf,
    /// Number of shards the keyspace is split into
    pub shards: usize,
    /// How long an operation waits for a shard lock
    pub timeout: Duration,
    /// Total size limit in bytes, split evenly across shards
    pub size_limit: u64,
    /// Maximum entries evicted per set
    pub cull_limit: usize,
    /// Eviction order
    pub eviction_policy: EvictionPolicy,
    /// Options for the disk of every shard
    pub disk: DiskOptions,
}

impl CacheConfig {
    /// Creates a config rooted at `directory` with the default settings.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Creates the config for a named scope under `root`.
    ///
    /// The scope is joined verbatim; it is not sanitized.
    pub fn for_scope(root: impl AsRef<Path>, scope: &str) -> Self {
        Self::new(root.as_ref().join(scope))
    }

    /// Size limit of a single shard.
    pub fn shard_size_limit(&self) -> u64 {
        self.size_limit / self.shards.max(1) as u64
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_CACHE_ROOT),
            shards: DEFAULT_SHARDS,
            timeout: DEFAULT_TIMEOUT,
            size_limit: DEFAULT_SIZE_LIMIT,
            cull_limit: DEFAULT_CULL_LIMIT,
            eviction_policy: EvictionPolicy::default(),
            disk: DiskOptions::default(),
        }
    }
}
