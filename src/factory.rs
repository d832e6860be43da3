//! Cache Factory
//!
//! Opens the compressed, sharded cache used for a named scope.

use std::path::Path;

use crate::cache::FanoutCache;
use crate::config::{CacheConfig, DEFAULT_CACHE_ROOT};
use crate::disk::GzipDisk;
use crate::error::Result;

/// Opens the gzip-compressed cache for `scope` under `data-unversioned/cache/`.
///
/// The cache has 64 shards, a 1 second lock timeout and a 300 GB size
/// limit. `scope` becomes a subdirectory as given; it is not sanitized, so
/// callers must not pass untrusted names.
///
/// # Example
/// ```no_run
/// let cache = gzcache::get_cache("embeddings")?;
/// cache.set("doc-1", vec![0u8; 1024], None)?;
/// # Ok::<(), gzcache::CacheError>(())
/// ```
pub fn get_cache(scope: &str) -> Result<FanoutCache<GzipDisk>> {
    get_cache_in(DEFAULT_CACHE_ROOT, scope)
}

/// Same as [`get_cache`] with a different root directory.
pub fn get_cache_in(root: impl AsRef<Path>, scope: &str) -> Result<FanoutCache<GzipDisk>> {
    FanoutCache::open(CacheConfig::for_scope(root, scope))
}
