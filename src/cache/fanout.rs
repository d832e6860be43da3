//! Fanout Cache Module
//!
//! Spreads keys over a fixed number of shard caches so callers working on
//! different keys rarely wait on the same lock.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::cache::{Cache, CacheStats};
use crate::config::CacheConfig;
use crate::disk::{Disk, FileDisk, Value};
use crate::error::Result;

// == Fanout Cache ==
/// A cache made of `config.shards` shards under `<directory>/NNN`.
#[derive(Debug)]
pub struct FanoutCache<D = FileDisk> {
    config: CacheConfig,
    shards: Vec<Cache<D>>,
}

impl<D: Disk> FanoutCache<D> {
    // == Constructor ==
    /// Opens every shard, creating directories as needed.
    ///
    /// Each shard gets `size_limit / shards` bytes. A shard count of zero is
    /// treated as one.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let count = config.shards.max(1);
        let shard_limit = config.size_limit / count as u64;

        let shards = (0..count)
            .map(|index| {
                Cache::open(&CacheConfig {
                    directory: config.directory.join(format!("{:03}", index)),
                    shards: 1,
                    size_limit: shard_limit,
                    ..config.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            directory = %config.directory.display(),
            shards = count,
            size_limit = config.size_limit,
            "Opened fanout cache"
        );

        Ok(Self { config, shards })
    }

    // == Introspection ==
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn size_limit(&self) -> u64 {
        self.config.size_limit
    }

    /// Shard responsible for `key`.
    ///
    /// Uses SHA-256 so the mapping is the same in every process.
    pub fn shard(&self, key: &str) -> &Cache<D> {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let index = u64::from_be_bytes(prefix) % self.shards.len() as u64;
        &self.shards[index as usize]
    }

    pub fn shards(&self) -> &[Cache<D>] {
        &self.shards
    }

    // == Key Operations ==
    pub fn set(&self, key: &str, value: impl Into<Value>, expire: Option<Duration>) -> Result<()> {
        self.shard(key).set(key, value, expire)
    }

    pub fn set_reader<R: Read>(
        &self,
        key: &str,
        reader: &mut R,
        expire: Option<Duration>,
    ) -> Result<()> {
        self.shard(key).set_reader(key, reader, expire)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.shard(key).get(key)
    }

    pub fn read(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        self.shard(key).read(key)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.shard(key).delete(key)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.shard(key).contains(key)
    }

    // == Aggregates ==
    pub fn len(&self) -> Result<usize> {
        self.sum(|shard| shard.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn volume(&self) -> Result<u64> {
        self.sum(|shard| shard.volume())
    }

    pub fn expire(&self) -> Result<usize> {
        self.sum(|shard| shard.expire())
    }

    pub fn cull(&self) -> Result<usize> {
        self.sum(|shard| shard.cull())
    }

    pub fn clear(&self) -> Result<usize> {
        self.sum(|shard| shard.clear())
    }

    /// Deletes unreferenced payload files older than `min_age` in every shard.
    pub fn remove_orphans(&self, min_age: Duration) -> Result<usize> {
        self.sum(|shard| shard.remove_orphans(min_age))
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut total = CacheStats::new();
        for shard in &self.shards {
            total.merge(&shard.stats()?);
        }
        Ok(total)
    }

    pub fn reset_stats(&self) -> Result<()> {
        self.shards.iter().try_for_each(|shard| shard.reset_stats())
    }

    fn sum<T, F>(&self, f: F) -> Result<T>
    where
        T: std::iter::Sum<T>,
        F: Fn(&Cache<D>) -> Result<T>,
    {
        self.shards.iter().map(f).sum()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{GzipDisk, Source};
    use tempfile::TempDir;

    fn open(dir: &TempDir, shards: usize) -> FanoutCache {
        FanoutCache::open(CacheConfig {
            shards,
            ..CacheConfig::new(dir.path())
        })
        .unwrap()
    }

    #[test]
    fn test_open_creates_shard_directories() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 4);

        assert_eq!(cache.shard_count(), 4);
        for name in ["000", "001", "002", "003"] {
            assert!(dir.path().join(name).is_dir(), "missing shard {}", name);
        }
        assert_eq!(cache.shards()[0].size_limit(), 300_000_000_000 / 4);
    }

    #[test]
    fn test_zero_shards_means_one() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 0);
        assert_eq!(cache.shard_count(), 1);
    }

    #[test]
    fn test_shard_selection_is_stable() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 8);

        let first = cache.shard("some-key").directory().to_path_buf();
        let again = cache.shard("some-key").directory().to_path_buf();
        assert_eq!(first, again);

        let reopened = open(&dir, 8);
        assert_eq!(reopened.shard("some-key").directory(), first);
    }

    #[test]
    fn test_keys_spread_over_shards() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 4);

        for i in 0..64 {
            cache.set(&format!("key{}", i), i as i64, None).unwrap();
        }
        assert_eq!(cache.len().unwrap(), 64);
        let used = cache
            .shards()
            .iter()
            .filter(|shard| !shard.is_empty().unwrap())
            .count();
        assert!(used > 1);
    }

    #[test]
    fn test_key_operations() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 4);

        cache.set("a", "alpha", None).unwrap();
        cache.set("b", vec![1u8, 2, 3], None).unwrap();

        assert_eq!(cache.get("a").unwrap(), Some(Value::Text("alpha".into())));
        assert!(cache.contains("b").unwrap());
        cache.delete("b").unwrap();
        assert!(!cache.contains("b").unwrap());
        assert!(cache.delete("b").is_err());
    }

    #[test]
    fn test_aggregate_stats_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 4);

        for i in 0..10 {
            cache.set(&format!("key{}", i), "v", None).unwrap();
        }
        for i in 0..12 {
            cache.get(&format!("key{}", i)).unwrap();
        }

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 10);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.total_entries, 10);

        assert_eq!(cache.clear().unwrap(), 10);
        assert!(cache.is_empty().unwrap());

        cache.reset_stats().unwrap();
        assert_eq!(cache.stats().unwrap().hits, 0);
    }

    #[test]
    fn test_expire_across_shards() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 4);

        for i in 0..6 {
            cache
                .set(&format!("key{}", i), i as i64, Some(Duration::from_millis(300)))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(cache.expire().unwrap(), 6);
    }

    #[test]
    fn test_size_limit_is_split_across_shards() {
        let dir = TempDir::new().unwrap();
        let cache: FanoutCache = FanoutCache::open(CacheConfig {
            shards: 2,
            size_limit: 100,
            ..CacheConfig::new(dir.path())
        })
        .unwrap();

        for i in 0..40 {
            cache.set(&format!("key{}", i), vec![0u8; 10], None).unwrap();
        }
        for shard in cache.shards() {
            assert!(shard.volume().unwrap() <= 50);
        }
        assert!(cache.stats().unwrap().evictions > 0);
    }

    #[test]
    fn test_remove_orphans_across_shards() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 4);
        cache.set("kept", vec![1u8; 64 * 1024], None).unwrap();
        for shard in cache.shards() {
            shard
                .disk()
                .store(Source::Value(Value::Bytes(vec![2u8; 64 * 1024])), "lost")
                .unwrap();
        }

        assert_eq!(cache.remove_orphans(Duration::ZERO).unwrap(), 4);
        assert_eq!(cache.get("kept").unwrap(), Some(Value::Bytes(vec![1u8; 64 * 1024])));
    }

    #[test]
    fn test_gzip_fanout_volume() {
        let dir = TempDir::new().unwrap();
        let cache: FanoutCache<GzipDisk> = FanoutCache::open(CacheConfig {
            shards: 2,
            ..CacheConfig::new(dir.path())
        })
        .unwrap();

        let data = vec![b'z'; 1_000_000];
        cache.set("big", data.clone(), None).unwrap();
        assert!(cache.volume().unwrap() < 100_000);
        assert_eq!(cache.get("big").unwrap(), Some(Value::Bytes(data)));
    }
}
