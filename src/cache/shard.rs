//! Cache Shard Module
//!
//! A single-directory disk cache: payloads written through a [`Disk`], an
//! SQLite index next to them, expiry and size-limit eviction. Any number of
//! handles, in this process or others, may open the same directory.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Params, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::cache::entry::{to_micros, ENTRY_COLUMNS};
use crate::cache::{CacheEntry, CacheStats};
use crate::config::{CacheConfig, EvictionPolicy};
use crate::disk::{Disk, Fetched, FileDisk, Source, Value};
use crate::error::{CacheError, Result};

/// Index database inside a shard directory
pub const DATABASE_FILE: &str = "cache.db";

/// Unreferenced payload files modified more recently than this are kept
/// when a shard opens. Writers create the file before they commit its entry.
pub const ORPHAN_MIN_AGE: Duration = Duration::from_secs(60 * 60);

// Entry count and volume are kept by triggers so neither needs a table scan.
// Replacing a key is a DELETE followed by an INSERT so both triggers fire.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
    INSERT OR IGNORE INTO settings (key, value) VALUES ('count', 0), ('volume', 0);

    CREATE TABLE IF NOT EXISTS entries (
        id INTEGER PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        mode INTEGER NOT NULL,
        size INTEGER NOT NULL,
        filename TEXT,
        inline BLOB,
        store_time INTEGER NOT NULL,
        access_time INTEGER NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0,
        expire_time INTEGER
    );
    CREATE INDEX IF NOT EXISTS entries_store_time ON entries (store_time);
    CREATE INDEX IF NOT EXISTS entries_access_time ON entries (access_time);
    CREATE INDEX IF NOT EXISTS entries_expire_time ON entries (expire_time);

    CREATE TRIGGER IF NOT EXISTS entries_insert AFTER INSERT ON entries BEGIN
        UPDATE settings SET value = value + 1 WHERE key = 'count';
        UPDATE settings SET value = value + NEW.size WHERE key = 'volume';
    END;
    CREATE TRIGGER IF NOT EXISTS entries_delete AFTER DELETE ON entries BEGIN
        UPDATE settings SET value = value - 1 WHERE key = 'count';
        UPDATE settings SET value = value - OLD.size WHERE key = 'volume';
    END;
";

// == Removed Entries ==
/// Entries deleted inside a transaction. Their files go once it commits.
#[derive(Debug, Default)]
struct Removed {
    count: usize,
    files: Vec<String>,
}

impl Removed {
    fn push(&mut self, filename: Option<String>) {
        self.count += 1;
        self.files.extend(filename);
    }
}

// == Cache ==
/// One cache directory and its index database.
///
/// Calls through one handle are serialized by a lock acquired within the
/// configured timeout. Writers from other handles wait on SQLite's own
/// lock for the same timeout.
#[derive(Debug)]
pub struct Cache<D = FileDisk> {
    directory: PathBuf,
    disk: D,
    timeout: Duration,
    size_limit: u64,
    cull_limit: usize,
    policy: EvictionPolicy,
    conn: Mutex<Connection>,
    /// Counters for this handle only
    stats: Mutex<CacheStats>,
}

impl<D: Disk> Cache<D> {
    // == Constructor ==
    /// Opens (creating if needed) a cache in `config.directory`.
    ///
    /// `config.size_limit` applies to this directory as a whole; the shard
    /// count is ignored. Payload files left behind by interrupted writes and
    /// older than [`ORPHAN_MIN_AGE`] are deleted.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let directory = config.directory.clone();
        fs::create_dir_all(&directory)?;

        let conn = open_index(&directory.join(DATABASE_FILE), config.timeout)
            .map_err(|e| e.or_timeout(config.timeout))?;

        let cache = Self {
            disk: D::open(&directory, &config.disk),
            directory,
            timeout: config.timeout,
            size_limit: config.size_limit,
            cull_limit: config.cull_limit,
            policy: config.eviction_policy,
            conn: Mutex::new(conn),
            stats: Mutex::new(CacheStats::new()),
        };
        let orphans = cache.remove_orphans(ORPHAN_MIN_AGE)?;

        debug!(
            directory = %cache.directory.display(),
            entries = cache.len()?,
            volume = cache.volume()?,
            orphans,
            "Opened cache shard"
        );
        Ok(cache)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    // == Set ==
    /// Stores a value, replacing any previous value for `key`.
    ///
    /// `expire` is the lifetime of the entry; `None` keeps it until evicted.
    pub fn set(&self, key: &str, value: impl Into<Value>, expire: Option<Duration>) -> Result<()> {
        self.store(key, Source::Value(value.into()), expire)
    }

    /// Stores the bytes read from `reader`.
    pub fn set_reader<R: Read>(
        &self,
        key: &str,
        reader: &mut R,
        expire: Option<Duration>,
    ) -> Result<()> {
        self.store(key, Source::Reader(reader), expire)
    }

    fn store(&self, key: &str, source: Source<'_>, expire: Option<Duration>) -> Result<()> {
        let stored = self.disk.store(source, key)?;
        let entry = CacheEntry::new(stored, expire);
        let now = to_micros(entry.store_time);

        let committed = self.write(|tx| {
            let mut replaced = Removed::default();
            let old: Option<Option<String>> = tx
                .query_row(
                    "SELECT filename FROM entries WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(filename) = old {
                tx.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
                replaced.push(filename);
            }
            insert_entry(tx, key, &entry)?;

            let expired = purge_expired(tx, now)?;
            let evicted = self.evict(tx, Some(self.cull_limit))?;
            Ok((replaced, expired, evicted))
        });

        let (replaced, expired, evicted) = match committed {
            Ok(removed) => removed,
            Err(e) => {
                self.discard(entry.filename.as_slice());
                return Err(e);
            }
        };

        self.discard(&replaced.files);
        self.discard(&expired.files);
        self.discard(&evicted.files);
        self.record_evictions(evicted.count);

        debug!(key, size = entry.size, "Stored entry");
        Ok(())
    }

    // == Get ==
    /// Returns the value for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.fetch(key, false)?.map(Fetched::into_value).transpose()
    }

    // == Read ==
    /// Returns a reader over a byte or text value.
    pub fn read(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let Some(fetched) = self.fetch(key, true)? else {
            return Ok(None);
        };
        let reader: Box<dyn Read + Send> = match fetched {
            Fetched::Reader(reader) => reader,
            Fetched::Value(Value::Bytes(bytes)) => Box::new(Cursor::new(bytes)),
            Fetched::Value(Value::Text(text)) => Box::new(Cursor::new(text.into_bytes())),
            Fetched::Value(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("value for {} is not a byte stream", key),
                )
                .into())
            }
        };
        Ok(Some(reader))
    }

    /// Looks `key` up and reads its payload.
    ///
    /// Expired entries are left for the next sweep. A hit is only counted
    /// once the payload has been read.
    fn fetch(&self, key: &str, read: bool) -> Result<Option<Fetched>> {
        let now = Utc::now();
        let sql = format!("SELECT {}, id FROM entries WHERE key = ?1", ENTRY_COLUMNS);
        let found = self.query(|conn| {
            conn.query_row(&sql, params![key], |row| {
                Ok((CacheEntry::from_row(row)?, row.get::<_, i64>(8)?))
            })
            .optional()
        })?;

        let (entry, id) = match found {
            Some((entry, id)) if !entry.is_expired_at(now) => (entry, id),
            _ => {
                self.stats.lock().record_miss();
                return Ok(None);
            }
        };

        if self.policy == EvictionPolicy::LeastRecentlyUsed {
            self.write(|tx| {
                tx.execute(
                    "UPDATE entries SET access_time = ?1, access_count = access_count + 1 \
                     WHERE id = ?2",
                    params![to_micros(now), id],
                )?;
                Ok(())
            })?;
        }

        let fetched = self.disk.fetch(
            entry.mode,
            entry.filename.as_deref(),
            entry.inline.as_deref(),
            read,
        );
        match fetched {
            Ok(fetched) => {
                self.stats.lock().record_hit();
                Ok(Some(fetched))
            }
            Err(e) if e.is_missing_file() => {
                warn!(key, "Payload file missing, dropping entry");
                self.stats.lock().record_miss();
                // The key may have been stored again since the lookup
                self.write(|tx| {
                    tx.execute(
                        "DELETE FROM entries WHERE id = ?1 AND filename IS ?2",
                        params![id, entry.filename],
                    )?;
                    Ok(())
                })?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // == Delete ==
    pub fn delete(&self, key: &str) -> Result<()> {
        let filename = self.write(|tx| {
            let filename: Option<String> = tx
                .query_row(
                    "SELECT filename FROM entries WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
            tx.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
            Ok(filename)
        })?;

        self.discard(filename.as_slice());
        Ok(())
    }

    // == Contains ==
    /// True if `key` holds an unexpired value. Does not count as a hit or miss.
    pub fn contains(&self, key: &str) -> Result<bool> {
        let now = to_micros(Utc::now());
        self.query(|conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM entries WHERE key = ?1 \
                 AND (expire_time IS NULL OR expire_time > ?2))",
                params![key, now],
                |row| row.get(0),
            )
        })
    }

    // == Expire ==
    /// Removes all expired entries, returning how many were removed.
    pub fn expire(&self) -> Result<usize> {
        let now = to_micros(Utc::now());
        let expired = self.write(|tx| purge_expired(tx, now))?;
        self.discard(&expired.files);
        Ok(expired.count)
    }

    // == Cull ==
    /// Removes expired entries, then evicts until under the size limit.
    pub fn cull(&self) -> Result<usize> {
        let now = to_micros(Utc::now());
        let (expired, evicted) =
            self.write(|tx| Ok((purge_expired(tx, now)?, self.evict(tx, None)?)))?;

        self.discard(&expired.files);
        self.discard(&evicted.files);
        self.record_evictions(evicted.count);
        Ok(expired.count + evicted.count)
    }

    // == Clear ==
    /// Removes every entry, returning how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let cleared = self.write(|tx| {
            let files = filenames(tx, "SELECT filename FROM entries WHERE filename IS NOT NULL", [])?;
            let count = tx.execute("DELETE FROM entries", [])?;
            Ok(Removed { count, files })
        })?;

        self.discard(&cleared.files);
        info!(directory = %self.directory.display(), count = cleared.count, "Cleared cache shard");
        Ok(cleared.count)
    }

    // == Orphans ==
    /// Deletes payload files no entry refers to, skipping files modified
    /// within `min_age`. Returns how many were deleted.
    pub fn remove_orphans(&self, min_age: Duration) -> Result<usize> {
        let referenced: HashSet<String> = self.query(|conn| {
            let mut stmt = conn.prepare("SELECT filename FROM entries WHERE filename IS NOT NULL")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })?;

        let now = SystemTime::now();
        let mut removed = 0;
        for filename in self.disk.files()? {
            if referenced.contains(&filename) {
                continue;
            }
            let modified = match fs::metadata(self.directory.join(&filename)) {
                Ok(metadata) => metadata.modified()?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if now.duration_since(modified).unwrap_or_default() < min_age {
                continue;
            }
            self.disk.remove(&filename)?;
            removed += 1;
        }

        if removed > 0 {
            info!(directory = %self.directory.display(), removed, "Removed orphaned payload files");
        }
        Ok(removed)
    }

    // == Size ==
    pub fn len(&self) -> Result<usize> {
        let count = self.query(|conn| setting(conn, "count"))?;
        Ok(count.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Total stored payload size in bytes.
    pub fn volume(&self) -> Result<u64> {
        let volume = self.query(|conn| setting(conn, "volume"))?;
        Ok(volume.max(0) as u64)
    }

    // == Stats ==
    /// Hits, misses and evictions seen by this handle, with the current
    /// entry count of the directory.
    pub fn stats(&self) -> Result<CacheStats> {
        let total = self.len()?;
        let mut stats = self.stats.lock().clone();
        stats.set_total_entries(total);
        Ok(stats)
    }

    /// Zeroes hit, miss and eviction counters.
    pub fn reset_stats(&self) -> Result<()> {
        *self.stats.lock() = CacheStats::new();
        Ok(())
    }

    // == Internals ==
    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.try_lock_for(self.timeout).ok_or_else(|| {
            warn!(directory = %self.directory.display(), "Timed out waiting for shard lock");
            CacheError::Timeout(self.timeout)
        })
    }

    /// Runs read-only statements outside a transaction.
    fn query<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn).map_err(|e| CacheError::from(e).or_timeout(self.timeout))
    }

    /// Runs `f` in an immediate transaction, committing if it succeeds.
    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        transact(&mut conn, f).map_err(|e| {
            if matches!(e, CacheError::Database(_)) {
                warn!(directory = %self.directory.display(), error = %e, "Shard write failed");
            }
            e.or_timeout(self.timeout)
        })
    }

    /// Evicts entries in policy order while over the size limit.
    fn evict(&self, conn: &Connection, limit: Option<usize>) -> Result<Removed> {
        let mut evicted = Removed::default();
        let oldest = match self.policy {
            EvictionPolicy::None => return Ok(evicted),
            EvictionPolicy::LeastRecentlyStored => {
                "SELECT id, filename FROM entries ORDER BY store_time, id LIMIT 1"
            }
            EvictionPolicy::LeastRecentlyUsed => {
                "SELECT id, filename FROM entries ORDER BY access_time, id LIMIT 1"
            }
        };

        while limit.map_or(true, |max| evicted.count < max) {
            let volume = setting(conn, "volume")?.max(0) as u64;
            if volume <= self.size_limit {
                break;
            }
            let Some((id, filename)) = conn
                .query_row(oldest, [], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
                })
                .optional()?
            else {
                break;
            };
            conn.execute("DELETE FROM entries WHERE id = ?1", params![id])?;
            evicted.push(filename);
        }

        if evicted.count > 0 {
            info!(
                directory = %self.directory.display(),
                evicted = evicted.count,
                "Evicted entries over size limit"
            );
        }
        Ok(evicted)
    }

    fn record_evictions(&self, count: usize) {
        let mut stats = self.stats.lock();
        for _ in 0..count {
            stats.record_eviction();
        }
    }

    /// Deletes payload files of removed entries, logging failures.
    fn discard(&self, files: &[String]) {
        for filename in files {
            if let Err(e) = self.disk.remove(filename) {
                warn!(file = %filename, error = %e, "Failed to remove payload file");
            }
        }
    }
}

fn open_index(path: &Path, timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(timeout)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA)?;
    debug!(path = %path.display(), journal_mode = %mode, "Opened shard index");
    Ok(conn)
}

fn transact<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn setting(conn: &Connection, key: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
}

fn filenames(conn: &Connection, sql: &str, params: impl Params) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get(0))?;
    rows.collect()
}

fn insert_entry(conn: &Connection, key: &str, entry: &CacheEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO entries (key, mode, size, filename, inline, store_time, access_time, \
         access_count, expire_time) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            key,
            entry.mode.code(),
            entry.size as i64,
            entry.filename,
            entry.inline,
            to_micros(entry.store_time),
            to_micros(entry.access_time),
            entry.access_count as i64,
            entry.expire_time.map(to_micros),
        ],
    )?;
    Ok(())
}

fn purge_expired(conn: &Connection, now: i64) -> Result<Removed> {
    let files = filenames(
        conn,
        "SELECT filename FROM entries WHERE expire_time <= ?1 AND filename IS NOT NULL",
        params![now],
    )?;
    let count = conn.execute("DELETE FROM entries WHERE expire_time <= ?1", params![now])?;
    if count > 0 {
        debug!(count, "Removed expired entries");
    }
    Ok(Removed { count, files })
}
