//! Cache Entry Module
//!
//! Index record for a stored value, with optional expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use crate::disk::{StoreMode, Stored};

/// Index columns read by [`CacheEntry::from_row`], in order.
pub(crate) const ENTRY_COLUMNS: &str =
    "mode, size, filename, inline, store_time, access_time, access_count, expire_time";

// == Cache Entry ==
/// Where a value lives and when it was stored, read and expires.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Encoding of the payload
    pub mode: StoreMode,
    /// Payload size in bytes as stored
    pub size: u64,
    /// Payload file relative to the shard directory
    pub filename: Option<String>,
    /// Payload kept in the index
    pub inline: Option<Vec<u8>>,
    pub store_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub access_count: u64,
    /// None = never expires
    pub expire_time: Option<DateTime<Utc>>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry for a freshly stored payload.
    ///
    /// An expiry too far in the future to represent means no expiry.
    pub fn new(stored: Stored, expire: Option<Duration>) -> Self {
        let now = Utc::now();
        let expire_time = expire
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));

        Self {
            mode: stored.mode,
            size: stored.size,
            filename: stored.filename,
            inline: stored.inline,
            store_time: now,
            access_time: now,
            access_count: 0,
            expire_time,
        }
    }

    // == Is Expired ==
    /// An entry is expired once the current time reaches its expire time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expire_time {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    // == Time To Live ==
    /// Remaining lifetime, `Some(ZERO)` once expired, `None` without expiry.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expire_time
            .map(|expires| (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    // == Index Rows ==
    /// Reads an entry from a row selected with [`ENTRY_COLUMNS`] first.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let code: i64 = row.get(0)?;
        let mode =
            StoreMode::from_code(code).ok_or_else(|| invalid(0, Type::Integer, "store mode"))?;
        let size: i64 = row.get(1)?;
        let access_count: i64 = row.get(6)?;

        Ok(Self {
            mode,
            size: size.max(0) as u64,
            filename: row.get(2)?,
            inline: row.get(3)?,
            store_time: from_micros(row, 4)?,
            access_time: from_micros(row, 5)?,
            access_count: access_count.max(0) as u64,
            expire_time: match row.get::<_, Option<i64>>(7)? {
                Some(_) => Some(from_micros(row, 7)?),
                None => None,
            },
        })
    }
}

/// Timestamps are kept as microseconds since the Unix epoch.
pub(crate) fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn from_micros(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(index)?;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| invalid(index, Type::Integer, "timestamp"))
}

fn invalid(index: usize, kind: Type, what: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        format!("invalid {} in cache index", what).into(),
    )
}
