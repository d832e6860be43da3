//! File Disk
//!
//! Default disk: small payloads stay inline, larger ones get their own file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::config::DiskOptions;
use crate::disk::{Disk, Fetched, Source, StoreMode, Stored, Value};
use crate::error::Result;

// == File Disk ==
/// Stores payloads under a shard directory as `ab/cd/<rest>.val` files.
#[derive(Debug, Clone)]
pub struct FileDisk {
    directory: PathBuf,
    min_file_size: u64,
}

impl FileDisk {
    /// Directory payload files are written under.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn inline(size: usize, mode: StoreMode, bytes: Vec<u8>) -> Stored {
        Stored {
            size: size as u64,
            mode,
            filename: None,
            inline: Some(bytes),
        }
    }

    /// Picks a fresh random file name and creates its parent directories.
    fn new_file(&self) -> Result<(String, File)> {
        let hex = Uuid::new_v4().simple().to_string();
        let filename = format!("{}/{}/{}.val", &hex[..2], &hex[2..4], &hex[4..]);
        let path = self.directory.join(&filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok((filename, file))
    }

    fn write_file(&self, mode: StoreMode, data: &[u8]) -> Result<Stored> {
        let (filename, mut file) = self.new_file()?;
        file.write_all(data)?;
        debug!(file = %filename, size = data.len(), "Wrote payload file");
        Ok(Stored {
            size: data.len() as u64,
            mode,
            filename: Some(filename),
            inline: None,
        })
    }

    fn read_file(&self, filename: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.directory.join(filename))?)
    }

    fn payload(&self, filename: Option<&str>, inline: Option<&[u8]>) -> Result<Vec<u8>> {
        match (filename, inline) {
            (Some(filename), _) => self.read_file(filename),
            (None, Some(bytes)) => Ok(bytes.to_vec()),
            (None, None) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "entry has neither a file nor an inline payload",
            )
            .into()),
        }
    }
}

impl Disk for FileDisk {
    fn open(directory: &Path, options: &DiskOptions) -> Self {
        Self {
            directory: directory.to_path_buf(),
            min_file_size: options.min_file_size,
        }
    }

    fn store(&self, source: Source<'_>, _key: &str) -> Result<Stored> {
        let min = self.min_file_size as usize;

        match source {
            Source::Reader(reader) => {
                let (filename, mut file) = self.new_file()?;
                let size = io::copy(reader, &mut file)?;
                debug!(file = %filename, size, "Streamed payload file");
                Ok(Stored {
                    size,
                    mode: StoreMode::Binary,
                    filename: Some(filename),
                    inline: None,
                })
            }
            Source::Value(Value::Bytes(bytes)) => {
                if bytes.len() < min {
                    Ok(Self::inline(bytes.len(), StoreMode::Binary, bytes))
                } else {
                    self.write_file(StoreMode::Binary, &bytes)
                }
            }
            Source::Value(Value::Text(text)) if text.len() >= min => {
                self.write_file(StoreMode::Text, text.as_bytes())
            }
            Source::Value(Value::Structured(value)) => {
                let encoded = serde_json::to_vec(&value)?;
                if encoded.len() < min {
                    Ok(Self::inline(encoded.len(), StoreMode::Structured, encoded))
                } else {
                    self.write_file(StoreMode::Structured, &encoded)
                }
            }
            // Integers, floats and short text
            Source::Value(value) => {
                let encoded = serde_json::to_vec(&value)?;
                Ok(Self::inline(encoded.len(), StoreMode::Raw, encoded))
            }
        }
    }

    fn fetch(
        &self,
        mode: StoreMode,
        filename: Option<&str>,
        inline: Option<&[u8]>,
        read: bool,
    ) -> Result<Fetched> {
        if read {
            if let Some(filename) = filename {
                let file = File::open(self.directory.join(filename))?;
                return Ok(Fetched::Reader(Box::new(file)));
            }
        }

        let payload = self.payload(filename, inline)?;
        let value = match mode {
            StoreMode::Raw => serde_json::from_slice(&payload)?,
            StoreMode::Binary => Value::Bytes(payload),
            StoreMode::Text => Value::Text(
                String::from_utf8(payload)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            ),
            StoreMode::Structured => Value::Structured(serde_json::from_slice(&payload)?),
        };

        match (read, value) {
            (true, Value::Bytes(bytes)) => Ok(Fetched::Reader(Box::new(Cursor::new(bytes)))),
            (_, value) => Ok(Fetched::Value(value)),
        }
    }

    fn remove(&self, filename: &str) -> Result<()> {
        match fs::remove_file(self.directory.join(filename)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![(self.directory.clone(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let relative = format!("{}{}", prefix, name);
                if entry.file_type()?.is_dir() {
                    pending.push((entry.path(), format!("{}/", relative)));
                } else if name.ends_with(".val") {
                    files.push(relative);
                }
            }
        }
        Ok(files)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn disk(min_file_size: u64) -> (TempDir, FileDisk) {
        let dir = TempDir::new().unwrap();
        let disk = FileDisk::open(dir.path(), &DiskOptions { min_file_size });
        (dir, disk)
    }

    fn fetch_value(disk: &FileDisk, stored: &Stored) -> Value {
        disk.fetch(
            stored.mode,
            stored.filename.as_deref(),
            stored.inline.as_deref(),
            false,
        )
        .unwrap()
        .into_value()
        .unwrap()
    }

    #[test]
    fn test_small_bytes_stay_inline_in_binary_mode() {
        let (_dir, disk) = disk(16);
        let stored = disk.store(Source::Value(Value::Bytes(b"tiny".to_vec())), "k").unwrap();

        assert_eq!(stored.mode, StoreMode::Binary);
        assert!(stored.filename.is_none());
        assert_eq!(stored.inline.as_deref(), Some(&b"tiny"[..]));
        assert_eq!(fetch_value(&disk, &stored), Value::Bytes(b"tiny".to_vec()));
    }

    #[test]
    fn test_large_bytes_go_to_file() {
        let (dir, disk) = disk(16);
        let data = vec![7u8; 64];
        let stored = disk.store(Source::Value(Value::Bytes(data.clone())), "k").unwrap();

        assert_eq!(stored.mode, StoreMode::Binary);
        assert_eq!(stored.size, 64);
        let filename = stored.filename.clone().unwrap();
        assert!(filename.ends_with(".val"));
        assert!(dir.path().join(&filename).exists());
        assert_eq!(fetch_value(&disk, &stored), Value::Bytes(data));
    }

    #[test]
    fn test_scalars_and_short_text_are_raw() {
        let (_dir, disk) = disk(16);

        for value in [Value::Integer(-3), Value::Float(2.5), Value::Text("short".into())] {
            let stored = disk.store(Source::Value(value.clone()), "k").unwrap();
            assert_eq!(stored.mode, StoreMode::Raw);
            assert_eq!(fetch_value(&disk, &stored), value);
        }
    }

    #[test]
    fn test_long_text_goes_to_text_file() {
        let (_dir, disk) = disk(16);
        let text = "x".repeat(100);
        let stored = disk.store(Source::Value(Value::Text(text.clone())), "k").unwrap();

        assert_eq!(stored.mode, StoreMode::Text);
        assert!(stored.filename.is_some());
        assert_eq!(fetch_value(&disk, &stored), Value::Text(text));
    }

    #[test]
    fn test_structured_round_trip() {
        let (_dir, disk) = disk(16);
        let small = serde_json::json!(1);
        let large = serde_json::json!({"items": vec!["entry"; 20]});

        let stored = disk.store(Source::Value(Value::Structured(small.clone())), "k").unwrap();
        assert_eq!(stored.mode, StoreMode::Structured);
        assert!(stored.inline.is_some());
        assert_eq!(fetch_value(&disk, &stored), Value::Structured(small));

        let stored = disk.store(Source::Value(Value::Structured(large.clone())), "k").unwrap();
        assert!(stored.filename.is_some());
        assert_eq!(fetch_value(&disk, &stored), Value::Structured(large));
    }

    #[test]
    fn test_reader_is_streamed_to_file() {
        let (_dir, disk) = disk(1024);
        let mut reader = Cursor::new(b"streamed".to_vec());
        let stored = disk.store(Source::Reader(&mut reader), "k").unwrap();

        assert_eq!(stored.mode, StoreMode::Binary);
        assert_eq!(stored.size, 8);
        assert!(stored.filename.is_some());

        let fetched = disk
            .fetch(stored.mode, stored.filename.as_deref(), None, true)
            .unwrap();
        let mut buf = Vec::new();
        match fetched {
            Fetched::Reader(mut r) => r.read_to_end(&mut buf).unwrap(),
            Fetched::Value(_) => panic!("expected a reader"),
        };
        assert_eq!(buf, b"streamed");
    }

    #[test]
    fn test_remove_file_and_missing_file() {
        let (dir, disk) = disk(1);
        let stored = disk.store(Source::Value(Value::Bytes(vec![1, 2, 3])), "k").unwrap();
        let filename = stored.filename.unwrap();

        disk.remove(&filename).unwrap();
        assert!(!dir.path().join(&filename).exists());
        disk.remove(&filename).unwrap();

        let err = disk
            .fetch(StoreMode::Binary, Some(&filename), None, false)
            .unwrap_err();
        assert!(err.is_missing_file());
    }

    #[test]
    fn test_files_lists_payload_files_only() {
        let (dir, disk) = disk(1);
        let a = disk.store(Source::Value(Value::Bytes(vec![1; 8])), "a").unwrap();
        let b = disk.store(Source::Value(Value::Bytes(vec![2; 8])), "b").unwrap();
        fs::write(dir.path().join("cache.db"), b"not a payload").unwrap();

        let mut files = disk.files().unwrap();
        files.sort();
        let mut expected = vec![a.filename.unwrap(), b.filename.unwrap()];
        expected.sort();
        assert_eq!(files, expected);
    }

    #[test]
    fn test_fetch_without_payload_fails() {
        let (_dir, disk) = disk(16);
        assert!(disk.fetch(StoreMode::Binary, None, None, false).is_err());
    }
}
