//! Log-structured persistent `KvStore`, grounded on the teacher's
//! `storage_engine.rs`/`log.rs` append-only format: every write is a
//! length-prefixed entry appended to one file, an in-memory index maps keys
//! to their latest offset, and the file is replayed front-to-back on open
//! to rebuild that index. Deletes append a tombstone rather than truncating.
//!
//! Unlike the teacher's engine this backend carries no WAL-vs-data split,
//! no compaction, and no value cache: the spec's storage substrate asks
//! only for durable ordered get/put/delete/scan, not for tegdb's
//! preallocation or crash-recovery tuning knobs.

use super::{Batch, BatchOp, KvStore, ScanDirection, ScanRange};
use crate::error::{Error, Result, StorageError};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 6] = b"QKVLG\0";
const TOMBSTONE: u32 = u32::MAX;

pub struct FileKv {
    path: PathBuf,
    file: File,
    index: BTreeMap<Vec<u8>, u64>,
    next_offset: u64,
}

impl FileKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let is_new = !path.exists();
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::Storage(StorageError::FileLocked(path.display().to_string()))
        })?;

        if is_new {
            file.write_all(MAGIC)?;
            file.flush()?;
        } else {
            let mut magic = [0u8; 6];
            let mut header_reader = File::open(&path)?;
            header_reader.read_exact(&mut magic)?;
            if &magic != MAGIC {
                return Err(Error::corrupted(format!(
                    "{}: bad magic header",
                    path.display()
                )));
            }
        }

        let mut store = Self { path, file, index: BTreeMap::new(), next_offset: 6 };
        store.rebuild_index()?;
        Ok(store)
    }

    /// Replays every entry from offset 6 (past the magic header) to EOF,
    /// keeping only the latest offset per key; a trailing truncated entry
    /// (a crash mid-append) is dropped rather than treated as corruption.
    fn rebuild_index(&mut self) -> Result<()> {
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(6))?;
        let mut offset = 6u64;
        loop {
            let entry_start = offset;
            let Some((key, value_len)) = read_entry_header(&mut reader)? else { break };
            let value_offset = reader.stream_position()?;
            if value_len == TOMBSTONE {
                self.index.remove(&key);
            } else {
                if reader.seek(SeekFrom::Current(value_len as i64)).is_err() {
                    break;
                }
                self.index.insert(key, entry_start);
            }
            offset = value_offset + if value_len == TOMBSTONE { 0 } else { value_len as u64 };
        }
        self.next_offset = offset;
        Ok(())
    }

    fn read_value_at(&self, offset: u64) -> Result<Vec<u8>> {
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(offset))?;
        let (_, value_len) = read_entry_header(&mut reader)?
            .ok_or_else(|| Error::corrupted("index points past end of log"))?;
        let mut value = vec![0u8; value_len as usize];
        reader.read_exact(&mut value)?;
        Ok(value)
    }

    fn append_put(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        let offset = self.next_offset;
        write_entry(&mut self.file, key, Some(value))?;
        self.next_offset = offset + entry_len(key, Some(value));
        Ok(offset)
    }

    fn append_delete(&mut self, key: &[u8]) -> Result<()> {
        write_entry(&mut self.file, key, None)?;
        self.next_offset += entry_len(key, None);
        Ok(())
    }
}

fn entry_len(key: &[u8], value: Option<&[u8]>) -> u64 {
    (4 + key.len() + 4 + value.map_or(0, |v| v.len())) as u64
}

fn write_entry(file: &mut File, key: &[u8], value: Option<&[u8]>) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + key.len() + value.map_or(0, |v| v.len()));
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    match value {
        Some(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
            buf.extend_from_slice(v);
        }
        None => buf.extend_from_slice(&TOMBSTONE.to_be_bytes()),
    }
    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}

/// Reads one entry's key and declared value length; returns `Ok(None)` on a
/// clean EOF and propagates a short read anywhere else as corruption.
fn read_entry_header(reader: &mut File) -> Result<Option<(Vec<u8>, u32)>> {
    let mut len_buf = [0u8; 4];
    match reader.read(&mut len_buf)? {
        0 => return Ok(None),
        4 => {}
        n => {
            reader.seek(SeekFrom::Current(-(n as i64)))?;
            return Ok(None);
        }
    }
    let key_len = u32::from_be_bytes(len_buf) as usize;
    let mut key = vec![0u8; key_len];
    if reader.read_exact(&mut key).is_err() {
        return Ok(None);
    }
    let mut value_len_buf = [0u8; 4];
    if reader.read_exact(&mut value_len_buf).is_err() {
        return Ok(None);
    }
    Ok(Some((key, u32::from_be_bytes(value_len_buf))))
}

impl KvStore for FileKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.index.get(key) {
            Some(&offset) => Ok(Some(self.read_value_at(offset)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let offset = self.append_put(key, value)?;
        self.index.insert(key.to_vec(), offset);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if self.index.remove(key).is_some() {
            self.append_delete(key)?;
        }
        Ok(())
    }

    fn scan(&self, range: ScanRange) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let bounds = (range.start.clone(), range.end.clone());
        let mut items = Vec::new();
        for (key, &offset) in self.index.range::<Vec<u8>, _>(bounds) {
            items.push((key.clone(), self.read_value_at(offset)?));
        }
        if range.direction == ScanDirection::Reverse {
            items.reverse();
        }
        if let Some(limit) = range.limit {
            items.truncate(limit);
        }
        Ok(Box::new(items.into_iter()))
    }

    fn commit_batch(&mut self, batch: Batch) -> Result<()> {
        // Every op is appended to the same log before the in-memory index
        // is updated, so a crash mid-batch leaves the index rebuildable
        // from a prefix of the log rather than in a half-applied state.
        let mut applied = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    let offset = self.append_put(k, v)?;
                    applied.push((k.clone(), Some(offset)));
                }
                BatchOp::Delete(k) => {
                    self.append_delete(k)?;
                    applied.push((k.clone(), None));
                }
            }
        }
        for (key, offset) in applied {
            match offset {
                Some(offset) => {
                    self.index.insert(key, offset);
                }
                None => {
                    self.index.remove(&key);
                }
            }
        }
        Ok(())
    }
}

impl Drop for FileKv {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.qkv");
        {
            let mut kv = FileKv::open(&path).unwrap();
            kv.put(b"k", b"v1").unwrap();
        }
        let kv = FileKv::open(&path).unwrap();
        assert_eq!(kv.get(b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn delete_tombstone_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.qkv");
        {
            let mut kv = FileKv::open(&path).unwrap();
            kv.put(b"k", b"v1").unwrap();
            kv.delete(b"k").unwrap();
        }
        let kv = FileKv::open(&path).unwrap();
        assert_eq!(kv.get(b"k").unwrap(), None);
    }

    #[test]
    fn later_put_shadows_earlier_one_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.qkv");
        {
            let mut kv = FileKv::open(&path).unwrap();
            kv.put(b"k", b"v1").unwrap();
            kv.put(b"k", b"v2").unwrap();
        }
        let kv = FileKv::open(&path).unwrap();
        assert_eq!(kv.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn second_open_while_locked_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.qkv");
        let _first = FileKv::open(&path).unwrap();
        let second = FileKv::open(&path);
        assert!(matches!(second, Err(Error::Storage(StorageError::FileLocked(_)))));
    }
}
