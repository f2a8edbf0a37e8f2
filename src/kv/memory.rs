//! In-memory `KvStore`: a `BTreeMap` keeps range scans ordered for free.
//! Used for connection-scoped isolation overlays and for tests; `FileKv`
//! is the persistent counterpart.

use super::{Batch, BatchOp, KvStore, ScanDirection, ScanRange};
use crate::error::Result;
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    fn scan(&self, range: ScanRange) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let bounds = (range.start.clone(), range.end.clone());
        let iter = self.map.range::<Vec<u8>, (Bound<Vec<u8>>, Bound<Vec<u8>>)>(bounds)
            .map(|(k, v)| (k.clone(), v.clone()));
        let items: Vec<_> = match range.direction {
            ScanDirection::Forward => iter.collect(),
            ScanDirection::Reverse => {
                let mut items: Vec<_> = iter.collect();
                items.reverse();
                items
            }
        };
        let items = match range.limit {
            Some(limit) => items.into_iter().take(limit).collect::<Vec<_>>(),
            None => items,
        };
        Ok(Box::new(items.into_iter()))
    }

    fn commit_batch(&mut self, batch: Batch) -> Result<()> {
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    self.map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    self.map.remove(&k);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_scan_is_ordered() {
        let mut kv = MemoryKv::new();
        kv.put(b"b", b"2").unwrap();
        kv.put(b"a", b"1").unwrap();
        kv.put(b"c", b"3").unwrap();
        let items: Vec<_> = kv.scan(ScanRange::full()).unwrap().collect();
        assert_eq!(items, vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]);
    }

    #[test]
    fn prefix_scan_excludes_siblings() {
        let mut kv = MemoryKv::new();
        kv.put(b"row/1", b"x").unwrap();
        kv.put(b"row/2", b"y").unwrap();
        kv.put(b"rowz", b"z").unwrap();
        let items: Vec<_> = kv.scan(ScanRange::prefix(b"row/".to_vec())).unwrap().collect();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn batch_commit_is_all_or_nothing_in_ordering() {
        let mut kv = MemoryKv::new();
        let mut batch = Batch::new();
        batch.put(b"x".to_vec(), b"1".to_vec());
        batch.put(b"y".to_vec(), b"2".to_vec());
        kv.commit_batch(batch).unwrap();
        assert_eq!(kv.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"y").unwrap(), Some(b"2".to_vec()));
    }
}
