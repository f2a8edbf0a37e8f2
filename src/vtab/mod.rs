//! The virtual-table execution contract: every storage module (the
//! built-in `mem` module, or a future custom one) implements `VirtualTable`,
//! shared (`SharedTable`) across every connection open on the same
//! database. A connection's own view onto a table — the actual
//! begin/commit/rollback/savepoint lifecycle — is `overlay::IsolatedTable`,
//! not a trait in this module: each connection wraps the `SharedTable` it
//! touches in its own `IsolatedTable`, and the transaction coordinator
//! drives that lifecycle directly (`IsolatedTable::flush`/`rollback`/
//! `rollback_to`) rather than through a connection-handle trait, since
//! there was never a second implementation for one to abstract over.
//!
//! Generalizes the teacher's single hard-coded row-oriented
//! `StorageEngine`/`Transaction` pair into a pluggable interface, the way
//! `query_processor.rs`'s `QueryProcessor` sits one layer above a storage
//! backend it does not otherwise assume concrete details about.

mod mem_table;

pub use mem_table::{MemTable, MemTableModule};

use crate::error::Result;
use crate::row::Row;
use crate::schema::TableSchema;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// A comparison operator a filter constraint applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
}

/// One pushed-down predicate: `column <op> value`. A module is free to
/// ignore any constraint it cannot use for access-path selection; the
/// engine always re-checks predicates above the scan.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub column: usize,
    pub op: ConstraintOp,
    pub value: Value,
}

/// Describes the access path chosen for a scan: which index (or none, for
/// a full scan / primary key), which pushed-down constraints apply, and
/// requested row order.
#[derive(Debug, Clone, Default)]
pub struct FilterDescriptor {
    pub index_name: Option<String>,
    pub constraints: Vec<Constraint>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl FilterDescriptor {
    pub fn full_scan() -> Self {
        Self::default()
    }
}

/// Evaluates a pushed-down constraint list against one materialized row,
/// shared by every module's `scan` (and by the isolation overlay, which
/// re-applies the same constraints to its own merged stream).
pub fn constraints_match(columns: &[crate::schema::ColumnDef], row: &Row, constraints: &[Constraint]) -> bool {
    constraints.iter().all(|c| {
        let collation = columns[c.column].collation;
        let Some(ordering) = row[c.column].compare(&c.value, collation) else { return false };
        match c.op {
            ConstraintOp::Eq => ordering.is_eq(),
            ConstraintOp::Ne => !ordering.is_eq(),
            ConstraintOp::Lt => ordering.is_lt(),
            ConstraintOp::Le => ordering.is_le(),
            ConstraintOp::Gt => ordering.is_gt(),
            ConstraintOp::Ge => ordering.is_ge(),
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    Abort,
    Replace,
    Ignore,
}

/// One row-level mutation a `Connection` applies via `update`.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    Insert { row: Row, on_conflict: OnConflict },
    /// `old_pk` identifies the row being changed; `new_row` is the full
    /// replacement (DML flat-row OLD/NEW halves are assembled one layer up,
    /// in `src/dml.rs`, from this plus the pre-image read).
    Update { old_pk: Row, new_row: Row },
    Delete { pk: Row },
}

/// What a module supports beyond the baseline (full scan, insert/update/
/// delete by primary key). Replaces `Option<fn>` capability fields with an
/// explicit struct any module constructs from its real feature set.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub creates_index: bool,
    pub has_index_comparator: bool,
    pub supports_savepoints: bool,
}

/// A storage module: a factory for tables of one storage kind (`mem`, or a
/// custom module registered with the schema manager). One instance is
/// shared across every connection that opens one of its tables.
pub trait VtabModule {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;

    /// Creates the on-disk/in-memory representation for a freshly-declared
    /// table and returns a handle to it. Called once by `CREATE TABLE`.
    fn create(&self, schema: Rc<TableSchema>) -> Result<Box<dyn VirtualTable>>;

    /// Reopens an existing table's representation (used when a schema is
    /// loaded from a persisted catalog rather than freshly created).
    fn connect(&self, schema: Rc<TableSchema>) -> Result<Box<dyn VirtualTable>>;
}

/// One open table, shared by every connection of one database instance.
/// `VirtualTable` itself is not transaction-scoped — transactional
/// isolation is the overlay's job (`src/overlay/mod.rs`), which wraps a
/// `VirtualTable` and intercepts `scan`/`update` per connection.
pub trait VirtualTable {
    fn schema(&self) -> &Rc<TableSchema>;

    /// Row iteration honoring `filter` on a best-effort basis: any
    /// constraint the implementation cannot apply is simply not filtered
    /// out, relying on the caller to re-check it.
    fn scan(&self, filter: &FilterDescriptor) -> Result<Box<dyn Iterator<Item = Result<Row>> + '_>>;

    /// Point lookup by primary key, when available; used by the overlay's
    /// pre-image read before an update/delete.
    fn get(&self, pk: &Row) -> Result<Option<Row>>;

    fn apply(&mut self, op: UpdateOp) -> Result<()>;

    /// Adds a secondary index to an already-populated table; only called
    /// on modules whose `Capabilities::creates_index` is set.
    fn create_index(&mut self, index: &crate::schema::SecondaryIndexDef) -> Result<()> {
        let _ = index;
        Err(crate::error::Error::misuse("module does not support secondary indexes"))
    }

    /// Removes a secondary index previously added by `create_index`. A
    /// no-op default for modules whose `Capabilities::creates_index` is
    /// unset (nothing to remove).
    fn drop_index(&mut self, index_name: &str) -> Result<()> {
        let _ = index_name;
        Ok(())
    }

    /// Row iteration ordered by a named secondary index, ascending or
    /// descending; only called on modules whose `Capabilities::
    /// has_index_comparator` is set. The isolation overlay uses this for
    /// the secondary-index merge mode of the sorted-merge iterator (§4.3).
    fn index_scan(&self, index_name: &str, descending: bool) -> Result<Box<dyn Iterator<Item = Result<Row>> + '_>> {
        let _ = descending;
        Err(crate::error::Error::misuse(format!("module does not support index scans: {index_name}")))
    }

    fn row_count(&self) -> Result<usize>;
}

/// A table instance shared by every connection open on the same database.
/// `Rc<RefCell<_>>` rather than a lock: the whole engine is single-threaded
/// per the concurrency model, same as the teacher's non-`Send` storage
/// types.
pub type SharedTable = Rc<RefCell<Box<dyn VirtualTable>>>;
