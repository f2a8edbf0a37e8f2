//! The transaction coordinator: the autocommit/explicit state machine,
//! savepoint nesting, and coordinated commit across a connection's open
//! table overlays.
//!
//! Grounded on the teacher's `transaction.rs`/`connections.rs` pair (a
//! per-connection transaction state plus a shared engine consulted at
//! commit), generalized from one hard-coded storage engine to the overlay
//! map `Database` keeps per connection and from a flat write buffer to a
//! savepoint stack with coordinator-assigned depths.

mod savepoint;

pub use savepoint::{SavepointFrame, SavepointStack};

use crate::error::{Error, Result};
use crate::events::EventAggregator;
use crate::overlay::IsolatedTable;
use crate::schema::SchemaManager;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Autocommit,
    Explicit,
}

/// Per-connection transaction state. `Database` owns one of these per open
/// connection alongside that connection's table overlays.
pub struct ConnectionTxn {
    pub mode: Mode,
    savepoints: SavepointStack,
}

impl Default for ConnectionTxn {
    fn default() -> Self {
        Self { mode: Mode::Autocommit, savepoints: SavepointStack::new() }
    }
}

impl ConnectionTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_explicit_transaction(&self) -> bool {
        self.mode == Mode::Explicit
    }

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.top().map(|f| f.depth as usize).unwrap_or(0)
    }
}

/// Commit flushes tables in the order they were first inserted into this
/// map — the "registration order" §4.6's coordinated-commit ordering
/// names — so `IndexMap` rather than `HashMap`, whose iteration order is
/// unspecified and would make commit order nondeterministic.
pub type OverlayMap = IndexMap<(String, String), IsolatedTable>;

/// A pending deferred row constraint: a closure checked once at coordinated
/// commit, after global assertions and before any overlay flushes. Pushed
/// via `TransactionCoordinator::push_deferred_constraint` (`Connection`
/// exposes this at `Database` level, the same way `register_assertion`
/// exposes global assertions).
pub type DeferredConstraint = Rc<dyn Fn() -> Result<()>>;

/// Assigns monotonically increasing savepoint depths across every
/// connection and drives the begin/commit/rollback/savepoint protocol.
/// Holds no table data itself: callers pass the connection's overlay map,
/// event aggregator, and schema manager explicitly so the coordinator
/// stays independent of `Database`'s storage layout. Does hold the
/// deferred-constraint queue directly (§4.6), since that queue is
/// coordinator state shared across every connection's commit, not
/// per-connection or per-table state like the overlay map.
pub struct TransactionCoordinator {
    next_depth: Cell<u32>,
    pending_constraints: RefCell<Vec<DeferredConstraint>>,
    /// Set for the duration of deferred-constraint evaluation inside
    /// `commit`; `begin` refuses while it's set, so a constraint closure
    /// that tries to open a new transaction on the same connection (instead
    /// of just reading state) fails loudly instead of re-entering the
    /// coordinator mid-commit.
    evaluating_deferred: Cell<bool>,
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self { next_depth: Cell::new(1), pending_constraints: RefCell::new(Vec::new()), evaluating_deferred: Cell::new(false) }
    }

    fn allocate_depth(&self) -> u32 {
        let depth = self.next_depth.get();
        self.next_depth.set(depth + 1);
        depth
    }

    /// Queues a constraint closure, checked once at the next coordinated
    /// commit (§4.6 step 2), after global assertions and before any
    /// connection's overlay flushes. Belongs to whichever savepoint layer is
    /// open when pushed: a `ROLLBACK TO` that undoes that layer discards it
    /// along with the layer's writes.
    pub fn push_deferred_constraint(&self, constraint: DeferredConstraint) {
        self.pending_constraints.borrow_mut().push(constraint);
    }

    pub fn begin(&self, txn: &mut ConnectionTxn) -> Result<()> {
        if self.evaluating_deferred.get() {
            return Err(Error::misuse("cannot begin a transaction while deferred constraints are evaluating"));
        }
        if txn.mode == Mode::Explicit {
            return Err(Error::misuse("already in a transaction"));
        }
        txn.mode = Mode::Explicit;
        tracing::debug!("began explicit transaction");
        Ok(())
    }

    /// `SAVEPOINT name`. Implicitly opens an explicit transaction if the
    /// connection was in autocommit, matching the common SQL dialect
    /// convention.
    pub fn savepoint(&self, txn: &mut ConnectionTxn, name: Option<String>, overlays: &OverlayMap, events: &EventAggregator) -> u32 {
        txn.mode = Mode::Explicit;
        let depth = self.allocate_depth();
        let overlay_marks = overlays.iter().map(|(k, v)| (k.clone(), v.mark())).collect();
        let deferred_mark = self.pending_constraints.borrow().len();
        tracing::trace!(depth, name = ?name, "opened savepoint");
        txn.savepoints.push(SavepointFrame { depth, name, overlay_marks, deferred_mark });
        events.begin_layer();
        depth
    }

    fn resolve_index(&self, txn: &ConnectionTxn, name: Option<&str>, depth: Option<u32>) -> Result<usize> {
        let index = match (name, depth) {
            (Some(n), _) => txn.savepoints.position_of(n),
            (None, Some(d)) => txn.savepoints.position_of_depth(d),
            (None, None) => None,
        };
        index.ok_or_else(|| Error::misuse("no such savepoint"))
    }

    /// `RELEASE SAVEPOINT`: the named frame and everything nested above it
    /// merge into their parent, surviving the release but no longer
    /// independently discardable.
    pub fn release(&self, txn: &mut ConnectionTxn, name: Option<&str>, depth: Option<u32>, events: &EventAggregator) -> Result<()> {
        let index = self.resolve_index(txn, name, depth)?;
        let popped = txn.savepoints.pop_from(index);
        for _ in &popped {
            events.release_layer();
        }
        Ok(())
    }

    /// `ROLLBACK TO SAVEPOINT`: discards every write and event recorded
    /// since the named savepoint, but keeps it open (a subsequent `RELEASE`
    /// or further nesting is still valid).
    pub fn rollback_to(&self, txn: &mut ConnectionTxn, name: Option<&str>, depth: Option<u32>, overlays: &mut OverlayMap, events: &EventAggregator) -> Result<()> {
        let index = self.resolve_index(txn, name, depth)?;
        let target = txn.savepoints.pop_from(index);
        let restore = target.last().expect("pop_from(index) always returns at least one frame");
        for _ in &target {
            events.rollback_layer();
        }
        for (key, table) in overlays.iter_mut() {
            if let Some(marks) = restore.overlay_marks.get(key) {
                table.rollback_to(marks);
            } else {
                table.rollback();
            }
        }
        self.pending_constraints.borrow_mut().truncate(restore.deferred_mark);
        txn.savepoints.push(SavepointFrame {
            depth: restore.depth,
            name: restore.name.clone(),
            overlay_marks: restore.overlay_marks.clone(),
            deferred_mark: restore.deferred_mark,
        });
        events.begin_layer();
        Ok(())
    }

    /// Coordinated commit (§4.6): (1) evaluates global assertions against
    /// the set of tables this transaction actually touched, (2) runs every
    /// queued deferred row constraint, (3) flushes every overlay and fires
    /// the accumulated events. An assertion or constraint failure at either
    /// step is commit-time (`Error::is_commit_time_constraint`) and the
    /// caller must roll back rather than retry; the deferred-constraint
    /// queue is left untouched on failure so a caller inspecting it (or a
    /// retried commit after a narrower rollback-to) sees exactly what
    /// hasn't run yet.
    pub fn commit(&self, txn: &mut ConnectionTxn, overlays: &mut OverlayMap, events: &EventAggregator, schema: &SchemaManager) -> Result<()> {
        let touched = events.touched_tables();
        tracing::debug!(?touched, "coordinated commit starting");
        schema.evaluate_assertions(&touched)?;

        self.evaluating_deferred.set(true);
        let pending = self.pending_constraints.borrow().clone();
        let result = pending.iter().try_for_each(|check| check());
        self.evaluating_deferred.set(false);
        result?;
        self.pending_constraints.borrow_mut().clear();

        for table in overlays.values_mut() {
            table.flush()?;
        }
        events.commit();
        txn.mode = Mode::Autocommit;
        txn.savepoints.clear();
        tracing::debug!("coordinated commit finished");
        Ok(())
    }

    pub fn rollback(&self, txn: &mut ConnectionTxn, overlays: &mut OverlayMap, events: &EventAggregator) -> Result<()> {
        tracing::debug!("rolling back transaction");
        for table in overlays.values_mut() {
            table.rollback();
        }
        events.rollback();
        self.pending_constraints.borrow_mut().clear();
        txn.mode = Mode::Autocommit;
        txn.savepoints.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaManagerConfig;
    use crate::value::Value;
    use crate::vtab::{MemTable, MemTableModule, OnConflict, VirtualTable};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn overlay_map() -> (OverlayMap, Rc<RefCell<Box<dyn VirtualTable>>>) {
        let schema = Rc::new(crate::schema::TableSchema::new(
            "main",
            "t",
            vec![crate::schema::ColumnDef {
                name: "id".into(),
                logical_type: crate::schema::LogicalType::Integer,
                nullable: false,
                default: None,
                collation: crate::value::Collation::Binary,
            }],
            crate::schema::PrimaryKeyDef { parts: vec![crate::schema::KeyPart { column: 0, direction: crate::schema::SortDirection::Asc }] },
            "mem",
            Default::default(),
        ));
        let shared: Rc<RefCell<Box<dyn VirtualTable>>> = Rc::new(RefCell::new(Box::new(MemTable::new(schema))));
        let mut map = OverlayMap::new();
        map.insert(("main".to_string(), "t".to_string()), IsolatedTable::new(shared.clone()));
        (map, shared)
    }

    #[test]
    fn begin_twice_is_misuse() {
        let coord = TransactionCoordinator::new();
        let mut txn = ConnectionTxn::new();
        coord.begin(&mut txn).unwrap();
        assert!(coord.begin(&mut txn).is_err());
    }

    #[test]
    fn commit_flushes_overlay_and_fires_events() {
        let _ = MemTableModule;
        let coord = TransactionCoordinator::new();
        let schema = SchemaManager::new(SchemaManagerConfig::default());
        let events = EventAggregator::new();
        let (mut overlays, shared) = overlay_map();
        let mut txn = ConnectionTxn::new();
        coord.begin(&mut txn).unwrap();
        overlays.get_mut(&("main".to_string(), "t".to_string())).unwrap().insert(vec![Value::Integer(1)], OnConflict::Abort).unwrap();
        events.record_data_change(crate::events::DataChangeEvent {
            schema: "main".into(),
            table: "t".into(),
            kind: crate::events::ChangeKind::Insert,
            pk: vec![Value::Integer(1)],
            remote: false,
        });
        coord.commit(&mut txn, &mut overlays, &events, &schema).unwrap();
        assert!(shared.borrow().get(&vec![Value::Integer(1)]).unwrap().is_some());
        assert_eq!(txn.mode, Mode::Autocommit);
    }

    #[test]
    fn commit_runs_deferred_constraints_after_assertions() {
        let coord = TransactionCoordinator::new();
        let schema = SchemaManager::new(SchemaManagerConfig::default());
        let events = EventAggregator::new();
        let (mut overlays, _shared) = overlay_map();
        let mut txn = ConnectionTxn::new();
        coord.begin(&mut txn).unwrap();
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        coord.push_deferred_constraint(Rc::new(move || {
            ran_clone.set(true);
            Ok(())
        }));
        coord.commit(&mut txn, &mut overlays, &events, &schema).unwrap();
        assert!(ran.get());
    }

    #[test]
    fn failing_deferred_constraint_is_commit_time() {
        let coord = TransactionCoordinator::new();
        let schema = SchemaManager::new(SchemaManagerConfig::default());
        let events = EventAggregator::new();
        let (mut overlays, _shared) = overlay_map();
        let mut txn = ConnectionTxn::new();
        coord.begin(&mut txn).unwrap();
        coord.push_deferred_constraint(Rc::new(|| Err(Error::deferred_constraint("row check failed"))));
        let err = coord.commit(&mut txn, &mut overlays, &events, &schema).unwrap_err();
        assert!(err.is_commit_time_constraint());
    }

    #[test]
    fn rollback_to_savepoint_discards_deferred_constraints_pushed_after_it() {
        let coord = TransactionCoordinator::new();
        let events = EventAggregator::new();
        let (mut overlays, _shared) = overlay_map();
        let mut txn = ConnectionTxn::new();
        coord.begin(&mut txn).unwrap();
        let depth = coord.savepoint(&mut txn, Some("s1".into()), &overlays, &events);
        coord.push_deferred_constraint(Rc::new(|| Err(Error::deferred_constraint("should never run"))));
        coord.rollback_to(&mut txn, None, Some(depth), &mut overlays, &events).unwrap();
        assert!(coord.pending_constraints.borrow().is_empty());
    }

    #[test]
    fn rollback_to_savepoint_restores_overlay() {
        let coord = TransactionCoordinator::new();
        let events = EventAggregator::new();
        let (mut overlays, _shared) = overlay_map();
        let mut txn = ConnectionTxn::new();
        coord.begin(&mut txn).unwrap();
        overlays.get_mut(&("main".to_string(), "t".to_string())).unwrap().insert(vec![Value::Integer(1)], OnConflict::Abort).unwrap();
        let depth = coord.savepoint(&mut txn, Some("s1".into()), &overlays, &events);
        overlays.get_mut(&("main".to_string(), "t".to_string())).unwrap().insert(vec![Value::Integer(2)], OnConflict::Abort).unwrap();
        coord.rollback_to(&mut txn, None, Some(depth), &mut overlays, &events).unwrap();
        let table = &overlays[&("main".to_string(), "t".to_string())];
        assert!(table.get(&vec![Value::Integer(1)]).unwrap().is_some());
        assert!(table.get(&vec![Value::Integer(2)]).unwrap().is_none());
    }
}
