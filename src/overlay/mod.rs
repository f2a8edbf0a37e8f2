//! Per-connection isolation overlay: shadows a shared `VirtualTable` so one
//! connection's uncommitted writes are visible to itself and invisible to
//! every other connection until `flush` (commit) applies them, or
//! `rollback` discards them.
//!
//! Grounded on the teacher's `transaction.rs` write-buffer-over-snapshot
//! design (a connection-local map of pending writes consulted first, the
//! shared engine consulted on miss), generalized from one hard-coded row
//! shape to any `VirtualTable` and from a single write-set to a
//! savepoint-free overlay (savepoint nesting is the transaction
//! coordinator's concern: it tracks which overlay entries belong to which
//! depth and replays `rollback_to` as a set of targeted overlay removals).

mod merge;

use crate::error::Result;
use crate::row::Row;
use crate::schema::TableSchema;
use crate::value::Value;
use crate::value::Collation;
use crate::vtab::{FilterDescriptor, OnConflict, SharedTable, UpdateOp, VirtualTable};
use merge::MergeIter;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Debug, Clone)]
enum OverlayEntry {
    Upsert(Row),
    /// Carries the deleted row's primary key, not the key bytes, since the
    /// byte key is a one-way order-preserving encoding and flushing a
    /// tombstone needs the actual PK values to issue `UpdateOp::Delete`.
    Tombstone(Row),
}

fn pk_values(schema: &TableSchema, row: &Row) -> Row {
    schema.primary_key.columns().map(|c| row[c].clone()).collect()
}

fn pk_key(schema: &TableSchema, pk: &[Value]) -> Vec<u8> {
    let parts: Vec<_> = pk
        .iter()
        .zip(schema.primary_key.columns())
        .map(|(v, col)| (v.clone(), schema.columns[col].collation))
        .collect();
    crate::kv::codec::encode_row_key("", "", &parts)
}

pub struct IsolatedTable {
    underlying: SharedTable,
    overlay: BTreeMap<Vec<u8>, OverlayEntry>,
}

impl IsolatedTable {
    pub fn new(underlying: SharedTable) -> Self {
        Self { underlying, overlay: BTreeMap::new() }
    }

    pub fn schema(&self) -> Rc<TableSchema> {
        self.underlying.borrow().schema().clone()
    }

    pub fn is_dirty(&self) -> bool {
        !self.overlay.is_empty()
    }

    pub fn get(&self, pk: &Row) -> Result<Option<Row>> {
        let schema = self.schema();
        let key = pk_key(&schema, pk);
        match self.overlay.get(&key) {
            Some(OverlayEntry::Upsert(row)) => Ok(Some(row.clone())),
            Some(OverlayEntry::Tombstone(_)) => Ok(None),
            None => self.underlying.borrow().get(pk),
        }
    }

    /// Dispatches to the primary-key or secondary-index merge path
    /// depending on the requested access path (§4.3).
    pub fn scan(&self, filter: &FilterDescriptor) -> Result<Box<dyn Iterator<Item = Result<Row>>>> {
        match &filter.index_name {
            Some(name) => self.scan_indexed(name, filter),
            None => self.scan_primary(filter),
        }
    }

    /// Merges the overlay with the shared table's current committed state
    /// in primary-key order. Rows are collected eagerly rather than
    /// streamed past the `RefCell` borrow: the `mem` module's own scan
    /// already materializes every row from its KV store, so eager
    /// collection here costs nothing extra and sidesteps holding a live
    /// borrow across the returned iterator's lifetime.
    fn scan_primary(&self, filter: &FilterDescriptor) -> Result<Box<dyn Iterator<Item = Result<Row>>>> {
        let schema = self.schema();
        let base_filter = FilterDescriptor { descending: filter.descending, ..FilterDescriptor::default() };
        let base_rows: Vec<Result<(Vec<u8>, Row)>> = {
            let table = self.underlying.borrow();
            table
                .scan(&base_filter)?
                .map(|r| r.map(|row| (pk_key(&schema, &pk_values(&schema, &row)), row)))
                .collect()
        };

        let mut overlay_entries: Vec<(Vec<u8>, Option<Row>)> = self
            .overlay
            .iter()
            .map(|(k, v)| {
                let row = match v {
                    OverlayEntry::Upsert(row) => Some(row.clone()),
                    OverlayEntry::Tombstone(_) => None,
                };
                (k.clone(), row)
            })
            .collect();
        if filter.descending {
            overlay_entries.reverse();
        }

        let merged = MergeIter::new(overlay_entries.into_iter().map(Ok), base_rows.into_iter(), filter.descending);

        let constraints = filter.constraints.clone();
        let columns = schema.columns.clone();
        let filtered = merged.filter(move |r| match r {
            Ok(row) => crate::vtab::constraints_match(&columns, row, &constraints),
            Err(_) => true,
        });
        Ok(match filter.limit {
            Some(n) => Box::new(filtered.take(n)),
            None => Box::new(filtered),
        })
    }

    /// Merges the overlay with the underlying table's secondary-index
    /// order (§4.3 mode 2): (a) read the underlying table through
    /// `VirtualTable::index_scan`, excluding any row whose primary key the
    /// overlay has touched (inserted, updated, or tombstoned) since the
    /// overlay's version always wins; (b) compute a sort key for every
    /// surviving underlying row and every live (non-tombstone) overlay row
    /// as the encoded index-key columns followed by the encoded PK columns,
    /// each under its declared collation; (c) because overlay-touched PKs
    /// were excluded from the underlying stream, the two streams cannot
    /// share a sort key, so the same generic merge used for primary-key
    /// scans applies unchanged; (d) re-apply pushed-down constraints and
    /// the row limit exactly as `scan_primary` does.
    fn scan_indexed(&self, index_name: &str, filter: &FilterDescriptor) -> Result<Box<dyn Iterator<Item = Result<Row>>>> {
        let schema = self.schema();
        let index = schema
            .index_named(index_name)
            .ok_or_else(|| crate::error::Error::schema(format!("no such index: {index_name}")))?;
        let index_parts: Vec<(usize, Collation)> = index.parts.iter().map(|(p, c)| (p.column, *c)).collect();
        let pk_parts: Vec<(usize, Collation)> =
            schema.primary_key.columns().map(|c| (c, schema.columns[c].collation)).collect();

        let sort_key = |row: &Row| -> Vec<u8> {
            let mut out = Vec::new();
            for (col, collation) in index_parts.iter().chain(pk_parts.iter()) {
                out.extend_from_slice(&crate::kv::codec::encode_value(&row[*col], *collation));
            }
            out
        };

        let touched: std::collections::HashSet<Vec<u8>> = self.overlay.keys().cloned().collect();

        let base_rows: Vec<Result<(Vec<u8>, Row)>> = {
            let table = self.underlying.borrow();
            table
                .index_scan(index_name, filter.descending)?
                .filter_map(|r| match r {
                    Ok(row) => {
                        let pk = pk_key(&schema, &pk_values(&schema, &row));
                        if touched.contains(&pk) {
                            None
                        } else {
                            Some(Ok((sort_key(&row), row)))
                        }
                    }
                    Err(e) => Some(Err(e)),
                })
                .collect()
        };

        let mut overlay_entries: Vec<(Vec<u8>, Option<Row>)> = self
            .overlay
            .values()
            .filter_map(|v| match v {
                OverlayEntry::Upsert(row) => Some((sort_key(row), Some(row.clone()))),
                OverlayEntry::Tombstone(_) => None,
            })
            .collect();
        overlay_entries.sort_by(|a, b| a.0.cmp(&b.0));
        if filter.descending {
            overlay_entries.reverse();
        }

        let merged = MergeIter::new(overlay_entries.into_iter().map(Ok), base_rows.into_iter(), filter.descending);

        let constraints = filter.constraints.clone();
        let columns = schema.columns.clone();
        let filtered = merged.filter(move |r| match r {
            Ok(row) => crate::vtab::constraints_match(&columns, row, &constraints),
            Err(_) => true,
        });
        Ok(match filter.limit {
            Some(n) => Box::new(filtered.take(n)),
            None => Box::new(filtered),
        })
    }

    pub fn insert(&mut self, row: Row, on_conflict: OnConflict) -> Result<()> {
        let schema = self.schema();
        let pk = pk_values(&schema, &row);
        let key = pk_key(&schema, &pk);
        if self.get(&pk)?.is_some() {
            match on_conflict {
                OnConflict::Abort => {
                    return Err(crate::error::Error::constraint(format!(
                        "PRIMARY KEY constraint failed: {}",
                        schema.table_name()
                    )))
                }
                OnConflict::Ignore => return Ok(()),
                OnConflict::Replace => {}
            }
        }
        self.overlay.insert(key, OverlayEntry::Upsert(row));
        Ok(())
    }

    pub fn update(&mut self, old_pk: Row, new_row: Row) -> Result<()> {
        let schema = self.schema();
        let new_pk = pk_values(&schema, &new_row);
        let old_key = pk_key(&schema, &old_pk);
        let new_key = pk_key(&schema, &new_pk);
        if old_key != new_key {
            self.overlay.insert(old_key, OverlayEntry::Tombstone(old_pk));
        }
        self.overlay.insert(new_key, OverlayEntry::Upsert(new_row));
        Ok(())
    }

    pub fn delete(&mut self, pk: Row) -> Result<()> {
        let schema = self.schema();
        let key = pk_key(&schema, &pk);
        self.overlay.insert(key, OverlayEntry::Tombstone(pk));
        Ok(())
    }

    pub fn apply(&mut self, op: UpdateOp) -> Result<()> {
        match op {
            UpdateOp::Insert { row, on_conflict } => self.insert(row, on_conflict),
            UpdateOp::Update { old_pk, new_row } => self.update(old_pk, new_row),
            UpdateOp::Delete { pk } => self.delete(pk),
        }
    }

    /// Applies every buffered write to the shared table in PK order
    /// (insertion order is irrelevant for `mem`'s PK-keyed storage) and
    /// clears the overlay. Called by the transaction coordinator at commit.
    pub fn flush(&mut self) -> Result<()> {
        let mut table = self.underlying.borrow_mut();
        for (_, entry) in std::mem::take(&mut self.overlay) {
            match entry {
                OverlayEntry::Upsert(row) => {
                    let pk = pk_values(table.schema(), &row);
                    if table.get(&pk)?.is_some() {
                        table.apply(UpdateOp::Update { old_pk: pk, new_row: row })?;
                    } else {
                        table.apply(UpdateOp::Insert { row, on_conflict: OnConflict::Abort })?;
                    }
                }
                OverlayEntry::Tombstone(pk) => {
                    table.apply(UpdateOp::Delete { pk })?;
                }
            }
        }
        Ok(())
    }

    /// Discards every buffered write without touching the shared table.
    pub fn rollback(&mut self) {
        self.overlay.clear();
    }

    /// Discards overlay entries recorded strictly after `mark`, used by
    /// `ROLLBACK TO SAVEPOINT` once the coordinator has taken a key
    /// snapshot via `mark()`.
    pub fn rollback_to(&mut self, mark: &[Vec<u8>]) {
        let keep: std::collections::HashSet<&Vec<u8>> = mark.iter().collect();
        self.overlay.retain(|k, _| keep.contains(k));
    }

    /// Snapshot of currently-buffered overlay keys, for `rollback_to`.
    pub fn mark(&self) -> Vec<Vec<u8>> {
        self.overlay.keys().cloned().collect()
    }

    pub fn row_count_hint(&self) -> Result<usize> {
        let base = self.underlying.borrow().row_count()?;
        let net: i64 = self
            .overlay
            .values()
            .map(|e| match e {
                OverlayEntry::Upsert(_) => 1,
                OverlayEntry::Tombstone(_) => -1,
            })
            .sum();
        Ok((base as i64 + net).max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, KeyPart, LogicalType, PrimaryKeyDef, SortDirection};
    use crate::value::Collation;
    use crate::vtab::MemTable;
    use std::cell::RefCell;

    fn shared_table(name: &str) -> SharedTable {
        let schema = Rc::new(TableSchema::new(
            "main",
            name,
            vec![
                ColumnDef { name: "id".into(), logical_type: LogicalType::Integer, nullable: false, default: None, collation: Collation::Binary },
                ColumnDef { name: "name".into(), logical_type: LogicalType::Text, nullable: true, default: None, collation: Collation::Binary },
            ],
            PrimaryKeyDef { parts: vec![KeyPart { column: 0, direction: SortDirection::Asc }] },
            "mem",
            Default::default(),
        ));
        Rc::new(RefCell::new(Box::new(MemTable::new(schema))))
    }

    fn shared_table_with_name_index(name: &str) -> SharedTable {
        let schema = Rc::new(
            TableSchema::new(
                "main",
                name,
                vec![
                    ColumnDef { name: "id".into(), logical_type: LogicalType::Integer, nullable: false, default: None, collation: Collation::Binary },
                    ColumnDef { name: "name".into(), logical_type: LogicalType::Text, nullable: true, default: None, collation: Collation::Binary },
                ],
                PrimaryKeyDef { parts: vec![KeyPart { column: 0, direction: SortDirection::Asc }] },
                "mem",
                Default::default(),
            )
            .with_index(crate::schema::SecondaryIndexDef {
                name: "by_name".into(),
                parts: vec![(KeyPart { column: 1, direction: SortDirection::Asc }, Collation::Binary)],
                unique: false,
            }),
        );
        Rc::new(RefCell::new(Box::new(MemTable::new(schema))))
    }

    #[test]
    fn own_writes_visible_before_flush_others_not() {
        let shared = shared_table("t");
        let mut overlay = IsolatedTable::new(shared.clone());
        overlay.insert(vec![Value::Integer(1), Value::Text("a".into())], OnConflict::Abort).unwrap();
        assert_eq!(overlay.get(&vec![Value::Integer(1)]).unwrap().unwrap()[1], Value::Text("a".into()));
        assert!(shared.borrow().get(&vec![Value::Integer(1)]).unwrap().is_none());
    }

    #[test]
    fn flush_applies_writes_to_shared_table() {
        let shared = shared_table("t");
        let mut overlay = IsolatedTable::new(shared.clone());
        overlay.insert(vec![Value::Integer(1), Value::Text("a".into())], OnConflict::Abort).unwrap();
        overlay.flush().unwrap();
        assert!(shared.borrow().get(&vec![Value::Integer(1)]).unwrap().is_some());
        assert!(!overlay.is_dirty());
    }

    #[test]
    fn delete_tombstones_a_committed_row() {
        let shared = shared_table("t");
        shared.borrow_mut().apply(UpdateOp::Insert { row: vec![Value::Integer(1), Value::Null], on_conflict: OnConflict::Abort }).unwrap();
        let mut overlay = IsolatedTable::new(shared.clone());
        overlay.delete(vec![Value::Integer(1)]).unwrap();
        assert!(overlay.get(&vec![Value::Integer(1)]).unwrap().is_none());
        let rows: Vec<_> = overlay.scan(&FilterDescriptor::full_scan()).unwrap().collect::<Result<_>>().unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn rollback_discards_overlay_without_touching_shared() {
        let shared = shared_table("t");
        let mut overlay = IsolatedTable::new(shared.clone());
        overlay.insert(vec![Value::Integer(1), Value::Null], OnConflict::Abort).unwrap();
        overlay.rollback();
        assert!(overlay.get(&vec![Value::Integer(1)]).unwrap().is_none());
    }

    #[test]
    fn scan_merges_overlay_and_shared_rows() {
        let shared = shared_table("t");
        shared.borrow_mut().apply(UpdateOp::Insert { row: vec![Value::Integer(1), Value::Null], on_conflict: OnConflict::Abort }).unwrap();
        let mut overlay = IsolatedTable::new(shared.clone());
        overlay.insert(vec![Value::Integer(2), Value::Null], OnConflict::Abort).unwrap();
        let rows: Vec<_> = overlay.scan(&FilterDescriptor::full_scan()).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn scan_indexed_merges_overlay_and_shared_in_index_order_and_hides_shadowed_rows() {
        let shared = shared_table_with_name_index("t");
        shared.borrow_mut().apply(UpdateOp::Insert { row: vec![Value::Integer(1), Value::Text("bravo".into())], on_conflict: OnConflict::Abort }).unwrap();
        shared.borrow_mut().apply(UpdateOp::Insert { row: vec![Value::Integer(2), Value::Text("delta".into())], on_conflict: OnConflict::Abort }).unwrap();
        let mut overlay = IsolatedTable::new(shared.clone());
        // Shadow row 1 with a new name that reorders it, and insert a brand-new row.
        overlay.update(vec![Value::Integer(1)], vec![Value::Integer(1), Value::Text("charlie".into())]).unwrap();
        overlay.insert(vec![Value::Integer(3), Value::Text("alpha".into())], OnConflict::Abort).unwrap();

        let filter = FilterDescriptor { index_name: Some("by_name".into()), ..FilterDescriptor::default() };
        let rows: Vec<Row> = overlay.scan(&filter).unwrap().collect::<Result<_>>().unwrap();
        let names: Vec<String> = rows.iter().map(|r| r[1].as_text().unwrap().to_string()).collect();
        assert_eq!(names, vec!["alpha", "charlie", "delta"]);
    }
}
