//! The flat OLD|NEW row convention DML operators pass downstream, so a
//! `RETURNING` projection can reference both halves of a change without a
//! second read.
//!
//! Grounded on the teacher's `query_processor.rs` insert/update/delete
//! plans (each keeps the pre-image row alongside the row being written so
//! index maintenance and validation can compare old vs. new), generalized
//! from ad hoc `old_row_data`/`row_data` locals into one typed, width-`2N`
//! row shape shared by every DML operator and by RETURNING projection.

use crate::events::ChangeKind;
use crate::row::Row;
use crate::schema::TableSchema;
use crate::value::Value;
use crate::vtab::{OnConflict, UpdateOp};

/// Which half of a flat row a reference picks out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowHalf {
    Old,
    New,
}

/// Builds the `2N`-wide flat row from the OLD and/or NEW row (whichever the
/// operation produces): `INSERT` has no OLD, `DELETE` has no NEW, `UPDATE`
/// has both. The missing half is padded with `NULL`.
pub fn flat_row(schema: &TableSchema, old: Option<&Row>, new: Option<&Row>) -> Row {
    let n = schema.column_count();
    let mut flat = Vec::with_capacity(2 * n);
    match old {
        Some(row) => flat.extend(row.iter().cloned()),
        None => flat.extend(std::iter::repeat(Value::Null).take(n)),
    }
    match new {
        Some(row) => flat.extend(row.iter().cloned()),
        None => flat.extend(std::iter::repeat(Value::Null).take(n)),
    }
    flat
}

/// Extracts the OLD half (columns `[0, N)`) from a flat row.
pub fn old_half(schema: &TableSchema, flat: &Row) -> Row {
    flat[..schema.column_count()].to_vec()
}

/// Extracts the NEW half (columns `[N, 2N)`) from a flat row.
pub fn new_half(schema: &TableSchema, flat: &Row) -> Row {
    flat[schema.column_count()..].to_vec()
}

/// Which half of a flat row carries the operand an operation keys its
/// module call on. `INSERT`/`UPDATE` key on NEW (a changed primary key is a
/// NEW-half value); `DELETE` keys on OLD (the only half it has).
pub fn relevant_half(kind: ChangeKind) -> RowHalf {
    match kind {
        ChangeKind::Insert | ChangeKind::Update => RowHalf::New,
        ChangeKind::Delete => RowHalf::Old,
    }
}

/// Extracts primary-key column values from the half of a flat row the
/// operation's kind designates as authoritative.
pub fn extract_pk(schema: &TableSchema, kind: ChangeKind, flat: &Row) -> Row {
    let half = match relevant_half(kind) {
        RowHalf::Old => old_half(schema, flat),
        RowHalf::New => new_half(schema, flat),
    };
    crate::schema::extract_pk(schema, &half)
}

/// Lowers a flat row plus its operation kind into the `UpdateOp` a
/// `VirtualTable`/overlay `apply` expects. `UPDATE`'s `old_pk` always comes
/// from the OLD half (it identifies which stored row to replace), even
/// though the write itself targets whatever PK the NEW half now carries.
pub fn to_update_op(schema: &TableSchema, kind: ChangeKind, flat: &Row, on_conflict: OnConflict) -> UpdateOp {
    match kind {
        ChangeKind::Insert => UpdateOp::Insert { row: new_half(schema, flat), on_conflict },
        ChangeKind::Update => {
            UpdateOp::Update { old_pk: crate::schema::extract_pk(schema, &old_half(schema, flat)), new_row: new_half(schema, flat) }
        }
        ChangeKind::Delete => UpdateOp::Delete { pk: crate::schema::extract_pk(schema, &old_half(schema, flat)) },
    }
}

/// One column reference in a `RETURNING` projection: a table column under
/// either the OLD or the NEW half.
#[derive(Debug, Clone, Copy)]
pub struct ReturningColumn {
    pub half: RowHalf,
    pub column: usize,
}

/// A compiled `RETURNING` clause: which `(half, column)` pairs to project
/// out of each flat row a DML operator yields.
#[derive(Debug, Clone, Default)]
pub struct ReturningProjection {
    pub columns: Vec<ReturningColumn>,
}

impl ReturningProjection {
    /// `RETURNING *` on `INSERT`/`DELETE`: every column of the half the
    /// operation actually populated (NEW for insert, OLD for delete).
    pub fn star(schema: &TableSchema, half: RowHalf) -> Self {
        Self { columns: (0..schema.column_count()).map(|column| ReturningColumn { half, column }).collect() }
    }

    /// `RETURNING OLD.*, NEW.*` on `UPDATE`: the before/after pair for
    /// every column, OLD columns first.
    pub fn old_and_new_star(schema: &TableSchema) -> Self {
        let n = schema.column_count();
        let columns = (0..n)
            .map(|column| ReturningColumn { half: RowHalf::Old, column })
            .chain((0..n).map(|column| ReturningColumn { half: RowHalf::New, column }))
            .collect();
        Self { columns }
    }

    pub fn project(&self, schema: &TableSchema, flat: &Row) -> Row {
        let n = schema.column_count();
        self.columns
            .iter()
            .map(|c| match c.half {
                RowHalf::Old => flat[c.column].clone(),
                RowHalf::New => flat[n + c.column].clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, KeyPart, LogicalType, PrimaryKeyDef, SortDirection};
    use crate::value::Collation;

    fn schema() -> TableSchema {
        TableSchema::new(
            "main",
            "t",
            vec![
                ColumnDef { name: "id".into(), logical_type: LogicalType::Integer, nullable: false, default: None, collation: Collation::Binary },
                ColumnDef { name: "name".into(), logical_type: LogicalType::Text, nullable: true, default: None, collation: Collation::Binary },
            ],
            PrimaryKeyDef { parts: vec![KeyPart { column: 0, direction: SortDirection::Asc }] },
            "mem",
            Default::default(),
        )
    }

    #[test]
    fn insert_pads_old_half_with_null() {
        let schema = schema();
        let new = vec![Value::Integer(1), Value::Text("a".into())];
        let flat = flat_row(&schema, None, Some(&new));
        assert_eq!(old_half(&schema, &flat), vec![Value::Null, Value::Null]);
        assert_eq!(new_half(&schema, &flat), new);
        assert_eq!(extract_pk(&schema, ChangeKind::Insert, &flat), vec![Value::Integer(1)]);
    }

    #[test]
    fn delete_pads_new_half_with_null() {
        let schema = schema();
        let old = vec![Value::Integer(1), Value::Text("a".into())];
        let flat = flat_row(&schema, Some(&old), None);
        assert_eq!(new_half(&schema, &flat), vec![Value::Null, Value::Null]);
        assert_eq!(extract_pk(&schema, ChangeKind::Delete, &flat), vec![Value::Integer(1)]);
    }

    #[test]
    fn update_keys_old_pk_off_old_half_even_when_pk_changes() {
        let schema = schema();
        let old = vec![Value::Integer(1), Value::Text("a".into())];
        let new = vec![Value::Integer(2), Value::Text("b".into())];
        let flat = flat_row(&schema, Some(&old), Some(&new));
        let op = to_update_op(&schema, ChangeKind::Update, &flat, OnConflict::Abort);
        match op {
            UpdateOp::Update { old_pk, new_row } => {
                assert_eq!(old_pk, vec![Value::Integer(1)]);
                assert_eq!(new_row, new);
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn old_and_new_star_orders_old_columns_before_new() {
        let schema = schema();
        let old = vec![Value::Integer(1), Value::Text("a".into())];
        let new = vec![Value::Integer(1), Value::Text("b".into())];
        let flat = flat_row(&schema, Some(&old), Some(&new));
        let projection = ReturningProjection::old_and_new_star(&schema);
        assert_eq!(projection.project(&schema, &flat), vec![Value::Integer(1), Value::Text("a".into()), Value::Integer(1), Value::Text("b".into())]);
    }
}
