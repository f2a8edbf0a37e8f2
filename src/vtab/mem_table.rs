//! The built-in `mem` module: rows keyed by encoded primary key in one
//! `MemoryKv`, secondary indexes keyed by encoded index-key+PK in a second.
//! The reference implementation every test and `Database`'s default module
//! target.

use super::{Capabilities, Constraint, FilterDescriptor, OnConflict, UpdateOp, VirtualTable, VtabModule};
use crate::error::{Error, Result};
use crate::kv::codec::{
    append_recoverable_pk, decode_row_blob, decode_trailing_pk, encode_index_key, encode_row_blob,
    encode_row_key, index_prefix, row_prefix,
};
use crate::kv::{KvStore, MemoryKv, ScanRange};
use crate::row::Row;
use crate::schema::{SecondaryIndexDef, TableSchema};
use crate::value::Value;
use std::rc::Rc;

pub struct MemTableModule;

impl VtabModule for MemTableModule {
    fn name(&self) -> &str {
        "mem"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { creates_index: true, has_index_comparator: true, supports_savepoints: false }
    }

    fn create(&self, schema: Rc<TableSchema>) -> Result<Box<dyn VirtualTable>> {
        Ok(Box::new(MemTable::new(schema)))
    }

    fn connect(&self, schema: Rc<TableSchema>) -> Result<Box<dyn VirtualTable>> {
        Ok(Box::new(MemTable::new(schema)))
    }
}

pub struct MemTable {
    schema: Rc<TableSchema>,
    rows: MemoryKv,
    indexes: std::collections::HashMap<String, MemoryKv>,
}

impl MemTable {
    pub fn new(schema: Rc<TableSchema>) -> Self {
        let indexes = schema
            .indexes
            .iter()
            .map(|ix| (ix.name.clone(), MemoryKv::new()))
            .collect();
        Self { schema, rows: MemoryKv::new(), indexes }
    }

    fn pk_parts(&self, row: &Row) -> Vec<(Value, crate::value::Collation)> {
        self.schema
            .primary_key
            .columns()
            .map(|col| (row[col].clone(), self.schema.columns[col].collation))
            .collect()
    }

    fn index_key_parts(&self, index: &SecondaryIndexDef, row: &Row) -> Vec<(Value, crate::value::Collation)> {
        index
            .columns()
            .map(|col| (row[col].clone(), self.schema.columns[col].collation))
            .collect()
    }

    fn schema_name(&self) -> &str {
        &self.schema.qualified_name.0
    }

    fn insert_indexes(&mut self, row: &Row) -> Result<()> {
        let pk = self.pk_parts(row);
        let raw_pk: Vec<Value> = self.schema.primary_key.columns().map(|c| row[c].clone()).collect();
        for index in self.schema.indexes.clone() {
            let key_parts = self.index_key_parts(&index, row);
            let store = self.indexes.get_mut(&index.name).expect("index store created with schema");
            if index.unique {
                let prefix = crate::kv::codec::encode_index_key_prefix(
                    self.schema_name(),
                    self.schema.table_name(),
                    &index.name,
                    &key_parts,
                );
                if store.scan(crate::kv::ScanRange::prefix(prefix).limited(1))?.next().is_some() {
                    return Err(Error::constraint(format!(
                        "UNIQUE constraint failed: {}.{}",
                        self.schema.table_name(),
                        index.name
                    )));
                }
            }
            let key = encode_index_key(self.schema_name(), self.schema.table_name(), &index.name, &key_parts, &pk);
            let key = append_recoverable_pk(key, &raw_pk);
            store.put(&key, &[])?;
        }
        Ok(())
    }

    fn remove_indexes(&mut self, row: &Row) -> Result<()> {
        let pk = self.pk_parts(row);
        let raw_pk: Vec<Value> = self.schema.primary_key.columns().map(|c| row[c].clone()).collect();
        for index in self.schema.indexes.clone() {
            let key_parts = self.index_key_parts(&index, row);
            let key = encode_index_key(self.schema_name(), self.schema.table_name(), &index.name, &key_parts, &pk);
            let key = append_recoverable_pk(key, &raw_pk);
            if let Some(store) = self.indexes.get_mut(&index.name) {
                store.delete(&key)?;
            }
        }
        Ok(())
    }

    fn matches(&self, row: &Row, constraints: &[Constraint]) -> bool {
        super::constraints_match(&self.schema.columns, row, constraints)
    }
}

impl VirtualTable for MemTable {
    fn schema(&self) -> &Rc<TableSchema> {
        &self.schema
    }

    fn scan(&self, filter: &FilterDescriptor) -> Result<Box<dyn Iterator<Item = Result<Row>> + '_>> {
        let prefix = row_prefix(self.schema_name(), self.schema.table_name());
        let mut range = ScanRange::prefix(prefix);
        if filter.descending {
            range = range.reversed();
        }
        if let Some(limit) = filter.limit {
            range = range.limited(limit);
        }
        let constraints = filter.constraints.clone();
        let decoded = self.rows.scan(range)?.map(move |(_, value)| decode_row(&value));
        let table = self;
        Ok(Box::new(decoded.filter(move |row| match row {
            Ok(row) => table.matches(row, &constraints),
            Err(_) => true,
        })))
    }

    fn get(&self, pk: &Row) -> Result<Option<Row>> {
        let parts: Vec<_> = self
            .schema
            .primary_key
            .parts
            .iter()
            .enumerate()
            .map(|(i, _)| (pk[i].clone(), self.schema.columns[self.schema.primary_key.parts[i].column].collation))
            .collect();
        let key = encode_row_key(self.schema_name(), self.schema.table_name(), &parts);
        match self.rows.get(&key)? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    fn apply(&mut self, op: UpdateOp) -> Result<()> {
        match op {
            UpdateOp::Insert { row, on_conflict } => {
                let pk = self.pk_parts(&row);
                let key = encode_row_key(self.schema_name(), self.schema.table_name(), &pk);
                if self.rows.exists(&key)? {
                    match on_conflict {
                        OnConflict::Abort => {
                            return Err(Error::constraint(format!(
                                "PRIMARY KEY constraint failed: {}",
                                self.schema.table_name()
                            )))
                        }
                        OnConflict::Ignore => return Ok(()),
                        OnConflict::Replace => {
                            if let Some(old) = self.get(&row_pk_only(&self.schema, &row))? {
                                self.remove_indexes(&old)?;
                            }
                        }
                    }
                }
                self.insert_indexes(&row)?;
                self.rows.put(&key, &encode_row(&row))?;
                Ok(())
            }
            UpdateOp::Update { old_pk, new_row } => {
                let old_parts: Vec<_> = old_pk
                    .iter()
                    .zip(self.schema.primary_key.columns())
                    .map(|(v, col)| (v.clone(), self.schema.columns[col].collation))
                    .collect();
                let old_key = encode_row_key(self.schema_name(), self.schema.table_name(), &old_parts);
                if let Some(old_bytes) = self.rows.get(&old_key)? {
                    let old_row = decode_row(&old_bytes)?;
                    self.remove_indexes(&old_row)?;
                }
                self.rows.delete(&old_key)?;
                let new_pk = self.pk_parts(&new_row);
                let new_key = encode_row_key(self.schema_name(), self.schema.table_name(), &new_pk);
                self.insert_indexes(&new_row)?;
                self.rows.put(&new_key, &encode_row(&new_row))?;
                Ok(())
            }
            UpdateOp::Delete { pk } => {
                let parts: Vec<_> = pk
                    .iter()
                    .zip(self.schema.primary_key.columns())
                    .map(|(v, col)| (v.clone(), self.schema.columns[col].collation))
                    .collect();
                let key = encode_row_key(self.schema_name(), self.schema.table_name(), &parts);
                if let Some(bytes) = self.rows.get(&key)? {
                    let row = decode_row(&bytes)?;
                    self.remove_indexes(&row)?;
                }
                self.rows.delete(&key)?;
                Ok(())
            }
        }
    }

    fn create_index(&mut self, index: &SecondaryIndexDef) -> Result<()> {
        let mut store = MemoryKv::new();
        let full_scan = FilterDescriptor::full_scan();
        let rows: Vec<Row> = self.scan(&full_scan)?.collect::<Result<_>>()?;
        for row in &rows {
            let pk = self.pk_parts(row);
            let raw_pk: Vec<Value> = self.schema.primary_key.columns().map(|c| row[c].clone()).collect();
            let key_parts = self.index_key_parts(index, row);
            if index.unique {
                let prefix = crate::kv::codec::encode_index_key_prefix(
                    self.schema_name(),
                    self.schema.table_name(),
                    &index.name,
                    &key_parts,
                );
                if store.scan(ScanRange::prefix(prefix).limited(1))?.next().is_some() {
                    return Err(Error::constraint(format!(
                        "UNIQUE constraint failed building index {}",
                        index.name
                    )));
                }
            }
            let key = encode_index_key(self.schema_name(), self.schema.table_name(), &index.name, &key_parts, &pk);
            let key = append_recoverable_pk(key, &raw_pk);
            store.put(&key, &[])?;
        }
        self.indexes.insert(index.name.clone(), store);
        self.schema = Rc::new((*self.schema).clone().with_index(index.clone()));
        Ok(())
    }

    /// Drops a secondary index built by `create_index`, removing both its
    /// backing store and its entry in `self.schema` so `insert_indexes`/
    /// `remove_indexes` stop maintaining it on subsequent writes.
    fn drop_index(&mut self, index_name: &str) -> Result<()> {
        self.indexes.remove(index_name);
        let mut schema = (*self.schema).clone();
        schema.indexes.retain(|ix| !ix.name.eq_ignore_ascii_case(index_name));
        self.schema = Rc::new(schema);
        Ok(())
    }

    fn row_count(&self) -> Result<usize> {
        Ok(self.rows.len())
    }

    /// Row iteration in secondary-index order: scans the index-key range,
    /// recovers each entry's PK, and re-reads the row from `self.rows`.
    fn index_scan(&self, index_name: &str, descending: bool) -> Result<Box<dyn Iterator<Item = Result<Row>> + '_>> {
        let prefix = index_prefix(self.schema_name(), self.schema.table_name(), index_name);
        let mut range = ScanRange::prefix(prefix);
        if descending {
            range = range.reversed();
        }
        let store = self
            .indexes
            .get(index_name)
            .ok_or_else(|| Error::schema(format!("no such index: {index_name}")))?;
        let rows = self;
        Ok(Box::new(store.scan(range)?.map(move |(key, _)| {
            let pk = decode_trailing_pk(&key)?;
            rows.get(&pk)?.ok_or_else(|| Error::internal("dangling secondary index entry"))
        })))
    }
}

fn row_pk_only(schema: &TableSchema, row: &Row) -> Row {
    schema.primary_key.columns().map(|c| row[c].clone()).collect()
}

fn encode_row(row: &Row) -> Vec<u8> {
    encode_row_blob(row)
}

/// Decodes a row encoded by `encode_row`. This is the same exact-value
/// blob format `kv::codec` defines, distinct from the order-preserving key
/// encoding used for row/index keys (which is one-way).
fn decode_row(bytes: &[u8]) -> Result<Row> {
    decode_row_blob(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, KeyPart, LogicalType, PrimaryKeyDef, SortDirection};
    use crate::value::Collation;

    fn int_table(name: &str) -> Rc<TableSchema> {
        Rc::new(TableSchema::new(
            "main",
            name,
            vec![
                ColumnDef { name: "id".into(), logical_type: LogicalType::Integer, nullable: false, default: None, collation: Collation::Binary },
                ColumnDef { name: "name".into(), logical_type: LogicalType::Text, nullable: true, default: None, collation: Collation::Binary },
            ],
            PrimaryKeyDef { parts: vec![KeyPart { column: 0, direction: SortDirection::Asc }] },
            "mem",
            Default::default(),
        ))
    }

    #[test]
    fn insert_then_get_round_trips() {
        let schema = int_table("t");
        let mut table = MemTable::new(schema);
        table
            .apply(UpdateOp::Insert {
                row: vec![Value::Integer(1), Value::Text("a".into())],
                on_conflict: OnConflict::Abort,
            })
            .unwrap();
        let row = table.get(&[Value::Integer(1)].to_vec()).unwrap().unwrap();
        assert_eq!(row, vec![Value::Integer(1), Value::Text("a".into())]);
    }

    #[test]
    fn duplicate_pk_aborts_by_default() {
        let schema = int_table("t");
        let mut table = MemTable::new(schema);
        table.apply(UpdateOp::Insert { row: vec![Value::Integer(1), Value::Null], on_conflict: OnConflict::Abort }).unwrap();
        let err = table.apply(UpdateOp::Insert { row: vec![Value::Integer(1), Value::Null], on_conflict: OnConflict::Abort });
        assert!(matches!(err, Err(Error::Constraint { .. })));
    }

    #[test]
    fn delete_removes_row() {
        let schema = int_table("t");
        let mut table = MemTable::new(schema);
        table.apply(UpdateOp::Insert { row: vec![Value::Integer(1), Value::Null], on_conflict: OnConflict::Abort }).unwrap();
        table.apply(UpdateOp::Delete { pk: vec![Value::Integer(1)] }).unwrap();
        assert_eq!(table.get(&[Value::Integer(1)].to_vec()).unwrap(), None);
    }
}
