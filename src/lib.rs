//! Quereus: an embeddable SQL engine over a pluggable virtual-table layer.
//!
//! A `Database` (see [`database`]) owns a schema catalog, a module
//! registry, a transaction coordinator, and an event aggregator; each
//! `Connection` sees its own committed-plus-own-writes view of every table
//! through a per-connection isolation overlay.

pub mod database;
pub mod dml;
mod error;
pub mod events;
pub mod kv;
mod overlay;
pub mod parser;
pub mod plan;
pub mod program;
mod row;
pub mod schema;
pub mod txn;
mod value;
pub mod vtab;

pub use database::{Database, DatabaseConfig};
pub use error::{Error, Result, StorageError};
pub use row::{AttributeId, Row, RowBinding};
pub use value::{Collation, Value};
