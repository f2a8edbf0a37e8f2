//! The facade tying the storage, schema, transaction, and execution layers
//! together: `Database` owns the catalog, the live table instances, and the
//! shared event/transaction machinery; `Connection` is a per-connection
//! handle with its own isolation overlays and transaction state, the thing
//! `execute` actually runs SQL text against.
//!
//! Grounded on the teacher's top-level `Engine`/`Database` pair (a shared
//! catalog plus storage engine, opened per connection through a thin
//! handle), generalized with a SQL binder that resolves the nom parser's
//! unresolved column names against a table's schema before handing a typed
//! plan tree to the scheduler.

use crate::dml::{ReturningColumn, ReturningProjection, RowHalf};
use crate::error::{Error, Result};
use crate::events::{EventAggregator, SchemaChangeEvent};
use crate::overlay::IsolatedTable;
use crate::parser::{
    self, ColumnConstraint, CompoundOp, CompoundSelect, CreateIndexStatement, CreateTableStatement, DataType,
    DeleteStatement, DropIndexStatement, DropTableStatement, InsertStatement, JoinType, OrderDirection, RawExpr,
    RawOp, ReturningClause, ReturningItem, SelectColumns, SelectStatement, Statement, TableConstraint,
    UpdateStatement,
};
use crate::plan::emit::emit_program;
use crate::plan::{AggregateExpr, AggregateKind, BinaryOp, Expr, JoinKind, PlanNode, ScalarKind, SetOpKind, SortKey, TableTarget};
use crate::program::{InstructionOutput, Scheduler};
use crate::row::{AttributeId, Row, RowDescriptor};
use crate::schema::{
    Assertion, CheckConstraint, ColumnDef, KeyPart, LogicalType, OpMask, PrimaryKeyDef, SchemaManager,
    SchemaManagerConfig, SecondaryIndexDef, SortDirection, TableSchema, MAIN_SCHEMA,
};
use crate::txn::{ConnectionTxn, DeferredConstraint, OverlayMap, TransactionCoordinator};
use crate::value::{Collation, Value};
use crate::vtab::{FilterDescriptor, MemTableModule, OnConflict, SharedTable, VtabModule};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Ambient configuration for a `Database`: currently just the catalog's own
/// module/nullability defaults. Kept as its own type (rather than folding
/// `SchemaManagerConfig` fields in directly) so a future on-disk-backed
/// module or a second storage tier has somewhere to add its own knobs
/// without breaking this one's field list.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub schema: SchemaManagerConfig,
}

/// State shared by every connection opened against one `Database`: the
/// catalog, the live table instances backing it, the event bus, and the
/// transaction coordinator. Held behind an `Rc` so `Database::connect`
/// handles stay cheap.
struct Shared {
    schema: RefCell<SchemaManager>,
    tables: RefCell<HashMap<(String, String), SharedTable>>,
    events: EventAggregator,
    coordinator: TransactionCoordinator,
}

pub struct Database {
    shared: Rc<Shared>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new(DatabaseConfig::default())
    }
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Self {
        let mut schema = SchemaManager::new(config.schema);
        schema.register_module(Rc::new(MemTableModule));
        Self {
            shared: Rc::new(Shared {
                schema: RefCell::new(schema),
                tables: RefCell::new(HashMap::new()),
                events: EventAggregator::new(),
                coordinator: TransactionCoordinator::new(),
            }),
        }
    }

    /// Opens a new connection: its own overlay map and transaction state,
    /// sharing the catalog and table instances with every other connection.
    pub fn connect(&self) -> Connection {
        Connection { shared: self.shared.clone(), overlays: Rc::new(RefCell::new(OverlayMap::new())), txn: ConnectionTxn::new() }
    }

    pub fn events(&self) -> EventAggregator {
        self.shared.events.clone()
    }

    /// Registers a storage module beyond the built-in `mem` one, available
    /// to subsequent `CREATE TABLE ... USING <name>` statements.
    pub fn register_module(&self, module: Rc<dyn VtabModule>) {
        self.shared.schema.borrow_mut().register_module(module);
    }

    /// Registers a cross-table assertion, evaluated against every commit
    /// that touches one of `assertion`'s tables.
    pub fn register_assertion(&self, assertion: Assertion) {
        self.shared.schema.borrow_mut().register_assertion(assertion);
    }
}

/// The outcome of running one statement through a `Connection`.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Rows(Vec<Row>),
    RowsAffected(usize),
    /// The depth the coordinator assigned a freshly opened savepoint.
    Savepoint(u32),
}

/// A connection-scoped handle: one transaction state, one set of isolation
/// overlays, shared schema/table/event state with every other connection
/// opened on the same `Database`.
pub struct Connection {
    shared: Rc<Shared>,
    overlays: Rc<RefCell<OverlayMap>>,
    txn: ConnectionTxn,
}

impl Connection {
    pub fn in_explicit_transaction(&self) -> bool {
        self.txn.in_explicit_transaction()
    }

    pub fn events(&self) -> EventAggregator {
        self.shared.events.clone()
    }

    /// Queues a deferred row constraint, checked once at this connection's
    /// next coordinated commit (§4.6 step 2), after global assertions and
    /// before any overlay flushes. A `ROLLBACK TO` undoing the savepoint
    /// layer open when this was pushed discards it along with that layer's
    /// writes.
    pub fn push_deferred_constraint(&self, constraint: DeferredConstraint) {
        self.shared.coordinator.push_deferred_constraint(constraint);
    }

    /// Parses and runs one SQL statement: DDL executes immediately against
    /// the catalog, transaction-control statements drive the coordinator,
    /// everything else is bound to a plan tree and run through the
    /// scheduler under the autocommit/explicit policy (§7): an autocommit
    /// statement that fails rolls itself back; inside an explicit
    /// transaction only a commit-time constraint failure forces a rollback,
    /// everything else is left for the caller to retry or roll back.
    pub fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        let statement = parser::parse_sql(sql).map_err(Error::syntax)?;
        self.execute_statement(statement)
    }

    fn execute_statement(&mut self, statement: Statement) -> Result<QueryResult> {
        match statement {
            Statement::Begin => {
                self.shared.coordinator.begin(&mut self.txn)?;
                Ok(QueryResult::RowsAffected(0))
            }
            Statement::Commit => self.commit(),
            Statement::Rollback => self.rollback(),
            Statement::Savepoint(name) => {
                let depth = self.shared.coordinator.savepoint(&mut self.txn, name, &self.overlays.borrow(), &self.shared.events);
                Ok(QueryResult::Savepoint(depth))
            }
            Statement::Release(name) => {
                let depth = if name.is_none() { Some(self.txn.savepoint_depth() as u32) } else { None };
                self.shared.coordinator.release(&mut self.txn, name.as_deref(), depth, &self.shared.events)?;
                Ok(QueryResult::RowsAffected(0))
            }
            Statement::RollbackTo(name) => {
                let depth = if name.is_none() { Some(self.txn.savepoint_depth() as u32) } else { None };
                self.shared.coordinator.rollback_to(&mut self.txn, name.as_deref(), depth, &mut self.overlays.borrow_mut(), &self.shared.events)?;
                Ok(QueryResult::RowsAffected(0))
            }
            Statement::CreateTable(stmt) => self.execute_create_table(stmt),
            Statement::DropTable(stmt) => self.execute_drop_table(stmt),
            Statement::CreateIndex(stmt) => self.execute_create_index(stmt),
            Statement::DropIndex(stmt) => self.execute_drop_index(stmt),
            stmt @ (Statement::Select(_) | Statement::SetOp(_) | Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_)) => {
                self.execute_query(stmt)
            }
        }
    }

    /// Runs a query/DML statement under the autocommit policy: every
    /// statement briefly opens its own coordinator-tracked transaction (even
    /// one already inside an explicit transaction just nests under it, since
    /// `commit`/`begin` below only fire when `autocommit` is true), so the
    /// same begin/commit/rollback path serves both cases.
    fn execute_query(&mut self, statement: Statement) -> Result<QueryResult> {
        let autocommit = !self.txn.in_explicit_transaction();
        if autocommit {
            self.shared.coordinator.begin(&mut self.txn)?;
        }
        let outcome = self.run_statement_plan(&statement);
        match outcome {
            Ok(result) => {
                if autocommit {
                    if let Err(err) = self.shared.coordinator.commit(
                        &mut self.txn,
                        &mut self.overlays.borrow_mut(),
                        &self.shared.events,
                        &self.shared.schema.borrow(),
                    ) {
                        let _ = self.shared.coordinator.rollback(&mut self.txn, &mut self.overlays.borrow_mut(), &self.shared.events);
                        return Err(err);
                    }
                }
                Ok(result)
            }
            Err(err) => {
                if autocommit || err.is_commit_time_constraint() {
                    let _ = self.shared.coordinator.rollback(&mut self.txn, &mut self.overlays.borrow_mut(), &self.shared.events);
                }
                Err(err)
            }
        }
    }

    fn commit(&mut self) -> Result<QueryResult> {
        if !self.txn.in_explicit_transaction() {
            return Err(Error::misuse("not in a transaction"));
        }
        match self.shared.coordinator.commit(&mut self.txn, &mut self.overlays.borrow_mut(), &self.shared.events, &self.shared.schema.borrow()) {
            Ok(()) => Ok(QueryResult::RowsAffected(0)),
            Err(err) => {
                let _ = self.shared.coordinator.rollback(&mut self.txn, &mut self.overlays.borrow_mut(), &self.shared.events);
                Err(err)
            }
        }
    }

    fn rollback(&mut self) -> Result<QueryResult> {
        if !self.txn.in_explicit_transaction() {
            return Err(Error::misuse("not in a transaction"));
        }
        self.shared.coordinator.rollback(&mut self.txn, &mut self.overlays.borrow_mut(), &self.shared.events)?;
        Ok(QueryResult::RowsAffected(0))
    }

    fn run_statement_plan(&mut self, statement: &Statement) -> Result<QueryResult> {
        let plan = self.bind_statement(statement)?;
        self.ensure_overlays_for_plan(&plan)?;
        let program = emit_program(plan, self.overlays.clone(), self.shared.events.clone());
        let output = Scheduler::new().run(program)?;
        Ok(match output {
            InstructionOutput::Rows(rows) => QueryResult::Rows(rows),
            InstructionOutput::RowCount(n) => QueryResult::RowsAffected(n),
            InstructionOutput::Unit | InstructionOutput::Value(_) => QueryResult::RowsAffected(0),
        })
    }

    fn bind_statement(&self, statement: &Statement) -> Result<PlanNode> {
        let schema = self.shared.schema.borrow();
        let mut ctx = BindCtx::new();
        match statement {
            Statement::Select(stmt) => bind_select(stmt, &schema, &mut ctx),
            Statement::SetOp(compound) => bind_compound(compound, &schema, &mut ctx),
            Statement::Insert(stmt) => bind_insert(stmt, &schema, &mut ctx),
            Statement::Update(stmt) => bind_update(stmt, &schema, &mut ctx),
            Statement::Delete(stmt) => bind_delete(stmt, &schema, &mut ctx),
            _ => Err(Error::internal("statement does not lower to a plan tree")),
        }
    }

    /// Lazily opens this connection's overlay on every table the plan
    /// references, so a connection never shares an `IsolatedTable` instance
    /// with another connection even though both wrap the same `SharedTable`.
    fn ensure_overlays_for_plan(&mut self, plan: &PlanNode) -> Result<()> {
        let mut targets = Vec::new();
        collect_targets(plan, &mut targets);
        for key in targets {
            if self.overlays.borrow().contains_key(&key) {
                continue;
            }
            let table = self
                .shared
                .tables
                .borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::schema(format!("no such table: {}.{}", key.0, key.1)))?;
            self.overlays.borrow_mut().insert(key, IsolatedTable::new(table));
        }
        Ok(())
    }

    /// `CREATE TABLE`: builds the declared schema, publishes it through the
    /// catalog, stores the freshly created table instance, and (per §4.4)
    /// records the schema-change event directly rather than through any
    /// connection's overlay — DDL is not isolated the way row data is.
    fn execute_create_table(&mut self, stmt: CreateTableStatement) -> Result<QueryResult> {
        let schema_name = MAIN_SCHEMA.to_string();
        let unique_columns: Vec<String> = stmt
            .columns
            .iter()
            .filter(|c| c.constraints.iter().any(|cc| matches!(cc, ColumnConstraint::Unique)))
            .map(|c| c.name.clone())
            .collect();
        let config = self.shared.schema.borrow().config().clone();
        let table_schema = build_create_table_schema(&schema_name, &stmt, &config)?;
        let table_name = table_schema.table_name().to_string();
        let (_, instance) = self.shared.schema.borrow_mut().create_table(&schema_name, table_schema)?;
        let table_rc: SharedTable = Rc::new(RefCell::new(instance));
        self.shared.tables.borrow_mut().insert((schema_name.clone(), table_name.clone()), table_rc.clone());

        for column_name in unique_columns {
            let mut table_ref = table_rc.borrow_mut();
            let column = table_ref
                .schema()
                .column_position(&column_name)
                .ok_or_else(|| Error::schema(format!("no such column: {column_name}")))?;
            let collation = table_ref.schema().columns[column].collation;
            let index = SecondaryIndexDef {
                name: format!("{table_name}_{column_name}_unique"),
                parts: vec![(KeyPart { column, direction: SortDirection::Asc }, collation)],
                unique: true,
            };
            self.shared.schema.borrow_mut().create_index(&schema_name, &table_name, index, &mut **table_ref)?;
        }

        self.shared.events.record_schema_change(SchemaChangeEvent { schema: schema_name, object_name: table_name, ddl: None, remote: false });
        self.flush_ddl_event()
    }

    fn execute_drop_table(&mut self, stmt: DropTableStatement) -> Result<QueryResult> {
        let schema_name = MAIN_SCHEMA.to_string();
        let table_name = stmt.table.to_ascii_lowercase();
        self.shared.schema.borrow_mut().drop_table(&schema_name, &table_name, stmt.if_exists)?;
        let key = (schema_name.clone(), table_name.clone());
        self.shared.tables.borrow_mut().remove(&key);
        self.overlays.borrow_mut().remove(&key);
        self.shared.events.record_schema_change(SchemaChangeEvent { schema: schema_name, object_name: table_name, ddl: None, remote: false });
        self.flush_ddl_event()
    }

    fn execute_create_index(&mut self, stmt: CreateIndexStatement) -> Result<QueryResult> {
        let schema_name = MAIN_SCHEMA.to_string();
        let table_name = stmt.table_name.to_ascii_lowercase();
        let existing = self.shared.schema.borrow().resolve_table(Some(&schema_name), &table_name)?;
        let column = existing
            .column_position(&stmt.column_name)
            .ok_or_else(|| Error::schema(format!("no such column: {}", stmt.column_name)))?;
        let index = SecondaryIndexDef {
            name: stmt.index_name.clone(),
            parts: vec![(KeyPart { column, direction: SortDirection::Asc }, existing.columns[column].collation)],
            unique: stmt.unique,
        };
        let key = (schema_name.clone(), table_name.clone());
        let table_rc = self.shared.tables.borrow().get(&key).cloned().ok_or_else(|| Error::internal("table instance missing from registry"))?;
        {
            let mut table_ref = table_rc.borrow_mut();
            self.shared.schema.borrow_mut().create_index(&schema_name, &table_name, index, &mut **table_ref)?;
        }
        self.shared.events.record_schema_change(SchemaChangeEvent { schema: schema_name, object_name: stmt.index_name, ddl: None, remote: false });
        self.flush_ddl_event()
    }

    fn execute_drop_index(&mut self, stmt: DropIndexStatement) -> Result<QueryResult> {
        let schema_name = MAIN_SCHEMA.to_string();
        let table_name = {
            let schema = self.shared.schema.borrow();
            let mut found = None;
            for table in schema.tables_in(&schema_name)? {
                if table.index_named(&stmt.index_name).is_some() {
                    found = Some(table.table_name().to_string());
                    break;
                }
            }
            found
        };
        let table_name = match table_name {
            Some(name) => name,
            None if stmt.if_exists => return self.flush_ddl_event(),
            None => return Err(Error::schema(format!("no such index: {}", stmt.index_name))),
        };
        let key = (schema_name.clone(), table_name.clone());
        let table_rc = self.shared.tables.borrow().get(&key).cloned().ok_or_else(|| Error::internal("table instance missing from registry"))?;
        table_rc.borrow_mut().drop_index(&stmt.index_name)?;
        self.shared.schema.borrow_mut().drop_index(&schema_name, &table_name, &stmt.index_name, stmt.if_exists)?;
        self.shared.events.record_schema_change(SchemaChangeEvent { schema: schema_name, object_name: stmt.index_name, ddl: None, remote: false });
        self.flush_ddl_event()
    }

    /// DDL is not buffered in this connection's overlay (there is nothing to
    /// flush — the catalog mutation already happened), but its notification
    /// event still rides the same layered event stream as row changes: in
    /// autocommit it fires immediately, inside an explicit transaction it
    /// waits for `COMMIT`/`ROLLBACK` like any other pending event.
    fn flush_ddl_event(&mut self) -> Result<QueryResult> {
        if !self.txn.in_explicit_transaction() {
            self.shared.events.commit();
        }
        Ok(QueryResult::RowsAffected(0))
    }
}

fn collect_targets(plan: &PlanNode, out: &mut Vec<(String, String)>) {
    match plan {
        PlanNode::Scan { target, .. } => out.push(target.key()),
        PlanNode::Filter { input, .. }
        | PlanNode::Project { input, .. }
        | PlanNode::Sort { input, .. }
        | PlanNode::Limit { input, .. }
        | PlanNode::Aggregate { input, .. } => collect_targets(input, out),
        PlanNode::Join { left, right, .. } | PlanNode::SetOp { left, right, .. } => {
            collect_targets(left, out);
            collect_targets(right, out);
        }
        PlanNode::Cte { query, recursive, body, .. } => {
            collect_targets(query, out);
            if let Some(recursive) = recursive {
                collect_targets(recursive, out);
            }
            collect_targets(body, out);
        }
        PlanNode::CteRef { .. } => {}
        PlanNode::Insert { target, .. } => out.push(target.key()),
        PlanNode::Update { target, source, .. } | PlanNode::Delete { target, source, .. } => {
            out.push(target.key());
            collect_targets(source, out);
        }
        PlanNode::Begin | PlanNode::Commit | PlanNode::Rollback | PlanNode::Savepoint { .. } | PlanNode::Release { .. } | PlanNode::RollbackTo { .. } => {}
    }
}

// ---- the binder: parser::Statement/RawExpr -> plan::PlanNode/Expr ----

/// Per-statement binder state: the monotonic `AttributeId` counter every
/// bound row context draws from, and the common table expressions currently
/// in scope (name, case-preserved, mapped to the synthetic schema its output
/// rows are typed under).
struct BindCtx {
    next_attr: u32,
    ctes: HashMap<String, (String, Rc<TableSchema>)>,
}

impl BindCtx {
    fn new() -> Self {
        Self { next_attr: 0, ctes: HashMap::new() }
    }

    fn fresh_attr(&mut self) -> AttributeId {
        let id = AttributeId(self.next_attr);
        self.next_attr += 1;
        id
    }

    /// Assigns one fresh `AttributeId` per column of `schema`, returning the
    /// descriptor binding those ids to column positions and the name-lookup
    /// map the expression binder resolves bare column references through.
    fn row_context(&mut self, schema: &TableSchema) -> (RowDescriptor, HashMap<String, AttributeId>) {
        let mut descriptor = HashMap::new();
        let mut attrs = HashMap::new();
        for (position, column) in schema.columns.iter().enumerate() {
            let attr = self.fresh_attr();
            descriptor.insert(attr, position);
            attrs.insert(column.name.to_ascii_lowercase(), attr);
        }
        (Rc::new(descriptor), attrs)
    }

    fn fresh_descriptor(&mut self, width: usize) -> RowDescriptor {
        let mut descriptor = HashMap::new();
        for position in 0..width {
            descriptor.insert(self.fresh_attr(), position);
        }
        Rc::new(descriptor)
    }
}

/// Resolves one `FROM` target: either a table already registered in the
/// catalog, or (if its name matches a common table expression currently in
/// scope) a reference back to that CTE's accumulated rows.
fn bind_from(mgr: &SchemaManager, ctx: &mut BindCtx, table_name: &str) -> Result<(PlanNode, Rc<TableSchema>, RowDescriptor, HashMap<String, AttributeId>)> {
    if let Some((name, cte_schema)) = ctx.ctes.get(&table_name.to_ascii_lowercase()).cloned() {
        let (descriptor, attrs) = ctx.row_context(&cte_schema);
        Ok((PlanNode::CteRef { name }, cte_schema, descriptor, attrs))
    } else {
        let schema = mgr.resolve_table(None, table_name)?;
        let (descriptor, attrs) = ctx.row_context(&schema);
        let node = PlanNode::Scan { target: TableTarget { schema: schema.clone() }, descriptor: descriptor.clone(), filter: FilterDescriptor::full_scan() };
        Ok((node, schema, descriptor, attrs))
    }
}

/// Binds a chain of `SELECT`s joined by `UNION [ALL]`/`INTERSECT`/`EXCEPT`,
/// left-associative: `((first op rest[0]) op rest[1]) ...`.
fn bind_compound(compound: &CompoundSelect, mgr: &SchemaManager, ctx: &mut BindCtx) -> Result<PlanNode> {
    let mut current = bind_select(&compound.first, mgr, ctx)?;
    for (op, stmt) in &compound.rest {
        let right = bind_select(stmt, mgr, ctx)?;
        let kind = match op {
            CompoundOp::Union => SetOpKind::Union,
            CompoundOp::UnionAll => SetOpKind::UnionAll,
            CompoundOp::Intersect => SetOpKind::Intersect,
            CompoundOp::Except => SetOpKind::Except,
        };
        current = PlanNode::SetOp { left: Box::new(current), right: Box::new(right), kind };
    }
    Ok(current)
}

fn bind_select(stmt: &SelectStatement, mgr: &SchemaManager, ctx: &mut BindCtx) -> Result<PlanNode> {
    let Some(cte) = &stmt.cte else {
        return bind_simple_select(stmt, mgr, ctx);
    };

    let base_table_schema = mgr.resolve_table(None, &cte.base.table)?;
    let output_columns = projected_columns(&cte.base.columns, &base_table_schema)?;
    let synthetic = Rc::new(TableSchema::new(MAIN_SCHEMA, cte.name.clone(), output_columns, PrimaryKeyDef { parts: Vec::new() }, "cte", HashMap::new()));
    ctx.ctes.insert(cte.name.to_ascii_lowercase(), (cte.name.clone(), synthetic));

    let base_plan = bind_simple_select(&cte.base, mgr, ctx)?;
    let recursive_plan = bind_simple_select(&cte.recursive, mgr, ctx)?;
    let body_plan = bind_simple_select(stmt, mgr, ctx)?;

    Ok(PlanNode::Cte { name: cte.name.clone(), query: Box::new(base_plan), recursive: Some(Box::new(recursive_plan)), body: Box::new(body_plan) })
}

/// The column set a CTE's working table is typed under: the projected
/// `SELECT` list of its base term, restricted to plain column references —
/// an expression seed column has no stable name/type for the recursive term
/// or the outer query to bind against.
fn projected_columns(columns: &SelectColumns, table_schema: &TableSchema) -> Result<Vec<ColumnDef>> {
    match columns {
        SelectColumns::Star => Ok(table_schema.columns.clone()),
        SelectColumns::List(exprs) => exprs
            .iter()
            .map(|expr| match expr {
                RawExpr::Column(name) => table_schema
                    .columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
                    .cloned()
                    .ok_or_else(|| Error::schema(format!("no such column: {name}"))),
                _ => Err(Error::schema("a common table expression's seed must project plain columns")),
            })
            .collect(),
    }
}

/// Assigns a fresh row context over the concatenation of `left`'s and
/// `right`'s columns (left's columns first), for a joined row. A name
/// appearing in both schemas resolves to the left side, the same
/// "first match wins" rule `HashMap::entry` gives for free; this is a known
/// simplification (see DESIGN.md) rather than SQL's qualified-name
/// disambiguation.
fn combined_row_context(ctx: &mut BindCtx, left: &TableSchema, right: &TableSchema) -> (RowDescriptor, HashMap<String, AttributeId>) {
    let mut descriptor = HashMap::new();
    let mut attrs = HashMap::new();
    let mut position = 0usize;
    for schema in [left, right] {
        for column in &schema.columns {
            let attr = ctx.fresh_attr();
            descriptor.insert(attr, position);
            attrs.entry(column.name.to_ascii_lowercase()).or_insert(attr);
            position += 1;
        }
    }
    (Rc::new(descriptor), attrs)
}

/// Looks up a column's declared collation for `ORDER BY`, checking the left
/// side of a join before the right.
fn column_collation(name: &str, left: &TableSchema, right: Option<&TableSchema>) -> Collation {
    if let Some(position) = left.column_position(name) {
        return left.columns[position].collation;
    }
    if let Some(right) = right {
        if let Some(position) = right.column_position(name) {
            return right.columns[position].collation;
        }
    }
    Collation::Binary
}

fn aggregate_kind_of(name: &str) -> Option<AggregateKind> {
    match name.to_ascii_uppercase().as_str() {
        "COUNT" => Some(AggregateKind::Count),
        "SUM" => Some(AggregateKind::Sum),
        "AVG" => Some(AggregateKind::Avg),
        "MIN" => Some(AggregateKind::Min),
        "MAX" => Some(AggregateKind::Max),
        _ => None,
    }
}

fn is_aggregate_call(expr: &RawExpr) -> bool {
    matches!(expr, RawExpr::FunctionCall { name, .. } if aggregate_kind_of(name).is_some())
}

fn select_list_has_aggregate(columns: &SelectColumns) -> bool {
    match columns {
        SelectColumns::Star => false,
        SelectColumns::List(exprs) => exprs.iter().any(is_aggregate_call),
    }
}

/// Binds a `SELECT` with no `WITH RECURSIVE` clause: an optional single
/// `JOIN` widens the source row, `WHERE` filters it, `GROUP BY`/aggregate
/// functions in the select list (if either is present) fold it through
/// `PlanNode::Aggregate` with `HAVING` as its post-aggregate filter,
/// `ORDER BY`/`LIMIT`/`OFFSET` operate positionally on whatever row shape is
/// current at that point, and only then does the final projection narrow to
/// the requested list.
fn bind_simple_select(stmt: &SelectStatement, mgr: &SchemaManager, ctx: &mut BindCtx) -> Result<PlanNode> {
    let (mut current, table_schema, mut descriptor, mut attrs) = bind_from(mgr, ctx, &stmt.table)?;
    let mut right_schema: Option<Rc<TableSchema>> = None;

    if let Some(join) = &stmt.join {
        let (right_node, joined_schema, _right_descriptor, _right_attrs) = bind_from(mgr, ctx, &join.table)?;
        let (combined_descriptor, combined_attrs) = combined_row_context(ctx, &table_schema, &joined_schema);
        let predicate = bind_raw_expr(&join.on, &combined_attrs, &table_schema)?;
        let kind = match join.kind {
            JoinType::Inner => JoinKind::Inner,
            JoinType::Left => JoinKind::Left,
        };
        let right_width = joined_schema.column_count();
        current = PlanNode::Join {
            left: Box::new(current),
            right: Box::new(right_node),
            kind,
            descriptor: combined_descriptor.clone(),
            predicate,
            right_width,
        };
        descriptor = combined_descriptor;
        attrs = combined_attrs;
        right_schema = Some(joined_schema);
    }

    if let Some(where_clause) = &stmt.where_clause {
        let predicate = bind_raw_expr(where_clause, &attrs, &table_schema)?;
        current = PlanNode::Filter { input: Box::new(current), descriptor: descriptor.clone(), predicate };
    }

    if !stmt.group_by.is_empty() || select_list_has_aggregate(&stmt.columns) {
        return bind_aggregate_tail(stmt, &table_schema, &descriptor, &attrs, current, ctx);
    }

    if !stmt.order_by.is_empty() {
        let keys = stmt
            .order_by
            .iter()
            .map(|(expr, direction)| {
                let RawExpr::Column(name) = expr else {
                    return Err(Error::syntax("ORDER BY must reference a plain column"));
                };
                let attr = attrs.get(&name.to_ascii_lowercase()).ok_or_else(|| Error::schema(format!("no such column: {name}")))?;
                let column = *descriptor.get(attr).expect("attrs and descriptor agree on every bound column");
                Ok(SortKey { column, descending: *direction == OrderDirection::Desc, collation: column_collation(name, &table_schema, right_schema.as_deref()) })
            })
            .collect::<Result<Vec<_>>>()?;
        current = PlanNode::Sort { input: Box::new(current), keys };
    }

    if stmt.limit.is_some() || stmt.offset.is_some() {
        current = PlanNode::Limit { input: Box::new(current), limit: stmt.limit.map(|n| n as usize), offset: stmt.offset.unwrap_or(0) as usize };
    }

    if let SelectColumns::List(exprs) = &stmt.columns {
        let bound: Vec<Expr> = exprs.iter().map(|expr| bind_raw_expr(expr, &attrs, &table_schema)).collect::<Result<_>>()?;
        let output_descriptor = ctx.fresh_descriptor(bound.len());
        current = PlanNode::Project { input: Box::new(current), descriptor: descriptor.clone(), exprs: bound, output_descriptor };
    }

    Ok(current)
}

/// Walks `expr` collecting every distinct aggregate function call it
/// contains that is not itself a `GROUP BY` expression, in encounter order,
/// deduplicated by raw syntactic equality (no attempt at semantic
/// equivalence — `SUM(x)` and `SUM( x )` parse identically, `SUM(x+0)` does
/// not dedupe against `SUM(x)`).
fn collect_aggregate_raws(expr: &RawExpr, group_exprs: &[RawExpr], out: &mut Vec<RawExpr>) {
    if group_exprs.contains(expr) {
        return;
    }
    if let RawExpr::FunctionCall { name, .. } = expr {
        if aggregate_kind_of(name).is_some() {
            if !out.contains(expr) {
                out.push(expr.clone());
            }
            return;
        }
    }
    match expr {
        RawExpr::Not(inner) => collect_aggregate_raws(inner, group_exprs, out),
        RawExpr::IsNull { expr: inner, .. } => collect_aggregate_raws(inner, group_exprs, out),
        RawExpr::BinaryOp { left, right, .. } => {
            collect_aggregate_raws(left, group_exprs, out);
            collect_aggregate_raws(right, group_exprs, out);
        }
        RawExpr::Column(_) | RawExpr::Literal(_) | RawExpr::FunctionCall { .. } => {}
    }
}

/// `expr`'s position in the aggregate node's output row — group values
/// first (in `GROUP BY` order), then aggregate values (in
/// `collect_aggregate_raws` order) — if it matches one exactly.
fn position_of(expr: &RawExpr, group_exprs: &[RawExpr], aggregate_raws: &[RawExpr]) -> Option<usize> {
    if let Some(index) = group_exprs.iter().position(|g| g == expr) {
        return Some(index);
    }
    aggregate_raws.iter().position(|a| a == expr).map(|index| group_exprs.len() + index)
}

/// Binds an expression evaluated against an aggregate node's *output* row
/// (a `HAVING` predicate, or an `ORDER BY` key on a grouped query): every
/// leaf must either match a `GROUP BY` expression or a known aggregate call
/// (by raw syntactic equality, see `collect_aggregate_raws`); anything else
/// recurses through the ordinary boolean/comparison combinators.
fn bind_post_aggregate_expr(
    expr: &RawExpr,
    group_exprs: &[RawExpr],
    aggregate_raws: &[RawExpr],
    attr_by_position: &HashMap<usize, AttributeId>,
    attrs: &HashMap<String, AttributeId>,
    schema: &TableSchema,
) -> Result<Expr> {
    if let Some(position) = position_of(expr, group_exprs, aggregate_raws) {
        let attr = attr_by_position.get(&position).expect("every group/aggregate position has an attribute");
        return Ok(Expr::Column(*attr));
    }
    match expr {
        RawExpr::Not(inner) => {
            Ok(Expr::Not(Box::new(bind_post_aggregate_expr(inner, group_exprs, aggregate_raws, attr_by_position, attrs, schema)?)))
        }
        RawExpr::IsNull { expr: inner, negated } => Ok(Expr::Is {
            left: Box::new(bind_post_aggregate_expr(inner, group_exprs, aggregate_raws, attr_by_position, attrs, schema)?),
            right: Box::new(Expr::Literal(Value::Null)),
            negated: *negated,
        }),
        RawExpr::BinaryOp { op: RawOp::And, left, right } => Ok(Expr::And(
            Box::new(bind_post_aggregate_expr(left, group_exprs, aggregate_raws, attr_by_position, attrs, schema)?),
            Box::new(bind_post_aggregate_expr(right, group_exprs, aggregate_raws, attr_by_position, attrs, schema)?),
        )),
        RawExpr::BinaryOp { op: RawOp::Or, left, right } => Ok(Expr::Or(
            Box::new(bind_post_aggregate_expr(left, group_exprs, aggregate_raws, attr_by_position, attrs, schema)?),
            Box::new(bind_post_aggregate_expr(right, group_exprs, aggregate_raws, attr_by_position, attrs, schema)?),
        )),
        RawExpr::BinaryOp { op, left, right } => {
            let kind = infer_scalar_kind(left, right, schema);
            let left = bind_post_aggregate_expr(left, group_exprs, aggregate_raws, attr_by_position, attrs, schema)?;
            let right = bind_post_aggregate_expr(right, group_exprs, aggregate_raws, attr_by_position, attrs, schema)?;
            Ok(Expr::BinaryOp { op: map_binary_op(*op), left: Box::new(left), right: Box::new(right), kind })
        }
        RawExpr::Literal(v) => Ok(Expr::Literal(v.clone())),
        RawExpr::Column(name) => Err(Error::syntax(format!("column '{name}' must appear in GROUP BY or be wrapped in an aggregate function"))),
        RawExpr::FunctionCall { name, .. } => Err(Error::syntax(format!("'{name}' is not a recognized aggregate function"))),
    }
}

/// Binds the `GROUP BY`/aggregate tail of a `SELECT` whose source row is
/// already fully assembled (post-`JOIN`, post-`WHERE`) in `input`/
/// `descriptor`/`attrs`. Every select-list item must either be an aggregate
/// function call or structurally match one of the `GROUP BY` expressions —
/// this binder has no notion of "functionally dependent on the group key",
/// so it does not try to allow anything looser. `HAVING` may introduce
/// aggregate calls beyond what the `SELECT` list projects.
fn bind_aggregate_tail(
    stmt: &SelectStatement,
    left_schema: &TableSchema,
    descriptor: &RowDescriptor,
    attrs: &HashMap<String, AttributeId>,
    input: PlanNode,
    ctx: &mut BindCtx,
) -> Result<PlanNode> {
    let select_exprs: Vec<RawExpr> = match &stmt.columns {
        SelectColumns::Star => return Err(Error::syntax("SELECT * cannot be combined with GROUP BY or an aggregate function")),
        SelectColumns::List(exprs) => exprs.clone(),
    };
    let group_exprs = stmt.group_by.clone();

    let mut aggregate_raws: Vec<RawExpr> = Vec::new();
    for expr in &select_exprs {
        collect_aggregate_raws(expr, &group_exprs, &mut aggregate_raws);
    }
    if let Some(having) = &stmt.having {
        collect_aggregate_raws(having, &group_exprs, &mut aggregate_raws);
    }

    let select_positions = select_exprs
        .iter()
        .map(|expr| {
            position_of(expr, &group_exprs, &aggregate_raws)
                .ok_or_else(|| Error::syntax("a grouped query's SELECT list may only reference GROUP BY expressions or aggregate functions"))
        })
        .collect::<Result<Vec<_>>>()?;

    let group_by: Vec<Expr> = group_exprs.iter().map(|e| bind_raw_expr(e, attrs, left_schema)).collect::<Result<_>>()?;
    let aggregates: Vec<AggregateExpr> = aggregate_raws
        .iter()
        .map(|raw| {
            let RawExpr::FunctionCall { name, arg, star } = raw else {
                unreachable!("collect_aggregate_raws only collects FunctionCall nodes")
            };
            let kind = aggregate_kind_of(name).expect("collect_aggregate_raws only collects recognized aggregate names");
            let input_expr = if *star {
                None
            } else {
                let arg = arg.as_ref().ok_or_else(|| Error::syntax(format!("{name} requires an argument")))?;
                Some(bind_raw_expr(arg, attrs, left_schema)?)
            };
            Ok(AggregateExpr { kind, input: input_expr })
        })
        .collect::<Result<_>>()?;

    let aggregate_descriptor = ctx.fresh_descriptor(group_by.len() + aggregates.len());
    let mut attr_by_position: HashMap<usize, AttributeId> = HashMap::new();
    for (&attr, &position) in aggregate_descriptor.iter() {
        attr_by_position.insert(position, attr);
    }

    let having = stmt
        .having
        .as_ref()
        .map(|h| bind_post_aggregate_expr(h, &group_exprs, &aggregate_raws, &attr_by_position, attrs, left_schema))
        .transpose()?;
    let having_descriptor = aggregate_descriptor.clone();

    let mut current = PlanNode::Aggregate {
        input: Box::new(input),
        descriptor: descriptor.clone(),
        group_by,
        aggregates,
        having,
        having_descriptor,
    };

    if !stmt.order_by.is_empty() {
        let keys = stmt
            .order_by
            .iter()
            .map(|(expr, direction)| {
                let position = position_of(expr, &group_exprs, &aggregate_raws)
                    .ok_or_else(|| Error::syntax("ORDER BY on a grouped query must reference a GROUP BY expression or an aggregate function"))?;
                Ok(SortKey { column: position, descending: *direction == OrderDirection::Desc, collation: Collation::Binary })
            })
            .collect::<Result<Vec<_>>>()?;
        current = PlanNode::Sort { input: Box::new(current), keys };
    }

    if stmt.limit.is_some() || stmt.offset.is_some() {
        current = PlanNode::Limit { input: Box::new(current), limit: stmt.limit.map(|n| n as usize), offset: stmt.offset.unwrap_or(0) as usize };
    }

    let projection: Vec<Expr> = select_positions
        .iter()
        .map(|position| Expr::Column(*attr_by_position.get(position).expect("every select position has an attribute")))
        .collect();
    let output_descriptor = ctx.fresh_descriptor(projection.len());
    current = PlanNode::Project { input: Box::new(current), descriptor: aggregate_descriptor, exprs: projection, output_descriptor };
    Ok(current)
}

fn bind_raw_expr(raw: &RawExpr, attrs: &HashMap<String, AttributeId>, schema: &TableSchema) -> Result<Expr> {
    Ok(match raw {
        RawExpr::Column(name) => {
            let attr = attrs.get(&name.to_ascii_lowercase()).ok_or_else(|| Error::schema(format!("no such column: {name}")))?;
            Expr::Column(*attr)
        }
        RawExpr::Literal(value) => Expr::Literal(value.clone()),
        RawExpr::Not(inner) => Expr::Not(Box::new(bind_raw_expr(inner, attrs, schema)?)),
        RawExpr::IsNull { expr, negated } => {
            Expr::Is { left: Box::new(bind_raw_expr(expr, attrs, schema)?), right: Box::new(Expr::Literal(Value::Null)), negated: *negated }
        }
        RawExpr::BinaryOp { op: RawOp::And, left, right } => {
            Expr::And(Box::new(bind_raw_expr(left, attrs, schema)?), Box::new(bind_raw_expr(right, attrs, schema)?))
        }
        RawExpr::BinaryOp { op: RawOp::Or, left, right } => {
            Expr::Or(Box::new(bind_raw_expr(left, attrs, schema)?), Box::new(bind_raw_expr(right, attrs, schema)?))
        }
        RawExpr::BinaryOp { op, left, right } => {
            let kind = infer_scalar_kind(left, right, schema);
            let left = bind_raw_expr(left, attrs, schema)?;
            let right = bind_raw_expr(right, attrs, schema)?;
            Expr::BinaryOp { op: map_binary_op(*op), left: Box::new(left), right: Box::new(right), kind }
        }
        RawExpr::FunctionCall { name, .. } => {
            return Err(Error::syntax(format!("{name}(...) is only valid as a SELECT-list aggregate in a grouped query")));
        }
    })
}

fn map_binary_op(op: RawOp) -> BinaryOp {
    match op {
        RawOp::Eq => BinaryOp::Eq,
        RawOp::Ne => BinaryOp::Ne,
        RawOp::Lt => BinaryOp::Lt,
        RawOp::Le => BinaryOp::Le,
        RawOp::Gt => BinaryOp::Gt,
        RawOp::Ge => BinaryOp::Ge,
        RawOp::Add => BinaryOp::Add,
        RawOp::Sub => BinaryOp::Sub,
        RawOp::Mul => BinaryOp::Mul,
        RawOp::Div => BinaryOp::Div,
        RawOp::And | RawOp::Or => unreachable!("AND/OR bind directly to Expr::And/Or"),
    }
}

/// Chooses the plan-time specialization a binary operator evaluates
/// through: numeric when both sides are declared numeric columns or numeric
/// literals, same-collation text when both are text, generic otherwise.
fn infer_scalar_kind(left: &RawExpr, right: &RawExpr, schema: &TableSchema) -> ScalarKind {
    fn declared_type(expr: &RawExpr, schema: &TableSchema) -> Option<(LogicalType, Collation)> {
        match expr {
            RawExpr::Column(name) => schema.column_position(name).map(|i| (schema.columns[i].logical_type, schema.columns[i].collation)),
            RawExpr::Literal(Value::Integer(_) | Value::BigInt(_) | Value::Real(_)) => Some((LogicalType::Real, Collation::Binary)),
            RawExpr::Literal(Value::Text(_)) => Some((LogicalType::Text, Collation::Binary)),
            _ => None,
        }
    }
    let is_numeric = |t: LogicalType| matches!(t, LogicalType::Integer | LogicalType::BigInt | LogicalType::Real);
    match (declared_type(left, schema), declared_type(right, schema)) {
        (Some((lt, _)), Some((rt, _))) if is_numeric(lt) && is_numeric(rt) => ScalarKind::Numeric,
        (Some((LogicalType::Text, lc)), Some((LogicalType::Text, _))) => ScalarKind::Text(lc),
        _ => ScalarKind::Generic,
    }
}

/// NOT NULL checks for every non-nullable column plus every schema-declared
/// CHECK constraint applicable to `op`, all bound against the same row
/// context (`attrs`) the DML node's `descriptor` exposes.
fn build_checks(schema: &TableSchema, attrs: &HashMap<String, AttributeId>, applies: impl Fn(&OpMask) -> bool) -> Result<Vec<Expr>> {
    let mut checks = Vec::new();
    for column in &schema.columns {
        if column.nullable {
            continue;
        }
        let attr = attrs.get(&column.name.to_ascii_lowercase()).expect("row_context registers every column");
        checks.push(Expr::Is { left: Box::new(Expr::Column(*attr)), right: Box::new(Expr::Literal(Value::Null)), negated: true });
    }
    for check in &schema.checks {
        if !applies(&check.applies_to) {
            continue;
        }
        let raw = parser::parse_expr_standalone(&check.expression_text).map_err(Error::syntax)?;
        checks.push(bind_raw_expr(&raw, attrs, schema)?);
    }
    Ok(checks)
}

fn build_returning(schema: &TableSchema, default_half: RowHalf, clause: &ReturningClause) -> Result<ReturningProjection> {
    let mut columns = Vec::new();
    for item in &clause.items {
        match item {
            ReturningItem::Star => columns.extend((0..schema.column_count()).map(|column| ReturningColumn { half: default_half, column })),
            ReturningItem::OldStar => columns.extend((0..schema.column_count()).map(|column| ReturningColumn { half: RowHalf::Old, column })),
            ReturningItem::NewStar => columns.extend((0..schema.column_count()).map(|column| ReturningColumn { half: RowHalf::New, column })),
            ReturningItem::Column(name) => {
                let column = schema.column_position(name).ok_or_else(|| Error::schema(format!("no such column: {name}")))?;
                columns.push(ReturningColumn { half: default_half, column });
            }
            ReturningItem::OldColumn(name) => {
                let column = schema.column_position(name).ok_or_else(|| Error::schema(format!("no such column: {name}")))?;
                columns.push(ReturningColumn { half: RowHalf::Old, column });
            }
            ReturningItem::NewColumn(name) => {
                let column = schema.column_position(name).ok_or_else(|| Error::schema(format!("no such column: {name}")))?;
                columns.push(ReturningColumn { half: RowHalf::New, column });
            }
        }
    }
    Ok(ReturningProjection { columns })
}

fn bind_insert(stmt: &InsertStatement, mgr: &SchemaManager, ctx: &mut BindCtx) -> Result<PlanNode> {
    let schema = mgr.resolve_table(None, &stmt.table)?;
    let target = TableTarget { schema: schema.clone() };
    let (descriptor, attrs) = ctx.row_context(&schema);

    let columns: Vec<usize> = if stmt.columns.is_empty() {
        (0..schema.column_count()).collect()
    } else {
        stmt.columns
            .iter()
            .map(|name| schema.column_position(name).ok_or_else(|| Error::schema(format!("no such column: {name}"))))
            .collect::<Result<Vec<_>>>()?
    };
    for value_row in &stmt.values {
        if value_row.len() != columns.len() {
            return Err(Error::schema(format!("expected {} values, found {}", columns.len(), value_row.len())));
        }
    }

    let mut rows = Vec::with_capacity(stmt.values.len());
    for value_row in &stmt.values {
        let mut exprs: Vec<Expr> = schema.columns.iter().map(|c| Expr::Literal(c.default.clone().unwrap_or(Value::Null))).collect();
        for (slot, &column) in columns.iter().enumerate() {
            exprs[column] = Expr::Literal(value_row[slot].clone());
        }
        rows.push(exprs);
    }

    let checks = build_checks(&schema, &attrs, |mask| mask.insert)?;
    let returning = stmt.returning.as_ref().map(|clause| build_returning(&schema, RowHalf::New, clause)).transpose()?;
    Ok(PlanNode::Insert { target, descriptor, rows, on_conflict: OnConflict::Abort, returning, checks })
}

fn bind_update(stmt: &UpdateStatement, mgr: &SchemaManager, ctx: &mut BindCtx) -> Result<PlanNode> {
    let schema = mgr.resolve_table(None, &stmt.table)?;
    let target = TableTarget { schema: schema.clone() };
    let (descriptor, attrs) = ctx.row_context(&schema);

    let scan = PlanNode::Scan { target: target.clone(), descriptor: descriptor.clone(), filter: FilterDescriptor::full_scan() };
    let source = match &stmt.where_clause {
        Some(where_clause) => {
            let predicate = bind_raw_expr(where_clause, &attrs, &schema)?;
            PlanNode::Filter { input: Box::new(scan), descriptor: descriptor.clone(), predicate }
        }
        None => scan,
    };

    let assignments = stmt
        .assignments
        .iter()
        .map(|assignment| {
            let column = schema.column_position(&assignment.column).ok_or_else(|| Error::schema(format!("no such column: {}", assignment.column)))?;
            let expr = bind_raw_expr(&assignment.value, &attrs, &schema)?;
            Ok((column, expr))
        })
        .collect::<Result<Vec<_>>>()?;

    let checks = build_checks(&schema, &attrs, |mask| mask.update)?;
    let returning = stmt.returning.as_ref().map(|clause| build_returning(&schema, RowHalf::New, clause)).transpose()?;
    Ok(PlanNode::Update { target, source: Box::new(source), descriptor, assignments, returning, checks })
}

fn bind_delete(stmt: &DeleteStatement, mgr: &SchemaManager, ctx: &mut BindCtx) -> Result<PlanNode> {
    let schema = mgr.resolve_table(None, &stmt.table)?;
    let target = TableTarget { schema: schema.clone() };
    let (descriptor, attrs) = ctx.row_context(&schema);

    let scan = PlanNode::Scan { target: target.clone(), descriptor: descriptor.clone(), filter: FilterDescriptor::full_scan() };
    let source = match &stmt.where_clause {
        Some(where_clause) => {
            let predicate = bind_raw_expr(where_clause, &attrs, &schema)?;
            PlanNode::Filter { input: Box::new(scan), descriptor: descriptor.clone(), predicate }
        }
        None => scan,
    };

    let returning = stmt.returning.as_ref().map(|clause| build_returning(&schema, RowHalf::Old, clause)).transpose()?;
    Ok(PlanNode::Delete { target, source: Box::new(source), descriptor, returning })
}

// ---- CREATE TABLE: parser::CreateTableStatement -> schema::TableSchema ----

fn map_data_type(data_type: &DataType) -> LogicalType {
    match data_type {
        DataType::Integer => LogicalType::Integer,
        DataType::BigInt => LogicalType::BigInt,
        DataType::Real => LogicalType::Real,
        DataType::Text => LogicalType::Text,
        DataType::Boolean => LogicalType::Boolean,
        DataType::Blob => LogicalType::Blob,
    }
}

fn build_create_table_schema(schema_name: &str, stmt: &CreateTableStatement, config: &SchemaManagerConfig) -> Result<TableSchema> {
    let mut columns = Vec::with_capacity(stmt.columns.len());
    let mut pk_columns: Vec<usize> = Vec::new();
    for (position, column) in stmt.columns.iter().enumerate() {
        let declares_not_null = column.constraints.iter().any(|c| matches!(c, ColumnConstraint::NotNull | ColumnConstraint::PrimaryKey));
        let nullable = !declares_not_null && !config.columns_not_null_by_default;
        if column.constraints.iter().any(|c| matches!(c, ColumnConstraint::PrimaryKey)) {
            pk_columns.push(position);
        }
        columns.push(ColumnDef { name: column.name.clone(), logical_type: map_data_type(&column.data_type), nullable, default: None, collation: Collation::Binary });
    }
    for constraint in &stmt.table_constraints {
        if let TableConstraint::PrimaryKey(names) = constraint {
            for name in names {
                let position = columns.iter().position(|c| c.name.eq_ignore_ascii_case(name)).ok_or_else(|| Error::schema(format!("no such column: {name}")))?;
                if !pk_columns.contains(&position) {
                    pk_columns.push(position);
                }
            }
        }
    }
    if pk_columns.is_empty() {
        return Err(Error::schema(format!("table {} has no primary key", stmt.table)));
    }

    let primary_key = PrimaryKeyDef { parts: pk_columns.into_iter().map(|column| KeyPart { column, direction: SortDirection::Asc }).collect() };
    let mut schema = TableSchema::new(schema_name, stmt.table.to_ascii_lowercase(), columns, primary_key, stmt.using_module.clone().unwrap_or_default(), HashMap::new());

    let mut unnamed_checks = 0usize;
    for constraint in &stmt.table_constraints {
        if let TableConstraint::Check { name, predicate } = constraint {
            let expression_text = parser::raw_expr_to_sql(predicate);
            let name = name.clone().unwrap_or_else(|| {
                unnamed_checks += 1;
                format!("check_{unnamed_checks}")
            });
            schema = schema.with_check(CheckConstraint { name, expression_text, applies_to: OpMask::all() });
        }
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn fresh_db() -> Database {
        Database::new(DatabaseConfig::default())
    }

    #[test]
    fn create_insert_select_round_trips() {
        let db = fresh_db();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)").unwrap();
        conn.execute("INSERT INTO t (id, name) VALUES (1, 'alice')").unwrap();
        conn.execute("INSERT INTO t (id, name) VALUES (2, 'bob')").unwrap();
        let result = conn.execute("SELECT * FROM t WHERE id > 0 ORDER BY id DESC").unwrap();
        match result {
            QueryResult::Rows(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0], vec![Value::Integer(2), Value::Text("bob".into())]);
                assert_eq!(rows[1], vec![Value::Integer(1), Value::Text("alice".into())]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn not_null_violation_is_a_constraint_error() {
        let db = fresh_db();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)").unwrap();
        let err = conn.execute("INSERT INTO t (id, name) VALUES (1, NULL)");
        assert!(matches!(err, Err(Error::Constraint { .. })));
    }

    #[test]
    fn autocommit_statement_rolls_back_on_error() {
        let db = fresh_db();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)").unwrap();
        assert!(conn.execute("INSERT INTO t (id) VALUES (1)").is_err());
        let result = conn.execute("SELECT * FROM t").unwrap();
        match result {
            QueryResult::Rows(rows) => assert_eq!(rows.len(), 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn explicit_transaction_rollback_undoes_writes() {
        let db = fresh_db();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        conn.execute("BEGIN").unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)").unwrap();
        conn.execute("ROLLBACK").unwrap();
        let result = conn.execute("SELECT * FROM t").unwrap();
        match result {
            QueryResult::Rows(rows) => assert!(rows.is_empty()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn inner_join_combines_matching_rows() {
        let db = fresh_db();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL)").unwrap();
        conn.execute("CREATE TABLE books (id INTEGER PRIMARY KEY, author_id INTEGER NOT NULL, title TEXT NOT NULL)").unwrap();
        conn.execute("INSERT INTO authors (id, name) VALUES (1, 'ursula')").unwrap();
        conn.execute("INSERT INTO authors (id, name) VALUES (2, 'octavia')").unwrap();
        conn.execute("INSERT INTO books (id, author_id, title) VALUES (10, 1, 'the dispossessed')").unwrap();
        let result = conn.execute("SELECT title, name FROM books JOIN authors ON author_id = id").unwrap();
        match result {
            QueryResult::Rows(rows) => {
                assert_eq!(rows, vec![vec![Value::Text("the dispossessed".into()), Value::Text("ursula".into())]]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn group_by_with_having_filters_aggregated_groups() {
        let db = fresh_db();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE sales (region TEXT NOT NULL, amount INTEGER NOT NULL)").unwrap();
        conn.execute("INSERT INTO sales (region, amount) VALUES ('east', 10)").unwrap();
        conn.execute("INSERT INTO sales (region, amount) VALUES ('east', 20)").unwrap();
        conn.execute("INSERT INTO sales (region, amount) VALUES ('west', 5)").unwrap();
        let result = conn.execute("SELECT region, SUM(amount) FROM sales GROUP BY region HAVING SUM(amount) > 15").unwrap();
        match result {
            QueryResult::Rows(rows) => {
                assert_eq!(rows, vec![vec![Value::Text("east".into()), Value::Integer(30)]]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn union_all_keeps_duplicate_rows_from_both_arms() {
        let db = fresh_db();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)").unwrap();
        conn.execute("INSERT INTO t (id) VALUES (2)").unwrap();
        let result = conn.execute("SELECT id FROM t WHERE id = 1 UNION ALL SELECT id FROM t WHERE id = 1").unwrap();
        match result {
            QueryResult::Rows(rows) => assert_eq!(rows, vec![vec![Value::Integer(1)], vec![Value::Integer(1)]]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn returning_projects_new_row_on_insert() {
        let db = fresh_db();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)").unwrap();
        let result = conn.execute("INSERT INTO t (id, name) VALUES (1, 'alice') RETURNING *").unwrap();
        match result {
            QueryResult::Rows(rows) => assert_eq!(rows, vec![vec![Value::Integer(1), Value::Text("alice".into())]]),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
