//! The plan-node tree the SQL execution pipeline compiles SQL text down to,
//! and the scalar expression language pipelined operators evaluate through
//! the row-context stack (`crate::row::RowBinding`).
//!
//! Grounded on the teacher's `planner.rs`/`query_processor.rs` pair (a flat
//! `ExecutionPlan` enum matched over by a single executor), generalized
//! from the teacher's fixed handful of scan/filter/project shapes into a
//! full relational node set plus a typed scalar expression tree with
//! plan-time type specialization instead of the teacher's per-row
//! `Expression::evaluate` dynamic dispatch.

pub mod emit;

use crate::dml::ReturningProjection;
use crate::row::{AttributeId, RowDescriptor};
use crate::schema::TableSchema;
use crate::value::{Collation, Value};
use crate::vtab::{Constraint, FilterDescriptor, OnConflict};
use std::rc::Rc;

/// A binary comparison or arithmetic operator a scalar `Expr::BinaryOp`
/// applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

/// The plan-time specialization an emitted `BinaryOp` selects: chosen once
/// when the expression is built, from the declared logical types of its
/// operands, so evaluation never re-inspects `Value` variants to decide how
/// to compare or coerce — the per-row loop just follows the chosen path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    /// Both operands are numeric columns/literals: compare/arithmetic
    /// operates on the numeric value directly, no temporal or text checks.
    Numeric,
    /// Both operands are text under the same declared collation.
    Text(Collation),
    /// Anything else: go through `Value::compare`'s generic coercion.
    Generic,
}

/// A scalar expression, evaluated against whatever row is currently bound
/// on the `RowBinding` scope chain.
#[derive(Debug, Clone)]
pub enum Expr {
    Column(AttributeId),
    Literal(Value),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `IS [NOT] <expr>`: NULL is an ordinary value here, unlike every
    /// other comparison.
    Is { left: Box<Expr>, right: Box<Expr>, negated: bool },
    BinaryOp { op: BinaryOp, left: Box<Expr>, right: Box<Expr>, kind: ScalarKind },
}

impl Expr {
    /// Evaluates this expression against the innermost row bound on
    /// `binding`. Three-valued logic: AND/OR short-circuit on a
    /// determining operand before NULL propagates; every other operator
    /// returns NULL if either side is NULL.
    pub fn eval(&self, binding: &crate::row::RowBinding) -> crate::error::Result<Value> {
        match self {
            Expr::Column(attr) => Ok(binding.lookup(*attr).unwrap_or(Value::Null)),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Not(e) => {
                let v = e.eval(binding)?;
                Ok(match v.as_bool() {
                    None => Value::Null,
                    Some(b) => Value::Boolean(!b),
                })
            }
            Expr::And(l, r) => {
                let lv = l.eval(binding)?;
                if lv.as_bool() == Some(false) {
                    return Ok(Value::Boolean(false));
                }
                let rv = r.eval(binding)?;
                if rv.as_bool() == Some(false) {
                    return Ok(Value::Boolean(false));
                }
                match (lv.as_bool(), rv.as_bool()) {
                    (Some(a), Some(b)) => Ok(Value::Boolean(a && b)),
                    _ => Ok(Value::Null),
                }
            }
            Expr::Or(l, r) => {
                let lv = l.eval(binding)?;
                if lv.as_bool() == Some(true) {
                    return Ok(Value::Boolean(true));
                }
                let rv = r.eval(binding)?;
                if rv.as_bool() == Some(true) {
                    return Ok(Value::Boolean(true));
                }
                match (lv.as_bool(), rv.as_bool()) {
                    (Some(a), Some(b)) => Ok(Value::Boolean(a || b)),
                    _ => Ok(Value::Null),
                }
            }
            Expr::Is { left, right, negated } => {
                let lv = left.eval(binding)?;
                let rv = right.eval(binding)?;
                let collation = Collation::Binary;
                let same = lv.is_same_as(&rv, collation);
                Ok(Value::Boolean(if *negated { !same } else { same }))
            }
            Expr::BinaryOp { op, left, right, kind } => {
                let lv = left.eval(binding)?;
                let rv = right.eval(binding)?;
                eval_binary(*op, &lv, &rv, *kind)
            }
        }
    }
}

fn eval_binary(op: BinaryOp, lv: &Value, rv: &Value, kind: ScalarKind) -> crate::error::Result<Value> {
    if is_comparison(op) {
        let collation = match kind {
            ScalarKind::Text(c) => c,
            _ => Collation::Binary,
        };
        let Some(ordering) = lv.compare(rv, collation) else { return Ok(Value::Null) };
        let result = match op {
            BinaryOp::Eq => ordering.is_eq(),
            BinaryOp::Ne => !ordering.is_eq(),
            BinaryOp::Lt => ordering.is_lt(),
            BinaryOp::Le => ordering.is_le(),
            BinaryOp::Gt => ordering.is_gt(),
            BinaryOp::Ge => ordering.is_ge(),
            _ => unreachable!("arithmetic handled below"),
        };
        return Ok(Value::Boolean(result));
    }
    if lv.is_null() || rv.is_null() {
        return Ok(Value::Null);
    }
    let (a, b) = (as_f64(lv), as_f64(rv));
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(crate::error::Error::constraint("division by zero"));
            }
            a / b
        }
        _ => unreachable!("comparison handled above"),
    };
    Ok(match kind {
        ScalarKind::Numeric if matches!(lv, Value::Integer(_)) && matches!(rv, Value::Integer(_)) && result.fract() == 0.0 => {
            Value::Integer(result as i64)
        }
        _ => Value::Real(result),
    })
}

fn is_comparison(op: BinaryOp) -> bool {
    matches!(op, BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge)
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Integer(i) => *i as f64,
        Value::BigInt(i) => *i as f64,
        Value::Real(r) => *r,
        _ => f64::NAN,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    UnionAll,
    Intersect,
    Except,
}

/// Sort/Limit/set-op nodes operate positionally on their input's already
/// materialized row shape — they need no expression evaluation, so unlike
/// `Filter`/`Project`/`Join`/`Aggregate` they carry a plain column index
/// rather than an `AttributeId` looked up through the row-context stack.
#[derive(Debug, Clone, Copy)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
    pub collation: Collation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct AggregateExpr {
    pub kind: AggregateKind,
    /// `None` only for `COUNT(*)`.
    pub input: Option<Expr>,
}

/// A resolved DML target: the table's schema plus its qualified name, used
/// by the emitter to look up the right overlay.
#[derive(Debug, Clone)]
pub struct TableTarget {
    pub schema: Rc<TableSchema>,
}

impl TableTarget {
    pub fn key(&self) -> (String, String) {
        self.schema.qualified_name.clone()
    }
}

/// One node of the relational plan tree. `RowDescriptor`s are assigned once
/// at plan-build time; `descriptor` fields bind a node's output row under
/// the attribute ids its parent's expressions reference.
#[derive(Debug, Clone)]
pub enum PlanNode {
    Scan { target: TableTarget, descriptor: RowDescriptor, filter: FilterDescriptor },
    Filter { input: Box<PlanNode>, descriptor: RowDescriptor, predicate: Expr },
    Project { input: Box<PlanNode>, descriptor: RowDescriptor, exprs: Vec<Expr>, output_descriptor: RowDescriptor },
    Join { left: Box<PlanNode>, right: Box<PlanNode>, kind: JoinKind, descriptor: RowDescriptor, predicate: Expr, right_width: usize },
    Aggregate {
        input: Box<PlanNode>,
        descriptor: RowDescriptor,
        group_by: Vec<Expr>,
        aggregates: Vec<AggregateExpr>,
        having: Option<Expr>,
        having_descriptor: RowDescriptor,
    },
    Sort { input: Box<PlanNode>, keys: Vec<SortKey> },
    Limit { input: Box<PlanNode>, limit: Option<usize>, offset: usize },
    /// Materializes `query` (and, for a recursive CTE, iterates `recursive`
    /// against the accumulated result until a fixed point) and binds the
    /// result under `name` for `CteRef` nodes within `body`.
    Cte { name: String, query: Box<PlanNode>, recursive: Option<Box<PlanNode>>, body: Box<PlanNode> },
    CteRef { name: String },
    SetOp { left: Box<PlanNode>, right: Box<PlanNode>, kind: SetOpKind },
    Insert {
        target: TableTarget,
        descriptor: RowDescriptor,
        rows: Vec<Vec<Expr>>,
        on_conflict: OnConflict,
        returning: Option<ReturningProjection>,
        /// CHECK constraints applicable to `INSERT`, bound against the
        /// freshly constructed row under `descriptor` before it reaches the
        /// overlay; a `false` result raises `Error::constraint`, matching
        /// §4.5's op-mask on `CheckConstraint`.
        checks: Vec<Expr>,
    },
    Update {
        target: TableTarget,
        source: Box<PlanNode>,
        descriptor: RowDescriptor,
        assignments: Vec<(usize, Expr)>,
        returning: Option<ReturningProjection>,
        /// CHECK constraints applicable to `UPDATE`, bound against the NEW
        /// row under `descriptor` (same column positions as the OLD row it
        /// replaces).
        checks: Vec<Expr>,
    },
    Delete { target: TableTarget, source: Box<PlanNode>, descriptor: RowDescriptor, returning: Option<ReturningProjection> },
    Begin,
    Commit,
    Rollback,
    Savepoint { name: Option<String> },
    Release { name: Option<String> },
    RollbackTo { name: Option<String> },
}

/// Re-exports `Constraint`/`FilterDescriptor` for plan-building code that
/// only imports this module.
pub use crate::vtab::ConstraintOp;
pub type PlanConstraint = Constraint;
