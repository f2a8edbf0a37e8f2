//! Lowers a plan tree into a `Program`: one `Instruction` per plan node,
//! each depending on the instructions emitted for its inputs, per
//! `crate::program`'s dependency-graph contract. A recursive CTE's
//! fixpoint loop is the one place a node's output can't be described as a
//! static dependency edge (the recursive term must be re-run an a priori
//! unknown number of times) — there the driver instruction invokes a freshly
//! emitted subprogram each round, the pattern `crate::program`'s own doc
//! comment calls out for "correlated subquery, recursive CTE step".

use crate::dml::{self, ReturningProjection};
use crate::error::{Error, Result};
use crate::events::{ChangeKind, DataChangeEvent, EventAggregator};
use crate::plan::{AggregateExpr, AggregateKind, Expr, JoinKind, PlanNode, SetOpKind, SortKey, TableTarget};
use crate::program::{Instruction, InstructionOutput, Program, Scheduler};
use crate::row::{Row, RowBinding, RowDescriptor};
use crate::txn::OverlayMap;
use crate::value::{Collation, Value};
use crate::vtab::{FilterDescriptor, OnConflict};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

/// Everything a statement's plan execution needs: the connection's table
/// overlays, its event aggregator, the row-context stack shared by every
/// scalar expression in the statement, and the working set of materialized
/// CTE results built up as `Cte` nodes are entered.
pub struct ExecContext {
    pub overlays: Rc<RefCell<OverlayMap>>,
    pub events: EventAggregator,
    pub binding: Rc<RowBinding>,
    ctes: RefCell<HashMap<String, Vec<Row>>>,
}

impl ExecContext {
    pub fn new(overlays: Rc<RefCell<OverlayMap>>, events: EventAggregator) -> Self {
        Self { overlays, events, binding: Rc::new(RowBinding::new()), ctes: RefCell::new(HashMap::new()) }
    }
}

/// Address of a cte's driver instruction within the instruction list it was
/// emitted into, keyed by cte name, so a sibling `CteRef` can wire a real
/// dependency edge to it.
type CteDrivers = HashMap<String, usize>;

fn push_instruction(
    instructions: &mut Vec<Instruction>,
    label: impl Into<String>,
    depends_on: Vec<usize>,
    run: impl FnOnce(&[InstructionOutput]) -> Result<InstructionOutput> + 'static,
) -> usize {
    instructions.push(Instruction::new(label, depends_on, Box::new(run)));
    instructions.len() - 1
}

fn bind<T>(ctx: &ExecContext, descriptor: &RowDescriptor, row: Row, f: impl FnOnce(&ExecContext) -> Result<T>) -> Result<T> {
    ctx.binding.with_bound(descriptor.clone(), row, || f(ctx))
}

fn rows_equal(a: &Row, b: &Row) -> bool {
    value_slices_equal(a, b)
}

fn value_slices_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.is_same_as(y, Collation::Binary))
}

fn dedup_rows(rows: Vec<Row>) -> Vec<Row> {
    let mut out: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        if !out.iter().any(|existing| rows_equal(existing, &row)) {
            out.push(row);
        }
    }
    out
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Integer(i) => *i as f64,
        Value::BigInt(i) => *i as f64,
        Value::Real(r) => *r,
        _ => f64::NAN,
    }
}

fn compute_aggregate(agg: &AggregateExpr, rows: &[Row], descriptor: &RowDescriptor, ctx: &ExecContext) -> Result<Value> {
    match agg.kind {
        AggregateKind::Count => match &agg.input {
            Some(expr) => {
                let mut count = 0i64;
                for row in rows {
                    let v = bind(ctx, descriptor, row.clone(), |ctx| expr.eval(&ctx.binding))?;
                    if !v.is_null() {
                        count += 1;
                    }
                }
                Ok(Value::Integer(count))
            }
            None => Ok(Value::Integer(rows.len() as i64)),
        },
        AggregateKind::Sum | AggregateKind::Avg => {
            let expr = agg.input.as_ref().ok_or_else(|| Error::internal("SUM/AVG requires an argument"))?;
            let mut sum = 0.0f64;
            let mut count = 0i64;
            for row in rows {
                let v = bind(ctx, descriptor, row.clone(), |ctx| expr.eval(&ctx.binding))?;
                if !v.is_null() {
                    sum += as_f64(&v);
                    count += 1;
                }
            }
            if agg.kind == AggregateKind::Avg {
                Ok(if count == 0 { Value::Null } else { Value::Real(sum / count as f64) })
            } else {
                Ok(Value::Real(sum))
            }
        }
        AggregateKind::Min | AggregateKind::Max => {
            let expr = agg.input.as_ref().ok_or_else(|| Error::internal("MIN/MAX requires an argument"))?;
            let mut best: Option<Value> = None;
            for row in rows {
                let v = bind(ctx, descriptor, row.clone(), |ctx| expr.eval(&ctx.binding))?;
                if v.is_null() {
                    continue;
                }
                best = Some(match best {
                    None => v,
                    Some(current) => {
                        let ordering = current.compare(&v, Collation::Binary).unwrap_or(Ordering::Equal);
                        match agg.kind {
                            AggregateKind::Min => if ordering.is_gt() { v } else { current },
                            AggregateKind::Max => if ordering.is_lt() { v } else { current },
                            _ => unreachable!(),
                        }
                    }
                });
            }
            Ok(best.unwrap_or(Value::Null))
        }
    }
}

/// Evaluates every check against `row` (bound under `descriptor`),
/// rejecting on the first one that evaluates to `false` (NULL, like any
/// other CHECK, passes).
fn enforce_checks(checks: &[Expr], descriptor: &RowDescriptor, row: Row, ctx: &ExecContext) -> Result<()> {
    if checks.is_empty() {
        return Ok(());
    }
    bind(ctx, descriptor, row, |ctx| {
        for check in checks {
            if check.eval(&ctx.binding)?.as_bool() == Some(false) {
                return Err(Error::constraint("CHECK constraint failed"));
            }
        }
        Ok(())
    })
}

// --- Per-node row transforms. Each takes its input(s) already materialized
// (the instruction graph's dependency edges are what supplied them) rather
// than recursing into a nested `PlanNode`. ---

fn eval_scan(target: &TableTarget, filter: &FilterDescriptor, ctx: &ExecContext) -> Result<Vec<Row>> {
    let key = target.key();
    let overlays = ctx.overlays.borrow();
    let table = overlays.get(&key).ok_or_else(|| Error::internal(format!("no open overlay for table {}.{}", key.0, key.1)))?;
    table.scan(filter)?.collect()
}

fn eval_filter(rows: Vec<Row>, descriptor: &RowDescriptor, predicate: &Expr, ctx: &ExecContext) -> Result<Vec<Row>> {
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        let keep = bind(ctx, descriptor, row.clone(), |ctx| predicate.eval(&ctx.binding))?;
        if keep.as_bool() == Some(true) {
            kept.push(row);
        }
    }
    Ok(kept)
}

fn eval_project(rows: Vec<Row>, descriptor: &RowDescriptor, exprs: &[Expr], ctx: &ExecContext) -> Result<Vec<Row>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let values = bind(ctx, descriptor, row, |ctx| exprs.iter().map(|e| e.eval(&ctx.binding)).collect::<Result<Vec<Value>>>())?;
        out.push(values);
    }
    Ok(out)
}

fn eval_join(
    left_rows: Vec<Row>,
    right_rows: Vec<Row>,
    kind: JoinKind,
    descriptor: &RowDescriptor,
    predicate: &Expr,
    right_width: usize,
    ctx: &ExecContext,
) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    for lrow in &left_rows {
        let mut matched = false;
        for rrow in &right_rows {
            let mut combined = lrow.clone();
            combined.extend(rrow.iter().cloned());
            let keep = bind(ctx, descriptor, combined.clone(), |ctx| predicate.eval(&ctx.binding))?;
            if keep.as_bool() == Some(true) {
                matched = true;
                out.push(combined);
            }
        }
        if !matched && kind == JoinKind::Left {
            let mut combined = lrow.clone();
            combined.extend(std::iter::repeat(Value::Null).take(right_width));
            out.push(combined);
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn eval_aggregate(
    rows: Vec<Row>,
    descriptor: &RowDescriptor,
    group_by: &[Expr],
    aggregates: &[AggregateExpr],
    having: Option<&Expr>,
    having_descriptor: &RowDescriptor,
    ctx: &ExecContext,
) -> Result<Vec<Row>> {
    let mut groups: Vec<(Vec<Value>, Vec<Row>)> = Vec::new();
    for row in rows {
        let key = bind(ctx, descriptor, row.clone(), |ctx| group_by.iter().map(|e| e.eval(&ctx.binding)).collect::<Result<Vec<Value>>>())?;
        match groups.iter_mut().find(|(k, _)| value_slices_equal(k, &key)) {
            Some(entry) => entry.1.push(row),
            None => groups.push((key, vec![row])),
        }
    }
    if groups.is_empty() && group_by.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }
    let mut out = Vec::new();
    for (key, group_rows) in groups {
        let mut result_row = key;
        for agg in aggregates {
            result_row.push(compute_aggregate(agg, &group_rows, descriptor, ctx)?);
        }
        if let Some(having) = having {
            let keep = bind(ctx, having_descriptor, result_row.clone(), |ctx| having.eval(&ctx.binding))?;
            if keep.as_bool() != Some(true) {
                continue;
            }
        }
        out.push(result_row);
    }
    Ok(out)
}

fn eval_sort(mut rows: Vec<Row>, keys: &[SortKey]) -> Vec<Row> {
    rows.sort_by(|a, b| {
        for key in keys {
            let ord = a[key.column].compare(&b[key.column], key.collation).unwrap_or(Ordering::Equal);
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    rows
}

fn eval_limit(rows: Vec<Row>, limit: Option<usize>, offset: usize) -> Vec<Row> {
    let skipped: Vec<Row> = rows.into_iter().skip(offset).collect();
    match limit {
        Some(n) => skipped.into_iter().take(n).collect(),
        None => skipped,
    }
}

fn eval_set_op(mut left_rows: Vec<Row>, right_rows: Vec<Row>, kind: SetOpKind) -> Vec<Row> {
    match kind {
        SetOpKind::UnionAll => {
            left_rows.extend(right_rows);
            left_rows
        }
        SetOpKind::Union => {
            left_rows.extend(right_rows);
            dedup_rows(left_rows)
        }
        SetOpKind::Intersect => {
            let kept: Vec<Row> = left_rows.into_iter().filter(|r| right_rows.iter().any(|o| rows_equal(r, o))).collect();
            dedup_rows(kept)
        }
        SetOpKind::Except => {
            let kept: Vec<Row> = left_rows.into_iter().filter(|r| !right_rows.iter().any(|o| rows_equal(r, o))).collect();
            dedup_rows(kept)
        }
    }
}

/// Emits one instruction per row-producing plan node, wiring each
/// instruction's `depends_on` to the instructions emitted for its inputs.
/// Returns the index of the instruction producing this node's rows.
fn emit_rows(plan: &PlanNode, ctx: &Rc<ExecContext>, cte_drivers: &mut CteDrivers, instructions: &mut Vec<Instruction>) -> usize {
    match plan {
        PlanNode::Scan { target, filter, .. } => {
            let (target, filter) = (target.clone(), filter.clone());
            let ctx = ctx.clone();
            push_instruction(instructions, "scan", Vec::new(), move |_inputs| Ok(InstructionOutput::Rows(eval_scan(&target, &filter, &ctx)?)))
        }
        PlanNode::Filter { input, descriptor, predicate } => {
            let input_idx = emit_rows(input, ctx, cte_drivers, instructions);
            let (descriptor, predicate) = (descriptor.clone(), predicate.clone());
            let ctx = ctx.clone();
            push_instruction(instructions, "filter", vec![input_idx], move |inputs| {
                let rows = inputs[0].clone().into_rows()?;
                Ok(InstructionOutput::Rows(eval_filter(rows, &descriptor, &predicate, &ctx)?))
            })
        }
        PlanNode::Project { input, descriptor, exprs, .. } => {
            let input_idx = emit_rows(input, ctx, cte_drivers, instructions);
            let (descriptor, exprs) = (descriptor.clone(), exprs.clone());
            let ctx = ctx.clone();
            push_instruction(instructions, "project", vec![input_idx], move |inputs| {
                let rows = inputs[0].clone().into_rows()?;
                Ok(InstructionOutput::Rows(eval_project(rows, &descriptor, &exprs, &ctx)?))
            })
        }
        PlanNode::Join { left, right, kind, descriptor, predicate, right_width } => {
            let left_idx = emit_rows(left, ctx, cte_drivers, instructions);
            let right_idx = emit_rows(right, ctx, cte_drivers, instructions);
            let (kind, descriptor, predicate, right_width) = (*kind, descriptor.clone(), predicate.clone(), *right_width);
            let ctx = ctx.clone();
            push_instruction(instructions, "join", vec![left_idx, right_idx], move |inputs| {
                let left_rows = inputs[0].clone().into_rows()?;
                let right_rows = inputs[1].clone().into_rows()?;
                Ok(InstructionOutput::Rows(eval_join(left_rows, right_rows, kind, &descriptor, &predicate, right_width, &ctx)?))
            })
        }
        PlanNode::Aggregate { input, descriptor, group_by, aggregates, having, having_descriptor } => {
            let input_idx = emit_rows(input, ctx, cte_drivers, instructions);
            let (descriptor, group_by, aggregates, having, having_descriptor) =
                (descriptor.clone(), group_by.clone(), aggregates.clone(), having.clone(), having_descriptor.clone());
            let ctx = ctx.clone();
            push_instruction(instructions, "aggregate", vec![input_idx], move |inputs| {
                let rows = inputs[0].clone().into_rows()?;
                Ok(InstructionOutput::Rows(eval_aggregate(rows, &descriptor, &group_by, &aggregates, having.as_ref(), &having_descriptor, &ctx)?))
            })
        }
        PlanNode::Sort { input, keys } => {
            let input_idx = emit_rows(input, ctx, cte_drivers, instructions);
            let keys = keys.clone();
            push_instruction(instructions, "sort", vec![input_idx], move |inputs| {
                let rows = inputs[0].clone().into_rows()?;
                Ok(InstructionOutput::Rows(eval_sort(rows, &keys)))
            })
        }
        PlanNode::Limit { input, limit, offset } => {
            let input_idx = emit_rows(input, ctx, cte_drivers, instructions);
            let (limit, offset) = (*limit, *offset);
            push_instruction(instructions, "limit", vec![input_idx], move |inputs| {
                let rows = inputs[0].clone().into_rows()?;
                Ok(InstructionOutput::Rows(eval_limit(rows, limit, offset)))
            })
        }
        PlanNode::SetOp { left, right, kind } => {
            let left_idx = emit_rows(left, ctx, cte_drivers, instructions);
            let right_idx = emit_rows(right, ctx, cte_drivers, instructions);
            let kind = *kind;
            push_instruction(instructions, "set-op", vec![left_idx, right_idx], move |inputs| {
                let left_rows = inputs[0].clone().into_rows()?;
                let right_rows = inputs[1].clone().into_rows()?;
                Ok(InstructionOutput::Rows(eval_set_op(left_rows, right_rows, kind)))
            })
        }
        PlanNode::Cte { name, query, recursive, body } => {
            let base_idx = emit_rows(query, ctx, cte_drivers, instructions);
            // The recursive term can't be wired as a single static
            // dependency edge: a fixpoint loop re-runs it an a priori
            // unknown number of times. Each round instead builds and runs a
            // fresh nested `Program` for it, bound to that round's `delta`
            // via `ctx.ctes` — the pattern the scheduler's own contract names
            // for a recursive CTE step: the driver instruction invokes a
            // subprogram rather than depending on a static instruction.
            let recursive_factory: Option<Rc<dyn Fn() -> Program>> = recursive.as_ref().map(|recursive_term| {
                let recursive_term = (**recursive_term).clone();
                let ctx = ctx.clone();
                let factory: Rc<dyn Fn() -> Program> = Rc::new(move || {
                    let mut instrs = Vec::new();
                    let mut local_drivers = HashMap::new();
                    let idx = emit_rows(&recursive_term, &ctx, &mut local_drivers, &mut instrs);
                    Program::new(instrs, idx)
                });
                factory
            });
            let name = name.clone();
            let ctx_for_driver = ctx.clone();
            let driver_idx = push_instruction(instructions, format!("cte:{name}"), vec![base_idx], move |inputs| {
                let base_rows = inputs[0].clone().into_rows()?;
                let mut accumulated = base_rows.clone();
                let mut delta = base_rows;
                if let Some(factory) = &recursive_factory {
                    while !delta.is_empty() {
                        ctx_for_driver.ctes.borrow_mut().insert(name.clone(), delta.clone());
                        let subprogram = factory();
                        let next = Scheduler::new().run(subprogram)?.into_rows()?;
                        if next.is_empty() {
                            break;
                        }
                        accumulated.extend(next.clone());
                        delta = next;
                    }
                }
                ctx_for_driver.ctes.borrow_mut().insert(name.clone(), accumulated.clone());
                Ok(InstructionOutput::Rows(accumulated))
            });
            cte_drivers.insert(plan_cte_name(plan), driver_idx);
            emit_rows(body, ctx, cte_drivers, instructions)
        }
        PlanNode::CteRef { name } => {
            let deps = cte_drivers.get(name).map(|&i| vec![i]).unwrap_or_default();
            let name = name.clone();
            let ctx = ctx.clone();
            push_instruction(instructions, format!("cte-ref:{name}"), deps, move |_inputs| {
                ctx.ctes
                    .borrow()
                    .get(&name)
                    .cloned()
                    .map(InstructionOutput::Rows)
                    .ok_or_else(|| Error::internal(format!("reference to undefined common table expression: {name}")))
            })
        }
        other => {
            let label = format!("{other:?}");
            push_instruction(instructions, "unsupported-row-node", Vec::new(), move |_inputs| {
                Err(Error::internal(format!("plan node does not produce rows directly: {label}")))
            })
        }
    }
}

/// Extracts the CTE name back out of a `PlanNode::Cte` — used only to avoid
/// borrowing `name` twice (once into the driver closure, once into
/// `cte_drivers`) above.
fn plan_cte_name(plan: &PlanNode) -> String {
    match plan {
        PlanNode::Cte { name, .. } => name.clone(),
        _ => unreachable!("plan_cte_name called on a non-Cte node"),
    }
}

fn emit_dml(plan: &PlanNode, ctx: &Rc<ExecContext>, cte_drivers: &mut CteDrivers, instructions: &mut Vec<Instruction>) -> usize {
    match plan {
        PlanNode::Insert { target, descriptor, rows, on_conflict, returning, checks } => {
            let (target, descriptor, rows, on_conflict, returning, checks) =
                (target.clone(), descriptor.clone(), rows.clone(), *on_conflict, returning.clone(), checks.clone());
            let ctx = ctx.clone();
            push_instruction(instructions, "insert", Vec::new(), move |_inputs| {
                execute_insert(&target, &descriptor, &rows, on_conflict, returning.as_ref(), &checks, &ctx)
            })
        }
        PlanNode::Update { target, source, descriptor, assignments, returning, checks } => {
            let source_idx = emit_rows(source, ctx, cte_drivers, instructions);
            let (target, descriptor, assignments, returning, checks) = (target.clone(), descriptor.clone(), assignments.clone(), returning.clone(), checks.clone());
            let ctx = ctx.clone();
            push_instruction(instructions, "update", vec![source_idx], move |inputs| {
                let old_rows = inputs[0].clone().into_rows()?;
                execute_update(&target, old_rows, &descriptor, &assignments, returning.as_ref(), &checks, &ctx)
            })
        }
        PlanNode::Delete { target, source, returning, .. } => {
            let source_idx = emit_rows(source, ctx, cte_drivers, instructions);
            let (target, returning) = (target.clone(), returning.clone());
            let ctx = ctx.clone();
            push_instruction(instructions, "delete", vec![source_idx], move |inputs| {
                let rows = inputs[0].clone().into_rows()?;
                execute_delete(&target, rows, returning.as_ref(), &ctx)
            })
        }
        _ => unreachable!("emit_dml called on a non-DML plan node"),
    }
}

fn execute_insert(
    target: &TableTarget,
    descriptor: &RowDescriptor,
    rows: &[Vec<Expr>],
    on_conflict: OnConflict,
    returning: Option<&ReturningProjection>,
    checks: &[Expr],
    ctx: &ExecContext,
) -> Result<InstructionOutput> {
    let key = target.key();
    let mut returned = Vec::new();
    for expr_row in rows {
        let new_row: Vec<Value> = expr_row.iter().map(|e| e.eval(&ctx.binding)).collect::<Result<Vec<_>>>()?;
        enforce_checks(checks, descriptor, new_row.clone(), ctx)?;
        let flat = dml::flat_row(&target.schema, None, Some(&new_row));
        let pk = dml::extract_pk(&target.schema, ChangeKind::Insert, &flat);
        {
            let mut overlays = ctx.overlays.borrow_mut();
            let table = overlays.get_mut(&key).ok_or_else(|| Error::internal("no open overlay for insert target"))?;
            table.insert(new_row, on_conflict)?;
        }
        ctx.events.record_data_change(DataChangeEvent { schema: key.0.clone(), table: key.1.clone(), kind: ChangeKind::Insert, pk, remote: false });
        if let Some(projection) = returning {
            returned.push(projection.project(&target.schema, &flat));
        }
    }
    if returning.is_some() {
        Ok(InstructionOutput::Rows(returned))
    } else {
        Ok(InstructionOutput::RowCount(rows.len()))
    }
}

fn execute_update(
    target: &TableTarget,
    old_rows: Vec<Row>,
    descriptor: &RowDescriptor,
    assignments: &[(usize, Expr)],
    returning: Option<&ReturningProjection>,
    checks: &[Expr],
    ctx: &ExecContext,
) -> Result<InstructionOutput> {
    let key = target.key();
    let mut returned = Vec::new();
    let mut count = 0usize;
    for old_row in old_rows {
        let mut new_row = old_row.clone();
        let computed: Vec<(usize, Value)> =
            bind(ctx, descriptor, old_row.clone(), |ctx| assignments.iter().map(|(col, expr)| expr.eval(&ctx.binding).map(|v| (*col, v))).collect())?;
        for (col, value) in computed {
            new_row[col] = value;
        }
        enforce_checks(checks, descriptor, new_row.clone(), ctx)?;
        let flat = dml::flat_row(&target.schema, Some(&old_row), Some(&new_row));
        let old_pk = dml::extract_pk(&target.schema, ChangeKind::Delete, &flat);
        let new_pk = dml::extract_pk(&target.schema, ChangeKind::Insert, &flat);
        {
            let mut overlays = ctx.overlays.borrow_mut();
            let table = overlays.get_mut(&key).ok_or_else(|| Error::internal("no open overlay for update target"))?;
            table.update(old_pk, new_row)?;
        }
        ctx.events.record_data_change(DataChangeEvent { schema: key.0.clone(), table: key.1.clone(), kind: ChangeKind::Update, pk: new_pk, remote: false });
        count += 1;
        if let Some(projection) = returning {
            returned.push(projection.project(&target.schema, &flat));
        }
    }
    if returning.is_some() {
        Ok(InstructionOutput::Rows(returned))
    } else {
        Ok(InstructionOutput::RowCount(count))
    }
}

fn execute_delete(target: &TableTarget, rows: Vec<Row>, returning: Option<&ReturningProjection>, ctx: &ExecContext) -> Result<InstructionOutput> {
    let key = target.key();
    let mut returned = Vec::new();
    let mut count = 0usize;
    for row in rows {
        let flat = dml::flat_row(&target.schema, Some(&row), None);
        let pk = dml::extract_pk(&target.schema, ChangeKind::Delete, &flat);
        {
            let mut overlays = ctx.overlays.borrow_mut();
            let table = overlays.get_mut(&key).ok_or_else(|| Error::internal("no open overlay for delete target"))?;
            table.delete(pk.clone())?;
        }
        ctx.events.record_data_change(DataChangeEvent { schema: key.0.clone(), table: key.1.clone(), kind: ChangeKind::Delete, pk, remote: false });
        count += 1;
        if let Some(projection) = returning {
            returned.push(projection.project(&target.schema, &flat));
        }
    }
    if returning.is_some() {
        Ok(InstructionOutput::Rows(returned))
    } else {
        Ok(InstructionOutput::RowCount(count))
    }
}

/// Lowers a fully-built plan tree into a real dependency-DAG `Program`: one
/// instruction per plan node, each depending on the instructions emitted for
/// its inputs. `subprograms` additionally carries one sample subprogram per
/// CTE (built fresh here, the same way the driver instruction rebuilds one
/// each fixpoint round) for record-shape introspection.
pub fn emit_program(plan: PlanNode, overlays: Rc<RefCell<OverlayMap>>, events: EventAggregator) -> Program {
    let ctx = Rc::new(ExecContext::new(overlays, events));
    let mut instructions = Vec::new();
    let mut cte_drivers = HashMap::new();
    let root = match &plan {
        PlanNode::Insert { .. } | PlanNode::Update { .. } | PlanNode::Delete { .. } => emit_dml(&plan, &ctx, &mut cte_drivers, &mut instructions),
        PlanNode::Begin | PlanNode::Commit | PlanNode::Rollback | PlanNode::Savepoint { .. } | PlanNode::Release { .. } | PlanNode::RollbackTo { .. } => {
            push_instruction(&mut instructions, "txn-control", Vec::new(), |_inputs| {
                Err(Error::internal("transaction-control plan nodes are executed by the connection, not the plan executor"))
            })
        }
        other => emit_rows(other, &ctx, &mut cte_drivers, &mut instructions),
    };
    let subprograms = collect_cte_subprograms(&plan, &ctx.overlays, &ctx.events);
    Program::new(instructions, root).with_subprograms(subprograms)
}

fn collect_cte_subprograms(plan: &PlanNode, overlays: &Rc<RefCell<OverlayMap>>, events: &EventAggregator) -> Vec<Program> {
    let mut out = Vec::new();
    collect_ctes_rec(plan, overlays, events, &mut out);
    out
}

fn collect_ctes_rec(plan: &PlanNode, overlays: &Rc<RefCell<OverlayMap>>, events: &EventAggregator, out: &mut Vec<Program>) {
    match plan {
        PlanNode::Cte { query, recursive, body, .. } => {
            out.push(emit_program((**query).clone(), overlays.clone(), events.clone()));
            if let Some(recursive_term) = recursive {
                out.push(emit_program((**recursive_term).clone(), overlays.clone(), events.clone()));
            }
            collect_ctes_rec(body, overlays, events, out);
        }
        PlanNode::Filter { input, .. } | PlanNode::Project { input, .. } | PlanNode::Sort { input, .. } | PlanNode::Limit { input, .. } => {
            collect_ctes_rec(input, overlays, events, out);
        }
        PlanNode::Aggregate { input, .. } => collect_ctes_rec(input, overlays, events, out),
        PlanNode::Join { left, right, .. } | PlanNode::SetOp { left, right, .. } => {
            collect_ctes_rec(left, overlays, events, out);
            collect_ctes_rec(right, overlays, events, out);
        }
        PlanNode::Update { source, .. } | PlanNode::Delete { source, .. } => collect_ctes_rec(source, overlays, events, out),
        _ => {}
    }
}
