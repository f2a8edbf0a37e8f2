//! The instruction program and its scheduler: the plan/emit layer lowers a
//! plan tree into a flat dependency graph of `Instruction`s, and the
//! scheduler runs them in dependency order, materializing each one's
//! output before handing it to its dependents.
//!
//! Grounded on the teacher's `query_processor.rs` execution loop (a single
//! pass over a small instruction-like sequence derived from the parsed
//! statement), generalized from one fixed statement-shaped sequence to an
//! arbitrary DAG with named subprograms (one per CTE/subquery) and
//! cooperative cancellation.

use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::Value;
use std::cell::Cell;
use std::rc::Rc;

/// The materialized result of one instruction. Every instruction
/// materializes fully before its dependents run: streaming between plan
/// nodes happens inside the emitter's own iterator chains (see
/// `src/plan/emit.rs`), while the program graph only orchestrates coarser
/// materialization points — CTEs, subqueries, and top-level statement
/// results — where an intermediate value genuinely needs to be shared or
/// counted before downstream work proceeds.
#[derive(Debug, Clone)]
pub enum InstructionOutput {
    Value(Value),
    Rows(Vec<Row>),
    RowCount(usize),
    Unit,
}

impl InstructionOutput {
    pub fn into_rows(self) -> Result<Vec<Row>> {
        match self {
            InstructionOutput::Rows(rows) => Ok(rows),
            other => Err(Error::internal(format!("expected rows, found {other:?}"))),
        }
    }

    pub fn into_row_count(self) -> Result<usize> {
        match self {
            InstructionOutput::RowCount(n) => Ok(n),
            other => Err(Error::internal(format!("expected a row count, found {other:?}"))),
        }
    }
}

type InstructionFn = Box<dyn FnOnce(&[InstructionOutput]) -> Result<InstructionOutput>>;

/// One node of the program DAG. `depends_on` indices must reference
/// instructions earlier in the owning `Program::instructions` vector —
/// the emitter builds programs in dependency order (like SSA), so the
/// scheduler never needs a separate topological sort pass.
pub struct Instruction {
    pub label: String,
    pub depends_on: Vec<usize>,
    run: InstructionFn,
}

impl Instruction {
    pub fn new(label: impl Into<String>, depends_on: Vec<usize>, run: InstructionFn) -> Self {
        Self { label: label.into(), depends_on, run }
    }
}

/// A flat instruction graph plus its nested subprograms (one per CTE or
/// scalar subquery the emitter chose to materialize independently). The
/// top-level program's `root` index names the instruction whose output is
/// the statement's result.
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub root: usize,
    pub subprograms: Vec<Program>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>, root: usize) -> Self {
        Self { instructions, root, subprograms: Vec::new() }
    }

    pub fn with_subprograms(mut self, subprograms: Vec<Program>) -> Self {
        self.subprograms = subprograms;
        self
    }
}

/// A cooperative cancellation flag shared between a `Scheduler` and
/// whoever holds a handle to interrupt a running statement (e.g. a
/// connection-level "interrupt" API). Checked between instructions, never
/// inside one — an instruction's own closure (a DML apply, a full scan) is
/// the smallest unit of uninterruptible work in this engine.
#[derive(Clone)]
pub struct CancellationToken(Rc<Cell<bool>>);

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(false)))
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

pub struct Scheduler {
    cancellation: CancellationToken,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self { cancellation: CancellationToken::new() }
    }

    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn run(&self, program: Program) -> Result<InstructionOutput> {
        let mut results: Vec<InstructionOutput> = Vec::with_capacity(program.instructions.len());
        for instruction in program.instructions {
            if self.cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tracing::trace!(label = %instruction.label, depends_on = ?instruction.depends_on, "running instruction");
            let inputs: Vec<InstructionOutput> =
                instruction.depends_on.iter().map(|&dep| results[dep].clone()).collect();
            let output = (instruction.run)(&inputs)?;
            results.push(output);
        }
        results
            .into_iter()
            .nth(program.root)
            .ok_or_else(|| Error::internal("program root index out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_instructions_in_dependency_order() {
        let program = Program::new(
            vec![
                Instruction::new("const 1", vec![], Box::new(|_| Ok(InstructionOutput::Value(Value::Integer(1))))),
                Instruction::new("const 2", vec![], Box::new(|_| Ok(InstructionOutput::Value(Value::Integer(2))))),
                Instruction::new(
                    "sum",
                    vec![0, 1],
                    Box::new(|inputs| {
                        let a = match &inputs[0] {
                            InstructionOutput::Value(Value::Integer(n)) => *n,
                            _ => unreachable!(),
                        };
                        let b = match &inputs[1] {
                            InstructionOutput::Value(Value::Integer(n)) => *n,
                            _ => unreachable!(),
                        };
                        Ok(InstructionOutput::Value(Value::Integer(a + b)))
                    }),
                ),
            ],
            2,
        );
        let scheduler = Scheduler::new();
        let output = scheduler.run(program).unwrap();
        match output {
            InstructionOutput::Value(Value::Integer(3)) => {}
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn cancellation_stops_before_next_instruction() {
        let scheduler = Scheduler::new();
        let token = scheduler.cancellation_token();
        token.cancel();
        let program = Program::new(
            vec![Instruction::new("noop", vec![], Box::new(|_| Ok(InstructionOutput::Unit)))],
            0,
        );
        assert!(matches!(scheduler.run(program), Err(Error::Cancelled)));
    }
}
