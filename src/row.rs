//! Rows and the row-descriptor binding discipline used by pipelined operators.

use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// An ordered sequence of values, indexed positionally.
pub type Row = Vec<Value>;

/// Maps an attribute id (assigned at plan time to every column a scalar
/// expression can reference) to its position in the currently-bound row.
pub type RowDescriptor = Rc<HashMap<AttributeId, usize>>;

/// A stable identifier for "the value of column N of the row produced by
/// plan node P", assigned once by the planner and looked up through the
/// scope chain at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u32);

/// One binding frame: a row descriptor plus the row currently flowing
/// through it. Pushed before a pipelined operator evaluates one row,
/// popped immediately after — a strict LIFO discipline that replaces any
/// ambient "current row" global.
struct Frame {
    descriptor: RowDescriptor,
    row: Row,
}

/// The row-context stack. One `RowBinding` exists per statement execution
/// and is threaded through every scalar sub-instruction.
#[derive(Default)]
pub struct RowBinding {
    stack: RefCell<Vec<Frame>>,
}

impl RowBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `row` under `descriptor` for the duration of `f`, guaranteeing
    /// the frame is popped even if `f` returns early via `?`.
    pub fn with_bound<T>(
        &self,
        descriptor: RowDescriptor,
        row: Row,
        f: impl FnOnce() -> T,
    ) -> T {
        self.stack.borrow_mut().push(Frame { descriptor, row });
        let result = f();
        self.stack.borrow_mut().pop();
        result
    }

    /// Looks up `attr` starting from the innermost bound frame and walking
    /// outward, matching the scope-chain resolution pipelined operators use
    /// for correlated references.
    pub fn lookup(&self, attr: AttributeId) -> Option<Value> {
        let stack = self.stack.borrow();
        for frame in stack.iter().rev() {
            if let Some(&idx) = frame.descriptor.get(&attr) {
                return frame.row.get(idx).cloned();
            }
        }
        None
    }

    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifo_binding_and_unbinding() {
        let binding = RowBinding::new();
        let mut desc = HashMap::new();
        desc.insert(AttributeId(0), 0);
        let desc = Rc::new(desc);

        assert_eq!(binding.lookup(AttributeId(0)), None);
        binding.with_bound(desc.clone(), vec![Value::Integer(42)], || {
            assert_eq!(binding.lookup(AttributeId(0)), Some(Value::Integer(42)));
            assert_eq!(binding.depth(), 1);
        });
        assert_eq!(binding.lookup(AttributeId(0)), None);
        assert_eq!(binding.depth(), 0);
    }

    #[test]
    fn outer_scope_visible_through_inner_frame() {
        let binding = RowBinding::new();
        let mut outer_desc = HashMap::new();
        outer_desc.insert(AttributeId(0), 0);
        let outer_desc = Rc::new(outer_desc);
        let mut inner_desc = HashMap::new();
        inner_desc.insert(AttributeId(1), 0);
        let inner_desc = Rc::new(inner_desc);

        binding.with_bound(outer_desc, vec![Value::Integer(1)], || {
            binding.with_bound(inner_desc, vec![Value::Integer(2)], || {
                assert_eq!(binding.lookup(AttributeId(1)), Some(Value::Integer(2)));
                assert_eq!(binding.lookup(AttributeId(0)), Some(Value::Integer(1)));
            });
        });
    }
}
