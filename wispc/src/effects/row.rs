//! Interned effect rows.
//!
//! A row is the set of operations an expression may perform, plus an
//! optional open tail standing for "whatever else the caller allows".
//! Rows are hash-consed: structurally identical rows get the same
//! [`RowId`], so equality is an id comparison.
//!
//! ```text
//! {Log.write, Test.effect}        closed
//! {Log.write | ..}                open
//! {}                              pure (the only empty row)
//! ```
//!
//! Each interner has a process-unique context id baked into every `RowId`
//! it hands out. Passing a row from one interner to another is a bug in the
//! caller and panics immediately rather than silently aliasing another row.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::hir::OpRef;

static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

/// Handle to an interned row.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId {
    ctx: u32,
    index: u32,
}

impl RowId {
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Row({}:{})", self.ctx, self.index)
    }
}

/// Contents of a row: sorted, deduplicated operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowData {
    pub ops: Vec<OpRef>,
    pub open: bool,
}

/// Owner of all rows of one program.
#[derive(Debug, Clone)]
pub struct RowInterner {
    ctx: u32,
    rows: Vec<RowData>,
    index: HashMap<RowData, u32>,
}

impl RowInterner {
    pub fn new() -> Self {
        let empty = RowData {
            ops: Vec::new(),
            open: false,
        };
        let mut index = HashMap::new();
        index.insert(empty.clone(), 0);
        Self {
            ctx: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            rows: vec![empty],
            index,
        }
    }

    /// The closed empty row.
    pub fn empty(&self) -> RowId {
        RowId {
            ctx: self.ctx,
            index: 0,
        }
    }

    /// Intern a row. Order and duplicates of `ops` do not matter.
    pub fn intern(&mut self, ops: impl IntoIterator<Item = OpRef>, open: bool) -> RowId {
        let mut ops: Vec<OpRef> = ops.into_iter().collect();
        ops.sort_unstable();
        ops.dedup();
        self.intern_data(RowData { ops, open })
    }

    fn intern_data(&mut self, data: RowData) -> RowId {
        if let Some(&index) = self.index.get(&data) {
            return RowId { ctx: self.ctx, index };
        }
        let index = self.rows.len() as u32;
        self.rows.push(data.clone());
        self.index.insert(data, index);
        RowId { ctx: self.ctx, index }
    }

    /// Contents of a row.
    ///
    /// # Panics
    ///
    /// If `row` was produced by a different interner.
    pub fn get(&self, row: RowId) -> &RowData {
        self.check(row);
        &self.rows[row.index as usize]
    }

    /// Union of two rows. Open if either side is open.
    pub fn compose(&mut self, a: RowId, b: RowId) -> RowId {
        if a == b {
            self.check(a);
            return a;
        }
        let (left, right) = (self.get(a), self.get(b));
        let open = left.open || right.open;
        let ops: Vec<OpRef> = left.ops.iter().chain(right.ops.iter()).copied().collect();
        self.intern(ops, open)
    }

    /// No operations and no open tail.
    pub fn is_empty(&self, row: RowId) -> bool {
        let data = self.get(row);
        data.ops.is_empty() && !data.open
    }

    /// `row` with the given operations removed. Openness is preserved: a
    /// handler cannot know what an open tail stands for.
    pub fn without(&mut self, row: RowId, handled: &[OpRef]) -> RowId {
        let data = self.get(row);
        let open = data.open;
        let ops: Vec<OpRef> = data.ops.iter().copied().filter(|op| !handled.contains(op)).collect();
        self.intern(ops, open)
    }

    /// Whether every operation of `inner` is in `outer`, and `outer` is
    /// open whenever `inner` is.
    pub fn covers(&self, outer: RowId, inner: RowId) -> bool {
        let (outer, inner) = (self.get(outer), self.get(inner));
        (outer.open || !inner.open) && inner.ops.iter().all(|op| outer.ops.binary_search(op).is_ok())
    }

    pub fn contains(&self, row: RowId, op: OpRef) -> bool {
        self.get(row).ops.binary_search(&op).is_ok()
    }

    /// Operations of `inner` missing from `outer`.
    pub fn uncovered(&self, outer: RowId, inner: RowId) -> Vec<OpRef> {
        let outer = self.get(outer);
        self.get(inner)
            .ops
            .iter()
            .copied()
            .filter(|op| outer.ops.binary_search(op).is_err())
            .collect()
    }

    fn check(&self, row: RowId) {
        if row.ctx != self.ctx {
            panic!(
                "effect row from interner context {} used with context {}",
                row.ctx, self.ctx
            );
        }
    }
}

impl Default for RowInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::EffectId;

    fn op(effect: u32, op: u32) -> OpRef {
        OpRef::new(EffectId::new(effect), op)
    }

    #[test]
    fn test_intern_ignores_order_and_duplicates() {
        let mut rows = RowInterner::new();
        let a = rows.intern([op(1, 0), op(0, 2), op(1, 0)], false);
        let b = rows.intern([op(0, 2), op(1, 0)], false);
        assert_eq!(a, b);
        assert_ne!(a, rows.intern([op(0, 2), op(1, 0)], true));
    }

    #[test]
    fn test_empty_row() {
        let mut rows = RowInterner::new();
        let empty = rows.intern([], false);
        assert_eq!(empty, rows.empty());
        assert!(rows.is_empty(empty));
        let open = rows.intern([], true);
        assert!(!rows.is_empty(open));
    }

    #[test]
    fn test_compose() {
        let mut rows = RowInterner::new();
        let a = rows.intern([op(0, 0)], false);
        let b = rows.intern([op(0, 1)], true);
        let ab = rows.compose(a, b);
        assert_eq!(ab, rows.compose(b, a));
        assert_eq!(rows.compose(ab, a), ab);
        assert!(rows.get(ab).open);
        assert_eq!(rows.get(ab).ops, vec![op(0, 0), op(0, 1)]);
    }

    #[test]
    fn test_without_and_covers() {
        let mut rows = RowInterner::new();
        let row = rows.intern([op(0, 0), op(1, 0)], true);
        let handled = rows.without(row, &[op(0, 0)]);
        assert_eq!(rows.get(handled).ops, vec![op(1, 0)]);
        assert!(rows.get(handled).open);

        let closed = rows.intern([op(1, 0)], false);
        assert!(rows.covers(handled, closed));
        assert!(!rows.covers(closed, handled));
        assert!(rows.contains(row, op(1, 0)));
        assert_eq!(rows.uncovered(closed, row), vec![op(0, 0)]);
    }

    #[test]
    #[should_panic(expected = "interner context")]
    fn test_mixing_contexts_panics() {
        let mut first = RowInterner::new();
        let second = RowInterner::new();
        let row = first.intern([op(0, 0)], false);
        second.is_empty(row);
    }

    #[test]
    fn test_clone_keeps_context() {
        let mut rows = RowInterner::new();
        let row = rows.intern([op(2, 1)], false);
        let mut copy = rows.clone();
        let more = copy.intern([op(3, 0)], false);
        let both = copy.compose(row, more);
        assert_eq!(copy.get(both).ops.len(), 2);
    }
}
