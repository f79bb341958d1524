//! Continuation usage analysis.
//!
//! For a continuation-typed binding (a function-typed parameter or a
//! clause continuation) this computes how many times it may be invoked on
//! any path through a body, and whether it escapes as a value.
//!
//! ```text
//! f(x) + 1                 {1, 1, no escape}
//! if c { f(x) } else { 0 } {0, 1, no escape}
//! while c { f(x) }         {0, inf, no escape}
//! g(f)                     {0, 0, escapes}
//! ```
//!
//! Usage `{1, 1, no escape}` is what lets a call site skip frame capture:
//! the continuation is consumed exactly once, in tail position, so a
//! suspended request can be forwarded as is.

use std::cmp;
use std::fmt;

use crate::hir::{Expr, ExprKind, LocalId};

/// Upper bound on invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bound {
    Finite(u32),
    Unbounded,
}

impl Bound {
    fn add(self, other: Bound) -> Bound {
        match (self, other) {
            (Bound::Finite(a), Bound::Finite(b)) => Bound::Finite(a.saturating_add(b)),
            _ => Bound::Unbounded,
        }
    }

    fn is_zero(self) -> bool {
        self == Bound::Finite(0)
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Finite(n) => write!(f, "{}", n),
            Bound::Unbounded => f.write_str("inf"),
        }
    }
}

/// How a continuation-typed binding is used by a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationUsage {
    pub min: u32,
    pub max: Bound,
    pub escapes: bool,
}

impl ContinuationUsage {
    pub const UNUSED: ContinuationUsage = ContinuationUsage {
        min: 0,
        max: Bound::Finite(0),
        escapes: false,
    };

    /// Invoked exactly once on every path and never used as a value.
    pub fn is_linear(&self) -> bool {
        self.min == 1 && self.max == Bound::Finite(1) && !self.escapes
    }

    pub fn at_most_once(&self) -> bool {
        self.max <= Bound::Finite(1)
    }
}

impl fmt::Display for ContinuationUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}", self.min, self.max)?;
        if self.escapes {
            f.write_str(", escapes")?;
        }
        f.write_str("}")
    }
}

/// Compute the usage of `target` in `body`, where `body` is the whole body
/// of a function or a handler clause.
pub fn analyze_usage(body: &Expr, target: LocalId) -> ContinuationUsage {
    let paths = UsageWalker { target }.walk(body, true);
    let (min, max) = match Count::merge(paths.terminated, paths.continuing) {
        Some(count) => (count.min, count.max),
        None => (0, Bound::Finite(0)),
    };
    ContinuationUsage {
        min,
        max,
        escapes: paths.escapes,
    }
}

/// Invocation count range over a set of paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Count {
    min: u32,
    max: Bound,
}

impl Count {
    const ZERO: Count = Count {
        min: 0,
        max: Bound::Finite(0),
    };
    const ONE: Count = Count {
        min: 1,
        max: Bound::Finite(1),
    };

    fn then(self, other: Count) -> Count {
        Count {
            min: self.min.saturating_add(other.min),
            max: self.max.add(other.max),
        }
    }

    fn merge(a: Option<Count>, b: Option<Count>) -> Option<Count> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Count {
                min: cmp::min(a.min, b.min),
                max: cmp::max(a.max, b.max),
            }),
            (a, None) => a,
            (None, b) => b,
        }
    }

    fn unbounded(self) -> Count {
        Count {
            min: self.min,
            max: Bound::Unbounded,
        }
    }
}

/// Summary of the paths through an expression: those that stopped counting
/// (tail invocation, `return`, escape) and those that fall through to what
/// follows. A `None` side has no paths.
#[derive(Debug, Clone, Copy)]
struct Paths {
    terminated: Option<Count>,
    continuing: Option<Count>,
    escapes: bool,
}

impl Paths {
    const NONE: Paths = Paths {
        terminated: None,
        continuing: Some(Count::ZERO),
        escapes: false,
    };

    fn invocation(tail: bool) -> Paths {
        if tail {
            Paths {
                terminated: Some(Count::ONE),
                continuing: None,
                escapes: false,
            }
        } else {
            Paths {
                terminated: None,
                continuing: Some(Count::ONE),
                escapes: false,
            }
        }
    }

    fn escape() -> Paths {
        Paths {
            terminated: Some(Count::ZERO),
            continuing: None,
            escapes: true,
        }
    }

    /// `self` followed by `next`.
    fn then(self, next: Paths) -> Paths {
        let Some(before) = self.continuing else {
            return self;
        };
        Paths {
            terminated: Count::merge(self.terminated, next.terminated.map(|c| before.then(c))),
            continuing: next.continuing.map(|c| before.then(c)),
            escapes: self.escapes || next.escapes,
        }
    }

    /// Either `self` or `other`.
    fn or(self, other: Paths) -> Paths {
        Paths {
            terminated: Count::merge(self.terminated, other.terminated),
            continuing: Count::merge(self.continuing, other.continuing),
            escapes: self.escapes || other.escapes,
        }
    }

    /// Stop every continuing path here.
    fn terminate(self) -> Paths {
        Paths {
            terminated: Count::merge(self.terminated, self.continuing),
            continuing: None,
            escapes: self.escapes,
        }
    }

    fn unbounded(self) -> Paths {
        Paths {
            terminated: self.terminated.map(Count::unbounded),
            continuing: self.continuing.map(Count::unbounded),
            escapes: self.escapes,
        }
    }

    fn may_invoke(&self) -> bool {
        let nonzero = |c: Option<Count>| c.map_or(false, |c| !c.max.is_zero());
        nonzero(self.terminated) || nonzero(self.continuing)
    }
}

struct UsageWalker {
    target: LocalId,
}

impl UsageWalker {
    fn walk(&self, expr: &Expr, tail: bool) -> Paths {
        match &expr.kind {
            ExprKind::Literal(_) | ExprKind::Def(_) => Paths::NONE,
            ExprKind::Local(id) => {
                if *id == self.target {
                    Paths::escape()
                } else {
                    Paths::NONE
                }
            }
            ExprKind::Binary { left, right, .. } => self.walk(left, false).then(self.walk(right, false)),
            ExprKind::Unary { operand, .. } => self.walk(operand, false),
            ExprKind::Block { stmts, expr: tail_expr } => {
                let mut paths = Paths::NONE;
                for stmt in stmts {
                    paths = paths.then(self.walk(stmt.expr(), false));
                }
                if let Some(e) = tail_expr {
                    paths = paths.then(self.walk(e, tail));
                }
                paths
            }
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let then_paths = self.walk(then_branch, tail);
                let else_paths = else_branch.as_ref().map_or(Paths::NONE, |e| self.walk(e, tail));
                self.walk(condition, false).then(then_paths.or(else_paths))
            }
            ExprKind::While { condition, body } => {
                let cond = self.walk(condition, false);
                let iteration = cond.then(self.walk(body, false));
                // Zero or more full iterations, then the exiting condition.
                let mut paths = cond.or(iteration);
                if iteration.may_invoke() {
                    paths = paths.unbounded();
                }
                paths
            }
            ExprKind::Assign { value, .. } => self.walk(value, false),
            ExprKind::Return(value) => value
                .as_ref()
                .map_or(Paths::NONE, |v| self.walk(v, true))
                .terminate(),
            ExprKind::Call { callee, args } => {
                let mut paths = Paths::NONE;
                for arg in args {
                    paths = paths.then(self.walk(arg, false));
                }
                match &callee.kind {
                    ExprKind::Local(id) if *id == self.target => paths.then(Paths::invocation(tail)),
                    _ => self.walk(callee, false).then(paths),
                }
            }
            ExprKind::Perform { args, .. } => args
                .iter()
                .fold(Paths::NONE, |paths, arg| paths.then(self.walk(arg, false))),
            ExprKind::Resume { cont, value } => {
                let paths = self.walk(value, false);
                if *cont == self.target {
                    paths.then(Paths::invocation(tail))
                } else {
                    paths
                }
            }
            ExprKind::Handle { body, clauses } => {
                // The handled body runs in a lifted function that receives
                // captured bindings by value.
                let mut paths = if mentions(body, self.target) {
                    Paths::escape()
                } else {
                    Paths::NONE
                };
                if !clauses.is_empty() {
                    let any_clause = clauses
                        .iter()
                        .map(|c| self.walk(&c.body, false))
                        .reduce(Paths::or)
                        .unwrap_or(Paths::NONE);
                    let mut repeated = Paths::NONE.or(any_clause);
                    if any_clause.may_invoke() {
                        repeated = repeated.unbounded();
                    }
                    paths = paths.then(repeated);
                }
                paths
            }
        }
    }
}

/// Whether `expr` refers to `target` in any way.
pub fn mentions(expr: &Expr, target: LocalId) -> bool {
    expr.any(&mut |e| match &e.kind {
        ExprKind::Local(id) => *id == target,
        ExprKind::Resume { cont, .. } => *cont == target,
        ExprKind::Assign { target: t, .. } => *t == target,
        _ => false,
    })
}

/// Visit every expression of a body together with whether it is in tail
/// position. `return_is_tail` decides whether the operand of `return`
/// counts as a tail position. Handled bodies and clause bodies are never
/// in tail position of the enclosing body.
pub fn visit_tail_positions<'a>(
    expr: &'a Expr,
    tail: bool,
    return_is_tail: bool,
    f: &mut dyn FnMut(&'a Expr, bool),
) {
    f(expr, tail);
    match &expr.kind {
        ExprKind::Block { stmts, expr: tail_expr } => {
            for stmt in stmts {
                visit_tail_positions(stmt.expr(), false, return_is_tail, f);
            }
            if let Some(e) = tail_expr {
                visit_tail_positions(e, tail, return_is_tail, f);
            }
        }
        ExprKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            visit_tail_positions(condition, false, return_is_tail, f);
            visit_tail_positions(then_branch, tail, return_is_tail, f);
            if let Some(e) = else_branch {
                visit_tail_positions(e, tail, return_is_tail, f);
            }
        }
        ExprKind::Return(Some(value)) => visit_tail_positions(value, return_is_tail, return_is_tail, f),
        _ => expr.for_each_child(|child| visit_tail_positions(child, false, return_is_tail, f)),
    }
}
