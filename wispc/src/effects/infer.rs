//! # Effect Inference
//!
//! Computes the effect row of every function and of every handled body.
//!
//! ## Algorithm
//!
//! A body's row is the composition of:
//!
//! 1. every operation it performs,
//! 2. the row of every callee (by `DefId` for direct calls, from the
//!    callee's `Fn` type for calls through a local),
//! 3. the rows of handler clause bodies,
//!
//! where a `handle` removes the operations its clauses cover from its
//! body's row. Mutually recursive functions are solved by iterating to a
//! fixpoint; rows only grow, so the iteration terminates.
//!
//! ## Declared Rows
//!
//! A function with a declared row keeps it. Its body is still inferred and
//! every operation outside the declared row is a `RowMismatch`.
//!
//! ```text
//! fn log_twice(msg) / {Log.write} {
//!     perform Log.write(msg);
//!     perform Log.write(msg)        // ok
//! }
//!
//! fn bad() / {} {
//!     perform Log.write(1)          // E0402
//! }
//! ```

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::row::{RowId, RowInterner};
use crate::diagnostics::EffectError;
use crate::hir::{DefId, Expr, ExprId, ExprKind, FnDecl, OpRef, Program, Type};
use crate::span::Span;

/// Rows computed for a program.
#[derive(Debug, Clone, Default)]
pub struct InferredEffects {
    /// Row of every source function.
    pub functions: BTreeMap<DefId, RowId>,
    /// Row of every handled body, keyed by the source function containing
    /// the `handle` and the `handle` expression.
    pub handled_bodies: HashMap<(DefId, ExprId), RowId>,
    /// Row of every clause of a `handle`, in clause order.
    pub clauses: HashMap<(DefId, ExprId), Vec<RowId>>,
}

impl InferredEffects {
    pub fn function(&self, def: DefId) -> Option<RowId> {
        self.functions.get(&def).copied()
    }

    pub fn handled_body(&self, owner: DefId, handle: ExprId) -> Option<RowId> {
        self.handled_bodies.get(&(owner, handle)).copied()
    }

    /// Row of calling `callee`, when the callee is a supported expression.
    pub fn callee_row(&self, callee: &Expr) -> Option<RowId> {
        match &callee.kind {
            ExprKind::Def(def) => self.function(*def),
            ExprKind::Local(_) => callee.ty.as_fn().map(|f| f.effects),
            _ => None,
        }
    }
}

/// Effect inferencer for a whole program.
#[derive(Debug)]
pub struct EffectInferencer<'a> {
    program: &'a Program,
    rows: &'a mut RowInterner,
    result: InferredEffects,
}

/// Per-walk state: the function being walked and whether to report errors.
struct Walk {
    owner: DefId,
    report: bool,
    errors: Vec<EffectError>,
}

impl<'a> EffectInferencer<'a> {
    pub fn new(program: &'a Program, rows: &'a mut RowInterner) -> Self {
        Self {
            program,
            rows,
            result: InferredEffects::default(),
        }
    }

    /// Infer every row of the program. Errors are returned alongside the
    /// result so later passes can still run on what was inferred.
    pub fn infer(mut self) -> (InferredEffects, Vec<EffectError>) {
        let program = self.program;
        let empty = self.rows.empty();
        for func in &program.functions {
            let initial = func.declared_effects.unwrap_or(empty);
            self.result.functions.insert(func.def_id, initial);
        }

        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            for func in &program.functions {
                if func.declared_effects.is_some() {
                    continue;
                }
                let inferred = self.infer_function(func, false).0;
                let current = self.result.functions[&func.def_id];
                let grown = self.rows.compose(current, inferred);
                if grown != current {
                    self.result.functions.insert(func.def_id, grown);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        debug!(rounds, functions = program.functions.len(), "effect rows reached fixpoint");

        // Final pass over the solved rows: record handled bodies and report.
        let mut errors = Vec::new();
        for func in &program.functions {
            let (inferred, mut func_errors) = self.infer_function(func, true);
            errors.append(&mut func_errors);
            if let Some(declared) = func.declared_effects {
                self.check_declared(func, declared, inferred, &mut errors);
            }
        }
        (self.result, errors)
    }

    fn infer_function(&mut self, func: &FnDecl, report: bool) -> (RowId, Vec<EffectError>) {
        let mut walk = Walk {
            owner: func.def_id,
            report,
            errors: Vec::new(),
        };
        let row = self.infer_expr(&func.body.expr, &mut walk);
        (row, walk.errors)
    }

    fn check_declared(&self, func: &FnDecl, declared: RowId, inferred: RowId, errors: &mut Vec<EffectError>) {
        if self.rows.covers(declared, inferred) {
            return;
        }
        let missing = self.rows.uncovered(declared, inferred);
        if missing.is_empty() {
            // Only openness differs: the body calls through an open row.
            errors.push(EffectError::RowMismatch {
                function: func.name.clone(),
                operation: "..".to_string(),
                span: func.span,
            });
        }
        for op in missing {
            errors.push(EffectError::RowMismatch {
                function: func.name.clone(),
                operation: self.program.op_label(op),
                span: func.span,
            });
        }
    }

    fn infer_expr(&mut self, expr: &Expr, walk: &mut Walk) -> RowId {
        match &expr.kind {
            ExprKind::Perform { op, args } => {
                let own = self.perform_row(expr, *op, args.len(), walk);
                self.compose_all(own, args.iter(), walk)
            }
            ExprKind::Call { callee, args } => {
                let own = self.callee_row(callee, walk);
                self.compose_all(own, args.iter(), walk)
            }
            ExprKind::Def(def) => {
                self.check_reference(expr, *def, walk);
                self.rows.empty()
            }
            ExprKind::Handle { body, clauses } => {
                let body_row = self.infer_expr(body, walk);
                if walk.report {
                    self.result.handled_bodies.insert((walk.owner, expr.id), body_row);
                }
                let handled: Vec<OpRef> = clauses.iter().map(|c| c.op).collect();
                let mut row = self.rows.without(body_row, &handled);
                let mut clause_rows = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    self.check_clause_shape(clause.op, clause.params.len(), clause.span, walk);
                    let clause_row = self.infer_expr(&clause.body, walk);
                    clause_rows.push(clause_row);
                    row = self.rows.compose(row, clause_row);
                }
                if walk.report {
                    self.result.clauses.insert((walk.owner, expr.id), clause_rows);
                }
                row
            }
            _ => {
                let mut children = Vec::new();
                expr.for_each_child(|child| children.push(child));
                let empty = self.rows.empty();
                self.compose_all(empty, children.into_iter(), walk)
            }
        }
    }

    fn compose_all<'e>(&mut self, mut row: RowId, exprs: impl Iterator<Item = &'e Expr>, walk: &mut Walk) -> RowId {
        for e in exprs {
            let child = self.infer_expr(e, walk);
            row = self.rows.compose(row, child);
        }
        row
    }

    fn perform_row(&mut self, expr: &Expr, op: OpRef, arity: usize, walk: &mut Walk) -> RowId {
        if !self.check_clause_shape(op, arity, expr.span, walk) {
            return self.rows.empty();
        }
        self.rows.intern([op], false)
    }

    /// Check that `op` exists and takes `arity` arguments.
    fn check_clause_shape(&self, op: OpRef, arity: usize, span: Span, walk: &mut Walk) -> bool {
        let Some(decl) = self.program.op_decl(op) else {
            if walk.report {
                walk.errors.push(EffectError::UnknownOperation {
                    operation: format!("{}#{}", self.program.effect_id(op.effect), op.op),
                    span,
                });
            }
            return false;
        };
        if decl.params.len() != arity && walk.report {
            walk.errors.push(EffectError::ArityMismatch {
                operation: self.program.op_label(op),
                expected: decl.params.len(),
                found: arity,
                span,
            });
        }
        true
    }

    fn callee_row(&mut self, callee: &Expr, walk: &mut Walk) -> RowId {
        match &callee.kind {
            ExprKind::Def(def) => match self.result.function(*def) {
                Some(row) => row,
                None => {
                    if walk.report {
                        walk.errors.push(EffectError::UnknownFunction {
                            def: format!("{:?}", def),
                            span: callee.span,
                        });
                    }
                    self.rows.empty()
                }
            },
            ExprKind::Local(_) => match callee.ty.as_fn() {
                Some(fn_ty) => fn_ty.effects,
                None => {
                    if walk.report {
                        walk.errors.push(EffectError::UnsupportedCallee { span: callee.span });
                    }
                    self.rows.empty()
                }
            },
            _ => {
                if walk.report {
                    walk.errors.push(EffectError::UnsupportedCallee { span: callee.span });
                }
                self.infer_expr(callee, walk)
            }
        }
    }

    /// A function used as a value must not perform more than the function
    /// type it is used at allows.
    fn check_reference(&self, expr: &Expr, def: DefId, walk: &mut Walk) {
        if !walk.report {
            return;
        }
        let Some(row) = self.result.function(def) else {
            walk.errors.push(EffectError::UnknownFunction {
                def: format!("{:?}", def),
                span: expr.span,
            });
            return;
        };
        if let Type::Fn(fn_ty) = &expr.ty {
            if !self.rows.covers(fn_ty.effects, row) {
                let name = self.program.function(def).map_or_else(|| format!("{:?}", def), |f| f.name.clone());
                walk.errors.push(EffectError::SignatureMismatch {
                    function: name,
                    span: expr.span,
                });
            }
        }
    }
}

/// Convenience wrapper around [`EffectInferencer`].
pub fn infer_program(program: &Program, rows: &mut RowInterner) -> (InferredEffects, Vec<EffectError>) {
    EffectInferencer::new(program, rows).infer()
}
