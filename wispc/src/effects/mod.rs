//! # Effects System
//!
//! Effect accounting and lowering for the trampoline backend.
//!
//! ## Design Overview
//!
//! Effectful functions return an *Outcome*: either a value, or a request
//! naming an operation together with the continuation of the computation
//! that performed it. Nothing in the generated code switches stacks; a
//! suspended computation is a chain of heap frames, one per function that
//! was active when the operation was performed.
//!
//! ```text
//! // Source
//! fn effectful_value(n) / {Test.effect} {
//!     let v = perform Test.effect(n);
//!     v + 1
//! }
//!
//! // After lowering
//! fn effectful_value$body(state, frame, value, n) -> Outcome {
//!     match state {
//!         0 => return Request(Test.effect, (n), Cont[frame(resume$0, env{})]),
//!         1 => { let v = value; return Value(v + 1) }
//!     }
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`row`] - Interned effect rows and row algebra
//! - [`infer`] - Row inference for functions and handled bodies
//! - [`usage`] - Continuation usage analysis
//! - [`handler`] - Handler clause classification
//! - [`liveness`] - Live slots after each suspension point
//! - [`lowering`] - Continuation sites, captured environments, handle lifting

pub mod handler;
pub mod infer;
pub mod liveness;
pub mod lowering;
pub mod row;
pub mod usage;

pub use handler::{classify_clause, ClauseAnalysis, ClauseStrategy};
pub use infer::{infer_program, EffectInferencer, InferredEffects};
pub use liveness::{Slot, SlotSet};
pub use lowering::{lower_program, ContinuationSite, LiftedHandle, LoweredFn, LoweredKind, SiteKind};
pub use row::{RowData, RowId, RowInterner};
pub use usage::{analyze_usage, Bound, ContinuationUsage};

use crate::hir::{DefId, ExprId, ExprKind, Program};

/// Which part of the program a [`FunctionEffectInfo`] describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectInfoKind {
    Function,
    /// A lifted handled body.
    HandledBody,
    /// One clause of a `handle` expression in `owner`.
    Clause { handle: ExprId, op: String },
}

/// Effect summary of a function, handled body or handler clause.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEffectInfo {
    pub def_id: DefId,
    pub name: String,
    pub kind: EffectInfoKind,
    pub row: RowId,
    pub effectful: bool,
    /// Usage of every continuation-typed binding: `Fn`-typed parameters,
    /// and the continuation of a clause.
    pub continuations: Vec<(String, ContinuationUsage)>,
}

/// Summarize the lowered functions and their clauses.
pub fn function_infos(
    program: &Program,
    lowered: &[LoweredFn<'_>],
    inferred: &InferredEffects,
    rows: &RowInterner,
) -> Vec<FunctionEffectInfo> {
    let mut infos = Vec::new();
    for func in lowered {
        let body = &func.decl.body;
        let local_name = |id| body.local(id).map_or_else(|| format!("{:?}", id), |l| l.name.clone());

        infos.push(FunctionEffectInfo {
            def_id: func.def_id,
            name: func.name.clone(),
            kind: match func.kind {
                LoweredKind::Source => EffectInfoKind::Function,
                LoweredKind::Handle { .. } => EffectInfoKind::HandledBody,
            },
            row: func.row,
            effectful: func.effectful,
            continuations: func
                .param_usage
                .iter()
                .map(|(param, usage)| (local_name(*param), *usage))
                .collect(),
        });

        let mut handles: Vec<_> = func.handles.keys().copied().collect();
        handles.sort();
        for handle in handles {
            let Some(expr) = lowering::find_own_expr(func.expr, handle) else {
                continue;
            };
            let ExprKind::Handle { clauses, .. } = &expr.kind else {
                continue;
            };
            let clause_rows = inferred.clauses.get(&(func.decl.def_id, handle));
            for (index, clause) in clauses.iter().enumerate() {
                let row = clause_rows
                    .and_then(|rows| rows.get(index).copied())
                    .unwrap_or_else(|| rows.empty());
                let usage = func
                    .clauses
                    .get(&(handle, index))
                    .map_or_else(|| analyze_usage(&clause.body, clause.cont), |c| c.usage);
                infos.push(FunctionEffectInfo {
                    def_id: func.def_id,
                    name: func.name.clone(),
                    kind: EffectInfoKind::Clause {
                        handle,
                        op: program.op_label(clause.op),
                    },
                    row,
                    effectful: !rows.is_empty(row),
                    continuations: vec![(local_name(clause.cont), usage)],
                });
            }
        }
    }
    infos
}
