//! # Handler Clause Classification
//!
//! Decides how each clause of a `handle` expression is compiled, based on
//! the operation's resume kind and on how the clause uses its continuation.
//!
//! ## Resume Kinds
//!
//! - **Tail**: the clause's value *is* the resumption value. The clause
//!   never touches its continuation; after it finishes, the dispatch loop
//!   resumes with the value.
//! - **Resume**: the clause resumes explicitly. Continuations are one-shot,
//!   so `resume` must be the clause's final action, may run at most once,
//!   and the continuation may not be used as a value.
//!
//! ```text
//! handle { ... } with {
//!     Log.write(msg), k => { print(msg) }         // tail: value resumes
//!     Ask.get(), k      => { resume k 42 }        // resume in tail position
//!     Ask.get(), k      => { if c { resume k 1 } else { 0 } }
//!                                                  // some paths trap
//! }
//! ```
//!
//! A resume-kind clause that does not resume on some path compiles that
//! path to a `MissingTailResume` trap.

use wisp_runtime::ResumeKind;

use super::usage::{analyze_usage, visit_tail_positions, Bound, ContinuationUsage};
use crate::diagnostics::{Diagnostic, EffectError, ErrorCode};
use crate::hir::{Body, Expr, ExprKind, HandlerClause, LocalId};
use crate::span::Span;

/// How a clause is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseStrategy {
    /// Tail-kind clause: its value is resumed by the dispatch loop.
    TailValue,
    /// Resume-kind clause whose resumes are all in tail position.
    /// `may_miss` is set when some path finishes without resuming.
    ResumeInTail { may_miss: bool },
    /// Resume-kind clause that never resumes.
    AlwaysMissing,
}

/// Classification of one clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClauseAnalysis {
    pub strategy: ClauseStrategy,
    pub usage: ContinuationUsage,
}

/// Classify a clause, pushing errors and warnings into `diagnostics`.
pub fn classify_clause(
    kind: ResumeKind,
    clause: &HandlerClause,
    body: &Body,
    diagnostics: &mut Vec<Diagnostic>,
) -> ClauseAnalysis {
    let k = clause.cont;
    let cont = body.local(k).map_or_else(|| "k".to_string(), |l| l.name.clone());
    let usage = analyze_usage(&clause.body, k);

    if usage.escapes {
        diagnostics.push(
            EffectError::ContinuationEscapes {
                cont: cont.clone(),
                span: clause.span,
            }
            .into(),
        );
    }

    match kind {
        ResumeKind::Tail => {
            for span in resumes_of(&clause.body, k) {
                diagnostics.push(
                    Diagnostic::warning(
                        format!("`resume` of `{}` in a tail-resumptive clause resumes twice", cont),
                        span,
                    )
                    .with_error_code(ErrorCode::ResumeInTailClause),
                );
            }
            ClauseAnalysis {
                strategy: ClauseStrategy::TailValue,
                usage,
            }
        }
        ResumeKind::Resume => {
            let mut misplaced = false;
            visit_tail_positions(&clause.body, true, false, &mut |e, tail| {
                if let ExprKind::Resume { cont: target, .. } = &e.kind {
                    if *target == k && !tail {
                        misplaced = true;
                        diagnostics.push(
                            EffectError::ResumeOutsideTail {
                                cont: cont.clone(),
                                span: e.span,
                            }
                            .into(),
                        );
                    }
                }
            });
            if !misplaced && !usage.at_most_once() {
                diagnostics.push(
                    EffectError::NonLinearResume {
                        cont: cont.clone(),
                        span: clause.span,
                    }
                    .into(),
                );
            }

            let strategy = if usage.max == Bound::Finite(0) {
                if !usage.escapes {
                    diagnostics.push(
                        Diagnostic::warning(format!("clause never resumes `{}`", cont), clause.span)
                            .with_error_code(ErrorCode::ResumeNeverCalled),
                    );
                }
                ClauseStrategy::AlwaysMissing
            } else {
                ClauseStrategy::ResumeInTail {
                    may_miss: usage.min == 0,
                }
            };
            ClauseAnalysis { strategy, usage }
        }
    }
}

/// Spans of every `resume` of `k` in `expr`.
fn resumes_of(expr: &Expr, k: LocalId) -> Vec<Span> {
    let mut spans = Vec::new();
    collect_resumes(expr, k, &mut spans);
    spans
}

fn collect_resumes(expr: &Expr, k: LocalId, spans: &mut Vec<Span>) {
    if let ExprKind::Resume { cont, .. } = &expr.kind {
        if *cont == k {
            spans.push(expr.span);
        }
    }
    expr.for_each_child(|child| collect_resumes(child, k, spans));
}

/// Report every `resume` whose continuation is not the continuation of an
/// enclosing clause of the same function. Handled bodies start a new scope:
/// they are compiled as separate functions.
pub fn check_resume_scopes(body: &Body, diagnostics: &mut Vec<Diagnostic>) {
    let mut scope = Vec::new();
    check_scopes(&body.expr, body, &mut scope, diagnostics);
}

fn check_scopes(expr: &Expr, body: &Body, scope: &mut Vec<LocalId>, diagnostics: &mut Vec<Diagnostic>) {
    match &expr.kind {
        ExprKind::Resume { cont, value } => {
            if !scope.contains(cont) {
                let name = body.local(*cont).map_or_else(|| format!("{:?}", cont), |l| l.name.clone());
                diagnostics.push(
                    EffectError::ResumeOutsideClause {
                        cont: name,
                        span: expr.span,
                    }
                    .into(),
                );
            }
            check_scopes(value, body, scope, diagnostics);
        }
        ExprKind::Handle { body: handled, clauses } => {
            let mut inner = Vec::new();
            check_scopes(handled, body, &mut inner, diagnostics);
            for clause in clauses {
                scope.push(clause.cont);
                check_scopes(&clause.body, body, scope, diagnostics);
                scope.pop();
            }
        }
        _ => expr.for_each_child(|child| check_scopes(child, body, scope, diagnostics)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{BodyBuilder, EffectId, OpRef, Stmt, Type};

    fn op() -> OpRef {
        OpRef::new(EffectId::new(0), 0)
    }

    fn clause_with(build: impl FnOnce(&mut BodyBuilder, LocalId) -> Expr) -> (HandlerClause, Body) {
        let mut b = BodyBuilder::new();
        let k = b.local("k", Type::cont(Type::Int));
        let clause_body = build(&mut b, k);
        let clause = b.clause(op(), vec![], k, clause_body);
        let unit = b.unit();
        (clause, b.finish(unit))
    }

    #[test]
    fn test_tail_resume() {
        let (clause, body) = clause_with(|b, k| {
            let v = b.int(42);
            b.resume(k, v)
        });
        let mut diagnostics = Vec::new();
        let analysis = classify_clause(ResumeKind::Resume, &clause, &body, &mut diagnostics);
        assert!(diagnostics.is_empty());
        assert_eq!(analysis.strategy, ClauseStrategy::ResumeInTail { may_miss: false });
        assert!(analysis.usage.is_linear());
    }

    #[test]
    fn test_conditional_resume_may_miss() {
        let (clause, body) = clause_with(|b, k| {
            let cond = b.bool(false);
            let v = b.int(1);
            let resume = b.resume(k, v);
            let other = b.unit();
            b.if_else(cond, resume, Some(other))
        });
        let mut diagnostics = Vec::new();
        let analysis = classify_clause(ResumeKind::Resume, &clause, &body, &mut diagnostics);
        assert!(diagnostics.is_empty());
        assert_eq!(analysis.strategy, ClauseStrategy::ResumeInTail { may_miss: true });
    }

    #[test]
    fn test_resume_outside_tail() {
        let (clause, body) = clause_with(|b, k| {
            let v = b.int(1);
            let resume = b.resume(k, v);
            let after = b.int(2);
            b.block(vec![Stmt::Expr(resume)], Some(after))
        });
        let mut diagnostics = Vec::new();
        classify_clause(ResumeKind::Resume, &clause, &body, &mut diagnostics);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, Some(ErrorCode::ResumeOutsideTail));
    }

    #[test]
    fn test_never_resumes_warns() {
        let (clause, body) = clause_with(|b, _| b.int(0));
        let mut diagnostics = Vec::new();
        let analysis = classify_clause(ResumeKind::Resume, &clause, &body, &mut diagnostics);
        assert_eq!(analysis.strategy, ClauseStrategy::AlwaysMissing);
        assert_eq!(diagnostics.len(), 1);
        assert!(!diagnostics[0].is_error());
        assert_eq!(diagnostics[0].code, Some(ErrorCode::ResumeNeverCalled));
    }

    #[test]
    fn test_escaping_continuation() {
        let (clause, body) = clause_with(|b, k| b.local_ref(k));
        let mut diagnostics = Vec::new();
        classify_clause(ResumeKind::Resume, &clause, &body, &mut diagnostics);
        assert!(diagnostics
            .iter()
            .any(|d| d.code == Some(ErrorCode::ContinuationEscapes)));
    }

    #[test]
    fn test_tail_clause_with_resume_warns() {
        let (clause, body) = clause_with(|b, k| {
            let v = b.int(1);
            b.resume(k, v)
        });
        let mut diagnostics = Vec::new();
        let analysis = classify_clause(ResumeKind::Tail, &clause, &body, &mut diagnostics);
        assert_eq!(analysis.strategy, ClauseStrategy::TailValue);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, Some(ErrorCode::ResumeInTailClause));
    }

    #[test]
    fn test_resume_outside_clause() {
        let mut b = BodyBuilder::new();
        let k = b.param("k", Type::cont(Type::Int));
        let v = b.int(1);
        let resume = b.resume(k, v);
        let body = b.finish(resume);
        let mut diagnostics = Vec::new();
        check_resume_scopes(&body, &mut diagnostics);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, Some(ErrorCode::ResumeOutsideClause));
    }
}
