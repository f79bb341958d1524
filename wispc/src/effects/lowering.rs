//! # Effect Lowering
//!
//! Prepares every function for the trampoline backend:
//!
//! 1. **Handle lifting.** The body of each `handle` becomes a function of
//!    its own, `{owner}$handle{n}`, receiving the bindings it reads by
//!    value. The dispatch loop stays in the owner.
//! 2. **Continuation sites.** Every effectful call, every `perform` and
//!    every `handle` with an effectful body is a point where the function
//!    may suspend. Sites are numbered per function in evaluation order.
//! 3. **Operand spilling.** A suspended function loses its operand stack.
//!    Operands evaluated before a later operand that may suspend are kept
//!    in temporaries instead.
//! 4. **Captured environments.** A site's frame holds exactly the slots
//!    that are in scope at the site and read after it.
//!
//! ```text
//! fn f(x) {                       site 0: perform Ask.get()
//!     let a = x * 2;                  captured: [a]
//!     let b = perform Ask.get();  site 1: g(b)
//!     a + g(b)                        captured: [t0] (a, spilled)
//! }
//! ```
//!
//! A site in tail position whose continuation-typed parameters are used
//! linearly is *inline-resumable*: nothing of the function remains to run
//! after it, so a suspended request passes through without a frame.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use super::handler::{check_resume_scopes, classify_clause, ClauseAnalysis};
use super::infer::InferredEffects;
use super::liveness::{live_after_sites, LivenessInput, Slot, SlotSet};
use super::row::{RowId, RowInterner};
use super::usage::{analyze_usage, visit_tail_positions, ContinuationUsage};
use crate::diagnostics::{Diagnostic, EffectError};
use crate::hir::{DefId, Expr, ExprId, ExprKind, FnDecl, LocalId, Program, Stmt, Type};
use crate::span::Span;

/// What kind of suspension point a site is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    Call,
    Perform,
    Handle,
}

/// A point where a function may suspend.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationSite {
    pub expr_id: ExprId,
    /// Position of the site in evaluation order within its function.
    pub site_id: u32,
    pub owner: DefId,
    pub kind: SiteKind,
    /// Slots saved in the site's frame, sorted.
    pub captured: Vec<Slot>,
    /// Type of the value the site produces when resumed.
    pub resume_type: Type,
    pub inline_resumable: bool,
    /// Spill temporaries among `captured`.
    pub preserved_temps: Vec<Slot>,
    pub span: Span,
}

/// Where a compiled function comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweredKind {
    Source,
    /// Lifted body of a `handle` expression in `owner`.
    Handle { owner: DefId, expr: ExprId },
}

/// A lifted handled body, as seen from the function containing the `handle`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiftedHandle {
    pub def_id: DefId,
    pub name: String,
    /// Bindings passed by value, in parameter order.
    pub captures: Vec<LocalId>,
    pub effectful: bool,
}

/// A function ready for code generation.
#[derive(Debug, Clone)]
pub struct LoweredFn<'p> {
    pub def_id: DefId,
    pub name: String,
    pub kind: LoweredKind,
    /// Source function whose bindings this function uses.
    pub decl: &'p FnDecl,
    pub expr: &'p Expr,
    pub exported: bool,
    /// Parameters in order. Their slots are `0..params.len()`.
    pub params: Vec<LocalId>,
    /// Slot of every binding of `decl`, indexed by `LocalId`.
    pub slots: Vec<Slot>,
    pub temp_count: u32,
    pub ret: Type,
    pub row: RowId,
    pub effectful: bool,
    pub sites: Vec<ContinuationSite>,
    /// Spill temporaries per operand list.
    pub spills: HashMap<ExprId, Vec<Slot>>,
    pub handles: HashMap<ExprId, LiftedHandle>,
    /// Clause classification, keyed by `handle` expression and clause index.
    pub clauses: HashMap<(ExprId, usize), ClauseAnalysis>,
    /// Usage of every continuation-typed parameter.
    pub param_usage: Vec<(LocalId, ContinuationUsage)>,
    pub span: Span,
    site_index: HashMap<ExprId, usize>,
}

impl LoweredFn<'_> {
    pub fn slot(&self, local: LocalId) -> Slot {
        self.slots
            .get(local.index as usize)
            .copied()
            .unwrap_or(Slot(local.index))
    }

    /// Slots for source bindings; temporaries follow.
    pub fn binding_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn slot_count(&self) -> u32 {
        self.binding_slots() + self.temp_count
    }

    pub fn site(&self, expr: ExprId) -> Option<&ContinuationSite> {
        self.site_index.get(&expr).map(|&i| &self.sites[i])
    }

    /// Whether any site needs a resume entry.
    pub fn has_resumable_sites(&self) -> bool {
        self.effectful && self.sites.iter().any(|s| !s.inline_resumable)
    }

    pub fn is_temp(&self, slot: Slot) -> bool {
        slot.0 >= self.binding_slots()
    }
}

/// Everything a function is lowered from.
struct FnInput<'p> {
    def_id: DefId,
    name: String,
    kind: LoweredKind,
    decl: &'p FnDecl,
    expr: &'p Expr,
    params: Vec<LocalId>,
    row: RowId,
    exported: bool,
    ret: Type,
    span: Span,
}

/// Lowering of a whole program.
#[derive(Debug)]
pub struct Lowering<'p, 'a> {
    program: &'p Program,
    inferred: &'a InferredEffects,
    rows: &'a RowInterner,
    /// Lifted name index and `DefId` of every `handle`, keyed by source
    /// function and expression.
    lifted: HashMap<(DefId, ExprId), (u32, DefId)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'p, 'a> Lowering<'p, 'a> {
    /// `next_def` is the first `DefId` free for lifted functions.
    pub fn new(program: &'p Program, inferred: &'a InferredEffects, rows: &'a RowInterner, next_def: DefId) -> Self {
        let mut lifted = HashMap::new();
        let mut next = next_def.index;
        for func in &program.functions {
            let mut n = 0;
            number_handles(&func.body.expr, &mut |handle| {
                lifted.insert((func.def_id, handle.id), (n, DefId::new(next)));
                n += 1;
                next += 1;
            });
        }
        Self {
            program,
            inferred,
            rows,
            lifted,
            diagnostics: Vec::new(),
        }
    }

    pub fn lower(mut self) -> (Vec<LoweredFn<'p>>, Vec<Diagnostic>) {
        let program = self.program;
        let mut out = Vec::new();
        for func in &program.functions {
            check_resume_scopes(&func.body, &mut self.diagnostics);
            let row = self.inferred.function(func.def_id).unwrap_or_else(|| self.rows.empty());
            let input = FnInput {
                def_id: func.def_id,
                name: func.name.clone(),
                kind: LoweredKind::Source,
                decl: func,
                expr: &func.body.expr,
                params: func.body.params().map(|l| l.id).collect(),
                row,
                exported: func.exported,
                ret: func.ret.clone(),
                span: func.span,
            };
            self.lower_fn(input, &mut out);
        }
        (out, self.diagnostics)
    }

    fn lower_fn(&mut self, input: FnInput<'p>, out: &mut Vec<LoweredFn<'p>>) {
        let decl = input.decl;
        let root = decl.def_id;
        let slots = slot_layout(decl.body.locals.len(), &input.params);
        let effectful = !self.rows.is_empty(input.row);

        if let LoweredKind::Handle { .. } = input.kind {
            self.check_handled_body(&input);
        }

        // Handles compiled in this function.
        let mut handles = HashMap::new();
        let mut own_handles = Vec::new();
        walk_own(input.expr, &mut |e| {
            if let ExprKind::Handle { body, .. } = &e.kind {
                own_handles.push(e);
                let (n, def_id) = self.lifted.get(&(root, e.id)).copied().unwrap_or((0, input.def_id));
                let effectful = self
                    .inferred
                    .handled_body(root, e.id)
                    .map_or(false, |row| !self.rows.is_empty(row));
                handles.insert(
                    e.id,
                    LiftedHandle {
                        def_id,
                        name: format!("{}$handle{}", decl.name, n),
                        captures: free_locals(body),
                        effectful,
                    },
                );
            }
        });

        // Sites in evaluation order.
        let mut order = Vec::new();
        self.number_sites(root, input.expr, &mut order);
        let site_set: HashSet<ExprId> = order.iter().map(|(id, _)| *id).collect();

        // Spill temporaries.
        let mut spills = HashMap::new();
        let mut temp_count = 0u32;
        walk_own(input.expr, &mut |e| {
            let Some(operands) = e.operands() else {
                return;
            };
            let last = operands.iter().rposition(|op| self.contains_site(root, op));
            if let Some(last) = last.filter(|&l| l > 0) {
                let temps = (0..=last)
                    .map(|i| Slot(slots.len() as u32 + temp_count + i as u32))
                    .collect();
                temp_count += last as u32 + 1;
                spills.insert(e.id, temps);
            }
        });

        let handle_captures: HashMap<ExprId, Vec<LocalId>> =
            handles.iter().map(|(id, h)| (*id, h.captures.clone())).collect();
        let live_after = live_after_sites(
            input.expr,
            LivenessInput {
                slots: &slots,
                spills: &spills,
                handle_captures: &handle_captures,
            },
        );

        let mut scopes = HashMap::new();
        let mut scope = input.params.clone();
        record_scopes(input.expr, &mut scope, &site_set, &mut scopes);

        let mut tails = HashSet::new();
        visit_tail_positions(input.expr, true, true, &mut |e, tail| {
            if tail {
                tails.insert(e.id);
            }
        });

        let param_usage: Vec<(LocalId, ContinuationUsage)> = input
            .params
            .iter()
            .filter(|p| decl.body.local(**p).map_or(false, |l| l.ty.is_continuation_like()))
            .map(|p| (*p, analyze_usage(input.expr, *p)))
            .collect();

        let binding_slots = slots.len() as u32;
        let mut sites = Vec::with_capacity(order.len());
        for (site_id, (expr_id, kind)) in order.iter().enumerate() {
            let Some(expr) = find_own_expr(input.expr, *expr_id) else {
                continue;
            };
            let in_scope: SlotSet = scopes
                .get(expr_id)
                .map(|locals: &Vec<LocalId>| {
                    locals
                        .iter()
                        .filter_map(|l| slots.get(l.index as usize).copied())
                        .collect()
                })
                .unwrap_or_default();
            let captured: Vec<Slot> = live_after
                .get(expr_id)
                .map(|live| {
                    live.iter()
                        .copied()
                        .filter(|s| s.0 >= binding_slots || in_scope.contains(s))
                        .collect()
                })
                .unwrap_or_default();
            let preserved_temps = captured.iter().copied().filter(|s| s.0 >= binding_slots).collect();

            let inline_resumable = *kind != SiteKind::Handle
                && tails.contains(expr_id)
                && self.relevant_usage_is_linear(expr, &param_usage);

            self.check_capture_types(&input, expr, &captured, &slots);

            sites.push(ContinuationSite {
                expr_id: *expr_id,
                site_id: site_id as u32,
                owner: input.def_id,
                kind: *kind,
                captured,
                resume_type: expr.ty.clone(),
                inline_resumable,
                preserved_temps,
                span: expr.span,
            });
        }
        let site_index = sites.iter().enumerate().map(|(i, s)| (s.expr_id, i)).collect();

        let mut clauses = HashMap::new();
        for handle in &own_handles {
            if let ExprKind::Handle { clauses: hir_clauses, .. } = &handle.kind {
                for (index, clause) in hir_clauses.iter().enumerate() {
                    let Some(op) = self.program.op_decl(clause.op) else {
                        continue;
                    };
                    let analysis = classify_clause(op.resume_kind, clause, &decl.body, &mut self.diagnostics);
                    clauses.insert((handle.id, index), analysis);
                }
            }
        }

        debug!(
            function = %input.name,
            effectful,
            sites = sites.len(),
            spilled = temp_count,
            "lowered function"
        );

        let lifted: Vec<(ExprId, &'p Expr, LiftedHandle)> = own_handles
            .iter()
            .copied()
            .filter_map(|h| match &h.kind {
                ExprKind::Handle { body, .. } => handles.get(&h.id).map(|l| (h.id, body.as_ref(), l.clone())),
                _ => None,
            })
            .collect();

        out.push(LoweredFn {
            def_id: input.def_id,
            name: input.name,
            kind: input.kind,
            decl,
            expr: input.expr,
            exported: input.exported,
            params: input.params,
            slots,
            temp_count,
            ret: input.ret,
            row: input.row,
            effectful,
            sites,
            spills,
            handles,
            clauses,
            param_usage,
            span: input.span,
            site_index,
        });

        for (expr_id, body, handle) in lifted {
            let row = self
                .inferred
                .handled_body(root, expr_id)
                .unwrap_or_else(|| self.rows.empty());
            let child = FnInput {
                def_id: handle.def_id,
                name: handle.name,
                kind: LoweredKind::Handle {
                    owner: input.def_id,
                    expr: expr_id,
                },
                decl,
                expr: body,
                params: handle.captures,
                row,
                exported: false,
                ret: body.ty.clone(),
                span: body.span,
            };
            self.lower_fn(child, out);
        }
    }

    fn site_kind(&self, root: DefId, expr: &Expr) -> Option<SiteKind> {
        let effectful = |row: Option<RowId>| row.map_or(false, |r| !self.rows.is_empty(r));
        match &expr.kind {
            ExprKind::Perform { .. } => Some(SiteKind::Perform),
            ExprKind::Call { callee, .. } if effectful(self.inferred.callee_row(callee)) => Some(SiteKind::Call),
            ExprKind::Handle { .. } if effectful(self.inferred.handled_body(root, expr.id)) => {
                Some(SiteKind::Handle)
            }
            _ => None,
        }
    }

    fn contains_site(&self, root: DefId, expr: &Expr) -> bool {
        let mut found = false;
        walk_own(expr, &mut |e| {
            if !found && self.site_kind(root, e).is_some() {
                found = true;
            }
        });
        found
    }

    /// Sites of one function in evaluation order. A `handle` site comes
    /// before the sites of its clauses: clauses run after the body returns.
    fn number_sites(&self, root: DefId, expr: &Expr, order: &mut Vec<(ExprId, SiteKind)>) {
        match &expr.kind {
            ExprKind::Handle { clauses, .. } => {
                if let Some(kind) = self.site_kind(root, expr) {
                    order.push((expr.id, kind));
                }
                for clause in clauses {
                    self.number_sites(root, &clause.body, order);
                }
            }
            _ => {
                expr.for_each_child(|child| self.number_sites(root, child, order));
                if let Some(kind) = self.site_kind(root, expr) {
                    order.push((expr.id, kind));
                }
            }
        }
    }

    /// A call through a continuation-typed parameter may skip its frame only
    /// if that parameter is used exactly once.
    fn relevant_usage_is_linear(&self, site: &Expr, usage: &[(LocalId, ContinuationUsage)]) -> bool {
        match &site.kind {
            ExprKind::Call { callee, .. } => match &callee.kind {
                ExprKind::Local(id) => usage
                    .iter()
                    .find(|(param, _)| param == id)
                    .map_or(true, |(_, u)| u.is_linear()),
                _ => true,
            },
            _ => true,
        }
    }

    fn check_capture_types(&mut self, input: &FnInput<'p>, site: &Expr, captured: &[Slot], slots: &[Slot]) {
        for slot in captured {
            let Some(index) = slots.iter().position(|s| s == slot) else {
                continue;
            };
            let Some(local) = input.decl.body.locals.get(index) else {
                continue;
            };
            if local.ty.mentions_param() {
                self.diagnostics.push(
                    EffectError::UnboundedCapture {
                        name: input.name.clone(),
                        binding: local.name.clone(),
                        ty: local.ty.to_string(),
                        span: site.span,
                    }
                    .into(),
                );
            }
        }
        if site.ty.mentions_param() {
            self.diagnostics.push(
                EffectError::UnboundedCapture {
                    name: input.name.clone(),
                    binding: "resume value".to_string(),
                    ty: site.ty.to_string(),
                    span: site.span,
                }
                .into(),
            );
        }
    }

    /// Handled bodies receive their captures by value and cannot leave the
    /// owner with `return`.
    fn check_handled_body(&mut self, input: &FnInput<'p>) {
        let diagnostics = &mut self.diagnostics;
        walk_own(input.expr, &mut |e| match &e.kind {
            ExprKind::Assign { target, .. } if input.params.contains(target) => {
                let binding = input
                    .decl
                    .body
                    .local(*target)
                    .map_or_else(|| format!("{:?}", target), |l| l.name.clone());
                diagnostics.push(EffectError::CapturedAssignment { binding, span: e.span }.into());
            }
            ExprKind::Return(_) => {
                diagnostics.push(EffectError::ReturnInHandledBody { span: e.span }.into());
            }
            _ => {}
        });
    }
}

/// Lower every function of `program`.
pub fn lower_program<'p>(
    program: &'p Program,
    inferred: &InferredEffects,
    rows: &RowInterner,
    next_def: DefId,
) -> (Vec<LoweredFn<'p>>, Vec<Diagnostic>) {
    Lowering::new(program, inferred, rows, next_def).lower()
}

/// Parameters first, then every other binding in `LocalId` order.
fn slot_layout(locals: usize, params: &[LocalId]) -> Vec<Slot> {
    let mut slots = vec![Slot(0); locals];
    let mut next = 0u32;
    for param in params {
        if let Some(slot) = slots.get_mut(param.index as usize) {
            *slot = Slot(next);
            next += 1;
        }
    }
    for (index, slot) in slots.iter_mut().enumerate() {
        if !params.iter().any(|p| p.index as usize == index) {
            *slot = Slot(next);
            next += 1;
        }
    }
    slots
}

/// Visit every expression compiled into the same function as `expr`:
/// everything except the bodies of `handle` expressions.
pub(crate) fn walk_own<'e>(expr: &'e Expr, f: &mut dyn FnMut(&'e Expr)) {
    f(expr);
    match &expr.kind {
        ExprKind::Handle { clauses, .. } => {
            for clause in clauses {
                walk_own(&clause.body, f);
            }
        }
        _ => expr.for_each_child(|child| walk_own(child, f)),
    }
}

/// `handle` expressions in pre-order, including those nested in handled bodies.
fn number_handles<'e>(expr: &'e Expr, f: &mut dyn FnMut(&'e Expr)) {
    if let ExprKind::Handle { .. } = expr.kind {
        f(expr);
    }
    expr.for_each_child(|child| number_handles(child, f));
}

/// Bindings read or written in `body` but bound outside it, sorted.
pub fn free_locals(body: &Expr) -> Vec<LocalId> {
    let mut used = BTreeSet::new();
    let mut bound = HashSet::new();
    collect_locals(body, &mut used, &mut bound);
    used.into_iter().filter(|l| !bound.contains(l)).collect()
}

fn collect_locals(expr: &Expr, used: &mut BTreeSet<LocalId>, bound: &mut HashSet<LocalId>) {
    match &expr.kind {
        ExprKind::Local(id) => {
            used.insert(*id);
        }
        ExprKind::Assign { target, .. } => {
            used.insert(*target);
        }
        ExprKind::Resume { cont, .. } => {
            used.insert(*cont);
        }
        ExprKind::Block { stmts, .. } => {
            for stmt in stmts {
                if let Stmt::Let { local, .. } = stmt {
                    bound.insert(*local);
                }
            }
        }
        ExprKind::Handle { clauses, .. } => {
            for clause in clauses {
                bound.extend(clause.params.iter().copied());
                bound.insert(clause.cont);
            }
        }
        _ => {}
    }
    expr.for_each_child(|child| collect_locals(child, used, bound));
}

/// Bindings in scope at every site, in declaration order.
fn record_scopes(
    expr: &Expr,
    scope: &mut Vec<LocalId>,
    sites: &HashSet<ExprId>,
    out: &mut HashMap<ExprId, Vec<LocalId>>,
) {
    match &expr.kind {
        ExprKind::Block { stmts, expr: tail } => {
            let mark = scope.len();
            for stmt in stmts {
                record_scopes(stmt.expr(), scope, sites, out);
                if let Stmt::Let { local, .. } = stmt {
                    scope.push(*local);
                }
            }
            if let Some(e) = tail {
                record_scopes(e, scope, sites, out);
            }
            scope.truncate(mark);
        }
        ExprKind::Handle { clauses, .. } => {
            if sites.contains(&expr.id) {
                out.insert(expr.id, scope.clone());
            }
            for clause in clauses {
                let mark = scope.len();
                scope.extend(clause.params.iter().copied());
                scope.push(clause.cont);
                record_scopes(&clause.body, scope, sites, out);
                scope.truncate(mark);
            }
        }
        _ => {
            expr.for_each_child(|child| record_scopes(child, scope, sites, out));
            if sites.contains(&expr.id) {
                out.insert(expr.id, scope.clone());
            }
        }
    }
}

pub(crate) fn find_own_expr(root: &Expr, id: ExprId) -> Option<&Expr> {
    let mut found = None;
    walk_own(root, &mut |e| {
        if e.id == id {
            found = Some(e);
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::infer::infer_program;
    use crate::hir::{BinOp, BodyBuilder, OpDecl, OpRef};
    use wisp_runtime::ResumeKind;

    fn ask_program() -> (Program, OpRef) {
        let mut program = Program::new("app", "app.wisp");
        let ask = program.declare_effect(
            "Ask",
            vec![OpDecl::new("get", vec![], Type::Int, ResumeKind::Resume)],
        );
        let get = program.op(ask, "get").unwrap();
        (program, get)
    }

    fn lower(program: &Program) -> (Vec<LoweredFn<'_>>, Vec<Diagnostic>) {
        let mut rows = program.rows.clone();
        let (inferred, errors) = infer_program(program, &mut rows);
        assert!(errors.is_empty(), "{:?}", errors);
        lower_program(program, &inferred, &rows, program.next_def_id())
    }

    #[test]
    fn test_captures_only_live_bindings() {
        // fn f(x) { let a = x * 2; let b = perform get(); a + b }
        let (mut program, get) = ask_program();
        let mut b = BodyBuilder::new();
        let x = b.param("x", Type::Int);
        let a = b.local("a", Type::Int);
        let bb = b.local("b", Type::Int);
        let get_x = b.local_ref(x);
        let two = b.int(2);
        let double = b.binary(BinOp::Mul, get_x, two);
        let perform = b.perform(get, vec![], Type::Int);
        let perform_id = perform.id;
        let stmts = vec![b.let_stmt(a, double), b.let_stmt(bb, perform)];
        let get_a = b.local_ref(a);
        let get_b = b.local_ref(bb);
        let sum = b.binary(BinOp::Add, get_a, get_b);
        let block = b.block(stmts, Some(sum));
        program.add_function(FnDecl::new(DefId::new(0), "f", b.finish(block), Type::Int));

        let (lowered, diagnostics) = lower(&program);
        assert!(diagnostics.is_empty());
        let f = &lowered[0];
        assert!(f.effectful);
        let site = f.site(perform_id).unwrap();
        assert_eq!(site.site_id, 0);
        assert_eq!(site.captured, vec![Slot(1)]);
        assert!(!site.inline_resumable);
    }

    #[test]
    fn test_spills_operand_before_site() {
        // fn f(x) { x + perform get() }
        let (mut program, get) = ask_program();
        let mut b = BodyBuilder::new();
        let x = b.param("x", Type::Int);
        let get_x = b.local_ref(x);
        let perform = b.perform(get, vec![], Type::Int);
        let perform_id = perform.id;
        let sum = b.binary(BinOp::Add, get_x, perform);
        let sum_id = sum.id;
        program.add_function(FnDecl::new(DefId::new(0), "f", b.finish(sum), Type::Int));

        let (lowered, _) = lower(&program);
        let f = &lowered[0];
        assert_eq!(f.spills[&sum_id], vec![Slot(1), Slot(2)]);
        assert_eq!(f.temp_count, 2);
        let site = f.site(perform_id).unwrap();
        assert_eq!(site.captured, vec![Slot(1)]);
        assert_eq!(site.preserved_temps, vec![Slot(1)]);
    }

    #[test]
    fn test_tail_perform_is_inline() {
        let (mut program, get) = ask_program();
        let mut b = BodyBuilder::new();
        let perform = b.perform(get, vec![], Type::Int);
        program.add_function(FnDecl::new(DefId::new(0), "f", b.finish(perform), Type::Int));

        let (lowered, _) = lower(&program);
        assert!(lowered[0].sites[0].inline_resumable);
        assert!(!lowered[0].has_resumable_sites());
    }

    #[test]
    fn test_handle_is_lifted() {
        // fn main(n) { let m = n + 1; handle { perform get() + m } with { get(), k => resume k 1 } }
        let (mut program, get) = ask_program();
        let mut b = BodyBuilder::new();
        let n = b.param("n", Type::Int);
        let m = b.local("m", Type::Int);
        let k = b.local("k", Type::cont(Type::Int));
        let get_n = b.local_ref(n);
        let one = b.int(1);
        let init = b.binary(BinOp::Add, get_n, one);
        let stmt = b.let_stmt(m, init);
        let perform = b.perform(get, vec![], Type::Int);
        let get_m = b.local_ref(m);
        let body = b.binary(BinOp::Add, perform, get_m);
        let value = b.int(1);
        let resume = b.resume(k, value);
        let clause = b.clause(get, vec![], k, resume);
        let handle = b.handle(body, vec![clause]);
        let handle_id = handle.id;
        let block = b.block(vec![stmt], Some(handle));
        program.add_function(FnDecl::new(DefId::new(0), "main", b.finish(block), Type::Int));

        let (lowered, diagnostics) = lower(&program);
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        assert_eq!(lowered.len(), 2);
        let main = &lowered[0];
        assert!(!main.effectful);
        let lifted = &main.handles[&handle_id];
        assert_eq!(lifted.name, "main$handle0");
        assert_eq!(lifted.def_id, DefId::new(1));
        assert_eq!(lifted.captures, vec![m]);

        let body_fn = &lowered[1];
        assert_eq!(body_fn.name, "main$handle0");
        assert!(body_fn.effectful);
        assert_eq!(body_fn.params, vec![m]);
        assert_eq!(body_fn.slot(m), Slot(0));
        assert_eq!(
            body_fn.kind,
            LoweredKind::Handle {
                owner: DefId::new(0),
                expr: handle_id
            }
        );
    }

    #[test]
    fn test_assigning_capture_is_rejected() {
        let (mut program, get) = ask_program();
        let mut b = BodyBuilder::new();
        let x = b.param("x", Type::Int);
        let k = b.local("k", Type::cont(Type::Int));
        let perform = b.perform(get, vec![], Type::Int);
        let assign = b.assign(x, perform);
        let body = b.block(vec![Stmt::Expr(assign)], None);
        let value = b.int(0);
        let resume = b.resume(k, value);
        let clause = b.clause(get, vec![], k, resume);
        let handle = b.handle(body, vec![clause]);
        program.add_function(FnDecl::new(DefId::new(0), "f", b.finish(handle), Type::Unit));

        let (_, diagnostics) = lower(&program);
        assert!(diagnostics
            .iter()
            .any(|d| d.code == Some(crate::diagnostics::ErrorCode::CapturedAssignment)));
    }

    #[test]
    fn test_unbounded_capture() {
        let (mut program, get) = ask_program();
        let mut b = BodyBuilder::new();
        let t = b.param("t", Type::Param("T".into()));
        let perform = b.perform(get, vec![], Type::Int);
        let stmt = Stmt::Expr(perform);
        let get_t = b.local_ref(t);
        let block = b.block(vec![stmt], Some(get_t));
        program.add_function(FnDecl::new(DefId::new(0), "f", b.finish(block), Type::Param("T".into())));

        let (_, diagnostics) = lower(&program);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, Some(crate::diagnostics::ErrorCode::UnboundedCapture));
    }
}
