//! # Trampoline Backend
//!
//! Compiles lowered functions to straight-line stack code. No stack is ever
//! switched: an effectful function returns an Outcome, and a function that
//! must survive a suspension parks its live slots in a heap frame.
//!
//! ## Function Layout
//!
//! A function without resumable sites compiles to one function with the
//! source signature. A function with resumable sites is split:
//!
//! ```text
//! f$body(state, frame, value, params...)   state 0: start
//!                                          state s+1: restore site s, continue
//! f(params...)          = f$body(0, null, (), params...)
//! f$resume$s(frame, v)  = f$body(s + 1, frame, v, ()...)
//! ```
//!
//! ## Continuation Sites
//!
//! | Site     | Completed                 | Suspended                                  |
//! |----------|---------------------------|--------------------------------------------|
//! | call     | unwrap value, continue    | append a call frame to the request, return |
//! | perform  | (never completes inline)  | return a request with a fresh continuation |
//! | handle   | dispatch loop             | unhandled requests get a handle frame      |
//!
//! Inline-resumable sites return the callee's outcome unchanged.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, trace};
use wisp_runtime::abi;
use wisp_runtime::module::{BinOp, Const, Instr};
use wisp_runtime::TrapCode;

use super::dispatcher::{AbiTypes, Dispatcher};
use super::sink::{FunctionBuilder, InstructionSink, Label};
use super::table::{FunctionOrigin, OpIndex};
use crate::diagnostics::{Diagnostic, EffectError};
use crate::effects::{ClauseStrategy, ContinuationSite, LoweredFn, RowInterner, Slot};
use crate::hir::{DefId, Expr, ExprId, ExprKind, HandlerClause, LiteralValue, LocalId, OpRef, Program, Stmt, Type};
use crate::ice_err;
use crate::span::Span;

type CodegenResult<T> = Result<T, Vec<Diagnostic>>;

/// Parameters of a `$body` function preceding the source parameters.
const STATE: u32 = 0;
const FRAME: u32 = 1;
const VALUE: u32 = 2;
const BODY_PREFIX: u32 = 3;

/// A compiled function as seen by its callers.
#[derive(Debug, Clone)]
struct Callable {
    def: DefId,
    index: u32,
    params: u32,
    effectful: bool,
    name: String,
    span: Span,
}

/// Resume entry of one non-inline site.
#[derive(Debug, Clone, Copy)]
struct ResumeEntry {
    state: i64,
    func: u32,
    /// `None` when the site captures nothing; the frame's env is null.
    env: Option<u32>,
}

#[derive(Debug, Clone)]
struct ResumeLayout {
    body: u32,
    entries: HashMap<ExprId, ResumeEntry>,
}

/// The enclosing handler clause of a `resume`.
#[derive(Debug, Clone, Copy)]
struct ClauseScope {
    cont: LocalId,
    strategy: ClauseStrategy,
    outcome: u32,
    dispatch: Label,
}

/// Code generator for a whole program.
pub struct Trampoline<'s> {
    sink: &'s mut dyn InstructionSink,
    rows: &'s RowInterner,
    ops: &'s OpIndex,
    types: AbiTypes,
    dispatcher: Option<Dispatcher>,
    args_types: HashMap<usize, u32>,
    callables: HashMap<DefId, Callable>,
    layouts: HashMap<DefId, ResumeLayout>,
    /// Outcome-returning wrappers of pure functions used at effectful types.
    adapters: HashMap<DefId, u32>,
    origins: Vec<FunctionOrigin>,
}

impl std::fmt::Debug for Trampoline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline")
            .field("functions", &self.origins.len())
            .field("dispatcher", &self.dispatcher.is_some())
            .finish()
    }
}

/// Generate every function of a lowered program into `sink` and export the
/// exported ones. Returns the origin of every function, by index.
pub fn generate(
    sink: &mut dyn InstructionSink,
    program: &Program,
    lowered: &[LoweredFn<'_>],
    ops: &OpIndex,
    rows: &RowInterner,
) -> CodegenResult<Vec<FunctionOrigin>> {
    let types = AbiTypes::declare(sink);
    let mut cg = Trampoline {
        sink,
        rows,
        ops,
        types,
        dispatcher: None,
        args_types: HashMap::new(),
        callables: HashMap::new(),
        layouts: HashMap::new(),
        adapters: HashMap::new(),
        origins: Vec::new(),
    };
    cg.declare_args_types(program);
    if lowered.iter().any(|f| f.effectful) {
        cg.dispatcher();
    }
    for func in lowered {
        cg.declare(func);
    }
    for func in lowered {
        cg.define(func)?;
    }
    for func in lowered.iter().filter(|f| f.exported) {
        if let Some(callable) = cg.callables.get(&func.def_id) {
            cg.sink.export(&func.name, callable.index);
        }
    }
    debug!(functions = cg.origins.len(), "generated trampoline code");
    Ok(cg.origins)
}

impl<'s> Trampoline<'s> {
    fn declare_function(&mut self, name: &str, params: u32, returns_outcome: bool, span: Span) -> u32 {
        let index = self.sink.declare_function(name, params, returns_outcome);
        self.origins.push(FunctionOrigin {
            name: name.to_string(),
            span,
        });
        index
    }

    /// Argument tuples of every operation arity.
    fn declare_args_types(&mut self, program: &Program) {
        let arities: BTreeSet<usize> = program
            .effects
            .iter()
            .flat_map(|e| e.ops.iter().map(|op| op.params.len()))
            .filter(|&n| n > 0)
            .collect();
        for arity in arities {
            let fields: Vec<String> = (0..arity).map(|i| i.to_string()).collect();
            let index = self.sink.add_struct_type(&abi::args_type_name(arity), &fields);
            self.args_types.insert(arity, index);
        }
    }

    /// The runtime helpers, generated on first use.
    fn dispatcher(&mut self) -> Dispatcher {
        if let Some(dispatcher) = self.dispatcher {
            return dispatcher;
        }
        let dispatcher = Dispatcher::generate(self.sink, self.types);
        for name in ["wisp$value", "wisp$append", "wisp$continue", "wisp$resume"] {
            self.origins.push(FunctionOrigin {
                name: name.to_string(),
                span: Span::dummy(),
            });
        }
        self.dispatcher = Some(dispatcher);
        dispatcher
    }

    fn declare(&mut self, func: &LoweredFn<'_>) {
        let params = func.params.len() as u32;
        if func.has_resumable_sites() {
            let body = self.declare_function(&format!("{}$body", func.name), BODY_PREFIX + params, true, func.span);
            let mut entries = HashMap::new();
            for site in func.sites.iter().filter(|s| !s.inline_resumable) {
                let index = self.declare_function(&format!("{}$resume${}", func.name, site.site_id), 2, true, site.span);
                let env = if site.captured.is_empty() {
                    None
                } else {
                    let fields: Vec<String> = site.captured.iter().map(|s| format!("{:?}", s)).collect();
                    Some(
                        self.sink
                            .add_struct_type(&format!("{}$env{}", func.name, site.site_id), &fields),
                    )
                };
                entries.insert(
                    site.expr_id,
                    ResumeEntry {
                        state: i64::from(site.site_id) + 1,
                        func: index,
                        env,
                    },
                );
            }
            self.layouts.insert(func.def_id, ResumeLayout { body, entries });
        }
        let index = self.declare_function(&func.name, params, func.effectful, func.span);
        self.callables.insert(
            func.def_id,
            Callable {
                def: func.def_id,
                index,
                params,
                effectful: func.effectful,
                name: func.name.clone(),
                span: func.span,
            },
        );
    }

    fn define(&mut self, func: &LoweredFn<'_>) -> CodegenResult<()> {
        let callable = self.callable(func.def_id, func.span)?;
        let Some(layout) = self.layouts.get(&func.def_id).cloned() else {
            let (locals, code) = FnCompiler::new(self, func, None).compile()?;
            trace!(function = %func.name, instrs = code.len(), "defined function");
            self.sink.define_function(callable.index, locals, code);
            return Ok(());
        };

        let (locals, code) = FnCompiler::new(self, func, Some(layout.clone())).compile()?;
        trace!(function = %func.name, instrs = code.len(), "defined resumable body");
        self.sink.define_function(layout.body, locals, code);

        // f(params...) = f$body(0, null, (), params...)
        let mut b = FunctionBuilder::new(callable.params, callable.params);
        b.i64(0);
        b.null();
        b.unit();
        for param in 0..callable.params {
            b.emit(Instr::LocalGet(param));
        }
        b.emit(Instr::Call(layout.body));
        b.emit(Instr::Return);
        let (locals, code) = b.finish();
        self.sink.define_function(callable.index, locals, code);

        let mut entries: Vec<ResumeEntry> = layout.entries.values().copied().collect();
        entries.sort_by_key(|e| e.state);
        for entry in entries {
            let mut b = FunctionBuilder::new(2, 2);
            b.i64(entry.state);
            b.emit(Instr::LocalGet(0));
            b.emit(Instr::LocalGet(1));
            for _ in 0..callable.params {
                b.unit();
            }
            b.emit(Instr::Call(layout.body));
            b.emit(Instr::Return);
            let (locals, code) = b.finish();
            self.sink.define_function(entry.func, locals, code);
        }
        Ok(())
    }

    fn callable(&self, def: DefId, span: Span) -> CodegenResult<Callable> {
        self.callables.get(&def).cloned().ok_or_else(|| {
            vec![EffectError::UnknownFunction {
                def: def.to_string(),
                span,
            }
            .into()]
        })
    }

    /// `{f}$outcome(params...) = wisp$value(f(params...))`
    fn adapter(&mut self, callable: &Callable) -> u32 {
        if let Some(&index) = self.adapters.get(&callable.def) {
            return index;
        }
        let dispatcher = self.dispatcher();
        let index = self.declare_function(
            &format!("{}$outcome", callable.name),
            callable.params,
            true,
            callable.span,
        );
        let mut b = FunctionBuilder::new(callable.params, callable.params);
        for param in 0..callable.params {
            b.emit(Instr::LocalGet(param));
        }
        b.emit(Instr::Call(callable.index));
        b.emit(Instr::Call(dispatcher.value));
        b.emit(Instr::Return);
        let (locals, code) = b.finish();
        self.sink.define_function(index, locals, code);
        self.adapters.insert(callable.def, index);
        index
    }
}

/// Compiles the body of one lowered function.
struct FnCompiler<'g, 's, 'f, 'p> {
    cg: &'g mut Trampoline<'s>,
    func: &'f LoweredFn<'p>,
    b: FunctionBuilder,
    /// Local index of slot 0.
    base: u32,
    layout: Option<ResumeLayout>,
    resume_labels: HashMap<ExprId, Label>,
    clauses: Vec<ClauseScope>,
}

impl<'g, 's, 'f, 'p> FnCompiler<'g, 's, 'f, 'p> {
    fn new(cg: &'g mut Trampoline<'s>, func: &'f LoweredFn<'p>, layout: Option<ResumeLayout>) -> Self {
        let params = func.params.len() as u32;
        let slots = func.slot_count();
        let (base, b) = match layout {
            Some(_) => (BODY_PREFIX, FunctionBuilder::new(BODY_PREFIX + params, BODY_PREFIX + slots)),
            None => (0, FunctionBuilder::new(params, slots)),
        };
        Self {
            cg,
            func,
            b,
            base,
            layout,
            resume_labels: HashMap::new(),
            clauses: Vec::new(),
        }
    }

    fn compile(mut self) -> CodegenResult<(u32, Vec<Instr>)> {
        let start = self.b.new_label();
        let mut restores = Vec::new();
        if let Some(layout) = &self.layout {
            let mut entries: Vec<(ExprId, ResumeEntry)> = layout.entries.iter().map(|(e, r)| (*e, *r)).collect();
            entries.sort_by_key(|(_, entry)| entry.state);

            self.b.emit(Instr::LocalGet(STATE));
            self.b.i64(0);
            self.b.emit(Instr::Binary(BinOp::Eq));
            self.b.jump_if(start);
            for (expr, entry) in entries {
                let restore = self.b.new_label();
                let resume = self.b.new_label();
                self.resume_labels.insert(expr, resume);
                self.b.emit(Instr::LocalGet(STATE));
                self.b.i64(entry.state);
                self.b.emit(Instr::Binary(BinOp::Eq));
                self.b.jump_if(restore);
                restores.push((expr, entry, restore, resume));
            }
            self.b.emit(Instr::Trap(TrapCode::InvalidContinuation));
        }

        self.b.bind(start);
        self.expr(self.func.expr)?;
        self.emit_return();

        // Restore the captured slots of a site from the frame's env.
        for (expr, entry, restore, resume) in restores {
            let site = self.site(expr, self.func.span)?;
            self.b.bind(restore);
            if let Some(env) = entry.env {
                for (field, slot) in site.captured.iter().enumerate() {
                    self.b.emit(Instr::LocalGet(FRAME));
                    self.b.emit(self.cg.types.frame_field(abi::FRAME_ENV));
                    self.b.emit(Instr::StructGet {
                        type_index: env,
                        field: field as u32,
                    });
                    self.b.emit(Instr::LocalSet(self.local(*slot)));
                }
            }
            self.b.jump(resume);
        }
        Ok(self.b.finish())
    }

    fn local(&self, slot: Slot) -> u32 {
        self.base + slot.0
    }

    fn binding(&self, local: LocalId) -> u32 {
        self.local(self.func.slot(local))
    }

    fn site(&self, expr: ExprId, span: Span) -> CodegenResult<&'f ContinuationSite> {
        let func = self.func;
        func.site(expr)
            .ok_or_else(|| vec![ice_err!(span, "expression is not a continuation site"; "expr" => expr, "function" => &func.name)])
    }

    fn entry(&self, site: &ContinuationSite) -> CodegenResult<(ResumeEntry, Label)> {
        let entry = self.layout.as_ref().and_then(|l| l.entries.get(&site.expr_id)).copied();
        let label = self.resume_labels.get(&site.expr_id).copied();
        match (entry, label) {
            (Some(entry), Some(label)) => Ok((entry, label)),
            _ => Err(vec![ice_err!(site.span, "resumable site without a resume entry"; "site" => site.site_id, "function" => &self.func.name)]),
        }
    }

    fn emit_return(&mut self) {
        if self.func.effectful {
            let dispatcher = self.cg.dispatcher();
            self.b.emit(Instr::Call(dispatcher.value));
        }
        self.b.emit(Instr::Return);
    }

    /// Compile `expr`, leaving exactly one value on the stack.
    fn expr(&mut self, expr: &'f Expr) -> CodegenResult<()> {
        match &expr.kind {
            ExprKind::Literal(lit) => self.b.emit(Instr::Const(match *lit {
                LiteralValue::Unit => Const::Unit,
                LiteralValue::Bool(b) => Const::Bool(b),
                LiteralValue::Int(v) => Const::I64(v),
                LiteralValue::Float(v) => Const::F64(v),
            })),
            ExprKind::Local(id) => self.b.emit(Instr::LocalGet(self.binding(*id))),
            ExprKind::Def(def) => self.function_ref(*def, &expr.ty, expr.span)?,
            ExprKind::Binary { op, left, right } => {
                self.operands(expr.id, &[left.as_ref(), right.as_ref()])?;
                self.b.emit(Instr::Binary(op.to_instr()));
            }
            ExprKind::Unary { op, operand } => {
                self.expr(operand)?;
                self.b.emit(Instr::Unary(op.to_instr()));
            }
            ExprKind::Block { stmts, expr: tail } => {
                for stmt in stmts {
                    match stmt {
                        Stmt::Let { local, init } => {
                            self.expr(init)?;
                            self.b.emit(Instr::LocalSet(self.binding(*local)));
                        }
                        Stmt::Expr(e) => {
                            self.expr(e)?;
                            self.b.emit(Instr::Drop);
                        }
                    }
                }
                match tail {
                    Some(e) => self.expr(e)?,
                    None => self.b.unit(),
                }
            }
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let otherwise = self.b.new_label();
                let end = self.b.new_label();
                self.expr(condition)?;
                self.b.jump_unless(otherwise);
                self.expr(then_branch)?;
                if else_branch.is_none() {
                    self.b.emit(Instr::Drop);
                    self.b.unit();
                }
                self.b.jump(end);
                self.b.bind(otherwise);
                match else_branch {
                    Some(e) => self.expr(e)?,
                    None => self.b.unit(),
                }
                self.b.bind(end);
            }
            ExprKind::While { condition, body } => {
                let head = self.b.new_label();
                let end = self.b.new_label();
                self.b.bind(head);
                self.expr(condition)?;
                self.b.jump_unless(end);
                self.expr(body)?;
                self.b.emit(Instr::Drop);
                self.b.jump(head);
                self.b.bind(end);
                self.b.unit();
            }
            ExprKind::Assign { target, value } => {
                self.expr(value)?;
                self.b.emit(Instr::LocalSet(self.binding(*target)));
                self.b.unit();
            }
            ExprKind::Return(value) => {
                match value {
                    Some(v) => self.expr(v)?,
                    None => self.b.unit(),
                }
                self.emit_return();
            }
            ExprKind::Call { callee, args } => self.call(expr, callee, args)?,
            ExprKind::Perform { op, args } => self.perform(expr, *op, args)?,
            ExprKind::Handle { clauses, .. } => self.handle(expr, clauses)?,
            ExprKind::Resume { cont, value } => self.resume(expr, *cont, value)?,
        }
        Ok(())
    }

    /// Operands left to right. Spilled operands go through their
    /// temporaries so the stack is empty whenever a later operand suspends.
    fn operands(&mut self, id: ExprId, operands: &[&'f Expr]) -> CodegenResult<()> {
        let Some(temps) = self.func.spills.get(&id) else {
            for operand in operands {
                self.expr(operand)?;
            }
            return Ok(());
        };
        for (operand, temp) in operands.iter().zip(temps) {
            self.expr(operand)?;
            self.b.emit(Instr::LocalSet(self.local(*temp)));
        }
        for temp in temps.iter().take(operands.len()) {
            self.b.emit(Instr::LocalGet(self.local(*temp)));
        }
        for operand in operands.iter().skip(temps.len()) {
            self.expr(operand)?;
        }
        Ok(())
    }

    fn function_ref(&mut self, def: DefId, ty: &Type, span: Span) -> CodegenResult<()> {
        let callable = self.cg.callable(def, span)?;
        let wants_outcome = ty.as_fn().map_or(false, |f| !self.cg.rows.is_empty(f.effects));
        let index = if wants_outcome && !callable.effectful {
            self.cg.adapter(&callable)
        } else {
            callable.index
        };
        self.b.emit(Instr::RefFunc(index));
        Ok(())
    }

    fn call(&mut self, expr: &'f Expr, callee: &'f Expr, args: &'f [Expr]) -> CodegenResult<()> {
        let operands: Vec<&Expr> = args.iter().collect();
        self.operands(expr.id, &operands)?;
        match &callee.kind {
            ExprKind::Def(def) => {
                let callable = self.cg.callable(*def, callee.span)?;
                self.b.emit(Instr::Call(callable.index));
            }
            ExprKind::Local(id) => {
                self.b.emit(Instr::LocalGet(self.binding(*id)));
                self.b.emit(Instr::CallRef {
                    arity: args.len() as u32,
                });
            }
            _ => return Err(vec![EffectError::UnsupportedCallee { span: callee.span }.into()]),
        }
        let func = self.func;
        match func.site(expr.id) {
            Some(site) => self.after_call(site),
            None => Ok(()),
        }
    }

    /// The callee's outcome is on the stack.
    fn after_call(&mut self, site: &'f ContinuationSite) -> CodegenResult<()> {
        if site.inline_resumable {
            self.b.emit(Instr::Return);
            return Ok(());
        }
        let (entry, resume) = self.entry(site)?;
        let dispatcher = self.cg.dispatcher();
        let types = self.cg.types;
        let outcome = self.b.new_local();
        let completed = self.b.new_label();

        self.b.emit(Instr::LocalTee(outcome));
        self.b.emit(types.outcome_field(abi::OUTCOME_TAG));
        self.b.i64(abi::TAG_VALUE);
        self.b.emit(Instr::Binary(BinOp::Eq));
        self.b.jump_if(completed);

        let frame = self.new_frame(site, entry, abi::FRAME_KIND_CALL);
        self.b.emit(Instr::LocalGet(outcome));
        self.b.emit(types.outcome_field(abi::OUTCOME_CONT));
        self.b.emit(Instr::LocalGet(frame));
        self.b.emit(Instr::LocalGet(frame));
        self.b.emit(Instr::Call(dispatcher.append));
        self.b.emit(Instr::Drop);
        self.b.emit(Instr::LocalGet(outcome));
        self.b.emit(Instr::Return);

        self.b.bind(completed);
        self.b.emit(Instr::LocalGet(outcome));
        self.b.emit(types.outcome_field(abi::OUTCOME_VALUE));
        self.b.emit(Instr::LocalSet(VALUE));
        self.b.bind(resume);
        self.b.emit(Instr::LocalGet(VALUE));
        Ok(())
    }

    /// Build a frame for `site` into a fresh local.
    fn new_frame(&mut self, site: &ContinuationSite, entry: ResumeEntry, kind: i64) -> u32 {
        self.b.emit(Instr::RefFunc(entry.func));
        self.b.null();
        match entry.env {
            Some(env) => {
                for slot in &site.captured {
                    self.b.emit(Instr::LocalGet(self.local(*slot)));
                }
                self.b.emit(Instr::StructNew { type_index: env });
            }
            None => self.b.null(),
        }
        self.b.i64(kind);
        self.b.emit(Instr::StructNew {
            type_index: self.cg.types.frame,
        });
        let frame = self.b.new_local();
        self.b.emit(Instr::LocalSet(frame));
        frame
    }

    fn perform(&mut self, expr: &'f Expr, op: OpRef, args: &'f [Expr]) -> CodegenResult<()> {
        let site = self.site(expr.id, expr.span)?;
        let op_index = self
            .cg
            .ops
            .get(op)
            .ok_or_else(|| vec![ice_err!(expr.span, "performed operation missing from the effect table"; "op" => op)])?;
        let types = self.cg.types;

        let operands: Vec<&Expr> = args.iter().collect();
        self.operands(expr.id, &operands)?;
        let packed = self.b.new_local();
        if args.is_empty() {
            self.b.unit();
        } else {
            let tuple = self.args_type(args.len(), expr.span)?;
            self.b.emit(Instr::StructNew { type_index: tuple });
        }
        self.b.emit(Instr::LocalSet(packed));

        let resumable = if site.inline_resumable {
            None
        } else {
            let (entry, resume) = self.entry(site)?;
            Some((self.new_frame(site, entry, abi::FRAME_KIND_CALL), resume))
        };

        self.b.i64(abi::TAG_REQUEST);
        self.b.unit();
        self.b.i64(i64::from(op_index));
        self.b.emit(Instr::LocalGet(packed));
        match resumable {
            Some((frame, _)) => {
                self.b.emit(Instr::LocalGet(frame));
                self.b.emit(Instr::LocalGet(frame));
            }
            None => {
                self.b.null();
                self.b.null();
            }
        }
        self.b.emit(Instr::Const(Const::Bool(false)));
        self.b.emit(Instr::StructNew { type_index: types.cont });
        self.b.emit(Instr::StructNew {
            type_index: types.outcome,
        });
        self.b.emit(Instr::Return);

        if let Some((_, resume)) = resumable {
            self.b.bind(resume);
            self.b.emit(Instr::LocalGet(VALUE));
        }
        Ok(())
    }

    fn args_type(&self, arity: usize, span: Span) -> CodegenResult<u32> {
        self.cg
            .args_types
            .get(&arity)
            .copied()
            .ok_or_else(|| vec![ice_err!(span, "no argument tuple type"; "arity" => arity)])
    }

    /// Call the lifted body and run the dispatch loop over its outcomes.
    fn handle(&mut self, expr: &'f Expr, clauses: &'f [HandlerClause]) -> CodegenResult<()> {
        let func = self.func;
        let lifted = func
            .handles
            .get(&expr.id)
            .ok_or_else(|| vec![ice_err!(expr.span, "handle expression was not lifted"; "expr" => expr.id)])?;
        let body = self.cg.callable(lifted.def_id, expr.span)?;
        for capture in &lifted.captures {
            self.b.emit(Instr::LocalGet(self.binding(*capture)));
        }
        self.b.emit(Instr::Call(body.index));
        if !lifted.effectful {
            return Ok(());
        }

        let dispatcher = self.cg.dispatcher();
        let types = self.cg.types;
        let outcome = self.b.new_local();
        let dispatch = self.b.new_label();
        let request = self.b.new_label();
        let done = self.b.new_label();
        self.b.emit(Instr::LocalSet(outcome));

        self.b.bind(dispatch);
        self.b.emit(Instr::LocalGet(outcome));
        self.b.emit(types.outcome_field(abi::OUTCOME_TAG));
        self.b.i64(abi::TAG_VALUE);
        self.b.emit(Instr::Binary(BinOp::Eq));
        self.b.jump_unless(request);
        self.b.emit(Instr::LocalGet(outcome));
        self.b.emit(types.outcome_field(abi::OUTCOME_VALUE));
        self.b.jump(done);

        self.b.bind(request);
        for (index, clause) in clauses.iter().enumerate() {
            // Operations nothing performs never reach a handler.
            let Some(op_index) = self.cg.ops.get(clause.op) else {
                continue;
            };
            let strategy = func
                .clauses
                .get(&(expr.id, index))
                .map(|c| c.strategy)
                .ok_or_else(|| vec![ice_err!(clause.span, "unclassified handler clause"; "clause" => index)])?;
            let next = self.b.new_label();
            self.b.emit(Instr::LocalGet(outcome));
            self.b.emit(types.outcome_field(abi::OUTCOME_OP));
            self.b.i64(i64::from(op_index));
            self.b.emit(Instr::Binary(BinOp::Eq));
            self.b.jump_unless(next);
            self.clause(
                clause,
                ClauseScope {
                    cont: clause.cont,
                    strategy,
                    outcome,
                    dispatch,
                },
                dispatcher,
            )?;
            self.b.bind(next);
        }

        // Requests no clause handles belong to an outer handler.
        let forward = func.site(expr.id).filter(|s| !s.inline_resumable);
        match forward {
            Some(site) if self.layout.is_some() => {
                let (entry, resume) = self.entry(site)?;
                let frame = self.new_frame(site, entry, abi::FRAME_KIND_HANDLE);
                self.b.emit(Instr::LocalGet(outcome));
                self.b.emit(types.outcome_field(abi::OUTCOME_CONT));
                self.b.emit(Instr::LocalGet(frame));
                self.b.emit(Instr::LocalGet(frame));
                self.b.emit(Instr::Call(dispatcher.append));
                self.b.emit(Instr::Drop);
                self.b.emit(Instr::LocalGet(outcome));
                self.b.emit(Instr::Return);

                self.b.bind(resume);
                self.b.emit(Instr::LocalGet(VALUE));
                self.b.emit(Instr::LocalSet(outcome));
                self.b.jump(dispatch);
            }
            _ => self.b.emit(Instr::Trap(TrapCode::Unreachable)),
        }
        self.b.bind(done);
        Ok(())
    }

    fn clause(&mut self, clause: &'f HandlerClause, scope: ClauseScope, dispatcher: Dispatcher) -> CodegenResult<()> {
        let types = self.cg.types;
        if !clause.params.is_empty() {
            let tuple = self.args_type(clause.params.len(), clause.span)?;
            for (field, param) in clause.params.iter().enumerate() {
                self.b.emit(Instr::LocalGet(scope.outcome));
                self.b.emit(types.outcome_field(abi::OUTCOME_ARGS));
                self.b.emit(Instr::StructGet {
                    type_index: tuple,
                    field: field as u32,
                });
                self.b.emit(Instr::LocalSet(self.binding(*param)));
            }
        }
        self.b.emit(Instr::LocalGet(scope.outcome));
        self.b.emit(types.outcome_field(abi::OUTCOME_CONT));
        self.b.emit(Instr::LocalSet(self.binding(clause.cont)));

        self.clauses.push(scope);
        let body = self.expr(&clause.body);
        self.clauses.pop();
        body?;

        match scope.strategy {
            ClauseStrategy::TailValue => {
                let value = self.b.new_local();
                self.b.emit(Instr::LocalSet(value));
                self.b.emit(Instr::LocalGet(self.binding(clause.cont)));
                self.b.emit(Instr::LocalGet(value));
                self.b.emit(Instr::Call(dispatcher.resume));
                self.b.emit(Instr::LocalSet(scope.outcome));
                self.b.jump(scope.dispatch);
            }
            // Paths that resume have already jumped back to the loop.
            ClauseStrategy::ResumeInTail { .. } | ClauseStrategy::AlwaysMissing => {
                self.b.emit(Instr::Drop);
                self.b.emit(Instr::Trap(TrapCode::MissingTailResume));
            }
        }
        Ok(())
    }

    fn resume(&mut self, expr: &'f Expr, cont: LocalId, value: &'f Expr) -> CodegenResult<()> {
        let scope = self
            .clauses
            .iter()
            .rev()
            .find(|c| c.cont == cont)
            .copied()
            .ok_or_else(|| vec![ice_err!(expr.span, "resume outside its clause"; "cont" => cont)])?;
        let types = self.cg.types;
        self.expr(value)?;
        match scope.strategy {
            // The dispatch loop resumes with the clause value; this resume
            // only consumes the continuation.
            ClauseStrategy::TailValue => {
                self.b.emit(Instr::Drop);
                self.b.emit(Instr::LocalGet(self.binding(cont)));
                self.b.emit(Instr::Const(Const::Bool(true)));
                self.b.emit(Instr::StructSet {
                    type_index: types.cont,
                    field: abi::CONT_RESUMED,
                });
                self.b.unit();
            }
            ClauseStrategy::ResumeInTail { .. } | ClauseStrategy::AlwaysMissing => {
                let dispatcher = self.cg.dispatcher();
                let resumed = self.b.new_local();
                self.b.emit(Instr::LocalSet(resumed));
                self.b.emit(Instr::LocalGet(self.binding(cont)));
                self.b.emit(Instr::LocalGet(resumed));
                self.b.emit(Instr::Call(dispatcher.resume));
                self.b.emit(Instr::LocalSet(scope.outcome));
                self.b.jump(scope.dispatch);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::sink::ModuleBuilder;
    use crate::codegen::table::{build_effect_table, EffectNames};
    use crate::effects::{infer_program, lower_program, RowInterner};
    use crate::hir::{BinOp as HirBinOp, BodyBuilder, FnDecl, OpDecl};
    use std::sync::Arc;
    use wisp_runtime::{Instance, Module, ResumeKind, Value};

    fn build(program: &Program) -> (ModuleBuilder, Vec<FunctionOrigin>) {
        let mut rows: RowInterner = program.rows.clone();
        let (inferred, errors) = infer_program(program, &mut rows);
        assert!(errors.is_empty(), "{:?}", errors);
        let (lowered, diagnostics) = lower_program(program, &inferred, &rows, program.next_def_id());
        assert!(diagnostics.iter().all(|d| !d.is_error()), "{:?}", diagnostics);
        let names = EffectNames {
            program,
            module_id: &program.module_id,
        };
        let (_, ops) = build_effect_table(names, &rows).unwrap();
        let mut sink = ModuleBuilder::new();
        let origins = generate(&mut sink, program, &lowered, &ops, &rows).unwrap();
        (sink, origins)
    }

    fn run(sink: &ModuleBuilder, export: &str, args: Vec<Value>) -> Result<Value, wisp_runtime::Trap> {
        let decoded = Module::decode(&sink.emit_binary()).unwrap();
        let func = decoded.module.export(export).unwrap();
        let mut instance = Instance::new(Arc::new(decoded), 256);
        instance.invoke(func, args)
    }

    #[test]
    fn test_pure_function() {
        let mut program = Program::new("app", "app.wisp");
        let mut b = BodyBuilder::new();
        let x = b.param("x", Type::Int);
        let get = b.local_ref(x);
        let two = b.int(2);
        let body = b.binary(HirBinOp::Mul, get, two);
        program.add_function(FnDecl::new(DefId::new(0), "double", b.finish(body), Type::Int).exported());

        let (sink, origins) = build(&program);
        assert!(sink.module().functions.iter().all(|f| !f.returns_outcome));
        assert_eq!(origins.len(), sink.module().functions.len());
        assert_eq!(run(&sink, "double", vec![Value::I64(21)]).unwrap().as_i64(), Some(42));
    }

    #[test]
    fn test_handled_perform_in_loop() {
        // handle { let i = 0; let s = 0; while i < 3 { s = s + perform Ask.get(); i = i + 1 }; s }
        //   with Ask.get(), k => resume k 5
        let mut program = Program::new("app", "app.wisp");
        let ask = program.declare_effect("Ask", vec![OpDecl::new("get", vec![], Type::Int, ResumeKind::Resume)]);
        let get = program.op(ask, "get").unwrap();

        let mut b = BodyBuilder::new();
        let i = b.local("i", Type::Int);
        let s = b.local("s", Type::Int);
        let k = b.local("k", Type::cont(Type::Int));
        let zero = b.int(0);
        let init_i = b.let_stmt(i, zero);
        let zero = b.int(0);
        let init_s = b.let_stmt(s, zero);
        let get_i = b.local_ref(i);
        let three = b.int(3);
        let cond = b.binary(HirBinOp::Lt, get_i, three);
        let get_s = b.local_ref(s);
        let asked = b.perform(get, vec![], Type::Int);
        let sum = b.binary(HirBinOp::Add, get_s, asked);
        let set_s = b.assign(s, sum);
        let get_i = b.local_ref(i);
        let one = b.int(1);
        let inc = b.binary(HirBinOp::Add, get_i, one);
        let set_i = b.assign(i, inc);
        let loop_body = b.block(vec![Stmt::Expr(set_s), Stmt::Expr(set_i)], None);
        let lp = b.while_loop(cond, loop_body);
        let get_s = b.local_ref(s);
        let handled = b.block(vec![init_i, init_s, Stmt::Expr(lp)], Some(get_s));
        let five = b.int(5);
        let resume = b.resume(k, five);
        let clause = b.clause(get, vec![], k, resume);
        let handle = b.handle(handled, vec![clause]);
        program.add_function(FnDecl::new(DefId::new(0), "main", b.finish(handle), Type::Int).exported());

        let (sink, _) = build(&program);
        assert_eq!(run(&sink, "main", vec![]).unwrap().as_i64(), Some(15));
    }

    #[test]
    fn test_tail_clause_value_resumes() {
        // handle { perform Log.double(4) + 1 } with Log.double(x), k => x * 2
        let mut program = Program::new("app", "app.wisp");
        let log = program.declare_effect(
            "Log",
            vec![OpDecl::new("double", vec![Type::Int], Type::Int, ResumeKind::Tail)],
        );
        let double = program.op(log, "double").unwrap();

        let mut b = BodyBuilder::new();
        let x = b.local("x", Type::Int);
        let k = b.local("k", Type::cont(Type::Int));
        let four = b.int(4);
        let performed = b.perform(double, vec![four], Type::Int);
        let one = b.int(1);
        let handled = b.binary(HirBinOp::Add, performed, one);
        let get_x = b.local_ref(x);
        let two = b.int(2);
        let doubled = b.binary(HirBinOp::Mul, get_x, two);
        let clause = b.clause(double, vec![x], k, doubled);
        let handle = b.handle(handled, vec![clause]);
        program.add_function(FnDecl::new(DefId::new(0), "main", b.finish(handle), Type::Int).exported());

        let (sink, _) = build(&program);
        assert_eq!(run(&sink, "main", vec![]).unwrap().as_i64(), Some(9));
    }

    #[test]
    fn test_missing_resume_traps() {
        let mut program = Program::new("app", "app.wisp");
        let ask = program.declare_effect("Ask", vec![OpDecl::new("get", vec![], Type::Int, ResumeKind::Resume)]);
        let get = program.op(ask, "get").unwrap();

        let mut b = BodyBuilder::new();
        let k = b.local("k", Type::cont(Type::Int));
        let performed = b.perform(get, vec![], Type::Int);
        let zero = b.int(0);
        let clause = b.clause(get, vec![], k, zero);
        let handle = b.handle(performed, vec![clause]);
        program.add_function(FnDecl::new(DefId::new(0), "main", b.finish(handle), Type::Int).exported());

        let (sink, _) = build(&program);
        let trap = run(&sink, "main", vec![]).unwrap_err();
        assert_eq!(trap.code, TrapCode::MissingTailResume);
    }
}
