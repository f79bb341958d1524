//! Typed, name-resolved program graph consumed by the effects engine.
//!
//! Parsing, name resolution and ordinary type inference happen elsewhere;
//! their result is handed over as a [`Program`]. Every identifier is
//! already resolved and every expression carries its type, so the passes
//! here only deal with effects.
//!
//! # Structure
//!
//! - [`Program`] - Effects, functions and the shared row interner
//! - [`EffectDecl`] / [`OpDecl`] - Declared effects and their operations
//! - [`FnDecl`] - A function with its [`Body`]
//! - [`Expr`] - Typed expressions

pub mod builder;
pub mod def;
pub mod expr;
pub mod ty;

pub use builder::BodyBuilder;
pub use def::{DefId, EffectId, ExprId, LocalId, OpRef};
pub use expr::{BinOp, Body, Expr, ExprKind, HandlerClause, LiteralValue, Local, Stmt, UnOp};
pub use ty::{FnType, Type};

use wisp_runtime::ResumeKind;

use crate::effects::row::{RowId, RowInterner};
use crate::span::Span;

/// A compilation unit.
#[derive(Debug, Clone)]
pub struct Program {
    /// Qualifies effect ids and labels in the effect table.
    pub module_id: String,
    pub source_file: String,
    /// Source text, used for line numbers and diagnostic snippets.
    pub source: Option<String>,
    /// Interner owning every `RowId` that appears in the program's types.
    pub rows: RowInterner,
    pub effects: Vec<EffectDecl>,
    pub functions: Vec<FnDecl>,
}

/// A declared effect.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectDecl {
    pub id: EffectId,
    pub name: String,
    pub ops: Vec<OpDecl>,
    pub span: Span,
}

/// One operation of an effect.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDecl {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub resume_kind: ResumeKind,
    pub span: Span,
}

impl OpDecl {
    pub fn new(name: &str, params: Vec<Type>, ret: Type, resume_kind: ResumeKind) -> Self {
        Self {
            name: name.to_string(),
            params,
            ret,
            resume_kind,
            span: Span::dummy(),
        }
    }
}

/// A function definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub def_id: DefId,
    pub name: String,
    pub body: Body,
    pub ret: Type,
    /// Effect row from the signature. `None` lets inference decide.
    pub declared_effects: Option<RowId>,
    pub exported: bool,
    pub span: Span,
}

impl FnDecl {
    pub fn new(def_id: DefId, name: &str, body: Body, ret: Type) -> Self {
        Self {
            def_id,
            name: name.to_string(),
            body,
            ret,
            declared_effects: None,
            exported: false,
            span: Span::dummy(),
        }
    }

    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    pub fn with_effects(mut self, row: RowId) -> Self {
        self.declared_effects = Some(row);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Parameter types, in order.
    pub fn param_types(&self) -> Vec<Type> {
        self.body.params().map(|l| l.ty.clone()).collect()
    }
}

impl Program {
    pub fn new(module_id: &str, source_file: &str) -> Self {
        Self {
            module_id: module_id.to_string(),
            source_file: source_file.to_string(),
            source: None,
            rows: RowInterner::new(),
            effects: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn declare_effect(&mut self, name: &str, ops: Vec<OpDecl>) -> EffectId {
        let id = EffectId::new(self.effects.len() as u32);
        self.effects.push(EffectDecl {
            id,
            name: name.to_string(),
            ops,
            span: Span::dummy(),
        });
        id
    }

    /// Look up an operation by effect and operation name.
    pub fn op(&self, effect: EffectId, name: &str) -> Option<OpRef> {
        let decl = self.effects.get(effect.index as usize)?;
        let index = decl.ops.iter().position(|op| op.name == name)?;
        Some(OpRef::new(effect, index as u32))
    }

    pub fn op_decl(&self, op: OpRef) -> Option<&OpDecl> {
        self.effects.get(op.effect.index as usize)?.ops.get(op.op as usize)
    }

    /// Fully qualified effect id, as written to the effect table.
    pub fn effect_id(&self, effect: EffectId) -> String {
        let name = self
            .effects
            .get(effect.index as usize)
            .map_or("?", |e| e.name.as_str());
        format!("{}::{}", self.module_id, name)
    }

    /// `effect_id.op` label of an operation.
    pub fn op_label(&self, op: OpRef) -> String {
        let name = self.op_decl(op).map_or("?", |o| o.name.as_str());
        format!("{}.{}", self.effect_id(op.effect), name)
    }

    /// DefId the next added function should use.
    pub fn next_def_id(&self) -> DefId {
        DefId::new(self.functions.iter().map(|f| f.def_id.index + 1).max().unwrap_or(0))
    }

    pub fn add_function(&mut self, decl: FnDecl) -> DefId {
        let id = decl.def_id;
        self.functions.push(decl);
        id
    }

    pub fn function(&self, def: DefId) -> Option<&FnDecl> {
        self.functions.iter().find(|f| f.def_id == def)
    }
}
