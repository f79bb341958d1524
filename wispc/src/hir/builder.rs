//! Convenience construction of bodies.
//!
//! Producers of the program graph (and tests) build bodies through a
//! [`BodyBuilder`], which hands out `ExprId`s and `LocalId`s and fills in
//! the obvious result types.
//!
//! ```
//! use wispc::hir::{BinOp, BodyBuilder, Type};
//!
//! let mut b = BodyBuilder::new();
//! let n = b.param("n", Type::Int);
//! let lhs = b.local_ref(n);
//! let rhs = b.int(1);
//! let sum = b.binary(BinOp::Add, lhs, rhs);
//! let body = b.finish(sum);
//! assert_eq!(body.param_count, 1);
//! ```

use super::def::{DefId, ExprId, LocalId, OpRef};
use super::expr::{BinOp, Body, Expr, ExprKind, HandlerClause, LiteralValue, Local, Stmt, UnOp};
use super::ty::Type;
use crate::span::Span;

#[derive(Debug, Default)]
pub struct BodyBuilder {
    locals: Vec<Local>,
    param_count: u32,
    next_expr: u32,
    span: Span,
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Span given to expressions built from now on.
    pub fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    /// Declare a parameter. Parameters must be declared before any other local.
    pub fn param(&mut self, name: &str, ty: Type) -> LocalId {
        debug_assert_eq!(self.param_count as usize, self.locals.len(), "parameters come first");
        self.param_count += 1;
        self.local(name, ty)
    }

    pub fn local(&mut self, name: &str, ty: Type) -> LocalId {
        let id = LocalId::new(self.locals.len() as u32);
        self.locals.push(Local {
            id,
            name: name.to_string(),
            ty,
        });
        id
    }

    pub fn local_type(&self, id: LocalId) -> Type {
        self.locals
            .get(id.index as usize)
            .map_or(Type::Unit, |l| l.ty.clone())
    }

    pub fn expr(&mut self, kind: ExprKind, ty: Type) -> Expr {
        let id = ExprId::new(self.next_expr);
        self.next_expr += 1;
        Expr {
            id,
            kind,
            ty,
            span: self.span,
        }
    }

    pub fn unit(&mut self) -> Expr {
        self.expr(ExprKind::Literal(LiteralValue::Unit), Type::Unit)
    }

    pub fn bool(&mut self, value: bool) -> Expr {
        self.expr(ExprKind::Literal(LiteralValue::Bool(value)), Type::Bool)
    }

    pub fn int(&mut self, value: i64) -> Expr {
        self.expr(ExprKind::Literal(LiteralValue::Int(value)), Type::Int)
    }

    pub fn float(&mut self, value: f64) -> Expr {
        self.expr(ExprKind::Literal(LiteralValue::Float(value)), Type::Float)
    }

    pub fn local_ref(&mut self, id: LocalId) -> Expr {
        let ty = self.local_type(id);
        self.expr(ExprKind::Local(id), ty)
    }

    /// Reference to a function, used at type `ty`.
    pub fn def_ref(&mut self, def: DefId, ty: Type) -> Expr {
        self.expr(ExprKind::Def(def), ty)
    }

    pub fn binary(&mut self, op: BinOp, left: Expr, right: Expr) -> Expr {
        let ty = if op.is_comparison() {
            Type::Bool
        } else {
            left.ty.clone()
        };
        self.expr(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
        )
    }

    pub fn unary(&mut self, op: UnOp, operand: Expr) -> Expr {
        let ty = operand.ty.clone();
        self.expr(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    pub fn let_stmt(&mut self, local: LocalId, init: Expr) -> Stmt {
        Stmt::Let { local, init }
    }

    pub fn block(&mut self, stmts: Vec<Stmt>, tail: Option<Expr>) -> Expr {
        let ty = tail.as_ref().map_or(Type::Unit, |e| e.ty.clone());
        self.expr(
            ExprKind::Block {
                stmts,
                expr: tail.map(Box::new),
            },
            ty,
        )
    }

    pub fn if_else(&mut self, condition: Expr, then_branch: Expr, else_branch: Option<Expr>) -> Expr {
        let ty = if else_branch.is_some() {
            then_branch.ty.clone()
        } else {
            Type::Unit
        };
        self.expr(
            ExprKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: else_branch.map(Box::new),
            },
            ty,
        )
    }

    pub fn while_loop(&mut self, condition: Expr, body: Expr) -> Expr {
        self.expr(
            ExprKind::While {
                condition: Box::new(condition),
                body: Box::new(body),
            },
            Type::Unit,
        )
    }

    pub fn assign(&mut self, target: LocalId, value: Expr) -> Expr {
        self.expr(
            ExprKind::Assign {
                target,
                value: Box::new(value),
            },
            Type::Unit,
        )
    }

    pub fn ret(&mut self, value: Option<Expr>) -> Expr {
        self.expr(ExprKind::Return(value.map(Box::new)), Type::Unit)
    }

    /// Call returning a value of type `ty`.
    pub fn call(&mut self, callee: Expr, args: Vec<Expr>, ty: Type) -> Expr {
        self.expr(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            ty,
        )
    }

    pub fn perform(&mut self, op: OpRef, args: Vec<Expr>, ty: Type) -> Expr {
        self.expr(ExprKind::Perform { op, args }, ty)
    }

    pub fn handle(&mut self, body: Expr, clauses: Vec<HandlerClause>) -> Expr {
        let ty = body.ty.clone();
        self.expr(
            ExprKind::Handle {
                body: Box::new(body),
                clauses,
            },
            ty,
        )
    }

    pub fn clause(&mut self, op: OpRef, params: Vec<LocalId>, cont: LocalId, body: Expr) -> HandlerClause {
        HandlerClause {
            op,
            params,
            cont,
            body,
            span: self.span,
        }
    }

    pub fn resume(&mut self, cont: LocalId, value: Expr) -> Expr {
        self.expr(
            ExprKind::Resume {
                cont,
                value: Box::new(value),
            },
            Type::Unit,
        )
    }

    pub fn finish(self, expr: Expr) -> Body {
        Body {
            locals: self.locals,
            param_count: self.param_count,
            expr,
        }
    }
}
