//! HIR expressions and bodies.

use wisp_runtime::module::{BinOp as InstrBinOp, UnOp as InstrUnOp};

use super::def::{ExprId, LocalId, OpRef};
use super::ty::Type;
use crate::span::Span;

/// A function body with its local bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    /// All bindings of the body, indexed by `LocalId`.
    pub locals: Vec<Local>,
    /// The first `param_count` locals are the parameters.
    pub param_count: u32,
    pub expr: Expr,
}

impl Body {
    pub fn local(&self, id: LocalId) -> Option<&Local> {
        self.locals.get(id.index as usize)
    }

    pub fn params(&self) -> impl Iterator<Item = &Local> {
        self.locals.iter().take(self.param_count as usize)
    }

    pub fn is_param(&self, id: LocalId) -> bool {
        id.index < self.param_count
    }
}

/// A local binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Local {
    pub id: LocalId,
    pub name: String,
    pub ty: Type,
}

/// A typed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(LiteralValue),

    /// A local binding reference.
    Local(LocalId),

    /// A reference to a function definition.
    Def(super::DefId),

    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },

    /// `{ stmts; expr }`. Without a tail expression the block is unit.
    Block {
        stmts: Vec<Stmt>,
        expr: Option<Box<Expr>>,
    },

    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },

    While {
        condition: Box<Expr>,
        body: Box<Expr>,
    },

    Assign {
        target: LocalId,
        value: Box<Expr>,
    },

    Return(Option<Box<Expr>>),

    /// Call of a function definition or of a function-typed local.
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },

    /// `perform Effect.op(args)`
    Perform {
        op: OpRef,
        args: Vec<Expr>,
    },

    /// `handle body with { clauses }`
    Handle {
        body: Box<Expr>,
        clauses: Vec<HandlerClause>,
    },

    /// `resume k value`, where `k` is a clause continuation.
    Resume {
        cont: LocalId,
        value: Box<Expr>,
    },
}

/// A statement in a block.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { local: LocalId, init: Expr },
    Expr(Expr),
}

impl Stmt {
    /// The expression evaluated by the statement.
    pub fn expr(&self) -> &Expr {
        match self {
            Stmt::Let { init, .. } => init,
            Stmt::Expr(e) => e,
        }
    }
}

/// One operation clause of a `handle` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerClause {
    pub op: OpRef,
    /// Bindings for the operation's arguments.
    pub params: Vec<LocalId>,
    /// Binding for the continuation.
    pub cont: LocalId,
    pub body: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LiteralValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Strict: both operands are always evaluated.
    And,
    /// Strict: both operands are always evaluated.
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub(crate) fn to_instr(self) -> InstrBinOp {
        match self {
            BinOp::Add => InstrBinOp::Add,
            BinOp::Sub => InstrBinOp::Sub,
            BinOp::Mul => InstrBinOp::Mul,
            BinOp::Div => InstrBinOp::Div,
            BinOp::Rem => InstrBinOp::Rem,
            BinOp::Eq => InstrBinOp::Eq,
            BinOp::Ne => InstrBinOp::Ne,
            BinOp::Lt => InstrBinOp::Lt,
            BinOp::Le => InstrBinOp::Le,
            BinOp::Gt => InstrBinOp::Gt,
            BinOp::Ge => InstrBinOp::Ge,
            BinOp::And => InstrBinOp::And,
            BinOp::Or => InstrBinOp::Or,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

impl UnOp {
    pub(crate) fn to_instr(self) -> InstrUnOp {
        match self {
            UnOp::Neg => InstrUnOp::Neg,
            UnOp::Not => InstrUnOp::Not,
        }
    }
}

impl Expr {
    /// Visit direct subexpressions in evaluation order. Clause bodies come
    /// after the handled body.
    pub fn for_each_child<'a>(&'a self, mut f: impl FnMut(&'a Expr)) {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Local(_) | ExprKind::Def(_) => {}
            ExprKind::Binary { left, right, .. } => {
                f(left);
                f(right);
            }
            ExprKind::Unary { operand, .. } => f(operand),
            ExprKind::Block { stmts, expr } => {
                for stmt in stmts {
                    match stmt {
                        Stmt::Let { init, .. } => f(init),
                        Stmt::Expr(e) => f(e),
                    }
                }
                if let Some(e) = expr {
                    f(e);
                }
            }
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                f(condition);
                f(then_branch);
                if let Some(e) = else_branch {
                    f(e);
                }
            }
            ExprKind::While { condition, body } => {
                f(condition);
                f(body);
            }
            ExprKind::Assign { value, .. } => f(value),
            ExprKind::Return(value) => {
                if let Some(e) = value {
                    f(e);
                }
            }
            ExprKind::Call { callee, args } => {
                f(callee);
                args.iter().for_each(&mut f);
            }
            ExprKind::Perform { args, .. } => args.iter().for_each(&mut f),
            ExprKind::Handle { body, clauses } => {
                f(body);
                for clause in clauses {
                    f(&clause.body);
                }
            }
            ExprKind::Resume { value, .. } => f(value),
        }
    }

    /// Whether `pred` holds for this expression or any expression inside it.
    pub fn any(&self, pred: &mut dyn FnMut(&Expr) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        let mut found = false;
        self.for_each_child(|child| {
            if !found && child.any(pred) {
                found = true;
            }
        });
        found
    }

    /// Operand list of an expression whose operands are evaluated left to
    /// right before the operation itself.
    pub fn operands(&self) -> Option<Vec<&Expr>> {
        match &self.kind {
            ExprKind::Binary { left, right, .. } => Some(vec![left.as_ref(), right.as_ref()]),
            ExprKind::Call { args, .. } | ExprKind::Perform { args, .. } => Some(args.iter().collect()),
            _ => None,
        }
    }
}
