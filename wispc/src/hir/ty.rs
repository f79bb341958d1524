//! Types as seen by the effects engine.
//!
//! Only what effect accounting and lowering need survives here: whether a
//! value is a function (and which effects calling it may perform), a
//! continuation, or a still-generic parameter. Everything else is an opaque
//! scalar.

use std::fmt;

use crate::effects::row::RowId;

/// A resolved type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Unit,
    Bool,
    Int,
    Float,
    /// A function value: `fn(params) -> ret / effects`.
    Fn(Box<FnType>),
    /// A handler continuation resuming with a value of the inner type.
    Cont(Box<Type>),
    /// A generic parameter the type checker left unresolved.
    Param(String),
}

/// Signature of a function value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnType {
    pub params: Vec<Type>,
    pub ret: Type,
    pub effects: RowId,
}

impl Type {
    pub fn function(params: Vec<Type>, ret: Type, effects: RowId) -> Self {
        Type::Fn(Box::new(FnType {
            params,
            ret,
            effects,
        }))
    }

    pub fn cont(resume: Type) -> Self {
        Type::Cont(Box::new(resume))
    }

    pub fn as_fn(&self) -> Option<&FnType> {
        match self {
            Type::Fn(fn_ty) => Some(fn_ty),
            _ => None,
        }
    }

    /// Whether this is a continuation-typed binding: a function parameter
    /// or a clause continuation.
    pub fn is_continuation_like(&self) -> bool {
        matches!(self, Type::Fn(_) | Type::Cont(_))
    }

    /// Whether an unresolved generic occurs anywhere in the type.
    pub fn mentions_param(&self) -> bool {
        match self {
            Type::Unit | Type::Bool | Type::Int | Type::Float => false,
            Type::Fn(fn_ty) => fn_ty.params.iter().any(Type::mentions_param) || fn_ty.ret.mentions_param(),
            Type::Cont(inner) => inner.mentions_param(),
            Type::Param(_) => true,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => f.write_str("()"),
            Type::Bool => f.write_str("bool"),
            Type::Int => f.write_str("int"),
            Type::Float => f.write_str("float"),
            Type::Fn(fn_ty) => {
                f.write_str("fn(")?;
                for (i, param) in fn_ty.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                write!(f, ") -> {}", fn_ty.ret)
            }
            Type::Cont(inner) => write!(f, "cont<{}>", inner),
            Type::Param(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::row::RowInterner;

    #[test]
    fn test_mentions_param() {
        let rows = RowInterner::new();
        let pure = rows.empty();
        assert!(!Type::Int.mentions_param());
        assert!(Type::Param("T".into()).mentions_param());
        assert!(Type::function(vec![Type::Param("T".into())], Type::Unit, pure).mentions_param());
        assert!(Type::cont(Type::Param("T".into())).mentions_param());
        assert!(!Type::function(vec![Type::Int], Type::Bool, pure).mentions_param());
    }

    #[test]
    fn test_display() {
        let rows = RowInterner::new();
        let ty = Type::function(vec![Type::Int, Type::Bool], Type::Unit, rows.empty());
        assert_eq!(ty.to_string(), "fn(int, bool) -> ()");
        assert_eq!(Type::cont(Type::Int).to_string(), "cont<int>");
    }
}
