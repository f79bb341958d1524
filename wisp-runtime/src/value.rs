//! Values exchanged with host handlers.
//!
//! Engine values hold instance-local references and cannot leave the
//! instance's thread. Handlers see `HostValue`s instead: plain data that is
//! `Send` and can be completed from any thread.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::Value;

/// A payload or resume value as seen by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Tuple(Vec<HostValue>),
}

impl HostValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            HostValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert an engine value. Function references and nested
    /// continuations have no host representation.
    pub(crate) fn from_engine(value: &Value) -> Result<Self, String> {
        Ok(match value {
            Value::Unit | Value::Null => HostValue::Unit,
            Value::Bool(b) => HostValue::Bool(*b),
            Value::I64(v) => HostValue::Int(*v),
            Value::F64(v) => HostValue::Float(*v),
            Value::Func(idx) => return Err(format!("function reference #{} cannot leave the instance", idx)),
            Value::Struct(s) => HostValue::Tuple(
                s.fields()
                    .iter()
                    .map(HostValue::from_engine)
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Convert into an engine value. `tuple_type` maps an arity to the
    /// module's argument struct type of that arity.
    pub(crate) fn to_engine(&self, tuple_type: &dyn Fn(usize) -> Option<u32>) -> Result<Value, String> {
        Ok(match self {
            HostValue::Unit => Value::Unit,
            HostValue::Bool(b) => Value::Bool(*b),
            HostValue::Int(v) => Value::I64(*v),
            HostValue::Float(v) => Value::F64(*v),
            HostValue::Tuple(items) => {
                let type_index = tuple_type(items.len())
                    .ok_or_else(|| format!("module has no tuple type of arity {}", items.len()))?;
                let fields = items
                    .iter()
                    .map(|item| item.to_engine(tuple_type))
                    .collect::<Result<_, _>>()?;
                Value::new_struct(type_index, fields)
            }
        })
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Unit => f.write_str("()"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Int(v) => write!(f, "{}", v),
            HostValue::Float(v) => write!(f, "{}", v),
            HostValue::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<()> for HostValue {
    fn from(_: ()) -> Self {
        HostValue::Unit
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Int(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_becomes_tuple() {
        let value = Value::new_struct(3, vec![Value::I64(1), Value::Bool(true)]);
        assert_eq!(
            HostValue::from_engine(&value).unwrap(),
            HostValue::Tuple(vec![HostValue::Int(1), HostValue::Bool(true)])
        );
    }

    #[test]
    fn test_func_refs_stay_inside() {
        assert!(HostValue::from_engine(&Value::Func(0)).is_err());
    }

    #[test]
    fn test_tuple_needs_module_type() {
        let tuple = HostValue::Tuple(vec![HostValue::Int(1)]);
        assert!(tuple.to_engine(&|_| None).is_err());
        let value = tuple.to_engine(&|arity| (arity == 1).then_some(9)).unwrap();
        assert_eq!(value.as_struct().unwrap().type_index(), 9);
    }

    #[test]
    fn test_display() {
        let v = HostValue::Tuple(vec![HostValue::Int(2), HostValue::Unit]);
        assert_eq!(v.to_string(), "(2, ())");
    }
}
