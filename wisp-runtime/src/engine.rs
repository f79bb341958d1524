//! Reference engine for the module format.
//!
//! The engine is a straightforward stack interpreter with garbage-collected
//! (reference counted) struct objects. It executes exactly one call at a
//! time and never suspends on its own: effect suspension is entirely a
//! property of the compiled code, which returns Request outcomes.
//!
//! Instances are deliberately `!Send`; an instance belongs to the thread
//! that drives its host loop.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::module::{BinOp, Const, DecodedModule, Instr, TrapCode, UnOp};

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    I64(i64),
    F64(f64),
    Null,
    Func(u32),
    Struct(StructRef),
}

impl Value {
    /// Allocate a struct of the given type.
    pub fn new_struct(type_index: u32, fields: Vec<Value>) -> Self {
        Value::Struct(StructRef(Rc::new(StructObject {
            type_index,
            fields: RefCell::new(fields),
        })))
    }

    pub fn as_struct(&self) -> Option<&StructRef> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::Null => "null",
            Value::Func(_) => "funcref",
            Value::Struct(_) => "structref",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::I64(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{:?}", v),
            Value::Null => f.write_str("null"),
            Value::Func(idx) => write!(f, "func#{}", idx),
            Value::Struct(s) => write!(f, "struct#{}", s.type_index()),
        }
    }
}

/// A shared reference to a struct object.
#[derive(Clone)]
pub struct StructRef(Rc<StructObject>);

struct StructObject {
    type_index: u32,
    fields: RefCell<Vec<Value>>,
}

impl fmt::Debug for StructRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructRef")
            .field("type_index", &self.0.type_index)
            .field("fields", &self.0.fields.borrow().len())
            .finish()
    }
}

impl StructRef {
    pub fn type_index(&self) -> u32 {
        self.0.type_index
    }

    pub fn get(&self, field: u32) -> Option<Value> {
        self.0.fields.borrow().get(field as usize).cloned()
    }

    pub fn fields(&self) -> Vec<Value> {
        self.0.fields.borrow().clone()
    }

    fn set(&self, field: u32, value: Value) -> bool {
        match self.0.fields.borrow_mut().get_mut(field as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn ptr_eq(&self, other: &StructRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A runtime fault, located at the instruction that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub code: TrapCode,
    /// Index of the function executing the faulting instruction.
    pub function: u32,
    /// Absolute byte offset of the faulting instruction in the binary.
    pub offset: u32,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in function {} at byte {}",
            self.code, self.function, self.offset
        )
    }
}

enum Fault {
    Code(TrapCode),
    Nested(Trap),
}

impl From<TrapCode> for Fault {
    fn from(code: TrapCode) -> Self {
        Fault::Code(code)
    }
}

enum Flow {
    Next,
    Jump(u32),
    Return(Value),
}

/// A module instance.
pub struct Instance {
    module: Arc<DecodedModule>,
    max_call_depth: usize,
    depth: usize,
    _not_send: PhantomData<Rc<()>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("functions", &self.module.module.functions.len())
            .field("max_call_depth", &self.max_call_depth)
            .field("depth", &self.depth)
            .finish()
    }
}

impl Instance {
    pub fn new(module: Arc<DecodedModule>, max_call_depth: usize) -> Self {
        Self {
            module,
            max_call_depth,
            depth: 0,
            _not_send: PhantomData,
        }
    }

    pub fn module(&self) -> &DecodedModule {
        &self.module
    }

    /// Call a function by index.
    pub fn invoke(&mut self, func: u32, args: Vec<Value>) -> Result<Value, Trap> {
        if self.depth >= self.max_call_depth {
            return Err(self.entry_trap(func, TrapCode::CallStackExhausted));
        }
        self.depth += 1;
        let result = self.execute(func, args);
        self.depth -= 1;
        result
    }

    fn entry_trap(&self, func: u32, code: TrapCode) -> Trap {
        let offset = self
            .module
            .code_ranges
            .get(func as usize)
            .map_or(0, |r| r.start);
        Trap {
            code,
            function: func,
            offset,
        }
    }

    fn execute(&mut self, func_index: u32, args: Vec<Value>) -> Result<Value, Trap> {
        let module = Arc::clone(&self.module);
        let Some(func) = module.module.functions.get(func_index as usize) else {
            return Err(self.entry_trap(func_index, TrapCode::Unreachable));
        };
        if args.len() != func.params as usize {
            return Err(self.entry_trap(func_index, TrapCode::TypeMismatch));
        }
        let offsets = &module.instr_offsets[func_index as usize];

        let mut locals = args;
        locals.resize((func.params + func.locals) as usize, Value::Unit);
        let mut stack: Vec<Value> = Vec::with_capacity(16);
        let mut pc = 0usize;

        loop {
            let Some(instr) = func.code.get(pc) else {
                return Ok(stack.pop().unwrap_or(Value::Unit));
            };
            let flow = match self.step(instr, &mut locals, &mut stack) {
                Ok(flow) => flow,
                Err(Fault::Code(code)) => {
                    return Err(Trap {
                        code,
                        function: func_index,
                        offset: offsets[pc],
                    })
                }
                Err(Fault::Nested(trap)) => return Err(trap),
            };
            match flow {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target as usize,
                Flow::Return(value) => return Ok(value),
            }
        }
    }

    fn step(
        &mut self,
        instr: &Instr,
        locals: &mut [Value],
        stack: &mut Vec<Value>,
    ) -> Result<Flow, Fault> {
        match *instr {
            Instr::Const(c) => stack.push(match c {
                Const::Unit => Value::Unit,
                Const::Bool(b) => Value::Bool(b),
                Const::I64(v) => Value::I64(v),
                Const::F64(v) => Value::F64(v),
                Const::Null => Value::Null,
            }),
            Instr::LocalGet(i) => stack.push(locals[i as usize].clone()),
            Instr::LocalSet(i) => locals[i as usize] = pop(stack)?,
            Instr::LocalTee(i) => {
                let value = pop(stack)?;
                locals[i as usize] = value.clone();
                stack.push(value);
            }
            Instr::Drop => {
                pop(stack)?;
            }
            Instr::Binary(op) => {
                let right = pop(stack)?;
                let left = pop(stack)?;
                stack.push(binary(op, left, right)?);
            }
            Instr::Unary(op) => {
                let operand = pop(stack)?;
                stack.push(match (op, operand) {
                    (UnOp::Neg, Value::I64(v)) => Value::I64(v.wrapping_neg()),
                    (UnOp::Neg, Value::F64(v)) => Value::F64(-v),
                    (UnOp::Not, Value::Bool(b)) => Value::Bool(!b),
                    _ => return Err(TrapCode::TypeMismatch.into()),
                });
            }
            Instr::Jump(target) => return Ok(Flow::Jump(target)),
            Instr::JumpIf(target) => {
                if pop_bool(stack)? {
                    return Ok(Flow::Jump(target));
                }
            }
            Instr::JumpUnless(target) => {
                if !pop_bool(stack)? {
                    return Ok(Flow::Jump(target));
                }
            }
            Instr::Call(func) => {
                let arity = self.arity(func)?;
                let args = pop_n(stack, arity)?;
                stack.push(self.invoke(func, args).map_err(Fault::Nested)?);
            }
            Instr::CallRef { arity } => {
                let func = match pop(stack)? {
                    Value::Func(f) => f,
                    Value::Null => return Err(TrapCode::NullReference.into()),
                    _ => return Err(TrapCode::TypeMismatch.into()),
                };
                if self.arity(func)? != arity as usize {
                    return Err(TrapCode::TypeMismatch.into());
                }
                let args = pop_n(stack, arity as usize)?;
                stack.push(self.invoke(func, args).map_err(Fault::Nested)?);
            }
            Instr::RefFunc(func) => stack.push(Value::Func(func)),
            Instr::Return => return Ok(Flow::Return(stack.pop().unwrap_or(Value::Unit))),
            Instr::StructNew { type_index } => {
                let field_count = self
                    .module
                    .module
                    .types
                    .get(type_index as usize)
                    .map(|t| t.fields.len())
                    .ok_or(TrapCode::TypeMismatch)?;
                let fields = pop_n(stack, field_count)?;
                stack.push(Value::new_struct(type_index, fields));
            }
            Instr::StructGet { type_index, field } => {
                let target = pop_struct(stack, type_index)?;
                stack.push(target.get(field).ok_or(TrapCode::TypeMismatch)?);
            }
            Instr::StructSet { type_index, field } => {
                let value = pop(stack)?;
                let target = pop_struct(stack, type_index)?;
                if !target.set(field, value) {
                    return Err(TrapCode::TypeMismatch.into());
                }
            }
            Instr::RefIsNull => {
                let value = pop(stack)?;
                stack.push(Value::Bool(value.is_null()));
            }
            Instr::Trap(code) => return Err(code.into()),
        }
        Ok(Flow::Next)
    }

    fn arity(&self, func: u32) -> Result<usize, TrapCode> {
        self.module
            .module
            .functions
            .get(func as usize)
            .map(|f| f.params as usize)
            .ok_or(TrapCode::Unreachable)
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, TrapCode> {
    stack.pop().ok_or(TrapCode::TypeMismatch)
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> Result<Vec<Value>, TrapCode> {
    if stack.len() < n {
        return Err(TrapCode::TypeMismatch);
    }
    Ok(stack.split_off(stack.len() - n))
}

fn pop_bool(stack: &mut Vec<Value>) -> Result<bool, TrapCode> {
    match pop(stack)? {
        Value::Bool(b) => Ok(b),
        _ => Err(TrapCode::TypeMismatch),
    }
}

fn pop_struct(stack: &mut Vec<Value>, type_index: u32) -> Result<StructRef, TrapCode> {
    match pop(stack)? {
        Value::Struct(s) if s.type_index() == type_index => Ok(s),
        Value::Null => Err(TrapCode::NullReference),
        _ => Err(TrapCode::TypeMismatch),
    }
}

fn values_equal(left: &Value, right: &Value) -> Result<bool, TrapCode> {
    Ok(match (left, right) {
        (Value::Unit, Value::Unit) | (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::I64(a), Value::I64(b)) => a == b,
        (Value::F64(a), Value::F64(b)) => a == b,
        (Value::Func(a), Value::Func(b)) => a == b,
        (Value::Struct(a), Value::Struct(b)) => a.ptr_eq(b),
        (Value::Struct(_), Value::Null) | (Value::Null, Value::Struct(_)) => false,
        _ => return Err(TrapCode::TypeMismatch),
    })
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, TrapCode> {
    use Value::{Bool, F64, I64};

    match op {
        BinOp::Eq => return values_equal(&left, &right).map(Bool),
        BinOp::Ne => return values_equal(&left, &right).map(|eq| Bool(!eq)),
        _ => {}
    }

    Ok(match (op, left, right) {
        (BinOp::Div | BinOp::Rem, I64(_), I64(0)) => return Err(TrapCode::DivisionByZero),
        (BinOp::Add, I64(a), I64(b)) => I64(a.wrapping_add(b)),
        (BinOp::Sub, I64(a), I64(b)) => I64(a.wrapping_sub(b)),
        (BinOp::Mul, I64(a), I64(b)) => I64(a.wrapping_mul(b)),
        (BinOp::Div, I64(a), I64(b)) => I64(a.wrapping_div(b)),
        (BinOp::Rem, I64(a), I64(b)) => I64(a.wrapping_rem(b)),
        (BinOp::Lt, I64(a), I64(b)) => Bool(a < b),
        (BinOp::Le, I64(a), I64(b)) => Bool(a <= b),
        (BinOp::Gt, I64(a), I64(b)) => Bool(a > b),
        (BinOp::Ge, I64(a), I64(b)) => Bool(a >= b),
        (BinOp::Add, F64(a), F64(b)) => F64(a + b),
        (BinOp::Sub, F64(a), F64(b)) => F64(a - b),
        (BinOp::Mul, F64(a), F64(b)) => F64(a * b),
        (BinOp::Div, F64(a), F64(b)) => F64(a / b),
        (BinOp::Rem, F64(a), F64(b)) => F64(a % b),
        (BinOp::Lt, F64(a), F64(b)) => Bool(a < b),
        (BinOp::Le, F64(a), F64(b)) => Bool(a <= b),
        (BinOp::Gt, F64(a), F64(b)) => Bool(a > b),
        (BinOp::Ge, F64(a), F64(b)) => Bool(a >= b),
        (BinOp::And, Bool(a), Bool(b)) => Bool(a && b),
        (BinOp::Or, Bool(a), Bool(b)) => Bool(a || b),
        (_, left, right) => {
            tracing::trace!(
                ?op,
                left = left.type_name(),
                right = right.type_name(),
                "operand type mismatch"
            );
            return Err(TrapCode::TypeMismatch);
        }
    })
}
