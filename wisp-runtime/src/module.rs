//! Binary module format.
//!
//! A module is a flat, versioned byte stream:
//!
//! ```text
//! magic "\0wsp" | version:u32 | section*
//! section = id:u8 | len:u32 | payload
//! ```
//!
//! | Id | Section   | Payload                                              |
//! |----|-----------|------------------------------------------------------|
//! | 1  | types     | struct types: name, field names                      |
//! | 2  | functions | name, param count, `returns_outcome` flag            |
//! | 3  | exports   | export name, function index                          |
//! | 4  | code      | one body per function: locals, instructions          |
//! | 0  | custom    | section name, opaque bytes (always written last)     |
//!
//! All integers are little-endian. Jump targets are instruction indices
//! within the enclosing function, so bodies can be relocated freely.
//! Because custom sections follow the code section, appending metadata
//! never moves the byte ranges of compiled functions.

use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// Magic bytes at the start of every module.
pub const MAGIC: [u8; 4] = *b"\0wsp";

/// Current module format version.
pub const FORMAT_VERSION: u32 = 1;

const SECTION_CUSTOM: u8 = 0;
const SECTION_TYPES: u8 = 1;
const SECTION_FUNCTIONS: u8 = 2;
const SECTION_EXPORTS: u8 = 3;
const SECTION_CODE: u8 = 4;

// ============================================================
// Instructions
// ============================================================

/// Binary operators. Operands are popped right then left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Rem = 4,
    Eq = 5,
    Ne = 6,
    Lt = 7,
    Le = 8,
    Gt = 9,
    Ge = 10,
    And = 11,
    Or = 12,
}

impl BinOp {
    const ALL: [BinOp; 13] = [
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::Div,
        BinOp::Rem,
        BinOp::Eq,
        BinOp::Ne,
        BinOp::Lt,
        BinOp::Le,
        BinOp::Gt,
        BinOp::Ge,
        BinOp::And,
        BinOp::Or,
    ];

    fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnOp {
    Neg = 0,
    Not = 1,
}

/// Reasons an instruction stream may trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrapCode {
    /// Explicit unreachable code.
    Unreachable = 0,
    /// A continuation was resumed a second time.
    DoubleResume = 1,
    /// A resume-kind handler clause finished without resuming.
    MissingTailResume = 2,
    /// A frame was re-entered at an entry it does not have.
    InvalidContinuation = 3,
    /// Integer division or remainder by zero.
    DivisionByZero = 4,
    /// An operand had the wrong runtime type.
    TypeMismatch = 5,
    /// A struct access through a null reference.
    NullReference = 6,
    /// The engine's call depth limit was exceeded.
    CallStackExhausted = 7,
}

impl TrapCode {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => TrapCode::Unreachable,
            1 => TrapCode::DoubleResume,
            2 => TrapCode::MissingTailResume,
            3 => TrapCode::InvalidContinuation,
            4 => TrapCode::DivisionByZero,
            5 => TrapCode::TypeMismatch,
            6 => TrapCode::NullReference,
            7 => TrapCode::CallStackExhausted,
            _ => return None,
        })
    }

    /// Short name used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrapCode::Unreachable => "unreachable",
            TrapCode::DoubleResume => "double resume",
            TrapCode::MissingTailResume => "missing tail resume",
            TrapCode::InvalidContinuation => "invalid continuation",
            TrapCode::DivisionByZero => "integer division by zero",
            TrapCode::TypeMismatch => "type mismatch",
            TrapCode::NullReference => "null reference",
            TrapCode::CallStackExhausted => "call stack exhausted",
        }
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A constant operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    Unit,
    Bool(bool),
    I64(i64),
    F64(f64),
    Null,
}

/// A single instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Const(Const),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    Drop,
    Binary(BinOp),
    Unary(UnOp),
    /// Unconditional jump to an instruction index.
    Jump(u32),
    /// Pop a bool; jump when true.
    JumpIf(u32),
    /// Pop a bool; jump when false.
    JumpUnless(u32),
    Call(u32),
    /// Pop a function reference, then `arity` arguments.
    CallRef { arity: u32 },
    RefFunc(u32),
    Return,
    /// Pop one value per field (first field deepest).
    StructNew { type_index: u32 },
    StructGet { type_index: u32, field: u32 },
    /// Pop the value, then the struct reference.
    StructSet { type_index: u32, field: u32 },
    RefIsNull,
    Trap(TrapCode),
}

mod opcode {
    pub const CONST_UNIT: u8 = 0x01;
    pub const CONST_BOOL: u8 = 0x02;
    pub const CONST_I64: u8 = 0x03;
    pub const CONST_F64: u8 = 0x04;
    pub const CONST_NULL: u8 = 0x05;
    pub const LOCAL_GET: u8 = 0x10;
    pub const LOCAL_SET: u8 = 0x11;
    pub const LOCAL_TEE: u8 = 0x12;
    pub const DROP: u8 = 0x13;
    pub const BINARY: u8 = 0x20;
    pub const UNARY: u8 = 0x21;
    pub const JUMP: u8 = 0x30;
    pub const JUMP_IF: u8 = 0x31;
    pub const JUMP_UNLESS: u8 = 0x32;
    pub const CALL: u8 = 0x40;
    pub const CALL_REF: u8 = 0x41;
    pub const REF_FUNC: u8 = 0x42;
    pub const RETURN: u8 = 0x43;
    pub const STRUCT_NEW: u8 = 0x50;
    pub const STRUCT_GET: u8 = 0x51;
    pub const STRUCT_SET: u8 = 0x52;
    pub const REF_IS_NULL: u8 = 0x53;
    pub const TRAP: u8 = 0x60;
}

// ============================================================
// Module structure
// ============================================================

/// A named struct type. Fields are untyped slots addressed by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<String>,
}

/// A function: signature plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: u32,
    /// Locals beyond the parameters.
    pub locals: u32,
    /// Whether the function returns an Outcome struct rather than a plain value.
    pub returns_outcome: bool,
    pub code: Vec<Instr>,
}

/// An exported function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub func: u32,
}

/// An opaque named metadata section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    pub data: Vec<u8>,
}

/// An in-memory module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub types: Vec<StructType>,
    pub functions: Vec<Function>,
    pub exports: Vec<Export>,
    pub custom: Vec<CustomSection>,
}

/// A decoded module together with the byte layout of its code.
#[derive(Debug, Clone)]
pub struct DecodedModule {
    pub module: Module,
    /// Absolute byte offset of every instruction, per function.
    pub instr_offsets: Vec<Vec<u32>>,
    /// Absolute byte range of every function body.
    pub code_ranges: Vec<Range<u32>>,
}

impl Module {
    /// Find a struct type by name.
    pub fn type_index(&self, name: &str) -> Option<u32> {
        self.types.iter().position(|t| t.name == name).map(|i| i as u32)
    }

    /// Find an export by name.
    pub fn export(&self, name: &str) -> Option<u32> {
        self.exports.iter().find(|e| e.name == name).map(|e| e.func)
    }

    /// Find a custom section by name.
    pub fn custom_section(&self, name: &str) -> Option<&[u8]> {
        self.custom
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.data.as_slice())
    }

    /// Serialize the module.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_layout().0
    }

    /// Serialize the module, also returning each function body's byte range.
    pub fn encode_with_layout(&self) -> (Vec<u8>, Vec<Range<u32>>) {
        let mut out = ByteWriter::new();
        out.bytes(&MAGIC);
        out.u32(FORMAT_VERSION);

        let mut types = ByteWriter::new();
        types.u32(self.types.len() as u32);
        for ty in &self.types {
            types.str(&ty.name);
            types.u32(ty.fields.len() as u32);
            for field in &ty.fields {
                types.str(field);
            }
        }
        out.section(SECTION_TYPES, &types.into_inner());

        let mut funcs = ByteWriter::new();
        funcs.u32(self.functions.len() as u32);
        for func in &self.functions {
            funcs.str(&func.name);
            funcs.u32(func.params);
            funcs.u8(func.returns_outcome as u8);
        }
        out.section(SECTION_FUNCTIONS, &funcs.into_inner());

        let mut exports = ByteWriter::new();
        exports.u32(self.exports.len() as u32);
        for export in &self.exports {
            exports.str(&export.name);
            exports.u32(export.func);
        }
        out.section(SECTION_EXPORTS, &exports.into_inner());

        // The code section payload starts after id + len.
        let code_start = out.len() + 5;
        let mut code = ByteWriter::new();
        let mut ranges = Vec::with_capacity(self.functions.len());
        code.u32(self.functions.len() as u32);
        for func in &self.functions {
            let mut body = ByteWriter::new();
            body.u32(func.locals);
            for instr in &func.code {
                encode_instr(&mut body, instr);
            }
            let body = body.into_inner();
            let start = (code_start + code.len()) as u32;
            code.u32(body.len() as u32);
            code.bytes(&body);
            ranges.push(start..(code_start + code.len()) as u32);
        }
        out.section(SECTION_CODE, &code.into_inner());

        for custom in &self.custom {
            let mut payload = ByteWriter::new();
            payload.str(&custom.name);
            payload.bytes(&custom.data);
            out.section(SECTION_CUSTOM, &payload.into_inner());
        }

        (out.into_inner(), ranges)
    }

    /// Parse and validate a module.
    pub fn decode(bytes: &[u8]) -> Result<DecodedModule, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        if reader.take(4)? != &MAGIC[..] {
            return Err(DecodeError::BadMagic);
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }

        let mut module = Module::default();
        let mut signatures: Vec<(String, u32, bool)> = Vec::new();
        let mut instr_offsets = Vec::new();
        let mut code_ranges = Vec::new();

        while !reader.is_empty() {
            let section_offset = reader.position();
            let id = reader.u8()?;
            let len = reader.u32()? as usize;
            let payload_start = reader.position();
            let mut section = ByteReader::at(bytes, payload_start, payload_start + len)?;
            reader.skip(len)?;

            match id {
                SECTION_TYPES => {
                    let count = section.u32()?;
                    for _ in 0..count {
                        let name = section.str()?;
                        let field_count = section.u32()?;
                        let mut fields = Vec::new();
                        for _ in 0..field_count {
                            fields.push(section.str()?);
                        }
                        module.types.push(StructType { name, fields });
                    }
                }
                SECTION_FUNCTIONS => {
                    let count = section.u32()?;
                    for _ in 0..count {
                        let name = section.str()?;
                        let params = section.u32()?;
                        let returns_outcome = section.u8()? != 0;
                        signatures.push((name, params, returns_outcome));
                    }
                }
                SECTION_EXPORTS => {
                    let count = section.u32()?;
                    for _ in 0..count {
                        let name = section.str()?;
                        let func = section.u32()?;
                        module.exports.push(Export { name, func });
                    }
                }
                SECTION_CODE => {
                    let count = section.u32()? as usize;
                    if count != signatures.len() {
                        return Err(DecodeError::Malformed {
                            what: "code section",
                            detail: format!(
                                "{} bodies for {} functions",
                                count,
                                signatures.len()
                            ),
                        });
                    }
                    for (name, params, returns_outcome) in signatures.drain(..) {
                        let start = section.position();
                        let body_len = section.u32()? as usize;
                        let body_start = section.position();
                        let mut body = ByteReader::at(bytes, body_start, body_start + body_len)?;
                        section.skip(body_len)?;
                        let locals = body.u32()?;
                        let mut code = Vec::new();
                        let mut offsets = Vec::new();
                        while !body.is_empty() {
                            offsets.push(body.position() as u32);
                            code.push(decode_instr(&mut body)?);
                        }
                        module.functions.push(Function {
                            name,
                            params,
                            locals,
                            returns_outcome,
                            code,
                        });
                        instr_offsets.push(offsets);
                        code_ranges.push(start as u32..section.position() as u32);
                    }
                }
                SECTION_CUSTOM => {
                    let name = section.str()?;
                    let data = section.rest().to_vec();
                    module.custom.push(CustomSection { name, data });
                }
                other => {
                    return Err(DecodeError::UnknownSection {
                        id: other,
                        offset: section_offset,
                    })
                }
            }
        }

        if !signatures.is_empty() {
            return Err(DecodeError::Malformed {
                what: "module",
                detail: "function section without code section".to_string(),
            });
        }
        module.validate()?;

        Ok(DecodedModule {
            module,
            instr_offsets,
            code_ranges,
        })
    }

    /// Check every index an instruction refers to.
    fn validate(&self) -> Result<(), DecodeError> {
        let func_count = self.functions.len() as u32;
        for export in &self.exports {
            if export.func >= func_count {
                return Err(malformed(
                    "export",
                    format!("`{}` refers to function {}", export.name, export.func),
                ));
            }
        }
        for func in &self.functions {
            let code_len = func.code.len() as u32;
            let local_count = func.params + func.locals;
            for instr in &func.code {
                let ok = match *instr {
                    Instr::LocalGet(i) | Instr::LocalSet(i) | Instr::LocalTee(i) => i < local_count,
                    Instr::Jump(t) | Instr::JumpIf(t) | Instr::JumpUnless(t) => t <= code_len,
                    Instr::Call(f) | Instr::RefFunc(f) => f < func_count,
                    Instr::StructNew { type_index } => (type_index as usize) < self.types.len(),
                    Instr::StructGet { type_index, field }
                    | Instr::StructSet { type_index, field } => self
                        .types
                        .get(type_index as usize)
                        .map_or(false, |t| (field as usize) < t.fields.len()),
                    _ => true,
                };
                if !ok {
                    return Err(malformed(
                        "function",
                        format!("`{}`: instruction {:?} is out of range", func.name, instr),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn malformed(what: &'static str, detail: String) -> DecodeError {
    DecodeError::Malformed { what, detail }
}

fn encode_instr(w: &mut ByteWriter, instr: &Instr) {
    use opcode::*;
    match *instr {
        Instr::Const(Const::Unit) => w.u8(CONST_UNIT),
        Instr::Const(Const::Bool(b)) => {
            w.u8(CONST_BOOL);
            w.u8(b as u8);
        }
        Instr::Const(Const::I64(v)) => {
            w.u8(CONST_I64);
            w.i64(v);
        }
        Instr::Const(Const::F64(v)) => {
            w.u8(CONST_F64);
            w.u64(v.to_bits());
        }
        Instr::Const(Const::Null) => w.u8(CONST_NULL),
        Instr::LocalGet(i) => w.op_u32(LOCAL_GET, i),
        Instr::LocalSet(i) => w.op_u32(LOCAL_SET, i),
        Instr::LocalTee(i) => w.op_u32(LOCAL_TEE, i),
        Instr::Drop => w.u8(DROP),
        Instr::Binary(op) => {
            w.u8(BINARY);
            w.u8(op as u8);
        }
        Instr::Unary(op) => {
            w.u8(UNARY);
            w.u8(op as u8);
        }
        Instr::Jump(t) => w.op_u32(JUMP, t),
        Instr::JumpIf(t) => w.op_u32(JUMP_IF, t),
        Instr::JumpUnless(t) => w.op_u32(JUMP_UNLESS, t),
        Instr::Call(f) => w.op_u32(CALL, f),
        Instr::CallRef { arity } => w.op_u32(CALL_REF, arity),
        Instr::RefFunc(f) => w.op_u32(REF_FUNC, f),
        Instr::Return => w.u8(RETURN),
        Instr::StructNew { type_index } => w.op_u32(STRUCT_NEW, type_index),
        Instr::StructGet { type_index, field } => {
            w.op_u32(STRUCT_GET, type_index);
            w.u32(field);
        }
        Instr::StructSet { type_index, field } => {
            w.op_u32(STRUCT_SET, type_index);
            w.u32(field);
        }
        Instr::RefIsNull => w.u8(REF_IS_NULL),
        Instr::Trap(code) => {
            w.u8(TRAP);
            w.u8(code as u8);
        }
    }
}

fn decode_instr(r: &mut ByteReader<'_>) -> Result<Instr, DecodeError> {
    use opcode::*;
    let offset = r.position();
    let op = r.u8()?;
    Ok(match op {
        CONST_UNIT => Instr::Const(Const::Unit),
        CONST_BOOL => Instr::Const(Const::Bool(r.u8()? != 0)),
        CONST_I64 => Instr::Const(Const::I64(r.i64()?)),
        CONST_F64 => Instr::Const(Const::F64(f64::from_bits(r.u64()?))),
        CONST_NULL => Instr::Const(Const::Null),
        LOCAL_GET => Instr::LocalGet(r.u32()?),
        LOCAL_SET => Instr::LocalSet(r.u32()?),
        LOCAL_TEE => Instr::LocalTee(r.u32()?),
        DROP => Instr::Drop,
        BINARY => {
            let byte = r.u8()?;
            Instr::Binary(BinOp::from_u8(byte).ok_or(DecodeError::UnknownOpcode {
                opcode: byte,
                offset,
            })?)
        }
        UNARY => match r.u8()? {
            0 => Instr::Unary(UnOp::Neg),
            1 => Instr::Unary(UnOp::Not),
            byte => return Err(DecodeError::UnknownOpcode { opcode: byte, offset }),
        },
        JUMP => Instr::Jump(r.u32()?),
        JUMP_IF => Instr::JumpIf(r.u32()?),
        JUMP_UNLESS => Instr::JumpUnless(r.u32()?),
        CALL => Instr::Call(r.u32()?),
        CALL_REF => Instr::CallRef { arity: r.u32()? },
        REF_FUNC => Instr::RefFunc(r.u32()?),
        RETURN => Instr::Return,
        STRUCT_NEW => Instr::StructNew {
            type_index: r.u32()?,
        },
        STRUCT_GET => Instr::StructGet {
            type_index: r.u32()?,
            field: r.u32()?,
        },
        STRUCT_SET => Instr::StructSet {
            type_index: r.u32()?,
            field: r.u32()?,
        },
        REF_IS_NULL => Instr::RefIsNull,
        TRAP => {
            let byte = r.u8()?;
            Instr::Trap(TrapCode::from_u8(byte).ok_or(DecodeError::UnknownOpcode {
                opcode: byte,
                offset,
            })?)
        }
        other => return Err(DecodeError::UnknownOpcode { opcode: other, offset }),
    })
}

// ============================================================
// Errors
// ============================================================

/// Errors raised while decoding a module or one of its sections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },

    #[error("bad magic number")]
    BadMagic,

    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("unknown section id {id} at byte {offset}")]
    UnknownSection { id: u8, offset: usize },

    #[error("unknown opcode 0x{opcode:02x} at byte {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("invalid utf-8 in string at byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

// ============================================================
// Byte-level helpers
// ============================================================

/// Little-endian byte writer shared by the module and metadata encoders.
#[derive(Debug, Default)]
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub(crate) fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }

    fn op_u32(&mut self, op: u8, v: u32) {
        self.u8(op);
        self.u32(v);
    }

    fn section(&mut self, id: u8, payload: &[u8]) {
        self.u8(id);
        self.u32(payload.len() as u32);
        self.bytes(payload);
    }
}

/// Bounds-checked little-endian reader. Positions are absolute.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            end: bytes.len(),
        }
    }

    fn at(bytes: &'a [u8], start: usize, end: usize) -> Result<Self, DecodeError> {
        if end > bytes.len() || start > end {
            return Err(DecodeError::UnexpectedEof { offset: bytes.len() });
        }
        Ok(Self {
            bytes,
            pos: start,
            end,
        })
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.end - self.pos < n {
            return Err(DecodeError::UnexpectedEof { offset: self.end });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..self.end];
        self.pos = self.end;
        slice
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.u64()? as i64)
    }

    pub(crate) fn str(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let offset = self.pos;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { offset })
    }
}
