//! Instruction emission.
//!
//! Code generation talks to an [`InstructionSink`] rather than to a
//! concrete module, so the backend does not depend on how (or whether) the
//! result is serialized. [`ModuleBuilder`] is the sink that produces a
//! binary module.
//!
//! Function bodies are assembled with a [`FunctionBuilder`], which plays
//! the role basic blocks play in an SSA builder: code is appended to the
//! current position and [`Label`]s are resolved to instruction indices
//! when the body is finished.

use std::collections::HashMap;
use std::ops::Range;

use wisp_runtime::module::{Const, CustomSection, Export, Function, Instr, StructType};
use wisp_runtime::Module;

/// Receiver of generated code.
pub trait InstructionSink {
    /// Add a struct type, or return the index of the type with this name.
    fn add_struct_type(&mut self, name: &str, fields: &[String]) -> u32;

    /// Reserve a function index. The body is supplied later.
    fn declare_function(&mut self, name: &str, params: u32, returns_outcome: bool) -> u32;

    fn define_function(&mut self, index: u32, locals: u32, code: Vec<Instr>);

    fn export(&mut self, name: &str, func: u32);

    fn custom_section(&mut self, name: &str, data: Vec<u8>);

    /// Byte range of every function body in the emitted binary.
    fn code_layout(&self) -> Vec<Range<u32>>;

    fn emit_binary(&self) -> Vec<u8>;
}

/// Builds an in-memory [`Module`].
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    module: Module,
    type_names: HashMap<String, u32>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn into_module(self) -> Module {
        self.module
    }
}

impl InstructionSink for ModuleBuilder {
    fn add_struct_type(&mut self, name: &str, fields: &[String]) -> u32 {
        if let Some(&index) = self.type_names.get(name) {
            return index;
        }
        let index = self.module.types.len() as u32;
        self.module.types.push(StructType {
            name: name.to_string(),
            fields: fields.to_vec(),
        });
        self.type_names.insert(name.to_string(), index);
        index
    }

    fn declare_function(&mut self, name: &str, params: u32, returns_outcome: bool) -> u32 {
        let index = self.module.functions.len() as u32;
        self.module.functions.push(Function {
            name: name.to_string(),
            params,
            locals: 0,
            returns_outcome,
            code: vec![Instr::Trap(wisp_runtime::TrapCode::Unreachable)],
        });
        index
    }

    fn define_function(&mut self, index: u32, locals: u32, code: Vec<Instr>) {
        if let Some(func) = self.module.functions.get_mut(index as usize) {
            func.locals = locals;
            func.code = code;
        }
    }

    fn export(&mut self, name: &str, func: u32) {
        self.module.exports.push(Export {
            name: name.to_string(),
            func,
        });
    }

    fn custom_section(&mut self, name: &str, data: Vec<u8>) {
        self.module.custom.push(CustomSection {
            name: name.to_string(),
            data,
        });
    }

    fn code_layout(&self) -> Vec<Range<u32>> {
        self.module.encode_with_layout().1
    }

    fn emit_binary(&self) -> Vec<u8> {
        self.module.encode()
    }
}

/// A forward or backward jump target within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Assembles the body of one function.
#[derive(Debug)]
pub struct FunctionBuilder {
    params: u32,
    locals: u32,
    code: Vec<Instr>,
    labels: Vec<Option<u32>>,
    /// Jumps whose target label was unbound when they were emitted.
    fixups: Vec<(usize, Label, fn(u32) -> Instr)>,
}

impl FunctionBuilder {
    /// A builder whose first `locals` locals (parameters included) are
    /// already assigned.
    pub fn new(params: u32, locals: u32) -> Self {
        Self {
            params,
            locals: locals.max(params),
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Allocate a scratch local.
    pub fn new_local(&mut self) -> u32 {
        let local = self.locals;
        self.locals += 1;
        local
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the next instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.code.len() as u32);
    }

    pub fn emit(&mut self, instr: Instr) {
        self.code.push(instr);
    }

    pub fn i64(&mut self, value: i64) {
        self.emit(Instr::Const(Const::I64(value)));
    }

    pub fn unit(&mut self) {
        self.emit(Instr::Const(Const::Unit));
    }

    pub fn null(&mut self) {
        self.emit(Instr::Const(Const::Null));
    }

    pub fn jump(&mut self, label: Label) {
        self.jump_instr(label, Instr::Jump);
    }

    pub fn jump_if(&mut self, label: Label) {
        self.jump_instr(label, Instr::JumpIf);
    }

    pub fn jump_unless(&mut self, label: Label) {
        self.jump_instr(label, Instr::JumpUnless);
    }

    fn jump_instr(&mut self, label: Label, make: fn(u32) -> Instr) {
        match self.labels[label.0 as usize] {
            Some(target) => self.emit(make(target)),
            None => {
                self.fixups.push((self.code.len(), label, make));
                self.emit(make(u32::MAX));
            }
        }
    }

    /// Resolve jumps. Returns the number of locals beyond the parameters
    /// and the code.
    pub fn finish(mut self) -> (u32, Vec<Instr>) {
        let end = self.code.len() as u32;
        for (at, label, make) in std::mem::take(&mut self.fixups) {
            // Unbound labels point past the end, which returns.
            self.code[at] = make(self.labels[label.0 as usize].unwrap_or(end));
        }
        (self.locals - self.params, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wisp_runtime::module::BinOp;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut b = FunctionBuilder::new(1, 1);
        let top = b.new_label();
        let end = b.new_label();
        b.bind(top);
        b.emit(Instr::LocalGet(0));
        b.jump_unless(end);
        b.jump(top);
        b.bind(end);
        b.unit();
        let (locals, code) = b.finish();
        assert_eq!(locals, 0);
        assert_eq!(code[1], Instr::JumpUnless(3));
        assert_eq!(code[2], Instr::Jump(0));
    }

    #[test]
    fn test_scratch_locals_follow_assigned() {
        let mut b = FunctionBuilder::new(2, 5);
        assert_eq!(b.new_local(), 5);
        assert_eq!(b.new_local(), 6);
        let (locals, _) = b.finish();
        assert_eq!(locals, 5);
    }

    #[test]
    fn test_module_builder_dedups_types() {
        let mut m = ModuleBuilder::new();
        let a = m.add_struct_type("pair", &["a".to_string(), "b".to_string()]);
        let b = m.add_struct_type("pair", &["a".to_string(), "b".to_string()]);
        assert_eq!(a, b);

        let f = m.declare_function("double", 1, false);
        m.define_function(
            f,
            0,
            vec![Instr::LocalGet(0), Instr::Const(Const::I64(2)), Instr::Binary(BinOp::Mul)],
        );
        m.export("double", f);
        let bytes = m.emit_binary();
        let decoded = Module::decode(&bytes).unwrap();
        assert_eq!(decoded.module.export("double"), Some(0));
        assert_eq!(m.code_layout(), decoded.code_ranges);
    }
}
