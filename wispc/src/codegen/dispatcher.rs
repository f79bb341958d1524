//! Generated runtime helpers shared by every effectful function.
//!
//! | Function        | Signature                        | Purpose                                   |
//! |-----------------|----------------------------------|-------------------------------------------|
//! | `wisp$value`    | `(v) -> outcome`                 | Wrap a completed value                    |
//! | `wisp$append`   | `(k, first, last) -> ()`         | Append a chain of frames to a continuation |
//! | `wisp$continue` | `(frame, outcome) -> outcome`    | Run a frame chain outward                 |
//! | `wisp$resume`   | `(k, v) -> outcome`              | One-shot check, then continue             |
//!
//! `wisp$resume` is exported as the host's resume entry.

use wisp_runtime::abi;
use wisp_runtime::module::{BinOp, Const, Instr};
use wisp_runtime::TrapCode;

use super::sink::{FunctionBuilder, InstructionSink};

/// Struct type indices of the calling convention.
#[derive(Debug, Clone, Copy)]
pub struct AbiTypes {
    pub outcome: u32,
    pub cont: u32,
    pub frame: u32,
}

impl AbiTypes {
    pub fn declare(sink: &mut dyn InstructionSink) -> Self {
        let fields = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        Self {
            outcome: sink.add_struct_type(abi::OUTCOME_TYPE, &fields(&abi::OUTCOME_FIELDS)),
            cont: sink.add_struct_type(abi::CONT_TYPE, &fields(&abi::CONT_FIELDS)),
            frame: sink.add_struct_type(abi::FRAME_TYPE, &fields(&abi::FRAME_FIELDS)),
        }
    }

    pub fn outcome_field(&self, field: u32) -> Instr {
        Instr::StructGet {
            type_index: self.outcome,
            field,
        }
    }

    pub fn cont_field(&self, field: u32) -> Instr {
        Instr::StructGet {
            type_index: self.cont,
            field,
        }
    }

    pub fn frame_field(&self, field: u32) -> Instr {
        Instr::StructGet {
            type_index: self.frame,
            field,
        }
    }
}

/// Function indices of the helpers.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    pub types: AbiTypes,
    pub value: u32,
    pub append: u32,
    pub continue_: u32,
    pub resume: u32,
}

impl Dispatcher {
    /// Declare, define and export the helpers.
    pub fn generate(sink: &mut dyn InstructionSink, types: AbiTypes) -> Self {
        let dispatcher = Self {
            types,
            value: sink.declare_function("wisp$value", 1, true),
            append: sink.declare_function("wisp$append", 3, false),
            continue_: sink.declare_function("wisp$continue", 2, true),
            resume: sink.declare_function("wisp$resume", 2, true),
        };
        dispatcher.define_value(sink);
        dispatcher.define_append(sink);
        dispatcher.define_continue(sink);
        dispatcher.define_resume(sink);
        sink.export(abi::RESUME_EXPORT, dispatcher.resume);
        dispatcher
    }

    fn define_value(&self, sink: &mut dyn InstructionSink) {
        let t = self.types;
        let mut b = FunctionBuilder::new(1, 1);
        b.i64(abi::TAG_VALUE);
        b.emit(Instr::LocalGet(0));
        b.i64(0);
        b.null();
        b.null();
        b.emit(Instr::StructNew { type_index: t.outcome });
        b.emit(Instr::Return);
        let (locals, code) = b.finish();
        sink.define_function(self.value, locals, code);
    }

    fn define_append(&self, sink: &mut dyn InstructionSink) {
        const K: u32 = 0;
        const FIRST: u32 = 1;
        const LAST: u32 = 2;
        let t = self.types;
        let mut b = FunctionBuilder::new(3, 3);
        let link = b.new_label();
        let done = b.new_label();

        b.emit(Instr::LocalGet(K));
        b.emit(t.cont_field(abi::CONT_HEAD));
        b.emit(Instr::RefIsNull);
        b.jump_unless(link);
        b.emit(Instr::LocalGet(K));
        b.emit(Instr::LocalGet(FIRST));
        b.emit(Instr::StructSet {
            type_index: t.cont,
            field: abi::CONT_HEAD,
        });
        b.jump(done);

        b.bind(link);
        b.emit(Instr::LocalGet(K));
        b.emit(t.cont_field(abi::CONT_LAST));
        b.emit(Instr::LocalGet(FIRST));
        b.emit(Instr::StructSet {
            type_index: t.frame,
            field: abi::FRAME_NEXT,
        });

        b.bind(done);
        b.emit(Instr::LocalGet(K));
        b.emit(Instr::LocalGet(LAST));
        b.emit(Instr::StructSet {
            type_index: t.cont,
            field: abi::CONT_LAST,
        });
        b.unit();
        b.emit(Instr::Return);
        let (locals, code) = b.finish();
        sink.define_function(self.append, locals, code);
    }

    /// ```text
    /// loop {
    ///     if frame == null { return outcome }
    ///     next = frame.next
    ///     if frame.kind == HANDLE {
    ///         outcome = frame.entry(frame, outcome)
    ///     } else if outcome.tag == REQUEST {
    ///         frame.next = null
    ///         append(outcome.cont, frame, frame)
    ///     } else {
    ///         outcome = frame.entry(frame, outcome.value)
    ///     }
    ///     frame = next
    /// }
    /// ```
    ///
    /// A request raised while frames remain moves the call frames between it
    /// and the next handle frame onto its own continuation, so that handle
    /// frame still sees the request.
    fn define_continue(&self, sink: &mut dyn InstructionSink) {
        const FRAME: u32 = 0;
        const OUTCOME: u32 = 1;
        let t = self.types;
        let mut b = FunctionBuilder::new(2, 2);
        let next = b.new_local();
        let top = b.new_label();
        let call_frame = b.new_label();
        let forward = b.new_label();
        let value = b.new_label();
        let advance = b.new_label();

        b.bind(top);
        b.emit(Instr::LocalGet(FRAME));
        b.emit(Instr::RefIsNull);
        b.jump_unless(call_frame);
        b.emit(Instr::LocalGet(OUTCOME));
        b.emit(Instr::Return);

        b.bind(call_frame);
        b.emit(Instr::LocalGet(FRAME));
        b.emit(t.frame_field(abi::FRAME_NEXT));
        b.emit(Instr::LocalSet(next));

        b.emit(Instr::LocalGet(FRAME));
        b.emit(t.frame_field(abi::FRAME_KIND));
        b.i64(abi::FRAME_KIND_HANDLE);
        b.emit(Instr::Binary(BinOp::Eq));
        b.jump_unless(forward);
        // Handle frames dispatch requests themselves.
        b.emit(Instr::LocalGet(FRAME));
        b.emit(Instr::LocalGet(OUTCOME));
        b.emit(Instr::LocalGet(FRAME));
        b.emit(t.frame_field(abi::FRAME_ENTRY));
        b.emit(Instr::CallRef { arity: 2 });
        b.emit(Instr::LocalSet(OUTCOME));
        b.jump(advance);

        b.bind(forward);
        b.emit(Instr::LocalGet(OUTCOME));
        b.emit(t.outcome_field(abi::OUTCOME_TAG));
        b.i64(abi::TAG_REQUEST);
        b.emit(Instr::Binary(BinOp::Eq));
        b.jump_unless(value);
        b.emit(Instr::LocalGet(FRAME));
        b.null();
        b.emit(Instr::StructSet {
            type_index: t.frame,
            field: abi::FRAME_NEXT,
        });
        b.emit(Instr::LocalGet(OUTCOME));
        b.emit(t.outcome_field(abi::OUTCOME_CONT));
        b.emit(Instr::LocalGet(FRAME));
        b.emit(Instr::LocalGet(FRAME));
        b.emit(Instr::Call(self.append));
        b.emit(Instr::Drop);
        b.jump(advance);

        b.bind(value);
        b.emit(Instr::LocalGet(FRAME));
        b.emit(Instr::LocalGet(OUTCOME));
        b.emit(t.outcome_field(abi::OUTCOME_VALUE));
        b.emit(Instr::LocalGet(FRAME));
        b.emit(t.frame_field(abi::FRAME_ENTRY));
        b.emit(Instr::CallRef { arity: 2 });
        b.emit(Instr::LocalSet(OUTCOME));

        b.bind(advance);
        b.emit(Instr::LocalGet(next));
        b.emit(Instr::LocalSet(FRAME));
        b.jump(top);
        let (locals, code) = b.finish();
        sink.define_function(self.continue_, locals, code);
    }

    fn define_resume(&self, sink: &mut dyn InstructionSink) {
        const K: u32 = 0;
        const VALUE: u32 = 1;
        let t = self.types;
        let mut b = FunctionBuilder::new(2, 2);
        let fresh = b.new_label();

        b.emit(Instr::LocalGet(K));
        b.emit(t.cont_field(abi::CONT_RESUMED));
        b.jump_unless(fresh);
        b.emit(Instr::Trap(TrapCode::DoubleResume));

        b.bind(fresh);
        b.emit(Instr::LocalGet(K));
        b.emit(Instr::Const(Const::Bool(true)));
        b.emit(Instr::StructSet {
            type_index: t.cont,
            field: abi::CONT_RESUMED,
        });
        b.emit(Instr::LocalGet(K));
        b.emit(t.cont_field(abi::CONT_HEAD));
        b.emit(Instr::LocalGet(VALUE));
        b.emit(Instr::Call(self.value));
        b.emit(Instr::Call(self.continue_));
        b.emit(Instr::Return);
        let (locals, code) = b.finish();
        sink.define_function(self.resume, locals, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::sink::ModuleBuilder;
    use std::sync::Arc;
    use wisp_runtime::{Instance, Module, Value};

    fn instance() -> (Instance, Dispatcher) {
        let mut sink = ModuleBuilder::new();
        let types = AbiTypes::declare(&mut sink);
        let dispatcher = Dispatcher::generate(&mut sink, types);
        let decoded = Module::decode(&sink.emit_binary()).unwrap();
        (Instance::new(Arc::new(decoded), 64), dispatcher)
    }

    fn empty_cont(types: &AbiTypes) -> Value {
        Value::new_struct(types.cont, vec![Value::Null, Value::Null, Value::Bool(false)])
    }

    #[test]
    fn test_resume_with_no_frames_completes() {
        let (mut instance, d) = instance();
        let k = empty_cont(&d.types);
        let outcome = instance.invoke(d.resume, vec![k, Value::I64(7)]).unwrap();
        let outcome = outcome.as_struct().unwrap().clone();
        assert_eq!(outcome.get(abi::OUTCOME_TAG).unwrap().as_i64(), Some(abi::TAG_VALUE));
        assert_eq!(outcome.get(abi::OUTCOME_VALUE).unwrap().as_i64(), Some(7));
    }

    #[test]
    fn test_second_resume_traps() {
        let (mut instance, d) = instance();
        let k = empty_cont(&d.types);
        instance.invoke(d.resume, vec![k.clone(), Value::Unit]).unwrap();
        let trap = instance.invoke(d.resume, vec![k, Value::Unit]).unwrap_err();
        assert_eq!(trap.code, TrapCode::DoubleResume);
    }

    #[test]
    fn test_append_links_frames() {
        let (mut instance, d) = instance();
        let frame = |types: &AbiTypes| {
            Value::new_struct(
                types.frame,
                vec![Value::Null, Value::Null, Value::Null, Value::I64(abi::FRAME_KIND_CALL)],
            )
        };
        let k = empty_cont(&d.types);
        let first = frame(&d.types);
        let second = frame(&d.types);
        instance.invoke(d.append, vec![k.clone(), first.clone(), first.clone()]).unwrap();
        instance.invoke(d.append, vec![k.clone(), second.clone(), second.clone()]).unwrap();

        let k = k.as_struct().unwrap().clone();
        assert!(!k.get(abi::CONT_HEAD).unwrap().is_null());
        let linked = first.as_struct().unwrap().get(abi::FRAME_NEXT).unwrap();
        assert!(!linked.is_null());
        assert!(second.as_struct().unwrap().get(abi::FRAME_NEXT).unwrap().is_null());
    }
}
