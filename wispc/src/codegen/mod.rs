//! Code generation for Wisp.
//!
//! Turns a lowered program into a binary module for `wisp-runtime`.
//!
//! # Architecture
//!
//! ```text
//! Program -> infer rows -> lower -> Trampoline -> InstructionSink -> binary
//!                                        |
//!                                        +-> effect table, runtime diagnostics
//! ```
//!
//! - [`sink`] - The emitter interface and the binary module builder
//! - [`dispatcher`] - Runtime helpers shared by all effectful functions
//! - [`trampoline`] - Per-function code for the tagged-return protocol
//! - [`table`] - Effect table and runtime diagnostics sections

pub mod dispatcher;
pub mod sink;
pub mod table;
pub mod trampoline;

pub use sink::{FunctionBuilder, InstructionSink, Label, ModuleBuilder};
pub use table::{build_effect_table, build_runtime_diagnostics, EffectNames, FunctionOrigin, OpIndex};

use tracing::{debug, warn};
use wisp_runtime::table::{DIAGNOSTICS_SECTION, EFFECT_TABLE_SECTION};
use wisp_runtime::{EffectTable, RuntimeDiagnostics};

use crate::context::{Backend, CompilationContext, CompileOptions};
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::{function_infos, infer_program, lower_program, FunctionEffectInfo};
use crate::hir::Program;
use crate::span::Span;

/// A compiled module.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// The binary, custom sections included.
    pub bytes: Vec<u8>,
    pub effect_table: EffectTable,
    pub runtime_diagnostics: RuntimeDiagnostics,
    pub function_infos: Vec<FunctionEffectInfo>,
    /// Warnings raised along the way.
    pub diagnostics: Vec<Diagnostic>,
}

/// Compile `program` to a binary module.
pub fn compile(program: &Program, options: CompileOptions) -> Result<CompileOutput, Vec<Diagnostic>> {
    let mut sink = ModuleBuilder::new();
    compile_with_sink(program, options, &mut sink)
}

/// Compile `program` into `sink`.
///
/// Fails with every diagnostic collected so far, warnings included, as soon
/// as a pass reports an error.
pub fn compile_with_sink(
    program: &Program,
    options: CompileOptions,
    sink: &mut dyn InstructionSink,
) -> Result<CompileOutput, Vec<Diagnostic>> {
    let mut cx = CompilationContext::new(program, options);

    if cx.options.backend == Backend::StackSwitch {
        warn!(
            module = %cx.module_id(),
            "stack-switching backend is unavailable; using the trampoline backend"
        );
        cx.report(Diagnostic::from_error_code(ErrorCode::BackendFallback, Span::dummy()));
    }

    let (inferred, errors) = infer_program(program, &mut cx.rows);
    cx.inferred = inferred;
    cx.extend_diagnostics(errors.into_iter().map(Diagnostic::from));
    if cx.has_errors() {
        return Err(cx.take_diagnostics());
    }

    let (lowered, diagnostics) = lower_program(program, &cx.inferred, &cx.rows, cx.next_def());
    cx.extend_diagnostics(diagnostics);
    if cx.has_errors() {
        return Err(cx.take_diagnostics());
    }
    cx.function_infos = function_infos(program, &lowered, &cx.inferred, &cx.rows);

    let (effect_table, ops) = build_effect_table(cx.effect_names(), &cx.rows)
        .map_err(|e| vec![Diagnostic::error(e.to_string(), Span::dummy())])?;

    let origins = trampoline::generate(sink, program, &lowered, &ops, &cx.rows)?;
    let layout = sink.code_layout();
    let runtime_diagnostics = build_runtime_diagnostics(program, cx.module_id(), &layout, &origins);

    sink.custom_section(EFFECT_TABLE_SECTION, effect_table.encode());
    if cx.options.emit_runtime_diagnostics {
        sink.custom_section(DIAGNOSTICS_SECTION, runtime_diagnostics.encode());
    }
    let bytes = sink.emit_binary();

    debug!(
        module = %cx.module_id(),
        functions = origins.len(),
        operations = effect_table.len(),
        bytes = bytes.len(),
        "compiled module"
    );

    Ok(CompileOutput {
        bytes,
        effect_table,
        runtime_diagnostics,
        function_infos: std::mem::take(&mut cx.function_infos),
        diagnostics: cx.take_diagnostics(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{BodyBuilder, DefId, FnDecl, OpDecl, Type};
    use wisp_runtime::{Module, ResumeKind};

    fn program() -> Program {
        let mut program = Program::new("app", "app.wisp");
        let test = program.declare_effect(
            "Test",
            vec![OpDecl::new("effect", vec![Type::Int], Type::Int, ResumeKind::Resume)],
        );
        let effect = program.op(test, "effect").unwrap();
        let mut b = BodyBuilder::new();
        let n = b.param("n", Type::Int);
        let get_n = b.local_ref(n);
        let performed = b.perform(effect, vec![get_n], Type::Int);
        program.add_function(FnDecl::new(DefId::new(0), "ask", b.finish(performed), Type::Int).exported());
        program
    }

    #[test]
    fn test_sections_written() {
        let output = compile(&program(), CompileOptions::default()).unwrap();
        let decoded = Module::decode(&output.bytes).unwrap();
        assert!(decoded.module.custom_section(EFFECT_TABLE_SECTION).is_some());
        assert!(decoded.module.custom_section(DIAGNOSTICS_SECTION).is_some());
        assert_eq!(output.effect_table.len(), 1);
        assert!(output.diagnostics.is_empty());
    }

    #[test]
    fn test_diagnostics_section_optional() {
        let options = CompileOptions::builder().emit_runtime_diagnostics(false).build();
        let output = compile(&program(), options).unwrap();
        let decoded = Module::decode(&output.bytes).unwrap();
        assert!(decoded.module.custom_section(DIAGNOSTICS_SECTION).is_none());
    }

    #[test]
    fn test_stack_switch_falls_back() {
        let options = CompileOptions::builder().backend(Backend::StackSwitch).build();
        let output = compile(&program(), options).unwrap();
        assert_eq!(output.diagnostics.len(), 1);
        assert_eq!(output.diagnostics[0].code, Some(ErrorCode::BackendFallback));
        assert!(!output.diagnostics[0].is_error());
        assert_eq!(output.bytes, compile(&program(), CompileOptions::default()).unwrap().bytes);
    }
}
