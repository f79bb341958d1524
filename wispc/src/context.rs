//! Compilation options and the state threaded through every pass.

use crate::codegen::table::EffectNames;
use crate::diagnostics::Diagnostic;
use crate::effects::{FunctionEffectInfo, InferredEffects, RowInterner};
use crate::hir::{DefId, Program};

/// Code generation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Tagged returns and heap frames. Works on any engine.
    #[default]
    Trampoline,
    /// Native stack switching. Not available yet; selecting it falls back
    /// to [`Backend::Trampoline`] with a warning.
    StackSwitch,
}

/// Options of one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub backend: Backend,
    /// Qualifies effect ids in the effect table. Defaults to the program's
    /// own module id.
    pub module_id: Option<String>,
    /// Whether to write the `wisp.diagnostics` section.
    pub emit_runtime_diagnostics: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Trampoline,
            module_id: None,
            emit_runtime_diagnostics: true,
        }
    }
}

impl CompileOptions {
    pub fn builder() -> CompileOptionsBuilder {
        CompileOptionsBuilder::default()
    }
}

/// Builder for [`CompileOptions`].
#[derive(Debug, Clone, Default)]
pub struct CompileOptionsBuilder {
    options: CompileOptions,
}

impl CompileOptionsBuilder {
    pub fn backend(mut self, backend: Backend) -> Self {
        self.options.backend = backend;
        self
    }

    pub fn module_id(mut self, module_id: impl Into<String>) -> Self {
        self.options.module_id = Some(module_id.into());
        self
    }

    pub fn emit_runtime_diagnostics(mut self, emit: bool) -> Self {
        self.options.emit_runtime_diagnostics = emit;
        self
    }

    pub fn build(self) -> CompileOptions {
        self.options
    }
}

/// Everything one compilation knows about the program so far.
///
/// Passes read the program and write their results here; nothing is kept
/// in global state, so independent compilations never interact.
#[derive(Debug)]
pub struct CompilationContext<'p> {
    pub program: &'p Program,
    pub options: CompileOptions,
    /// Starts as a copy of the program's interner; inference adds to it.
    pub rows: RowInterner,
    pub inferred: InferredEffects,
    pub function_infos: Vec<FunctionEffectInfo>,
    diagnostics: Vec<Diagnostic>,
    next_def: DefId,
}

impl<'p> CompilationContext<'p> {
    pub fn new(program: &'p Program, options: CompileOptions) -> Self {
        Self {
            program,
            options,
            rows: program.rows.clone(),
            inferred: InferredEffects::default(),
            function_infos: Vec::new(),
            diagnostics: Vec::new(),
            next_def: program.next_def_id(),
        }
    }

    pub fn module_id(&self) -> &str {
        self.options.module_id.as_deref().unwrap_or(&self.program.module_id)
    }

    pub fn effect_names(&self) -> EffectNames<'_> {
        EffectNames {
            program: self.program,
            module_id: self.module_id(),
        }
    }

    /// First `DefId` free for synthesized functions.
    pub fn next_def(&self) -> DefId {
        self.next_def
    }

    pub fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn extend_diagnostics(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(diagnostics);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = CompileOptions::builder()
            .backend(Backend::StackSwitch)
            .module_id("lib")
            .emit_runtime_diagnostics(false)
            .build();
        assert_eq!(options.backend, Backend::StackSwitch);
        assert_eq!(options.module_id.as_deref(), Some("lib"));
        assert!(!options.emit_runtime_diagnostics);
        assert_eq!(CompileOptions::default().backend, Backend::Trampoline);
    }

    #[test]
    fn test_module_id_defaults_to_program() {
        let program = Program::new("app", "app.wisp");
        let cx = CompilationContext::new(&program, CompileOptions::default());
        assert_eq!(cx.module_id(), "app");

        let options = CompileOptions::builder().module_id("renamed").build();
        let cx = CompilationContext::new(&program, options);
        assert_eq!(cx.module_id(), "renamed");
        assert_eq!(cx.next_def(), DefId::new(0));
    }
}
