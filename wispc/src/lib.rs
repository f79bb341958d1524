//! # Wisp Effects Engine
//!
//! The algebraic-effects half of the Wisp compiler: effect rows,
//! continuation analysis, effect lowering and the trampoline backend.
//!
//! ## Pipeline
//!
//! ```text
//! Program (typed HIR) -> Row inference -> Lowering -> Trampoline codegen -> binary
//!                                                            |
//!                                          effect table + runtime diagnostics
//! ```
//!
//! The binary runs on `wisp-runtime`, whose host loop dispatches effect
//! requests to handlers registered by the embedding application.
//!
//! ## Quick Start
//!
//! ```rust
//! use wispc::hir::{BodyBuilder, DefId, FnDecl, OpDecl, Program, Type};
//! use wispc::{compile, CompileOptions};
//! use wisp_runtime::ResumeKind;
//!
//! let mut program = Program::new("app", "app.wisp");
//! let test = program.declare_effect(
//!     "Test",
//!     vec![OpDecl::new("effect", vec![Type::Int], Type::Int, ResumeKind::Resume)],
//! );
//! let effect = program.op(test, "effect").unwrap();
//!
//! let mut b = BodyBuilder::new();
//! let n = b.param("n", Type::Int);
//! let arg = b.local_ref(n);
//! let body = b.perform(effect, vec![arg], Type::Int);
//! program.add_function(FnDecl::new(DefId::new(0), "ask", b.finish(body), Type::Int).exported());
//!
//! let output = compile(&program, CompileOptions::default()).unwrap();
//! assert_eq!(output.effect_table.entries()[0].label, "app::Test.effect");
//! ```
//!
//! ## Module Overview
//!
//! - [`hir`] - Typed program graph handed to the engine
//! - [`effects`] - Row interning, inference, usage analysis, lowering
//! - [`codegen`] - Trampoline backend, effect table, instruction sink
//! - [`context`] - Compile options and per-compilation state
//! - [`content`] - Content hashes for effect ids and signatures
//! - [`diagnostics`] - Error reporting infrastructure
//! - [`span`] - Source location tracking

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod codegen;
pub mod content;
pub mod context;
pub mod diagnostics;
pub mod effects;
pub mod hir;
pub mod span;

pub use codegen::{compile, compile_with_sink, CompileOutput};
pub use context::{Backend, CompilationContext, CompileOptions, CompileOptionsBuilder};
pub use diagnostics::{Diagnostic, DiagnosticEmitter, DiagnosticKind, EffectError, ErrorCode};
pub use effects::{ContinuationUsage, FunctionEffectInfo, RowId, RowInterner};
pub use span::Span;
