//! Wisp Runtime
//!
//! Loads binaries produced by `wispc`, runs them on a small reference
//! engine, and dispatches the effect requests they make to host handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Host application                     │
//! │        register handlers · call exports · await         │
//! ├─────────────────────────────────────────────────────────┤
//! │  host        Runtime, Execution (Future), block_on      │
//! │  registry    HandlerRegistry, label-suffix matching     │
//! │  continuation  one-shot Resumer tickets                 │
//! │  cancellation / timeout                                  │
//! ├─────────────────────────────────────────────────────────┤
//! │  table       wisp.effects, wisp.diagnostics sections     │
//! │  abi         Outcome / Cont / Frame layout               │
//! │  engine      stack interpreter over module::Instr        │
//! │  module      binary format: encode, decode, validate     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use wisp_runtime::{Handler, HostValue, Runtime, RuntimeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = std::fs::read("app.wsp")?;
//! let mut runtime = Runtime::load(&bytes, RuntimeConfig::from_env())?;
//! runtime
//!     .registry_mut()
//!     .register_label("Test.effect", Handler::resuming(|_| HostValue::Int(2)))?;
//! let result = runtime.run_blocking("main", vec![])?;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod cancellation;
pub mod config;
pub mod continuation;
pub mod engine;
pub mod error;
pub mod host;
pub mod module;
pub mod registry;
pub mod table;
pub mod timeout;
pub mod value;

pub use cancellation::{CancellationError, CancellationSource, CancellationToken, Timer};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use continuation::{ContinuationId, Resumer};
pub use engine::{Instance, Trap, Value};
pub use error::{
    ContinuationDirection, ErrorKind, LoadError, RegistrationError, ResumeContext, ResumeError,
    ResumeViolation, RuntimeError, SourceSpan, TrapReport,
};
pub use host::{block_on, Execution, Runtime};
pub use module::{DecodeError, DecodedModule, Module, TrapCode};
pub use registry::{EffectCall, Handler, HandlerRegistry};
pub use table::{
    EffectTable, EffectTableEntry, FunctionDiagnostic, LineCol, ResumeKind, RuntimeDiagnostics,
};
pub use timeout::{Deadline, Timeout, TimeoutGuard};
pub use value::HostValue;
