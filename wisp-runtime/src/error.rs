//! Runtime error surface.
//!
//! Every failure an execution can end with is a [`RuntimeError`]. Each
//! variant carries structured fields so callers can build messages or
//! retry policies without parsing strings; [`RuntimeError::kind`] gives
//! the coarse classification.

use std::fmt;
use std::ops::Range;

use thiserror::Error;

use crate::config::ConfigError;
use crate::module::{DecodeError, TrapCode};
use crate::table::{LineCol, TableError};

/// Coarse classification of a [`RuntimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    WasmTrap,
    UnhandledEffect,
    Cancelled,
    DoubleResume,
    MissingTailResume,
    /// The caller misused the runtime API.
    Usage,
}

/// Which way control was crossing the continuation boundary.
///
/// Suspension hands an outcome value back to the host without running
/// engine code, so a trap can only surface while resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ContinuationDirection {
    /// Re-entering the binary through the resume entry.
    Resuming,
}

impl fmt::Display for ContinuationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContinuationDirection::Resuming => f.write_str("resuming"),
        }
    }
}

/// The operation a continuation belonged to when a fault occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeContext {
    pub effect_id: String,
    pub op_name: String,
    pub direction: ContinuationDirection,
}

/// Source location of a compiled function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpan {
    pub source_file: String,
    pub byte_range: Range<u32>,
    pub start: LineCol,
    pub end: LineCol,
}

/// A trap annotated with whatever the runtime diagnostics section knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapReport {
    pub code: TrapCode,
    pub function_index: u32,
    pub function_name: String,
    pub module_id: Option<String>,
    pub span: Option<SourceSpan>,
    /// Absolute byte offset of the faulting instruction.
    pub offset: u32,
    pub resume: Option<ResumeContext>,
}

impl fmt::Display for TrapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in `{}`", self.code, self.function_name)?;
        if let Some(module) = &self.module_id {
            write!(f, " of module `{}`", module)?;
        }
        if let Some(span) = &self.span {
            write!(f, " ({}:{})", span.source_file, span.start)?;
        }
        write!(f, " at byte {}", self.offset)?;
        if let Some(ctx) = &self.resume {
            write!(f, " while {} {}.{}", ctx.direction, ctx.effect_id, ctx.op_name)?;
        }
        Ok(())
    }
}

/// A violated resume-once contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeViolation {
    /// `Effect.op` label, when the violating operation is known.
    pub label: Option<String>,
    /// The trap, when the violation was detected inside the binary.
    pub trap: Option<TrapReport>,
}

impl fmt::Display for ResumeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.label, &self.trap) {
            (Some(label), Some(trap)) => write!(f, "{}: {}", label, trap),
            (Some(label), None) => f.write_str(label),
            (None, Some(trap)) => write!(f, "{}", trap),
            (None, None) => f.write_str("unknown operation"),
        }
    }
}

/// Errors surfaced by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("trap: {0}")]
    WasmTrap(Box<TrapReport>),

    #[error("unhandled effect {effect_id}.{op_name} (op index {op_index})")]
    UnhandledEffect {
        effect_id: String,
        op_name: String,
        op_index: u32,
    },

    #[error("continuation resumed twice: {0}")]
    DoubleResume(Box<ResumeViolation>),

    #[error("handler finished without resuming: {0}")]
    MissingTailResume(Box<ResumeViolation>),

    #[error("execution cancelled{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    Cancelled { reason: Option<String> },

    #[error("no export named `{0}`")]
    UnknownExport(String),

    #[error("export `{export}` takes {expected} arguments, got {found}")]
    ArgumentCount {
        export: String,
        expected: usize,
        found: usize,
    },

    #[error("value conversion failed: {0}")]
    ValueConversion(String),

    #[error("malformed outcome returned by `{0}`")]
    MalformedOutcome(String),

    #[error("execution polled after completion")]
    PolledAfterCompletion,
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::WasmTrap(_) | RuntimeError::MalformedOutcome(_) => ErrorKind::WasmTrap,
            RuntimeError::UnhandledEffect { .. } => ErrorKind::UnhandledEffect,
            RuntimeError::DoubleResume(_) => ErrorKind::DoubleResume,
            RuntimeError::MissingTailResume(_) => ErrorKind::MissingTailResume,
            RuntimeError::Cancelled { .. } => ErrorKind::Cancelled,
            RuntimeError::UnknownExport(_)
            | RuntimeError::ArgumentCount { .. }
            | RuntimeError::ValueConversion(_)
            | RuntimeError::PolledAfterCompletion => ErrorKind::Usage,
        }
    }

    /// The trap report, for errors raised inside the binary.
    pub fn trap(&self) -> Option<&TrapReport> {
        match self {
            RuntimeError::WasmTrap(report) => Some(report),
            RuntimeError::DoubleResume(v) | RuntimeError::MissingTailResume(v) => v.trap.as_ref(),
            _ => None,
        }
    }
}

/// Errors loading a binary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("invalid module: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid metadata: {0}")]
    Table(#[from] TableError),

    #[error("module is missing runtime type `{0}`")]
    MissingAbiType(&'static str),

    #[error("module does not export the resume entry `{0}`")]
    MissingResumeEntry(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors registering a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("effect table has no operation {op_id} of effect `{effect_id}`")]
    UnknownOperation { effect_id: String, op_id: u32 },

    #[error("signature hash mismatch for {label}: table has {expected:#010x}, handler declares {found:#010x}")]
    SignatureMismatch {
        label: String,
        expected: u32,
        found: u32,
    },

    #[error("no operation label ends with `{0}`")]
    UnknownLabel(String),

    #[error("labels ending with `{suffix}` match several effects equally well: {}", .candidates.join(", "))]
    AmbiguousLabel {
        suffix: String,
        candidates: Vec<String>,
    },
}

/// Errors returned to a handler calling [`crate::Resumer::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("continuation was already resumed")]
    AlreadyResumed,

    #[error("execution already finished")]
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> TrapReport {
        TrapReport {
            code: TrapCode::DivisionByZero,
            function_index: 3,
            function_name: "compute".to_string(),
            module_id: Some("app".to_string()),
            span: Some(SourceSpan {
                source_file: "app.wisp".to_string(),
                byte_range: 10..40,
                start: LineCol { line: 2, col: 5 },
                end: LineCol { line: 4, col: 1 },
            }),
            offset: 120,
            resume: Some(ResumeContext {
                effect_id: "Test".to_string(),
                op_name: "effect".to_string(),
                direction: ContinuationDirection::Resuming,
            }),
        }
    }

    #[test]
    fn test_trap_report_display() {
        assert_eq!(
            report().to_string(),
            "integer division by zero in `compute` of module `app` (app.wisp:2:5) at byte 120 while resuming Test.effect"
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!(RuntimeError::WasmTrap(Box::new(report())).kind(), ErrorKind::WasmTrap);
        assert_eq!(RuntimeError::Cancelled { reason: None }.kind(), ErrorKind::Cancelled);
        assert_eq!(
            RuntimeError::Cancelled {
                reason: Some("timed out".to_string())
            }
            .to_string(),
            "execution cancelled: timed out"
        );
        let violation = RuntimeError::DoubleResume(Box::new(ResumeViolation {
            label: Some("Test.effect".to_string()),
            trap: None,
        }));
        assert_eq!(violation.kind(), ErrorKind::DoubleResume);
        assert!(violation.trap().is_none());
    }
}
