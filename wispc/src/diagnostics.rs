//! Diagnostic reporting infrastructure.
//!
//! Compile-time effect errors are collected as [`Diagnostic`]s and rendered
//! with source snippets by a [`DiagnosticEmitter`].
//!
//! # Error Codes
//!
//! - **E0401-E0499**: Effect, handler and lowering errors
//! - **W0401-W0499**: Effect warnings (compilation still succeeds)

use std::io;

use ariadne::{Color, Config, Label, Report, ReportKind, Source};
use thiserror::Error;

use crate::span::Span;

/// Compiler error and warning codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // ============================================================
    // Effect errors (E0400-E0499)
    // ============================================================
    /// A captured binding or resume type mentions an unresolved generic.
    UnboundedCapture = 401,
    /// An inferred operation is outside the declared effect row.
    RowMismatch = 402,
    /// A function reference's row is not covered by the type it is used at.
    SignatureMismatch = 403,
    /// A handled body assigns a binding it captured from the enclosing function.
    CapturedAssignment = 404,
    /// `return` inside a handled body.
    ReturnInHandledBody = 405,
    /// Callee is neither a function definition nor a local.
    UnsupportedCallee = 406,
    /// `resume` outside tail position of its clause.
    ResumeOutsideTail = 407,
    /// A continuation may be resumed more than once.
    NonLinearResume = 408,
    /// A continuation is used as a value.
    ContinuationEscapes = 409,
    /// `resume` of a symbol that is not an enclosing clause's continuation.
    ResumeOutsideClause = 410,
    /// Reference to an operation missing from the effect catalogue.
    UnknownOperation = 411,
    /// Reference to a function that is not part of the program.
    UnknownFunction = 412,
    /// Wrong number of arguments or clause parameters for an operation.
    ArityMismatch = 413,

    // ============================================================
    // Effect warnings (W0400-W0499)
    // ============================================================
    /// The stack-switching backend was requested but is unavailable.
    BackendFallback = 1401,
    /// A resume-kind clause never resumes.
    ResumeNeverCalled = 1402,
    /// A tail-kind clause resumes explicitly.
    ResumeInTailClause = 1403,
}

impl ErrorCode {
    pub fn is_warning(&self) -> bool {
        (*self as u16) >= 1000
    }

    /// The formatted code (e.g., "E0402", "W0401").
    pub fn as_str(&self) -> String {
        let number = *self as u16 % 1000;
        if self.is_warning() {
            format!("W{:04}", number)
        } else {
            format!("E{:04}", number)
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::UnboundedCapture => "captured value has an unresolved generic type",
            ErrorCode::RowMismatch => "effect not allowed by the declared effect row",
            ErrorCode::SignatureMismatch => "function reference performs effects its type does not allow",
            ErrorCode::CapturedAssignment => "handled body assigns a captured binding",
            ErrorCode::ReturnInHandledBody => "`return` inside a handled body",
            ErrorCode::UnsupportedCallee => "unsupported callee expression",
            ErrorCode::ResumeOutsideTail => "`resume` is not in tail position",
            ErrorCode::NonLinearResume => "continuation may be resumed more than once",
            ErrorCode::ContinuationEscapes => "continuation escapes its handler clause",
            ErrorCode::ResumeOutsideClause => "`resume` outside a handler clause",
            ErrorCode::UnknownOperation => "unknown effect operation",
            ErrorCode::UnknownFunction => "unknown function",
            ErrorCode::ArityMismatch => "wrong number of arguments for effect operation",
            ErrorCode::BackendFallback => "stack-switching backend unavailable; using trampoline",
            ErrorCode::ResumeNeverCalled => "handler clause never resumes",
            ErrorCode::ResumeInTailClause => "explicit `resume` in a tail-resumptive clause",
        }
    }

    pub fn help(&self) -> Option<&'static str> {
        match self {
            ErrorCode::UnboundedCapture => {
                Some("give the value a concrete type before the effect operation")
            }
            ErrorCode::RowMismatch => Some("add the operation to the function's effect row or handle it"),
            ErrorCode::CapturedAssignment => {
                Some("handled bodies receive captured bindings by value; return the new value instead")
            }
            ErrorCode::ResumeOutsideTail => Some("make `resume` the last expression of the clause"),
            ErrorCode::ContinuationEscapes => {
                Some("continuations are one-shot and may only be resumed inside their clause")
            }
            ErrorCode::ResumeNeverCalled => {
                Some("declare the operation tail-resumptive, or resume the continuation")
            }
            ErrorCode::ResumeInTailClause => {
                Some("the clause's value already resumes the computation; remove the `resume`")
            }
            _ => None,
        }
    }
}

/// The kind of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error,
    Warning,
    Note,
}

impl DiagnosticKind {
    fn to_report_kind(self) -> ReportKind<'static> {
        match self {
            DiagnosticKind::Error => ReportKind::Error,
            DiagnosticKind::Warning => ReportKind::Warning,
            DiagnosticKind::Note => ReportKind::Advice,
        }
    }

    fn color(self) -> Color {
        match self {
            DiagnosticKind::Error => Color::Red,
            DiagnosticKind::Warning => Color::Yellow,
            DiagnosticKind::Note => Color::Cyan,
        }
    }
}

/// A compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub code: Option<ErrorCode>,
    pub message: String,
    /// The primary span where the problem occurred.
    pub span: Span,
    /// Additional labels pointing to relevant code.
    pub labels: Vec<DiagnosticLabel>,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            ..Self::error(message, span)
        }
    }

    /// A diagnostic with the code's description as message and its help
    /// as suggestion. Warning codes produce warnings.
    pub fn from_error_code(code: ErrorCode, span: Span) -> Self {
        let base = if code.is_warning() {
            Self::warning(code.description(), span)
        } else {
            Self::error(code.description(), span)
        };
        base.with_error_code(code)
    }

    /// Set the code; its help message is added automatically.
    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        if let Some(help) = code.help() {
            self.suggestions.push(help.to_string());
        }
        self
    }

    pub fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::secondary(span, message));
        self
    }

    pub fn with_primary_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::primary(span, message));
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == DiagnosticKind::Error
    }
}

/// Internal compiler error: an invariant an earlier pass guarantees does
/// not hold.
///
/// ```ignore
/// return Err(vec![ice_err!(expr.span, "no continuation site"; "expr" => expr.id)]);
/// ```
#[macro_export]
macro_rules! ice_err {
    ($span:expr, $msg:expr $(; $($key:literal => $value:expr),+ $(,)?)?) => {{
        #[allow(unused_mut)]
        let mut message = format!("internal compiler error: {}", $msg);
        $($(message.push_str(&format!("\n  {}: {:?}", $key, $value));)+)?
        $crate::diagnostics::Diagnostic::error(message, $span)
    }};
}

/// A secondary label in a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticLabel {
    pub span: Span,
    pub message: String,
    pub primary: bool,
}

impl DiagnosticLabel {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: true,
        }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: false,
        }
    }
}

/// Renders diagnostics against their source file.
#[derive(Debug)]
pub struct DiagnosticEmitter<'a> {
    filename: &'a str,
    source: &'a str,
    color: bool,
}

impl<'a> DiagnosticEmitter<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self {
            filename,
            source,
            color: true,
        }
    }

    pub fn without_color(mut self) -> Self {
        self.color = false;
        self
    }

    /// Emit a diagnostic to stderr.
    pub fn emit(&self, diagnostic: &Diagnostic) -> io::Result<()> {
        self.write(diagnostic, io::stderr())
    }

    /// Render a diagnostic into a string.
    pub fn render(&self, diagnostic: &Diagnostic) -> io::Result<String> {
        let mut buf = Vec::new();
        self.write(diagnostic, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn write<W: io::Write>(&self, diagnostic: &Diagnostic, out: W) -> io::Result<()> {
        let clamp = |span: Span| {
            let end = span.end.min(self.source.len());
            span.start.min(end)..end
        };
        let primary = clamp(diagnostic.span);

        let message = match &diagnostic.code {
            Some(code) => format!("[{}] {}", code.as_str(), diagnostic.message),
            None => diagnostic.message.clone(),
        };
        let mut builder = Report::build(diagnostic.kind.to_report_kind(), self.filename, primary.start)
            .with_config(Config::default().with_color(self.color))
            .with_message(&message)
            .with_label(
                Label::new((self.filename, primary))
                    .with_color(diagnostic.kind.color())
                    .with_message(&diagnostic.message),
            );

        for label in &diagnostic.labels {
            let color = if label.primary {
                diagnostic.kind.color()
            } else {
                Color::Blue
            };
            builder = builder.with_label(
                Label::new((self.filename, clamp(label.span)))
                    .with_color(color)
                    .with_message(&label.message),
            );
        }

        if !diagnostic.suggestions.is_empty() {
            builder = builder.with_help(diagnostic.suggestions.join("\n"));
        }

        builder
            .finish()
            .write((self.filename, Source::from(self.source)), out)
    }
}

/// Compile-time effect errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error("`{name}` captures `{binding}` of type `{ty}`, which has no concrete runtime layout")]
    UnboundedCapture {
        name: String,
        binding: String,
        ty: String,
        span: Span,
    },

    #[error("`{function}` performs `{operation}`, which its declared effect row does not include")]
    RowMismatch {
        function: String,
        operation: String,
        span: Span,
    },

    #[error("`{function}` performs effects not allowed by the function type it is used at")]
    SignatureMismatch { function: String, span: Span },

    #[error("handled body assigns captured binding `{binding}`")]
    CapturedAssignment { binding: String, span: Span },

    #[error("`return` inside a handled body")]
    ReturnInHandledBody { span: Span },

    #[error("callee must be a function or a local binding")]
    UnsupportedCallee { span: Span },

    #[error("`resume` of `{cont}` is not in tail position")]
    ResumeOutsideTail { cont: String, span: Span },

    #[error("continuation `{cont}` may be resumed more than once")]
    NonLinearResume { cont: String, span: Span },

    #[error("continuation `{cont}` escapes its handler clause")]
    ContinuationEscapes { cont: String, span: Span },

    #[error("`resume` of `{cont}`, which is not a handler continuation in scope")]
    ResumeOutsideClause { cont: String, span: Span },

    #[error("unknown effect operation {operation}")]
    UnknownOperation { operation: String, span: Span },

    #[error("unknown function {def}")]
    UnknownFunction { def: String, span: Span },

    #[error("`{operation}` takes {expected} arguments, found {found}")]
    ArityMismatch {
        operation: String,
        expected: usize,
        found: usize,
        span: Span,
    },
}

impl EffectError {
    pub fn span(&self) -> Span {
        match self {
            EffectError::UnboundedCapture { span, .. }
            | EffectError::RowMismatch { span, .. }
            | EffectError::SignatureMismatch { span, .. }
            | EffectError::CapturedAssignment { span, .. }
            | EffectError::ReturnInHandledBody { span }
            | EffectError::UnsupportedCallee { span }
            | EffectError::ResumeOutsideTail { span, .. }
            | EffectError::NonLinearResume { span, .. }
            | EffectError::ContinuationEscapes { span, .. }
            | EffectError::ResumeOutsideClause { span, .. }
            | EffectError::UnknownOperation { span, .. }
            | EffectError::UnknownFunction { span, .. }
            | EffectError::ArityMismatch { span, .. } => *span,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            EffectError::UnboundedCapture { .. } => ErrorCode::UnboundedCapture,
            EffectError::RowMismatch { .. } => ErrorCode::RowMismatch,
            EffectError::SignatureMismatch { .. } => ErrorCode::SignatureMismatch,
            EffectError::CapturedAssignment { .. } => ErrorCode::CapturedAssignment,
            EffectError::ReturnInHandledBody { .. } => ErrorCode::ReturnInHandledBody,
            EffectError::UnsupportedCallee { .. } => ErrorCode::UnsupportedCallee,
            EffectError::ResumeOutsideTail { .. } => ErrorCode::ResumeOutsideTail,
            EffectError::NonLinearResume { .. } => ErrorCode::NonLinearResume,
            EffectError::ContinuationEscapes { .. } => ErrorCode::ContinuationEscapes,
            EffectError::ResumeOutsideClause { .. } => ErrorCode::ResumeOutsideClause,
            EffectError::UnknownOperation { .. } => ErrorCode::UnknownOperation,
            EffectError::UnknownFunction { .. } => ErrorCode::UnknownFunction,
            EffectError::ArityMismatch { .. } => ErrorCode::ArityMismatch,
        }
    }
}

impl From<EffectError> for Diagnostic {
    fn from(error: EffectError) -> Self {
        let span = error.span();
        let diagnostic = Diagnostic::error(error.to_string(), span).with_error_code(error.code());
        match &error {
            EffectError::RowMismatch { operation, .. } => {
                diagnostic.with_primary_label(span, format!("`{}` performed here", operation))
            }
            EffectError::NonLinearResume { .. } => {
                diagnostic.with_suggestion("resume at most once on every path through the clause")
            }
            _ => diagnostic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ErrorCode::UnboundedCapture.as_str(), "E0401");
        assert_eq!(ErrorCode::ArityMismatch.as_str(), "E0413");
        assert_eq!(ErrorCode::BackendFallback.as_str(), "W0401");
        assert!(ErrorCode::ResumeInTailClause.is_warning());
        assert!(!ErrorCode::RowMismatch.is_warning());
    }

    #[test]
    fn test_effect_error_to_diagnostic() {
        let error = EffectError::RowMismatch {
            function: "main".to_string(),
            operation: "app::Log.write".to_string(),
            span: Span::new(4, 9),
        };
        let diagnostic = Diagnostic::from(error);
        assert!(diagnostic.is_error());
        assert_eq!(diagnostic.code, Some(ErrorCode::RowMismatch));
        assert_eq!(diagnostic.span, Span::new(4, 9));
        assert!(!diagnostic.suggestions.is_empty());
    }

    #[test]
    fn test_warning_from_code() {
        let diagnostic = Diagnostic::from_error_code(ErrorCode::BackendFallback, Span::dummy());
        assert_eq!(diagnostic.kind, DiagnosticKind::Warning);
    }

    #[test]
    fn test_render_includes_code_and_snippet() {
        let source = "fn main() {\n    perform Log.write(1)\n}\n";
        let emitter = DiagnosticEmitter::new("main.wisp", source).without_color();
        let diagnostic = Diagnostic::from_error_code(ErrorCode::RowMismatch, Span::new(16, 36));
        let rendered = emitter.render(&diagnostic).unwrap();
        assert!(rendered.contains("E0402"));
        assert!(rendered.contains("main.wisp"));
        assert!(rendered.contains("perform Log.write(1)"));
    }
}
