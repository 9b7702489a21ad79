//! Kiln Error Handling - Unified Diagnostic API
//!
//! Every failure in the crate, from a stray template hole to a unit that fails
//! verification, is a [`KilnError`]. Errors are created through an
//! [`ErrorReporting`] context that knows which source text and phase they belong
//! to, so spans always resolve against the right file.

use miette::{Diagnostic, SourceSpan};
use miette::{LabeledSpan, NamedSource};
use std::fmt;
use std::sync::Arc;

use crate::ast::Span;

// ============================================================================
// SOURCE CONTEXT - Error reporting infrastructure
// ============================================================================

/// Source text an error points into.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub name: String,
    pub content: Arc<str>,
}

impl SourceContext {
    /// Create a source context from real file content
    pub fn from_file(name: impl Into<String>, content: impl Into<String>) -> Self {
        let content: String = content.into();
        Self {
            name: name.into(),
            content: Arc::from(content),
        }
    }

    /// Create a fallback when real source is unavailable
    pub fn fallback(context: &str) -> Self {
        Self::from_file("fallback", format!("# {}", context))
    }

    /// Convert to NamedSource for use with miette error reporting
    pub fn to_named_source(&self) -> Arc<NamedSource<String>> {
        Arc::new(NamedSource::new(
            self.name.clone(),
            self.content.to_string(),
        ))
    }
}

impl Default for SourceContext {
    fn default() -> Self {
        Self::fallback("default context")
    }
}

/// The single error type
#[derive(Debug, Clone)]
pub struct KilnError {
    /// What went wrong (type-specific data)
    pub kind: ErrorKind,
    /// Where it happened
    pub source_info: SourceInfo,
    /// How to help
    pub diagnostic_info: DiagnosticInfo,
}

/// All error types as a clean enum
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    // Parse errors
    Syntax {
        message: String,
    },
    InvalidLiteral {
        literal_type: String,
        value: String,
    },

    // Template errors
    TemplateUsage {
        hole: String,
    },
    TemplateMismatch {
        message: String,
    },

    // Macro definition errors, raised before any build step
    InvalidMacroDefinition {
        macro_name: String,
        reason: String,
    },

    // Extension build errors
    MacroCompile {
        macro_name: String,
        reason: String,
    },
    MacroRequiredBeforeDefined {
        macro_name: String,
    },
    ExpansionFailed {
        macro_name: String,
        reason: String,
    },

    // Loading errors
    MacroLoad {
        unit: String,
        reason: String,
    },

    // Resolution errors
    MacroNotFound {
        name: String,
        owner: String,
    },
    UndefinedName {
        name: String,
        context: String,
    },

    // Non-fatal
    MetadataUnavailable {
        owner: String,
        macro_name: String,
    },

    // Environment
    Io {
        path: String,
        message: String,
    },
    Config {
        message: String,
    },
}

/// Context-specific source information
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub source: Arc<NamedSource<String>>,
    pub primary_span: SourceSpan,
    pub phase: String,
}

/// Diagnostic enhancement data
#[derive(Debug, Clone)]
pub struct DiagnosticInfo {
    pub help: Option<String>,
    pub error_code: String,
}

/// Context-aware error creation - each context knows how to create appropriate errors
pub trait ErrorReporting {
    /// Create an error with context-appropriate enhancements
    fn report(&self, kind: ErrorKind, span: SourceSpan) -> KilnError;

    fn syntax_error(&self, message: &str, span: SourceSpan) -> KilnError {
        self.report(
            ErrorKind::Syntax {
                message: message.into(),
            },
            span,
        )
    }

    fn invalid_definition(&self, macro_name: &str, reason: &str, span: SourceSpan) -> KilnError {
        self.report(
            ErrorKind::InvalidMacroDefinition {
                macro_name: macro_name.into(),
                reason: reason.into(),
            },
            span,
        )
    }

    fn undefined_name(&self, name: &str, context: &str, span: SourceSpan) -> KilnError {
        self.report(
            ErrorKind::UndefinedName {
                name: name.into(),
                context: context.into(),
            },
            span,
        )
    }

    fn macro_not_found(&self, name: &str, owner: &str, span: SourceSpan) -> KilnError {
        self.report(
            ErrorKind::MacroNotFound {
                name: name.into(),
                owner: owner.into(),
            },
            span,
        )
    }

    /// Creates an internal error. These indicate engine bugs, not user errors.
    fn internal_error(&self, message: &str, span: SourceSpan) -> KilnError {
        let mut error = self.report(
            ErrorKind::TemplateMismatch {
                message: message.into(),
            },
            span,
        );
        error.diagnostic_info.help =
            Some("This is an internal compiler error. Please report this as a bug.".into());
        error
    }
}

impl ErrorKind {
    /// Get the error category for test assertions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Syntax { .. } | Self::InvalidLiteral { .. } => ErrorCategory::Parse,

            Self::TemplateUsage { .. } | Self::TemplateMismatch { .. } => ErrorCategory::Template,

            Self::InvalidMacroDefinition { .. } => ErrorCategory::Definition,

            Self::MacroCompile { .. }
            | Self::MacroRequiredBeforeDefined { .. }
            | Self::ExpansionFailed { .. } => ErrorCategory::Compile,

            Self::MacroLoad { .. } => ErrorCategory::Load,

            Self::MacroNotFound { .. } | Self::UndefinedName { .. } => ErrorCategory::Resolution,

            Self::MetadataUnavailable { .. } => ErrorCategory::Warning,

            Self::Io { .. } | Self::Config { .. } => ErrorCategory::Environment,
        }
    }

    /// Get error code suffix for diagnostic codes
    pub const fn code_suffix(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "syntax",
            Self::InvalidLiteral { .. } => "invalid_literal",
            Self::TemplateUsage { .. } => "template_usage",
            Self::TemplateMismatch { .. } => "template_mismatch",
            Self::InvalidMacroDefinition { .. } => "invalid_macro_definition",
            Self::MacroCompile { .. } => "macro_compile",
            Self::MacroRequiredBeforeDefined { .. } => "macro_required_before_defined",
            Self::ExpansionFailed { .. } => "expansion_failed",
            Self::MacroLoad { .. } => "macro_load",
            Self::MacroNotFound { .. } => "macro_not_found",
            Self::UndefinedName { .. } => "undefined_name",
            Self::MetadataUnavailable { .. } => "metadata_unavailable",
            Self::Io { .. } => "io",
            Self::Config { .. } => "config",
        }
    }

    pub fn is_warning(&self) -> bool {
        self.category() == ErrorCategory::Warning
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Parse,
    Template,
    Definition,
    Compile,
    Load,
    Resolution,
    Warning,
    Environment,
}

impl std::error::Error for KilnError {}

impl fmt::Display for KilnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Syntax { message } => write!(f, "Parse error: {}", message),
            ErrorKind::InvalidLiteral {
                literal_type,
                value,
            } => {
                write!(f, "Parse error: invalid {} '{}'", literal_type, value)
            }
            ErrorKind::TemplateUsage { hole } => {
                write!(
                    f,
                    "Template error: hole {} used outside an expansion",
                    hole
                )
            }
            ErrorKind::TemplateMismatch { message } => {
                write!(f, "Template error: {}", message)
            }
            ErrorKind::InvalidMacroDefinition { macro_name, reason } => {
                write!(
                    f,
                    "Definition error: invalid macro '{}': {}",
                    macro_name, reason
                )
            }
            ErrorKind::MacroCompile { macro_name, reason } => {
                write!(
                    f,
                    "Compile error: macro '{}' could not be built: {}",
                    macro_name, reason
                )
            }
            ErrorKind::MacroRequiredBeforeDefined { macro_name } => {
                write!(
                    f,
                    "Compile error: macro '{}' required before fully defined",
                    macro_name
                )
            }
            ErrorKind::ExpansionFailed { macro_name, reason } => {
                write!(
                    f,
                    "Expansion error: macro '{}' failed: {}",
                    macro_name, reason
                )
            }
            ErrorKind::MacroLoad { unit, reason } => {
                write!(f, "Load error: unit '{}' could not be loaded: {}", unit, reason)
            }
            ErrorKind::MacroNotFound { name, owner } => {
                write!(f, "Resolution error: macro not found: {}.{}", owner, name)
            }
            ErrorKind::UndefinedName { name, context } => {
                write!(f, "Resolution error: undefined {} '{}'", context, name)
            }
            ErrorKind::MetadataUnavailable { owner, macro_name } => {
                write!(
                    f,
                    "Warning: type '{}' has no descriptor; macro '{}' is only available in this session",
                    owner, macro_name
                )
            }
            ErrorKind::Io { path, message } => write!(f, "I/O error on '{}': {}", path, message),
            ErrorKind::Config { message } => write!(f, "Configuration error: {}", message),
        }
    }
}

impl Diagnostic for KilnError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(&self.diagnostic_info.error_code))
    }

    fn severity(&self) -> Option<miette::Severity> {
        if self.kind.is_warning() {
            Some(miette::Severity::Warning)
        } else {
            Some(miette::Severity::Error)
        }
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.diagnostic_info
            .help
            .as_ref()
            .map(|h| Box::new(h) as Box<dyn fmt::Display>)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        let labels = vec![LabeledSpan::new_with_span(
            Some(self.primary_label()),
            self.source_info.primary_span,
        )];
        Some(Box::new(labels.into_iter()))
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&*self.source_info.source)
    }
}

impl KilnError {
    fn primary_label(&self) -> String {
        match &self.kind {
            ErrorKind::Syntax { .. } => "syntax error".into(),
            ErrorKind::InvalidLiteral { .. } => "invalid literal".into(),
            ErrorKind::TemplateUsage { .. } => "hole used here".into(),
            ErrorKind::TemplateMismatch { .. } => "template mismatch".into(),
            ErrorKind::InvalidMacroDefinition { .. } => "invalid definition".into(),
            ErrorKind::MacroCompile { .. } => "macro defined here".into(),
            ErrorKind::MacroRequiredBeforeDefined { .. } => "macro defined here".into(),
            ErrorKind::ExpansionFailed { .. } => "expanded here".into(),
            ErrorKind::MacroLoad { .. } => "macro defined here".into(),
            ErrorKind::MacroNotFound { .. } => "no such macro".into(),
            ErrorKind::UndefinedName { .. } => "undefined".into(),
            ErrorKind::MetadataUnavailable { .. } => "session-local macro".into(),
            ErrorKind::Io { .. } => "i/o failure".into(),
            ErrorKind::Config { .. } => "configuration".into(),
        }
    }

    /// Byte range of the primary label.
    pub fn span(&self) -> Span {
        let start = self.source_info.primary_span.offset();
        Span {
            start,
            end: start + self.source_info.primary_span.len(),
        }
    }

    /// Name of the source the error points into.
    pub fn source_name(&self) -> &str {
        self.source_info.source.name()
    }

    /// Re-anchors the error at `span` within `source`, keeping its kind and help.
    pub fn reanchor(mut self, span: Span, source: &SourceContext) -> Self {
        self.source_info.source = source.to_named_source();
        self.source_info.primary_span = to_source_span(span);
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.diagnostic_info.help = Some(help.into());
        self
    }
}

/// Creates a placeholder span for errors not tied to a specific source code
/// location, such as I/O errors.
pub fn unspanned() -> miette::SourceSpan {
    miette::SourceSpan::from(0..0)
}

/// Converts an AST span to a miette SourceSpan.
pub fn to_source_span(span: Span) -> miette::SourceSpan {
    miette::SourceSpan::from(span.start..span.end)
}

/// General-purpose error creation context bound to one source and phase.
#[derive(Debug, Clone)]
pub struct DiagnosticContext {
    pub source: SourceContext,
    pub phase: String,
}

impl DiagnosticContext {
    pub fn new(source: SourceContext, phase: impl Into<String>) -> Self {
        Self {
            source,
            phase: phase.into(),
        }
    }
}

impl ErrorReporting for DiagnosticContext {
    fn report(&self, kind: ErrorKind, span: SourceSpan) -> KilnError {
        let error_code = format!("kiln::{}::{}", self.phase, kind.code_suffix());

        KilnError {
            kind,
            source_info: SourceInfo {
                source: self.source.to_named_source(),
                primary_span: span,
                phase: self.phase.clone(),
            },
            diagnostic_info: DiagnosticInfo {
                help: None,
                error_code,
            },
        }
    }
}

/// Wraps an I/O failure on `path`.
pub fn io_error(path: &std::path::Path, error: &std::io::Error) -> KilnError {
    DiagnosticContext::new(SourceContext::fallback("filesystem"), "io").report(
        ErrorKind::Io {
            path: path.display().to_string(),
            message: error.to_string(),
        },
        unspanned(),
    )
}

/// Wraps a configuration failure.
pub fn config_error(message: impl Into<String>) -> KilnError {
    DiagnosticContext::new(SourceContext::fallback("configuration"), "config").report(
        ErrorKind::Config {
            message: message.into(),
        },
        unspanned(),
    )
}

impl From<crate::template::TemplateError> for KilnError {
    fn from(error: crate::template::TemplateError) -> Self {
        let context = DiagnosticContext::new(SourceContext::fallback("template"), "template");
        match error {
            crate::template::TemplateError::OutsideExpansion { hole } => {
                context.report(ErrorKind::TemplateUsage { hole }, unspanned())
            }
            other => context.internal_error(&other.to_string(), unspanned()),
        }
    }
}

// ============================================================================
// ERROR FORMATTING UTILITIES
// ============================================================================

/// Prints a KilnError with full miette diagnostics
pub fn print_error(error: KilnError) {
    use miette::Report;
    let report = Report::new(error);
    eprintln!("{report:?}");
}
