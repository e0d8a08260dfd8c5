//! Collected diagnostics with token locations.
//!
//! Errors are accumulated, not thrown: evaluation and building continue past
//! each error so a single run surfaces as many problems as possible. The
//! canonical rendering is `<file>:<line>: error: <message>`, followed by
//! `note:` lines citing further token locations and, for macro failures, a
//! dump of the offending expansion. When the source text has been registered
//! with the environment, errors also carry a miette source span so they can
//! be rendered as rich reports.

use std::fmt;
use std::sync::Arc;

use miette::{Diagnostic, LabeledSpan, NamedSource, SourceSpan};

use crate::token::{Span, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        }
    }
}

/// What went wrong, with kind-specific data.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Tokenizer-level problem, including unbalanced parentheses.
    Tokenize { message: String },
    /// A token appeared in a scope that cannot accept it.
    InvalidScope { what: String, expected: &'static str },
    /// After all passes, a reference remained in state `None`.
    UnresolvedReference { name: String },
    /// A macro returned failure or produced unbalanced output.
    MacroFailure { name: String, message: String },
    /// Compile, link, load, or symbol resolution failed for a definition.
    BuildFailure { name: String, message: String },
    /// Two top-level forms share a name.
    DuplicateDefinition { name: String },
    /// A malformed built-in generator invocation (bad arity, wrong token
    /// kind in a signature, and so on).
    InvalidInvocation { message: String },
    /// The environment's own bookkeeping is broken. Reported, never panicked.
    InternalInconsistency { message: String },
    /// File I/O failed.
    Io { message: String },
    /// Free-form note or warning text.
    Message { message: String },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Tokenize { message } => write!(f, "{message}"),
            ErrorKind::InvalidScope { what, expected } => {
                write!(f, "{what} is only allowed in {expected} scope")
            }
            ErrorKind::UnresolvedReference { name } => {
                write!(f, "reference to '{name}' has not been resolved")
            }
            ErrorKind::MacroFailure { name, message } => {
                write!(f, "macro '{name}' {message}")
            }
            ErrorKind::BuildFailure { name, message } => {
                write!(f, "failed to build '{name}': {message}")
            }
            ErrorKind::DuplicateDefinition { name } => {
                write!(f, "multiple definitions of '{name}'")
            }
            ErrorKind::InvalidInvocation { message } => write!(f, "{message}"),
            ErrorKind::InternalInconsistency { message } => {
                write!(f, "internal inconsistency: {message}")
            }
            ErrorKind::Io { message } => write!(f, "{message}"),
            ErrorKind::Message { message } => write!(f, "{message}"),
        }
    }
}

/// `file:line:column` of the token a diagnostic points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn of(token: &Token) -> Self {
        Self {
            file: token.source.to_string(),
            line: token.line,
            column: token.column_start,
        }
    }
}

/// A secondary location attached to an error.
#[derive(Debug, Clone)]
pub struct DiagnosticNote {
    pub message: String,
    pub location: Option<SourceLoc>,
}

#[derive(Debug)]
pub struct CinderError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub location: Option<SourceLoc>,
    pub notes: Vec<DiagnosticNote>,
    /// Byte span of the offending token, used once a source is attached.
    pub span: Option<Span>,
    /// Registered source content, attached by the environment when known.
    pub source_code: Option<Arc<NamedSource<String>>>,
}

impl CinderError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            location: None,
            notes: Vec::new(),
            span: None,
            source_code: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_note(mut self, note: DiagnosticNote) -> Self {
        self.notes.push(note);
        self
    }

    /// Renders the canonical plain-text form, notes included.
    pub fn render(&self) -> String {
        let mut text = String::new();
        if let Some(location) = &self.location {
            text.push_str(&format!("{}:{}: ", location.file, location.line));
        }
        text.push_str(self.severity.as_str());
        text.push_str(": ");
        text.push_str(&self.kind.to_string());
        for note in &self.notes {
            text.push('\n');
            if let Some(location) = &note.location {
                text.push_str(&format!("{}:{}: ", location.file, location.line));
            }
            text.push_str("note: ");
            text.push_str(&note.message);
        }
        text
    }
}

impl fmt::Display for CinderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for CinderError {}

impl Diagnostic for CinderError {
    fn severity(&self) -> Option<miette::Severity> {
        Some(match self.severity {
            Severity::Error => miette::Severity::Error,
            Severity::Warning => miette::Severity::Warning,
            Severity::Note => miette::Severity::Advice,
        })
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        let span = self.span?;
        self.source_code.as_ref()?;
        let labeled = LabeledSpan::new_with_span(
            Some("here".into()),
            SourceSpan::from(span.start..span.end),
        );
        Some(Box::new(std::iter::once(labeled)))
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        self.source_code
            .as_ref()
            .map(|source| &**source as &dyn miette::SourceCode)
    }
}

/// Prints an error as a rich miette report, with a labeled source span when
/// one was attached. Used for user-facing presentation in the CLI.
pub fn print_error(error: CinderError) {
    let report = miette::Report::new(error);
    eprintln!("{report:?}");
}

/// Builds an error pointing at `token`.
pub fn error_at_token(kind: ErrorKind, token: &Token) -> CinderError {
    let mut error = CinderError::new(kind);
    error.location = Some(SourceLoc::of(token));
    error.span = Some(token.span);
    error
}

/// Builds a note-severity diagnostic pointing at `token`.
pub fn note_at_token(message: impl Into<String>, token: &Token) -> CinderError {
    error_at_token(
        ErrorKind::Message {
            message: message.into(),
        },
        token,
    )
    .with_severity(Severity::Note)
}

/// A note line for attachment to an existing error.
pub fn note_for_token(message: impl Into<String>, token: &Token) -> DiagnosticNote {
    DiagnosticNote {
        message: message.into(),
        location: Some(SourceLoc::of(token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenKind;

    fn token() -> Token {
        Token {
            kind: TokenKind::Symbol,
            contents: "thing".into(),
            source: "module.cnd".into(),
            line: 12,
            column_start: 3,
            column_end: 8,
            span: Span { start: 40, end: 45 },
        }
    }

    #[test]
    fn renders_file_line_error_form() {
        let error = error_at_token(
            ErrorKind::UnresolvedReference {
                name: "thing".into(),
            },
            &token(),
        );
        assert_eq!(
            error.render(),
            "module.cnd:12: error: reference to 'thing' has not been resolved"
        );
    }

    #[test]
    fn renders_attached_notes() {
        let error = error_at_token(
            ErrorKind::DuplicateDefinition {
                name: "thing".into(),
            },
            &token(),
        )
        .with_note(note_for_token("first defined here", &token()));
        let rendered = error.render();
        assert!(rendered.contains("error: multiple definitions of 'thing'"));
        assert!(rendered.contains("module.cnd:12: note: first defined here"));
    }
}
