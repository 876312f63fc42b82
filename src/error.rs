// Copyright (c) 2025 ETH Zurich

//! Error codes and reporting for the engine.
//!
//! Every fallible operation returns [`Result`]. The [`Augeas`]
//! instance additionally latches the first error raised during a
//! public call so that embedders polling in the C style can inspect
//! it after the fact.
//!
//! [`Augeas`]: crate::augeas::Augeas

use std::fmt;

use miette::Diagnostic;
use thiserror::Error as ThisError;

/// A result with the engine's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// The stable error-code table of the public API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error.
    NoError,
    /// Out of memory.
    NoMem,
    /// Internal error (bug).
    Internal,
    /// Invalid path expression.
    Pathx,
    /// No matching node for a path expression.
    NoMatch,
    /// Too many matching nodes for a path expression.
    TooManyMatches,
    /// Syntax error in a lens or text.
    Syntax,
    /// Lens not found in the registry.
    NoLens,
    /// Multiple transforms apply to one file.
    MultipleTransforms,
    /// No span information available for the node.
    NoSpan,
    /// Cannot move a node into its own descendant.
    MoveDescendant,
    /// Failed to execute an `srun` command.
    CmdRun,
    /// Invalid argument to an API call.
    BadArg,
    /// Invalid label.
    Label,
}

impl ErrorCode {
    /// The fixed human message associated with the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NoError => "No error",
            ErrorCode::NoMem => "Out of memory",
            ErrorCode::Internal => "Internal error (please file a bug)",
            ErrorCode::Pathx => "Invalid path expression",
            ErrorCode::NoMatch => "No match for path expression",
            ErrorCode::TooManyMatches => "Too many matches for path expression",
            ErrorCode::Syntax => "Syntax error in lens definition",
            ErrorCode::NoLens => "Lens not found",
            ErrorCode::MultipleTransforms => "Multiple transforms",
            ErrorCode::NoSpan => "No span info",
            ErrorCode::MoveDescendant => "Cannot move node into its descendant",
            ErrorCode::CmdRun => "Failed to execute command",
            ErrorCode::BadArg => "Invalid argument in function call",
            ErrorCode::Label => "Invalid label",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// An error raised by the engine.
///
/// `details` carries the context-specific explanation; the fixed
/// message belongs to the [`ErrorCode`].
#[derive(ThisError, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Internal error: {0}")]
    #[diagnostic(code(augeas::einternal))]
    Internal(String),

    #[error("Invalid path expression: {details}")]
    #[diagnostic(code(augeas::epathx))]
    Pathx {
        /// The failing expression annotated with `|=|` at the error.
        details: String,
        /// Byte offset of the failure in the expression.
        pos: usize,
    },

    #[error("No match for path expression {0}")]
    #[diagnostic(code(augeas::enomatch))]
    NoMatch(String),

    #[error("Too many matches for path expression {0}")]
    #[diagnostic(code(augeas::emmatch))]
    TooManyMatches(String),

    #[error("Syntax error: {0}")]
    #[diagnostic(code(augeas::esyntax))]
    Syntax(String),

    #[error("Lens `{0}` not found")]
    #[diagnostic(code(augeas::enolens))]
    NoLens(String),

    #[error("Multiple transforms: {0}")]
    #[diagnostic(code(augeas::emxfm))]
    MultipleTransforms(String),

    #[error("No span info for {0}")]
    #[diagnostic(code(augeas::enospan))]
    NoSpan(String),

    #[error("Cannot move {src} into its descendant {dst}")]
    #[diagnostic(code(augeas::emvdesc))]
    MoveDescendant { src: String, dst: String },

    #[error("Failed to execute command: {0}")]
    #[diagnostic(code(augeas::ecmdrun))]
    CmdRun(String),

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(augeas::ebadarg))]
    BadArg(String),

    #[error("Invalid label `{0}`")]
    #[diagnostic(code(augeas::elabel))]
    Label(String),

    #[error("Failed to parse: {0}")]
    #[diagnostic(code(augeas::eparse))]
    Parse(#[from] LnsError),

    #[error("I/O error on {path}: {msg}")]
    #[diagnostic(code(augeas::eio))]
    Io { path: String, msg: String },
}

impl Error {
    /// The public error code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Internal(_) => ErrorCode::Internal,
            Error::Pathx { .. } => ErrorCode::Pathx,
            Error::NoMatch(_) => ErrorCode::NoMatch,
            Error::TooManyMatches(_) => ErrorCode::TooManyMatches,
            Error::Syntax(_) => ErrorCode::Syntax,
            Error::NoLens(_) => ErrorCode::NoLens,
            Error::MultipleTransforms(_) => ErrorCode::MultipleTransforms,
            Error::NoSpan(_) => ErrorCode::NoSpan,
            Error::MoveDescendant { .. } => ErrorCode::MoveDescendant,
            Error::CmdRun(_) => ErrorCode::CmdRun,
            Error::BadArg(_) => ErrorCode::BadArg,
            Error::Label(_) => ErrorCode::Label,
            Error::Parse(_) => ErrorCode::Syntax,
            Error::Io { .. } => ErrorCode::Internal,
        }
    }

    /// Shorthand for an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Error {
        Error::Internal(msg.into())
    }
}

/// A failure in the `get` or `put` direction of a lens.
///
/// `get` failures carry a byte position into the text; `put` failures
/// carry the path of the offending tree node instead.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LnsError {
    /// Human-readable explanation.
    pub message: String,
    /// Byte offset into the input text (`get` failures).
    pub pos: Option<usize>,
    /// Path of the offending tree node (`put` failures).
    pub path: Option<String>,
    /// A short rendering of the lens that failed.
    pub lens: Option<String>,
}

impl LnsError {
    /// A `get`-side failure at byte offset `pos`.
    pub fn at_pos<S: Into<String>>(message: S, pos: usize) -> LnsError {
        LnsError {
            message: message.into(),
            pos: Some(pos),
            path: None,
            lens: None,
        }
    }

    /// A `put`-side failure at tree node `path`.
    pub fn at_path<S: Into<String>, P: Into<String>>(message: S, path: P) -> LnsError {
        LnsError {
            message: message.into(),
            pos: None,
            path: Some(path.into()),
            lens: None,
        }
    }

    /// Attach the offending lens.
    pub fn with_lens<S: Into<String>>(mut self, lens: S) -> LnsError {
        self.lens = Some(lens.into());
        self
    }

    /// Compute `(line, char)` of the failure position within `text`.
    ///
    /// Lines and columns are 1-based; returns `None` for put errors.
    pub fn line_char(&self, text: &str) -> Option<(usize, usize)> {
        let pos = self.pos?.min(text.len());
        let mut line = 1;
        let mut col = 1;
        for b in text.as_bytes()[..pos].iter() {
            if *b == b'\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        Some((line, col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_have_messages() {
        assert_eq!(ErrorCode::Pathx.message(), "Invalid path expression");
        assert_eq!(
            Error::NoMatch("/files/foo".into()).code(),
            ErrorCode::NoMatch
        );
    }

    #[test]
    fn line_char_counts_newlines() {
        let err = LnsError::at_pos("no match", 6);
        assert_eq!(err.line_char("ab\ncd\nef\n"), Some((3, 1)));
        let err = LnsError::at_path("value mismatch", "/files/x");
        assert_eq!(err.line_char(""), None);
    }
}
