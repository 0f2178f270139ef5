//! Error types for grammar compilation and parsing
//!
//! Two error families exist: `GrammarError` for problems detected while
//! building or compiling a grammar (unresolved references, patterns that
//! cannot be disambiguated by bounded lookahead), and `ParseError` for
//! failures while running a compiled parser over input data.

use std::fmt;

/// Errors detected while building or compiling a grammar
#[derive(Debug, Clone, PartialEq)]
pub enum GrammarError {
    /// A `Forward` production names a symbol the grammar never defines
    UnresolvedForward { grammar: String, symbol: String },
    /// A `Reference` production names a format that is not part of the set
    UnknownFormat(String),
    /// A regular-expression literal failed to compile
    InvalidPattern { pattern: String, message: String },
    /// Both alternatives of a lookahead site can start with the same token
    AmbiguousAlternatives { grammar: String, detail: String },
    /// An alternative starts with something no literal token can identify
    UnresolvableLookahead { grammar: String, detail: String },
    /// The set contains no grammar with the requested root format
    MissingRoot(String),
    /// Two grammars in the set share a format name
    DuplicateFormat(String),
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarError::UnresolvedForward { grammar, symbol } => {
                write!(f, "Grammar '{}' forwards to undefined symbol '{}'", grammar, symbol)
            }
            GrammarError::UnknownFormat(name) => {
                write!(f, "Referenced format '{}' is not in the grammar set", name)
            }
            GrammarError::InvalidPattern { pattern, message } => {
                write!(f, "Invalid literal pattern /{}/: {}", pattern, message)
            }
            GrammarError::AmbiguousAlternatives { grammar, detail } => {
                write!(f, "Grammar '{}' has ambiguous alternatives: {}", grammar, detail)
            }
            GrammarError::UnresolvableLookahead { grammar, detail } => {
                write!(f, "Grammar '{}' cannot be disambiguated by lookahead: {}", grammar, detail)
            }
            GrammarError::MissingRoot(name) => {
                write!(f, "Grammar set has no format named '{}'", name)
            }
            GrammarError::DuplicateFormat(name) => {
                write!(f, "Grammar set defines format '{}' more than once", name)
            }
        }
    }
}

impl std::error::Error for GrammarError {}

/// A failure while parsing input data
///
/// Carries the failure message plus, where known, the grammar location
/// (`Format.field`) that was active when the failure occurred. Errors
/// surfaced through hooks and through `feed`/`parse` carry the same
/// location metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    message: String,
    location: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(message: impl Into<String>, location: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
            location: Some(location.into()),
        }
    }

    /// Attach a location if none is present yet; inner locations win
    pub fn or_at(mut self, location: impl Into<String>) -> Self {
        if self.location.is_none() {
            self.location = Some(location.into());
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "Parse error at {}: {}", loc, self.message),
            None => write!(f, "Parse error: {}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}
