//! # wireform
//!
//! An incremental parser compiler for binary wire formats.
//!
//! Describe a format as a grammar of productions, compile it, and run the
//! resulting parser over data that arrives in chunks: the parser suspends
//! whenever it needs bytes that are not there yet and resumes exactly
//! where it stopped. Alternatives are disambiguated ahead of time by
//! bounded lookahead over literal tokens, so feeding more data never
//! backtracks.

pub mod error;
pub mod expr;
pub mod grammar;
pub mod hooks;
pub mod lookahead;
pub mod parser;
pub mod stream;
pub mod value;

mod compiler;
mod matcher;
mod runtime;

pub use error::{GrammarError, ParseError};
pub use expr::{Expr, Scope};
pub use grammar::{
    Field, FilterFactory, Grammar, GrammarSet, LiteralPattern, LookAheadDefault, Production,
    StopKind, SwitchCase, UnitDef,
};
pub use hooks::{Hooks, NoHooks};
pub use parser::{ParseRun, ParseStatus, ParsedUnit, Parser, ParserRegistry};
pub use stream::{StreamBuffer, View};
pub use value::{
    AtomicValueParser, Endian, UnitValue, Value, ValueOutcome, ValueType, ValueTypeParser,
};
