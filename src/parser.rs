//! Compiled parsers and parse runs
//!
//! `Parser::compile` turns a grammar set into an executable parser for one
//! root format. A parser is immutable and shareable; each `ParseRun` holds
//! the resumable state of one parse over one stream.
//!
//! ## Example
//!
//! ```text
//! let parser = Parser::compile(&set, "Request")?;
//! let mut run = parser.begin();
//! let mut buf = StreamBuffer::new();
//! loop {
//!     buf.append(next_chunk());
//!     match run.feed(&mut buf, &mut NoHooks)? {
//!         ParseStatus::Done(unit) => break println!("{}", unit.to_json()?),
//!         ParseStatus::Suspended => continue,
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::compiler::{compile, Program};
use crate::error::{GrammarError, ParseError};
use crate::grammar::GrammarSet;
use crate::hooks::Hooks;
use crate::runtime::{Executor, RunOutcome, RunState};
use crate::stream::{StreamBuffer, View};
use crate::value::{AtomicValueParser, Value, ValueTypeParser};

/// A compiled, reusable parser for one root format
pub struct Parser {
    name: String,
    program: Program,
    values: Box<dyn ValueTypeParser>,
}

impl Parser {
    /// Compile the grammar set, rooted at the format named `root`
    pub fn compile(set: &GrammarSet, root: &str) -> Result<Parser, GrammarError> {
        Ok(Parser {
            name: root.to_string(),
            program: compile(set, root)?,
            values: Box::new(AtomicValueParser),
        })
    }

    /// Replace the collaborator that parses atomic value types
    pub fn with_value_parser(mut self, values: impl ValueTypeParser + 'static) -> Self {
        self.values = Box::new(values);
        self
    }

    /// The root format this parser was compiled for
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start an incremental parse from the stream's current position
    pub fn begin(&self) -> ParseRun<'_> {
        ParseRun {
            parser: self,
            start: None,
            state: None,
            finished: false,
        }
    }

    /// Start an incremental parse over an explicit window of the stream
    ///
    /// The run neither trims the buffer nor assumes its own window starts
    /// at the front, so the caller stays in charge of retention.
    pub fn begin_at(&self, view: View) -> ParseRun<'_> {
        ParseRun {
            parser: self,
            start: Some(view),
            state: None,
            finished: false,
        }
    }

    /// Parse to completion from data that is already all present
    pub fn parse(
        &self,
        data: &mut StreamBuffer,
        hooks: &mut dyn Hooks,
    ) -> Result<ParsedUnit, ParseError> {
        let mut run = self.begin();
        match run.feed(data, hooks)? {
            ParseStatus::Done(unit) => Ok(unit),
            ParseStatus::Suspended => Err(ParseError::new(
                "input exhausted before the parse completed",
            )),
        }
    }

    /// Like `parse`, over an explicit window
    pub fn parse_at(
        &self,
        data: &mut StreamBuffer,
        view: View,
        hooks: &mut dyn Hooks,
    ) -> Result<ParsedUnit, ParseError> {
        let mut run = self.begin_at(view);
        match run.feed(data, hooks)? {
            ParseStatus::Done(unit) => Ok(unit),
            ParseStatus::Suspended => Err(ParseError::new(
                "input exhausted before the parse completed",
            )),
        }
    }
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser").field("name", &self.name).finish()
    }
}

/// What a `feed` call concluded
#[derive(Debug)]
pub enum ParseStatus {
    /// The parse is complete
    Done(ParsedUnit),
    /// More input is required; append to the buffer (or freeze it) and
    /// call `feed` again
    Suspended,
}

/// The result of a completed parse
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUnit {
    value: Value,
    remaining: View,
}

impl ParsedUnit {
    pub(crate) fn new(value: Value, remaining: View) -> Self {
        ParsedUnit { value, remaining }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// The unconsumed rest of the input window
    pub fn remaining(&self) -> View {
        self.remaining
    }

    /// Dump the parsed value as pretty-printed JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.value)
    }
}

/// The resumable state of one incremental parse
pub struct ParseRun<'p> {
    parser: &'p Parser,
    start: Option<View>,
    state: Option<RunState>,
    finished: bool,
}

impl ParseRun<'_> {
    /// Run as far as the buffered bytes allow
    ///
    /// Returns `Suspended` when more input is needed. After an `Err` or
    /// `Done` the run is finished; further calls error.
    pub fn feed(
        &mut self,
        data: &mut StreamBuffer,
        hooks: &mut dyn Hooks,
    ) -> Result<ParseStatus, ParseError> {
        if self.finished {
            return Err(ParseError::new("parse run already finished"));
        }
        let program = &self.parser.program;
        let start = self.start;
        let st = self
            .state
            .get_or_insert_with(|| RunState::new(program, start, data));
        let executor = Executor {
            program,
            st,
            data,
            hooks,
            values: self.parser.values.as_ref(),
        };
        match executor.run() {
            Ok(RunOutcome::Done { value, remaining }) => {
                self.finished = true;
                Ok(ParseStatus::Done(ParsedUnit::new(value, remaining)))
            }
            Ok(RunOutcome::Suspended) => Ok(ParseStatus::Suspended),
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }
}

/// Registry of compiled parsers, keyed by root format name
///
/// Lets independent components share parsers without threading them
/// through every call site.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<Parser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        ParserRegistry {
            parsers: HashMap::new(),
        }
    }

    pub fn register(&mut self, parser: Arc<Parser>) {
        self.parsers.insert(parser.name().to_string(), parser);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Parser>> {
        self.parsers.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.parsers.contains_key(name)
    }

    /// Registered format names, sorted
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<_> = self.parsers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Parse with a registered parser
    pub fn parse(
        &self,
        name: &str,
        data: &mut StreamBuffer,
        hooks: &mut dyn Hooks,
    ) -> Result<ParsedUnit, ParseError> {
        let parser = self
            .get(name)
            .ok_or_else(|| ParseError::new(format!("parser '{}' not found", name)))?;
        parser.parse(data, hooks)
    }

    /// The process-wide registry
    pub fn global() -> &'static Mutex<ParserRegistry> {
        static REGISTRY: Lazy<Mutex<ParserRegistry>> =
            Lazy::new(|| Mutex::new(ParserRegistry::new()));
        &REGISTRY
    }
}
