//! Production forms and field declarations
//!
//! A grammar is a tree of `Production` values. Structural forms (sequence,
//! switch, lookahead, loops) compose terminal forms (literals and atomic
//! variables); `Unit` productions group named fields into a record and are
//! the only place field attributes can appear.

use std::fmt;
use std::sync::Arc;

use crate::error::ParseError;
use crate::expr::Expr;
use crate::value::ValueType;

/// A literal terminal: either exact bytes or a byte-oriented regex
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LiteralPattern {
    Bytes(Vec<u8>),
    Regex(String),
}

impl fmt::Display for LiteralPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralPattern::Bytes(b) => {
                write!(f, "b\"")?;
                for &c in b {
                    for e in std::ascii::escape_default(c) {
                        write!(f, "{}", e as char)?;
                    }
                }
                write!(f, "\"")
            }
            LiteralPattern::Regex(r) => write!(f, "/{}/", r),
        }
    }
}

/// Which alternative a lookahead site selects when no candidate matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookAheadDefault {
    /// No default; failure to match any candidate is a parse error
    None,
    First,
    Second,
}

/// One production form
#[derive(Debug, Clone)]
pub enum Production {
    /// Matches nothing, always succeeds
    Epsilon,
    /// A literal token
    Literal(LiteralPattern),
    /// Each production in order
    Sequence(Vec<Production>),
    /// Evaluate the selector, run the first case with a matching guard
    Switch {
        selector: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Box<Production>>,
    },
    /// Choose between two alternatives by bounded lookahead
    LookAhead {
        first: Box<Production>,
        second: Box<Production>,
        default: LookAheadDefault,
    },
    /// Repeat the body a computed number of times
    Counter { count: Expr, body: Box<Production> },
    /// Repeat the body until stopped; `eod_ok` makes end-of-data a clean stop
    ForEach { body: Box<Production>, eod_ok: bool },
    /// A record of named fields
    Unit(UnitDef),
    /// The root of another format in the same grammar set
    Reference {
        format: String,
        /// Named values computed in the caller's scope, seeded into the
        /// referenced format's unit before its `on_init` hook
        args: Vec<(String, Expr)>,
    },
    /// A named symbol of the enclosing grammar, resolved at compile time
    Forward(String),
    /// An atomic value parsed by the value-type collaborator
    Variable(ValueType),
}

impl Production {
    pub fn literal(bytes: impl Into<Vec<u8>>) -> Production {
        Production::Literal(LiteralPattern::Bytes(bytes.into()))
    }

    pub fn regex(pattern: impl Into<String>) -> Production {
        Production::Literal(LiteralPattern::Regex(pattern.into()))
    }

    pub fn sequence(items: Vec<Production>) -> Production {
        Production::Sequence(items)
    }

    pub fn look_ahead(first: Production, second: Production, default: LookAheadDefault) -> Production {
        Production::LookAhead {
            first: Box::new(first),
            second: Box::new(second),
            default,
        }
    }

    pub fn counter(count: Expr, body: Production) -> Production {
        Production::Counter {
            count,
            body: Box::new(body),
        }
    }

    pub fn for_each(body: Production, eod_ok: bool) -> Production {
        Production::ForEach {
            body: Box::new(body),
            eod_ok,
        }
    }

    pub fn reference(format: impl Into<String>) -> Production {
        Production::Reference {
            format: format.into(),
            args: Vec::new(),
        }
    }

    pub fn reference_with(format: impl Into<String>, args: Vec<(String, Expr)>) -> Production {
        Production::Reference {
            format: format.into(),
            args,
        }
    }

    pub fn forward(symbol: impl Into<String>) -> Production {
        Production::Forward(symbol.into())
    }

    pub fn variable(ty: ValueType) -> Production {
        Production::Variable(ty)
    }
}

/// One case of a `Switch`: any matching guard selects the body
#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub guards: Vec<Expr>,
    pub body: Production,
}

impl SwitchCase {
    pub fn new(guards: Vec<Expr>, body: Production) -> Self {
        SwitchCase { guards, body }
    }
}

/// When a loop field's stop condition is evaluated relative to the item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Condition true: discard the item and stop before it
    Until,
    /// Condition true: keep the item, then stop
    UntilIncluding,
    /// Condition false: discard the item and stop
    While,
}

/// A loop field's stop condition
#[derive(Debug, Clone)]
pub struct Stop {
    pub kind: StopKind,
    pub condition: Expr,
}

/// Attributes modifying how a field parses and what it stores
#[derive(Debug, Clone, Default)]
pub struct FieldAttributes {
    /// Limit the field to exactly this many bytes of input
    pub size: Option<Expr>,
    /// Parse the field from computed bytes instead of stream input
    pub parse_from: Option<Expr>,
    /// Parse the field at an absolute stream offset, without consuming
    pub parse_at: Option<Expr>,
    /// Transform the parsed value before storing it
    pub convert: Option<Expr>,
    /// Assert over the (converted) value; failure is a parse error
    pub requires: Option<Expr>,
    /// Stop condition for loop-shaped fields
    pub stop: Option<Stop>,
    /// Parse but do not store
    pub transient: bool,
}

/// A named field of a unit
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub production: Production,
    pub attrs: FieldAttributes,
}

impl Field {
    pub fn new(name: impl Into<String>, production: Production) -> Self {
        Field {
            name: name.into(),
            production,
            attrs: FieldAttributes::default(),
        }
    }

    pub fn size(mut self, expr: Expr) -> Self {
        self.attrs.size = Some(expr);
        self
    }

    pub fn parse_from(mut self, expr: Expr) -> Self {
        self.attrs.parse_from = Some(expr);
        self
    }

    pub fn parse_at(mut self, expr: Expr) -> Self {
        self.attrs.parse_at = Some(expr);
        self
    }

    pub fn convert(mut self, expr: Expr) -> Self {
        self.attrs.convert = Some(expr);
        self
    }

    pub fn requires(mut self, expr: Expr) -> Self {
        self.attrs.requires = Some(expr);
        self
    }

    pub fn until(mut self, condition: Expr) -> Self {
        self.attrs.stop = Some(Stop {
            kind: StopKind::Until,
            condition,
        });
        self
    }

    pub fn until_including(mut self, condition: Expr) -> Self {
        self.attrs.stop = Some(Stop {
            kind: StopKind::UntilIncluding,
            condition,
        });
        self
    }

    pub fn while_(mut self, condition: Expr) -> Self {
        self.attrs.stop = Some(Stop {
            kind: StopKind::While,
            condition,
        });
        self
    }

    pub fn transient(mut self) -> Self {
        self.attrs.transient = true;
        self
    }
}

/// A stateful transformer from raw stream bytes to the bytes a unit parses
///
/// Called with each upstream chunk; `final_chunk` is true on the last call,
/// letting block-oriented transforms flush.
pub type BoxedFilter = Box<dyn FnMut(&[u8], bool) -> Result<Vec<u8>, ParseError> + Send>;

/// Creates a fresh filter instance for each parse run
#[derive(Clone)]
pub struct FilterFactory {
    make: Arc<dyn Fn() -> BoxedFilter + Send + Sync>,
}

impl FilterFactory {
    pub fn new(make: impl Fn() -> BoxedFilter + Send + Sync + 'static) -> Self {
        FilterFactory {
            make: Arc::new(make),
        }
    }

    pub fn instantiate(&self) -> BoxedFilter {
        (self.make)()
    }
}

impl fmt::Debug for FilterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilterFactory(..)")
    }
}

/// A unit production: an ordered record of named fields
#[derive(Debug, Clone)]
pub struct UnitDef {
    pub name: String,
    pub fields: Vec<Field>,
    /// Input filter applied to the unit's bytes before its fields parse
    pub filter: Option<FilterFactory>,
    /// Unit-level assertions checked after the last field, before `on_done`
    pub requires: Vec<Expr>,
}

impl UnitDef {
    pub fn new(name: impl Into<String>) -> Self {
        UnitDef {
            name: name.into(),
            fields: Vec::new(),
            filter: None,
            requires: Vec::new(),
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn filter(mut self, factory: FilterFactory) -> Self {
        self.filter = Some(factory);
        self
    }

    pub fn require(mut self, expr: Expr) -> Self {
        self.requires.push(expr);
        self
    }

    pub fn into_production(self) -> Production {
        Production::Unit(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern_display() {
        assert_eq!(
            LiteralPattern::Bytes(b"GET ".to_vec()).to_string(),
            "b\"GET \""
        );
        assert_eq!(
            LiteralPattern::Regex("[0-9]+".to_string()).to_string(),
            "/[0-9]+/"
        );
    }

    #[test]
    fn test_field_builder_sets_attributes() {
        let f = Field::new("body", Production::variable(ValueType::Remaining))
            .size(Expr::uint(4))
            .transient();
        assert!(f.attrs.size.is_some());
        assert!(f.attrs.transient);
        assert!(f.attrs.convert.is_none());
    }

    #[test]
    fn test_unit_builder_keeps_field_order() {
        let unit = UnitDef::new("Pair")
            .field(Field::new("a", Production::variable(ValueType::UInt8)))
            .field(Field::new("b", Production::variable(ValueType::UInt8)));
        let names: Vec<&str> = unit.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
