//! Parsed values and atomic value types
//!
//! Compiled parsers are type-erased: whatever the grammar describes, the
//! result of a parse is a `Value`. Unit productions build a `UnitValue`, an
//! ordered map from field names to the values parsed for them. Values
//! serialize with serde so callers can dump parses as JSON without knowing
//! the format ahead of time.
//!
//! ## Design
//!
//! Variable productions delegate to a `ValueTypeParser`: given the bytes
//! available right now and whether more can still arrive, the parser either
//! produces a complete value plus the number of bytes it consumed, or
//! reports the minimum number of bytes it needs before it can decide.
//! `AtomicValueParser` covers the built-in atoms (fixed-width unsigned
//! integers in either byte order, fixed-length byte runs, and the remainder
//! of the input); callers can supply their own implementation to extend the
//! atom set.

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::ParseError;

/// Byte order for multi-byte atomic values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Big,
    Little,
}

/// Atomic value types parsed by `Variable` productions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    UInt8,
    UInt16(Endian),
    UInt32(Endian),
    UInt64(Endian),
    /// Exactly this many raw bytes
    Bytes(usize),
    /// All bytes up to the end of the current input view
    Remaining,
}

/// A type-erased parsed value
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    UInt(u64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Unit(UnitValue),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_unit(&self) -> Option<&UnitValue> {
        match self {
            Value::Unit(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// The parsed instance of a unit production
///
/// Fields keep their declaration order; setting a field that is already
/// present replaces its value in place.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitValue {
    type_name: String,
    fields: Vec<(String, Value)>,
}

impl UnitValue {
    pub fn new(type_name: impl Into<String>) -> Self {
        UnitValue {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Name of the unit type this value was parsed as
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Fields in declaration order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for UnitValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("_type", &self.type_name)?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Outcome of attempting to parse an atomic value from the available bytes
#[derive(Debug, Clone, PartialEq)]
pub enum ValueOutcome {
    /// A complete value; `consumed` bytes were used from the front
    Complete { value: Value, consumed: usize },
    /// Not decidable yet; at least `min` bytes total are required
    NeedMoreData { min: usize },
}

/// Parses atomic value types out of raw bytes
///
/// `at_final` is true when no further bytes can arrive in the current view:
/// the stream is frozen, or the view is bounded and all its bytes are
/// present. Implementations must not report `NeedMoreData` in a way that
/// can never be satisfied when `at_final` is false; the driver converts a
/// short read at final into a parse error.
pub trait ValueTypeParser: Send + Sync {
    fn parse(
        &self,
        ty: &ValueType,
        avail: &[u8],
        at_final: bool,
    ) -> Result<ValueOutcome, ParseError>;
}

/// Built-in parser for the atomic value types
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicValueParser;

impl AtomicValueParser {
    fn uint(avail: &[u8], width: usize, endian: Endian) -> ValueOutcome {
        if avail.len() < width {
            return ValueOutcome::NeedMoreData { min: width };
        }
        let mut n: u64 = 0;
        match endian {
            Endian::Big => {
                for &b in &avail[..width] {
                    n = (n << 8) | u64::from(b);
                }
            }
            Endian::Little => {
                for (i, &b) in avail[..width].iter().enumerate() {
                    n |= u64::from(b) << (8 * i);
                }
            }
        }
        ValueOutcome::Complete {
            value: Value::UInt(n),
            consumed: width,
        }
    }
}

impl ValueTypeParser for AtomicValueParser {
    fn parse(
        &self,
        ty: &ValueType,
        avail: &[u8],
        at_final: bool,
    ) -> Result<ValueOutcome, ParseError> {
        let outcome = match ty {
            ValueType::UInt8 => Self::uint(avail, 1, Endian::Big),
            ValueType::UInt16(e) => Self::uint(avail, 2, *e),
            ValueType::UInt32(e) => Self::uint(avail, 4, *e),
            ValueType::UInt64(e) => Self::uint(avail, 8, *e),
            ValueType::Bytes(n) => {
                if avail.len() < *n {
                    ValueOutcome::NeedMoreData { min: *n }
                } else {
                    ValueOutcome::Complete {
                        value: Value::Bytes(avail[..*n].to_vec()),
                        consumed: *n,
                    }
                }
            }
            ValueType::Remaining => {
                if at_final {
                    ValueOutcome::Complete {
                        value: Value::Bytes(avail.to_vec()),
                        consumed: avail.len(),
                    }
                } else {
                    ValueOutcome::NeedMoreData {
                        min: avail.len() + 1,
                    }
                }
            }
        };
        Ok(outcome)
    }
}
