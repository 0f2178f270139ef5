//! Parse-time callbacks
//!
//! A `Hooks` implementation observes a parse run as it happens: unit
//! construction, individual field values, loop items, completion, and
//! failure. All methods have empty defaults, so implementations override
//! only what they care about. `NoHooks` is the inert implementation used
//! when the caller wants plain values out.

use crate::error::ParseError;
use crate::value::{UnitValue, Value};

pub trait Hooks {
    /// A unit instance has been created, before any of its fields parse
    fn on_init(&mut self, _unit: &mut UnitValue) {}

    /// A field finished parsing; runs after the value is stored in the unit
    fn on_field(&mut self, _unit: &mut UnitValue, _field: &str, _value: &Value) {}

    /// A loop item was parsed; set `stop` to end the loop after this item
    fn on_foreach(
        &mut self,
        _unit: &mut UnitValue,
        _field: &str,
        _item: &Value,
        _stop: &mut bool,
    ) {
    }

    /// A unit finished parsing successfully, after unit-level assertions
    fn on_done(&mut self, _unit: &mut UnitValue) {}

    /// A unit failed; runs once per failing unit, innermost first
    fn on_error(&mut self, _unit: &mut UnitValue, _error: &ParseError) {}
}

/// Hooks implementation that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}
