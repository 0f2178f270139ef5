//! Runtime expressions for grammar attributes
//!
//! Counts, switch selectors, stop conditions, `convert`, and `requires`
//! are all plain Rust closures wrapped in `Expr`. An expression evaluates
//! against a `Scope` that exposes the unit instance being parsed (for
//! `self.<field>` style access) and, where one exists, the current item
//! value (`$$` in the attribute's source notation).
//!
//! Expressions are evaluated at specific points during parsing, never
//! speculatively, so a closure can assume every field declared before the
//! one it is attached to has already been set.

use std::fmt;
use std::sync::Arc;

use crate::error::ParseError;
use crate::value::{UnitValue, Value};

/// Evaluation scope for an `Expr`
///
/// `unit` is the innermost unit instance under construction, if any;
/// `dollar` is the contextual value bound at the evaluation site (the
/// just-parsed field value for `convert`/`requires`, the current item
/// for loop stop conditions).
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope<'a> {
    pub unit: Option<&'a UnitValue>,
    pub dollar: Option<&'a Value>,
}

impl<'a> Scope<'a> {
    pub fn field(&self, name: &str) -> Result<&'a Value, ParseError> {
        self.unit
            .and_then(|u| u.get(name))
            .ok_or_else(|| ParseError::new(format!("field '{}' is not set in scope", name)))
    }

    pub fn dollar(&self) -> Result<&'a Value, ParseError> {
        self.dollar
            .ok_or_else(|| ParseError::new("no contextual value ($$) in scope"))
    }
}

type ExprFn = dyn Fn(&Scope<'_>) -> Result<Value, ParseError> + Send + Sync;

/// A runtime expression attached to a grammar attribute
#[derive(Clone)]
pub struct Expr {
    f: Arc<ExprFn>,
}

impl Expr {
    pub fn new(f: impl Fn(&Scope<'_>) -> Result<Value, ParseError> + Send + Sync + 'static) -> Self {
        Expr { f: Arc::new(f) }
    }

    /// A constant value
    pub fn constant(value: Value) -> Self {
        Expr::new(move |_| Ok(value.clone()))
    }

    /// A constant unsigned integer
    pub fn uint(n: u64) -> Self {
        Expr::constant(Value::UInt(n))
    }

    /// Reads a previously parsed field of the enclosing unit
    pub fn field(name: impl Into<String>) -> Self {
        let name = name.into();
        Expr::new(move |scope| scope.field(&name).cloned())
    }

    /// The contextual value bound at the evaluation site
    pub fn dollar() -> Self {
        Expr::new(|scope| scope.dollar().cloned())
    }

    pub fn eval(&self, scope: &Scope<'_>) -> Result<Value, ParseError> {
        (self.f)(scope)
    }

    pub fn eval_u64(&self, scope: &Scope<'_>) -> Result<u64, ParseError> {
        match self.eval(scope)? {
            Value::UInt(n) => Ok(n),
            other => Err(ParseError::new(format!(
                "expected an unsigned integer, got {:?}",
                other
            ))),
        }
    }

    pub fn eval_bool(&self, scope: &Scope<'_>) -> Result<bool, ParseError> {
        match self.eval(scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ParseError::new(format!(
                "expected a boolean, got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Expr(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_expr() {
        let e = Expr::uint(42);
        assert_eq!(e.eval_u64(&Scope::default()).unwrap(), 42);
    }

    #[test]
    fn test_field_expr_reads_unit() {
        let mut unit = UnitValue::new("Header");
        unit.set("length", Value::UInt(16));

        let scope = Scope {
            unit: Some(&unit),
            dollar: None,
        };
        assert_eq!(Expr::field("length").eval_u64(&scope).unwrap(), 16);
    }

    #[test]
    fn test_field_expr_missing_field_errors() {
        let unit = UnitValue::new("Header");
        let scope = Scope {
            unit: Some(&unit),
            dollar: None,
        };
        let err = Expr::field("length").eval(&scope).unwrap_err();
        assert!(err.message().contains("length"));
    }

    #[test]
    fn test_dollar_expr() {
        let item = Value::UInt(7);
        let scope = Scope {
            unit: None,
            dollar: Some(&item),
        };
        assert_eq!(Expr::dollar().eval(&scope).unwrap(), Value::UInt(7));
    }

    #[test]
    fn test_closure_expr_combines_scope() {
        let mut unit = UnitValue::new("Msg");
        unit.set("limit", Value::UInt(3));
        let item = Value::UInt(5);
        let scope = Scope {
            unit: Some(&unit),
            dollar: Some(&item),
        };

        let over_limit = Expr::new(|scope| {
            let limit = scope.field("limit")?.as_u64().unwrap_or(0);
            let item = scope.dollar()?.as_u64().unwrap_or(0);
            Ok(Value::Bool(item > limit))
        });
        assert_eq!(over_limit.eval_bool(&scope).unwrap(), true);
    }
}
