//! Grammars and grammar sets
//!
//! A `Grammar` describes one wire format: a root production plus named
//! symbols that `Forward` productions resolve against. A `GrammarSet`
//! bundles the grammars that may reference each other and is the input
//! to parser compilation.
//!
//! ## Design
//!
//! Building a set resolves everything that can be checked without running
//! a parser: every `Forward` must name a symbol of its own grammar, every
//! `Reference` must name a format in the set, and every distinct literal
//! pattern is assigned a stable `TokenId`. Token ids are what lookahead
//! first-sets and dispatch tables are computed over; two occurrences of
//! the same pattern anywhere in the set share an id.

pub mod production;

use std::collections::HashMap;

use crate::error::GrammarError;
pub use production::{
    BoxedFilter, Field, FieldAttributes, FilterFactory, LiteralPattern, LookAheadDefault,
    Production, Stop, StopKind, SwitchCase, UnitDef,
};

/// Identifies one distinct literal pattern within a grammar set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenId(u32);

impl TokenId {
    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// One wire format: a root production plus named symbols
#[derive(Debug, Clone)]
pub struct Grammar {
    name: String,
    root: Production,
    symbols: HashMap<String, Production>,
}

impl Grammar {
    pub fn new(name: impl Into<String>, root: Production) -> Self {
        Grammar {
            name: name.into(),
            root,
            symbols: HashMap::new(),
        }
    }

    /// Define a named symbol that `Forward` productions can target
    pub fn define(mut self, symbol: impl Into<String>, production: Production) -> Self {
        self.symbols.insert(symbol.into(), production);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Production {
        &self.root
    }

    pub fn symbol(&self, name: &str) -> Option<&Production> {
        self.symbols.get(name)
    }

    /// Every production of this grammar, for whole-grammar walks
    fn all_productions(&self) -> impl Iterator<Item = &Production> {
        std::iter::once(&self.root).chain(self.symbols.values())
    }
}

/// A validated collection of grammars with a shared token table
#[derive(Debug, Clone)]
pub struct GrammarSet {
    grammars: HashMap<String, Grammar>,
    tokens: Vec<LiteralPattern>,
    token_ids: HashMap<LiteralPattern, TokenId>,
}

impl GrammarSet {
    pub fn builder() -> GrammarSetBuilder {
        GrammarSetBuilder::new()
    }

    pub fn grammar(&self, name: &str) -> Option<&Grammar> {
        self.grammars.get(name)
    }

    /// The id assigned to a literal pattern, if it occurs in the set
    pub fn token_id(&self, pattern: &LiteralPattern) -> Option<TokenId> {
        self.token_ids.get(pattern).copied()
    }

    pub fn token_pattern(&self, id: TokenId) -> &LiteralPattern {
        &self.tokens[id.index()]
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Accumulates grammars and validates them into a `GrammarSet`
#[derive(Debug, Default)]
pub struct GrammarSetBuilder {
    grammars: Vec<Grammar>,
}

impl GrammarSetBuilder {
    pub fn new() -> Self {
        GrammarSetBuilder::default()
    }

    pub fn grammar(mut self, grammar: Grammar) -> Self {
        self.grammars.push(grammar);
        self
    }

    pub fn build(self) -> Result<GrammarSet, GrammarError> {
        let mut grammars: HashMap<String, Grammar> = HashMap::new();
        for g in self.grammars {
            if grammars.contains_key(g.name()) {
                return Err(GrammarError::DuplicateFormat(g.name().to_string()));
            }
            grammars.insert(g.name().to_string(), g);
        }

        // Assign token ids in a stable order so compiled parsers are
        // reproducible across runs.
        let mut names: Vec<&String> = grammars.keys().collect();
        names.sort();
        let mut tokens = Vec::new();
        let mut token_ids = HashMap::new();
        for name in &names {
            for p in grammars[*name].all_productions() {
                walk(p, &mut |p| {
                    if let Production::Literal(pat) = p {
                        if !token_ids.contains_key(pat) {
                            let id = TokenId(tokens.len() as u32);
                            tokens.push(pat.clone());
                            token_ids.insert(pat.clone(), id);
                        }
                    }
                });
            }
        }

        // Resolve forwards and references before anything runs.
        for name in &names {
            let g = &grammars[*name];
            let mut err = None;
            for p in g.all_productions() {
                walk(p, &mut |p| {
                    if err.is_some() {
                        return;
                    }
                    match p {
                        Production::Forward(sym) if g.symbol(sym).is_none() => {
                            err = Some(GrammarError::UnresolvedForward {
                                grammar: g.name().to_string(),
                                symbol: sym.clone(),
                            });
                        }
                        Production::Reference { format, .. } if !grammars.contains_key(format) => {
                            err = Some(GrammarError::UnknownFormat(format.clone()));
                        }
                        _ => {}
                    }
                });
            }
            if let Some(e) = err {
                return Err(e);
            }
        }

        Ok(GrammarSet {
            grammars,
            tokens,
            token_ids,
        })
    }
}

/// Visit `p` and every production nested inside it, parents first
///
/// Does not follow `Forward` or `Reference`; callers walking a whole set
/// visit each grammar's productions separately.
pub(crate) fn walk(p: &Production, f: &mut impl FnMut(&Production)) {
    f(p);
    match p {
        Production::Sequence(items) => {
            for item in items {
                walk(item, f);
            }
        }
        Production::Switch { cases, default, .. } => {
            for case in cases {
                walk(&case.body, f);
            }
            if let Some(d) = default {
                walk(d, f);
            }
        }
        Production::LookAhead { first, second, .. } => {
            walk(first, f);
            walk(second, f);
        }
        Production::Counter { body, .. } | Production::ForEach { body, .. } => {
            walk(body, f);
        }
        Production::Unit(unit) => {
            for field in &unit.fields {
                walk(&field.production, f);
            }
        }
        Production::Epsilon
        | Production::Literal(_)
        | Production::Reference { .. }
        | Production::Forward(_)
        | Production::Variable(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    #[test]
    fn test_build_assigns_shared_token_ids() {
        let g = Grammar::new(
            "A",
            Production::sequence(vec![
                Production::literal(b"hi".to_vec()),
                Production::literal(b"hi".to_vec()),
                Production::regex("[0-9]+"),
            ]),
        );
        let set = GrammarSet::builder().grammar(g).build().unwrap();
        assert_eq!(set.token_count(), 2);

        let hi = LiteralPattern::Bytes(b"hi".to_vec());
        let num = LiteralPattern::Regex("[0-9]+".to_string());
        assert!(set.token_id(&hi).is_some());
        assert_ne!(set.token_id(&hi), set.token_id(&num));
    }

    #[test]
    fn test_unresolved_forward_is_rejected() {
        let g = Grammar::new("A", Production::forward("missing"));
        let err = GrammarSet::builder().grammar(g).build().unwrap_err();
        assert_eq!(
            err,
            GrammarError::UnresolvedForward {
                grammar: "A".to_string(),
                symbol: "missing".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_reference_is_rejected() {
        let g = Grammar::new("A", Production::reference("B"));
        let err = GrammarSet::builder().grammar(g).build().unwrap_err();
        assert_eq!(err, GrammarError::UnknownFormat("B".to_string()));
    }

    #[test]
    fn test_cross_format_reference_resolves() {
        let a = Grammar::new("A", Production::reference("B"));
        let b = Grammar::new("B", Production::variable(ValueType::UInt8));
        assert!(GrammarSet::builder().grammar(a).grammar(b).build().is_ok());
    }

    #[test]
    fn test_duplicate_format_is_rejected() {
        let a1 = Grammar::new("A", Production::Epsilon);
        let a2 = Grammar::new("A", Production::Epsilon);
        let err = GrammarSet::builder().grammar(a1).grammar(a2).build().unwrap_err();
        assert_eq!(err, GrammarError::DuplicateFormat("A".to_string()));
    }

    #[test]
    fn test_walk_reaches_unit_fields() {
        let unit = UnitDef::new("U")
            .field(Field::new("x", Production::literal(b"x".to_vec())))
            .into_production();
        let mut literals = 0;
        walk(&unit, &mut |p| {
            if matches!(p, Production::Literal(_)) {
                literals += 1;
            }
        });
        assert_eq!(literals, 1);
    }
}
