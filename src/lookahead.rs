//! First-set computation and lookahead dispatch tables
//!
//! A `LookAhead` production chooses between two alternatives by inspecting
//! which literal token comes next in the input, without consuming it. That
//! only works if the two alternatives can be told apart by their possible
//! starting tokens, so compilation computes a *first set* for each
//! alternative: the set of token ids that can begin it, whether it can
//! match empty input, and whether it can start with something no literal
//! token identifies (an atomic variable, or a filtered unit whose raw
//! bytes differ from what its fields see).
//!
//! ## Design
//!
//! First sets are computed on demand and memoized per named symbol and
//! per format root. A symbol re-entered during its own computation (a
//! cyclic grammar) contributes an empty, non-nullable set on the inner
//! visit; genuinely left-recursive alternatives therefore surface as
//! "no identifiable starting token" errors instead of looping.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::GrammarError;
use crate::grammar::{GrammarSet, LookAheadDefault, Production, TokenId};

/// The possible beginnings of a production
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirstSet {
    /// Literal tokens that can start the production
    pub tokens: BTreeSet<TokenId>,
    /// Whether the production can match empty input
    pub nullable: bool,
    /// Whether the production can start with non-literal input
    pub opaque: bool,
}

impl FirstSet {
    fn epsilon() -> Self {
        FirstSet {
            nullable: true,
            ..FirstSet::default()
        }
    }

    fn token(id: TokenId) -> Self {
        let mut tokens = BTreeSet::new();
        tokens.insert(id);
        FirstSet {
            tokens,
            ..FirstSet::default()
        }
    }

    fn opaque() -> Self {
        FirstSet {
            opaque: true,
            ..FirstSet::default()
        }
    }

    fn merge(&mut self, other: &FirstSet) {
        self.tokens.extend(other.tokens.iter().copied());
        self.opaque |= other.opaque;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SymbolKey {
    Root(String),
    Symbol(String, String),
}

/// Memoized first-set computation over one grammar set
pub struct FirstSets<'g> {
    set: &'g GrammarSet,
    memo: RefCell<HashMap<SymbolKey, FirstSet>>,
    active: RefCell<HashSet<SymbolKey>>,
}

impl<'g> FirstSets<'g> {
    pub fn new(set: &'g GrammarSet) -> Self {
        FirstSets {
            set,
            memo: RefCell::new(HashMap::new()),
            active: RefCell::new(HashSet::new()),
        }
    }

    /// The first set of `p` as it occurs within grammar `grammar`
    pub fn first_of(&self, grammar: &str, p: &Production) -> FirstSet {
        match p {
            Production::Epsilon => FirstSet::epsilon(),
            Production::Literal(pat) => match self.set.token_id(pat) {
                Some(id) => FirstSet::token(id),
                // Unreachable for patterns that came from this set
                None => FirstSet::opaque(),
            },
            Production::Variable(_) => FirstSet::opaque(),
            Production::Sequence(items) => self.first_of_sequence(grammar, items.iter()),
            Production::Switch { cases, default, .. } => {
                let mut out = FirstSet::default();
                for case in cases {
                    let fs = self.first_of(grammar, &case.body);
                    out.nullable |= fs.nullable;
                    out.merge(&fs);
                }
                match default {
                    Some(d) => {
                        let fs = self.first_of(grammar, d);
                        out.nullable |= fs.nullable;
                        out.merge(&fs);
                    }
                    // Without a default the switch can still fail, but it
                    // can never match empty unless a case can.
                    None => {}
                }
                out
            }
            Production::LookAhead { first, second, .. } => {
                let a = self.first_of(grammar, first);
                let b = self.first_of(grammar, second);
                let mut out = a.clone();
                out.merge(&b);
                out.nullable = a.nullable || b.nullable;
                out
            }
            Production::Counter { body, .. } | Production::ForEach { body, .. } => {
                // Zero iterations are possible, so loops are nullable.
                let mut out = self.first_of(grammar, body);
                out.nullable = true;
                out
            }
            Production::Unit(unit) => {
                if unit.filter.is_some() {
                    // The raw stream bytes are not what the fields parse.
                    return FirstSet::opaque();
                }
                let consuming = unit.fields.iter().filter_map(|f| {
                    if f.attrs.parse_from.is_some() || f.attrs.parse_at.is_some() {
                        None
                    } else {
                        Some(&f.production)
                    }
                });
                self.first_of_sequence(grammar, consuming)
            }
            Production::Forward(sym) => self.cached(
                SymbolKey::Symbol(grammar.to_string(), sym.clone()),
                |this| match this.set.grammar(grammar).and_then(|g| g.symbol(sym)) {
                    Some(target) => this.first_of(grammar, target),
                    None => FirstSet::opaque(),
                },
            ),
            Production::Reference { format, .. } => self.cached(
                SymbolKey::Root(format.clone()),
                |this| match this.set.grammar(format) {
                    Some(g) => this.first_of(format, g.root()),
                    None => FirstSet::opaque(),
                },
            ),
        }
    }

    fn first_of_sequence<'a>(
        &self,
        grammar: &str,
        items: impl Iterator<Item = &'a Production>,
    ) -> FirstSet {
        let mut out = FirstSet::epsilon();
        for item in items {
            let fs = self.first_of(grammar, item);
            out.merge(&fs);
            if !fs.nullable {
                out.nullable = false;
                break;
            }
        }
        out
    }

    fn cached(&self, key: SymbolKey, compute: impl FnOnce(&Self) -> FirstSet) -> FirstSet {
        if let Some(fs) = self.memo.borrow().get(&key) {
            return fs.clone();
        }
        if !self.active.borrow_mut().insert(key.clone()) {
            // Cycle: the inner visit contributes nothing.
            return FirstSet::default();
        }
        let fs = compute(self);
        self.active.borrow_mut().remove(&key);
        self.memo.borrow_mut().insert(key, fs.clone());
        fs
    }
}

/// Which alternative of a lookahead site to take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alt {
    First,
    Second,
}

/// The compiled decision table of one lookahead site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    pub tokens1: BTreeSet<TokenId>,
    pub tokens2: BTreeSet<TokenId>,
    /// Alternative taken when no candidate token matches
    pub none_goes: Option<Alt>,
    /// Alternative taken on end-of-data
    pub eod_goes: Option<Alt>,
}

impl DispatchTable {
    pub fn candidates(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.tokens1.iter().chain(self.tokens2.iter()).copied()
    }

    pub fn alternative_for(&self, token: TokenId) -> Option<Alt> {
        if self.tokens1.contains(&token) {
            Some(Alt::First)
        } else if self.tokens2.contains(&token) {
            Some(Alt::Second)
        } else {
            None
        }
    }
}

/// Whether a production is structurally empty
fn is_epsilon(p: &Production) -> bool {
    match p {
        Production::Epsilon => true,
        Production::Sequence(items) => items.iter().all(is_epsilon),
        _ => false,
    }
}

/// Build the dispatch table for one lookahead site, or reject the grammar
pub fn resolve_site(
    firsts: &FirstSets<'_>,
    grammar: &str,
    first: &Production,
    second: &Production,
    default: LookAheadDefault,
) -> Result<DispatchTable, GrammarError> {
    let fs1 = firsts.first_of(grammar, first);
    let fs2 = firsts.first_of(grammar, second);

    for (fs, which) in [(&fs1, "first"), (&fs2, "second")] {
        if fs.opaque {
            return Err(GrammarError::UnresolvableLookahead {
                grammar: grammar.to_string(),
                detail: format!(
                    "{} alternative can start with non-literal input",
                    which
                ),
            });
        }
        if fs.tokens.is_empty() && !fs.nullable {
            return Err(GrammarError::UnresolvableLookahead {
                grammar: grammar.to_string(),
                detail: format!("{} alternative has no identifiable starting token", which),
            });
        }
    }

    if fs1.nullable && fs2.nullable {
        return Err(GrammarError::AmbiguousAlternatives {
            grammar: grammar.to_string(),
            detail: "both alternatives can match empty input".to_string(),
        });
    }

    let common: Vec<TokenId> = fs1.tokens.intersection(&fs2.tokens).copied().collect();
    if !common.is_empty() {
        return Err(GrammarError::AmbiguousAlternatives {
            grammar: grammar.to_string(),
            detail: format!(
                "both alternatives can start with token {}",
                common[0]
            ),
        });
    }

    // Without an explicit default, a non-matching token is a parse error
    // even when an alternative is nullable; the nullable alternative only
    // admits end-of-data, below.
    let none_goes = match default {
        LookAheadDefault::First => Some(Alt::First),
        LookAheadDefault::Second => Some(Alt::Second),
        LookAheadDefault::None => None,
    };

    // Only a structurally empty alternative accepts end-of-data: it parses
    // nothing, so "no more input" completes it.
    let eod_goes = if is_epsilon(first) {
        Some(Alt::First)
    } else if is_epsilon(second) {
        Some(Alt::Second)
    } else {
        None
    };

    Ok(DispatchTable {
        tokens1: fs1.tokens,
        tokens2: fs2.tokens,
        none_goes,
        eod_goes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{Grammar, GrammarSet, LiteralPattern};
    use crate::value::ValueType;

    fn set_with_root(root: Production) -> GrammarSet {
        GrammarSet::builder()
            .grammar(Grammar::new("G", root))
            .build()
            .unwrap()
    }

    #[test]
    fn test_literal_first_set() {
        let set = set_with_root(Production::literal(b"GET".to_vec()));
        let firsts = FirstSets::new(&set);
        let fs = firsts.first_of("G", set.grammar("G").unwrap().root());
        assert_eq!(fs.tokens.len(), 1);
        assert!(!fs.nullable);
        assert!(!fs.opaque);
    }

    #[test]
    fn test_sequence_accumulates_through_nullable_head() {
        let root = Production::sequence(vec![
            Production::for_each(Production::literal(b"a".to_vec()), true),
            Production::literal(b"b".to_vec()),
        ]);
        let set = set_with_root(root);
        let firsts = FirstSets::new(&set);
        let fs = firsts.first_of("G", set.grammar("G").unwrap().root());
        // Both "a" (loop body) and "b" (after zero iterations) can start it.
        assert_eq!(fs.tokens.len(), 2);
        assert!(!fs.nullable);
    }

    #[test]
    fn test_variable_is_opaque() {
        let set = set_with_root(Production::variable(ValueType::UInt8));
        let firsts = FirstSets::new(&set);
        let fs = firsts.first_of("G", set.grammar("G").unwrap().root());
        assert!(fs.opaque);
    }

    #[test]
    fn test_cyclic_forward_terminates() {
        let g = Grammar::new("G", Production::forward("x"))
            .define(
                "x",
                Production::sequence(vec![
                    Production::forward("x"),
                    Production::literal(b"a".to_vec()),
                ]),
            );
        let set = GrammarSet::builder().grammar(g).build().unwrap();
        let firsts = FirstSets::new(&set);
        let fs = firsts.first_of("G", set.grammar("G").unwrap().root());
        // The left-recursive head contributes nothing and blocks the tail.
        assert!(fs.tokens.is_empty());
        assert!(!fs.nullable);
    }

    #[test]
    fn test_resolve_site_disjoint_tokens() {
        let a = Production::literal(b"a".to_vec());
        let b = Production::literal(b"b".to_vec());
        let set = set_with_root(Production::look_ahead(
            a.clone(),
            b.clone(),
            LookAheadDefault::None,
        ));
        let firsts = FirstSets::new(&set);
        let table = resolve_site(&firsts, "G", &a, &b, LookAheadDefault::None).unwrap();
        assert_eq!(table.tokens1.len(), 1);
        assert_eq!(table.tokens2.len(), 1);
        assert_eq!(table.none_goes, None);
        assert_eq!(table.eod_goes, None);
    }

    #[test]
    fn test_resolve_site_rejects_shared_token() {
        let a = Production::literal(b"a".to_vec());
        let set = set_with_root(Production::look_ahead(
            a.clone(),
            a.clone(),
            LookAheadDefault::None,
        ));
        let firsts = FirstSets::new(&set);
        let err = resolve_site(&firsts, "G", &a, &a, LookAheadDefault::None).unwrap_err();
        assert!(matches!(err, GrammarError::AmbiguousAlternatives { .. }));
    }

    #[test]
    fn test_resolve_site_rejects_opaque_alternative() {
        let a = Production::literal(b"a".to_vec());
        let v = Production::variable(ValueType::UInt8);
        let set = set_with_root(Production::sequence(vec![a.clone(), v.clone()]));
        let firsts = FirstSets::new(&set);
        let err = resolve_site(&firsts, "G", &a, &v, LookAheadDefault::None).unwrap_err();
        assert!(matches!(err, GrammarError::UnresolvableLookahead { .. }));
    }

    #[test]
    fn test_epsilon_alternative_admits_only_eod() {
        let a = Production::literal(b"a".to_vec());
        let eps = Production::Epsilon;
        let set = set_with_root(Production::look_ahead(
            a.clone(),
            eps.clone(),
            LookAheadDefault::None,
        ));
        let firsts = FirstSets::new(&set);
        let table = resolve_site(&firsts, "G", &a, &eps, LookAheadDefault::None).unwrap();
        // A foreign token is still an error; only end-of-data picks the
        // empty alternative.
        assert_eq!(table.none_goes, None);
        assert_eq!(table.eod_goes, Some(Alt::Second));
    }

    #[test]
    fn test_filtered_unit_is_opaque() {
        use crate::grammar::{FilterFactory, UnitDef};
        let unit = UnitDef::new("U")
            .filter(FilterFactory::new(|| Box::new(|chunk: &[u8], _| Ok(chunk.to_vec()))))
            .into_production();
        let set = set_with_root(unit);
        let firsts = FirstSets::new(&set);
        let fs = firsts.first_of("G", set.grammar("G").unwrap().root());
        assert!(fs.opaque);
    }

    #[test]
    fn test_token_ids_shared_across_occurrences() {
        let pat = LiteralPattern::Bytes(b"x".to_vec());
        let set = set_with_root(Production::sequence(vec![
            Production::literal(b"x".to_vec()),
            Production::literal(b"x".to_vec()),
        ]));
        assert!(set.token_id(&pat).is_some());
        assert_eq!(set.token_count(), 1);
    }
}
