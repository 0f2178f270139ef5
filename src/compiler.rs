//! Lowering grammars to executable routines
//!
//! Compilation turns each production into a flat list of `Step`s. One
//! routine exists per named symbol, per format root, and per structural
//! position that must run as its own resumable unit (lookahead
//! alternatives, switch cases, loop bodies, unit parsers). Routines are
//! memoized, so a symbol used from ten places compiles once.
//!
//! ## Design
//!
//! Units lower to a guarded entry routine that creates the unit instance
//! and runs the `%init` hook. Without a filter the entry routine parses
//! the fields itself; with one, it installs the filter and delegates the
//! fields to a second routine, so the filtered input scope is live for
//! exactly the field-parsing stage. The guard marks where failure
//! handling (the `%error` hook, scope cleanup) anchors during unwind.
//!
//! Field attributes never appear as steps of their own: `BeginField`
//! and `EndField` bracket the field's production and carry a `FieldPlan`
//! index describing redirection, size limits, conversion, and assertions.

use std::collections::HashMap;

use crate::error::GrammarError;
use crate::expr::Expr;
use crate::grammar::{
    FieldAttributes, FilterFactory, GrammarSet, LiteralPattern, Production, TokenId,
};
use crate::lookahead::{resolve_site, DispatchTable, FirstSets};
use crate::matcher::TokenMatcher;
use crate::value::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RoutineId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SiteId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnitId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LitId(pub(crate) usize);

/// One executable operation of a routine
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Match one literal token at the current position
    MatchLiteral { lit: LitId },
    /// Parse an atomic value via the value-type collaborator
    ParseValue { ty: ValueType },
    /// Run another routine, keeping its result
    Call {
        routine: RoutineId,
        /// Constructor arguments evaluated in the caller's scope and
        /// seeded into the first unit the callee creates
        args: Vec<(String, Expr)>,
    },
    /// Choose between two routines by lookahead token
    Dispatch { site: SiteId },
    /// Evaluate the selector and run the first case with a matching guard
    Switch {
        selector: Expr,
        cases: Vec<(Vec<Expr>, RoutineId)>,
        default: Option<RoutineId>,
    },
    /// Run the body a computed number of times
    Counter {
        count: Expr,
        body: RoutineId,
        container: Option<FieldId>,
    },
    /// Run the body until stopped or, if allowed, end-of-data
    ForEach {
        body: RoutineId,
        eod_ok: bool,
        container: Option<FieldId>,
    },
    /// Enter a field: apply redirection and size attributes
    BeginField { field: FieldId },
    /// Leave a field: size check, convert, requires, hook, store
    EndField { field: FieldId },
    /// Create the unit instance and run its `%init` hook
    InitUnit { unit: UnitId },
    /// Put the unit's input filter between the stream and its fields
    InstallFilter { unit: UnitId },
    /// Unit-level assertions, `%done` hook, filter disconnect
    Finalize { unit: UnitId },
}

/// A compiled routine: the steps of one resumable parsing unit
#[derive(Debug)]
pub(crate) struct Routine {
    pub(crate) name: String,
    /// Guarded routines anchor unit error handling during unwind
    pub(crate) guarded: bool,
    pub(crate) steps: Vec<Step>,
}

/// Everything the runtime needs about one lookahead site
#[derive(Debug)]
pub(crate) struct DispatchSite {
    pub(crate) table: DispatchTable,
    /// Joint DFA over the site's regex candidates, if any
    pub(crate) matcher: Option<TokenMatcher>,
    /// Byte-literal candidates, compared directly
    pub(crate) literals: Vec<(TokenId, Vec<u8>)>,
    pub(crate) alt1: RoutineId,
    pub(crate) alt2: RoutineId,
}

/// A literal as matched at parse time
#[derive(Debug)]
pub(crate) struct CompiledLiteral {
    pub(crate) token: TokenId,
    pub(crate) pattern: LiteralPattern,
    /// Present for regex literals
    pub(crate) matcher: Option<TokenMatcher>,
}

/// Per-field metadata used by `BeginField`/`EndField`
#[derive(Debug)]
pub(crate) struct FieldPlan {
    pub(crate) name: String,
    /// `Format.field`, for error locations
    pub(crate) location: String,
    pub(crate) attrs: FieldAttributes,
}

/// Per-unit metadata used by `InitUnit`/`Finalize`
#[derive(Debug)]
pub(crate) struct UnitPlan {
    pub(crate) name: String,
    pub(crate) filter: Option<FilterFactory>,
    pub(crate) requires: Vec<Expr>,
}

/// The compiled form of a grammar set, rooted at one format
#[derive(Debug)]
pub(crate) struct Program {
    pub(crate) routines: Vec<Routine>,
    pub(crate) sites: Vec<DispatchSite>,
    pub(crate) fields: Vec<FieldPlan>,
    pub(crate) units: Vec<UnitPlan>,
    pub(crate) literals: Vec<CompiledLiteral>,
    pub(crate) root: RoutineId,
    /// Whether any field parses at an absolute offset; such programs keep
    /// the whole input retained instead of trimming consumed bytes
    pub(crate) random_access: bool,
}

impl Program {
    pub(crate) fn routine(&self, id: RoutineId) -> &Routine {
        &self.routines[id.0]
    }

    pub(crate) fn site(&self, id: SiteId) -> &DispatchSite {
        &self.sites[id.0]
    }

    pub(crate) fn field(&self, id: FieldId) -> &FieldPlan {
        &self.fields[id.0]
    }

    pub(crate) fn unit(&self, id: UnitId) -> &UnitPlan {
        &self.units[id.0]
    }

    pub(crate) fn literal(&self, id: LitId) -> &CompiledLiteral {
        &self.literals[id.0]
    }
}

/// Compile the format `root` of `set` into an executable program
pub(crate) fn compile(set: &GrammarSet, root: &str) -> Result<Program, GrammarError> {
    let mut c = Compiler {
        set,
        firsts: FirstSets::new(set),
        routines: Vec::new(),
        sites: Vec::new(),
        fields: Vec::new(),
        units: Vec::new(),
        literals: Vec::new(),
        lit_ids: HashMap::new(),
        roots: HashMap::new(),
        symbols: HashMap::new(),
        random_access: false,
    };
    let root_id = c.format_root(root)?;
    Ok(Program {
        routines: c.routines,
        sites: c.sites,
        fields: c.fields,
        units: c.units,
        literals: c.literals,
        root: root_id,
        random_access: c.random_access,
    })
}

struct Compiler<'g> {
    set: &'g GrammarSet,
    firsts: FirstSets<'g>,
    routines: Vec<Routine>,
    sites: Vec<DispatchSite>,
    fields: Vec<FieldPlan>,
    units: Vec<UnitPlan>,
    literals: Vec<CompiledLiteral>,
    lit_ids: HashMap<TokenId, LitId>,
    roots: HashMap<String, RoutineId>,
    symbols: HashMap<(String, String), RoutineId>,
    random_access: bool,
}

impl<'g> Compiler<'g> {
    fn new_routine(&mut self, name: String, guarded: bool) -> RoutineId {
        let id = RoutineId(self.routines.len());
        self.routines.push(Routine {
            name,
            guarded,
            steps: Vec::new(),
        });
        id
    }

    /// Entry routine for a format's root production
    ///
    /// The id is registered before the body compiles so mutually
    /// referencing formats terminate.
    fn format_root(&mut self, name: &str) -> Result<RoutineId, GrammarError> {
        if let Some(&id) = self.roots.get(name) {
            return Ok(id);
        }
        let set = self.set;
        let grammar = set
            .grammar(name)
            .ok_or_else(|| GrammarError::MissingRoot(name.to_string()))?;
        let id = self.new_routine(format!("{}::__root", name), false);
        self.roots.insert(name.to_string(), id);
        let mut steps = Vec::new();
        self.lower(name, grammar.root(), &mut steps, None)?;
        self.routines[id.0].steps = steps;
        Ok(id)
    }

    fn symbol_routine(&mut self, grammar: &str, symbol: &str) -> Result<RoutineId, GrammarError> {
        let key = (grammar.to_string(), symbol.to_string());
        if let Some(&id) = self.symbols.get(&key) {
            return Ok(id);
        }
        let set = self.set;
        let target = set
            .grammar(grammar)
            .and_then(|g| g.symbol(symbol))
            .ok_or_else(|| GrammarError::UnresolvedForward {
                grammar: grammar.to_string(),
                symbol: symbol.to_string(),
            })?;
        let id = self.new_routine(format!("{}::{}", grammar, symbol), false);
        self.symbols.insert(key, id);
        let mut steps = Vec::new();
        self.lower(grammar, target, &mut steps, None)?;
        self.routines[id.0].steps = steps;
        Ok(id)
    }

    /// A routine holding just this production, for structural positions
    /// that must run as their own frame
    fn sub_routine(
        &mut self,
        grammar: &str,
        name: String,
        p: &Production,
    ) -> Result<RoutineId, GrammarError> {
        let id = self.new_routine(name, false);
        let mut steps = Vec::new();
        self.lower(grammar, p, &mut steps, None)?;
        self.routines[id.0].steps = steps;
        Ok(id)
    }

    fn lit_id(&mut self, pattern: &LiteralPattern) -> Result<LitId, GrammarError> {
        let token = self
            .set
            .token_id(pattern)
            .ok_or_else(|| GrammarError::InvalidPattern {
                pattern: pattern.to_string(),
                message: "pattern missing from the set's token table".to_string(),
            })?;
        if let Some(&id) = self.lit_ids.get(&token) {
            return Ok(id);
        }
        let matcher = match pattern {
            LiteralPattern::Regex(r) => Some(TokenMatcher::new(&[(token, r.clone())])?),
            LiteralPattern::Bytes(_) => None,
        };
        let id = LitId(self.literals.len());
        self.literals.push(CompiledLiteral {
            token,
            pattern: pattern.clone(),
            matcher,
        });
        self.lit_ids.insert(token, id);
        Ok(id)
    }

    fn lower(
        &mut self,
        grammar: &str,
        p: &Production,
        steps: &mut Vec<Step>,
        container: Option<FieldId>,
    ) -> Result<(), GrammarError> {
        match p {
            Production::Epsilon => {}
            Production::Literal(pattern) => {
                let lit = self.lit_id(pattern)?;
                steps.push(Step::MatchLiteral { lit });
            }
            Production::Variable(ty) => {
                steps.push(Step::ParseValue { ty: *ty });
            }
            Production::Sequence(items) => {
                for item in items {
                    self.lower(grammar, item, steps, None)?;
                }
            }
            Production::Switch {
                selector,
                cases,
                default,
            } => {
                let mut lowered = Vec::with_capacity(cases.len());
                for (i, case) in cases.iter().enumerate() {
                    let id = self.sub_routine(
                        grammar,
                        format!("{}::__case{}", grammar, i),
                        &case.body,
                    )?;
                    lowered.push((case.guards.clone(), id));
                }
                let default = match default {
                    Some(d) => Some(self.sub_routine(
                        grammar,
                        format!("{}::__case_default", grammar),
                        d,
                    )?),
                    None => None,
                };
                steps.push(Step::Switch {
                    selector: selector.clone(),
                    cases: lowered,
                    default,
                });
            }
            Production::LookAhead {
                first,
                second,
                default,
            } => {
                let table = resolve_site(&self.firsts, grammar, first, second, *default)?;
                let site = self.make_site(grammar, table, first, second)?;
                steps.push(Step::Dispatch { site });
            }
            Production::Counter { count, body } => {
                let body = self.sub_routine(grammar, format!("{}::__count_body", grammar), body)?;
                steps.push(Step::Counter {
                    count: count.clone(),
                    body,
                    container,
                });
            }
            Production::ForEach { body, eod_ok } => {
                let body = self.sub_routine(grammar, format!("{}::__each_body", grammar), body)?;
                steps.push(Step::ForEach {
                    body,
                    eod_ok: *eod_ok,
                    container,
                });
            }
            Production::Unit(unit) => {
                let routine = self.compile_unit(grammar, unit)?;
                steps.push(Step::Call {
                    routine,
                    args: Vec::new(),
                });
            }
            Production::Reference { format, args } => {
                let routine = self.format_root(format)?;
                steps.push(Step::Call {
                    routine,
                    args: args.clone(),
                });
            }
            Production::Forward(symbol) => {
                let routine = self.symbol_routine(grammar, symbol)?;
                steps.push(Step::Call {
                    routine,
                    args: Vec::new(),
                });
            }
        }
        Ok(())
    }

    fn make_site(
        &mut self,
        grammar: &str,
        table: DispatchTable,
        first: &Production,
        second: &Production,
    ) -> Result<SiteId, GrammarError> {
        let mut regexes = Vec::new();
        let mut literals = Vec::new();
        for token in table.candidates() {
            match self.set.token_pattern(token) {
                LiteralPattern::Regex(r) => regexes.push((token, r.clone())),
                LiteralPattern::Bytes(b) => literals.push((token, b.clone())),
            }
        }
        let matcher = if regexes.is_empty() {
            None
        } else {
            Some(TokenMatcher::new(&regexes)?)
        };
        let alt1 = self.sub_routine(grammar, format!("{}::__alt1", grammar), first)?;
        let alt2 = self.sub_routine(grammar, format!("{}::__alt2", grammar), second)?;
        let id = SiteId(self.sites.len());
        self.sites.push(DispatchSite {
            table,
            matcher,
            literals,
            alt1,
            alt2,
        });
        Ok(id)
    }

    fn compile_unit(
        &mut self,
        grammar: &str,
        unit: &crate::grammar::UnitDef,
    ) -> Result<RoutineId, GrammarError> {
        let unit_id = UnitId(self.units.len());
        self.units.push(UnitPlan {
            name: unit.name.clone(),
            filter: unit.filter.clone(),
            requires: unit.requires.clone(),
        });

        let entry = self.new_routine(format!("{}::__parse", unit.name), true);

        let mut body = Vec::new();
        for field in &unit.fields {
            if field.attrs.parse_at.is_some() {
                self.random_access = true;
            }
            let fid = FieldId(self.fields.len());
            self.fields.push(FieldPlan {
                name: field.name.clone(),
                location: format!("{}.{}", unit.name, field.name),
                attrs: field.attrs.clone(),
            });
            body.push(Step::BeginField { field: fid });
            let container = matches!(
                field.production,
                Production::Counter { .. } | Production::ForEach { .. }
            )
            .then_some(fid);
            self.lower(grammar, &field.production, &mut body, container)?;
            body.push(Step::EndField { field: fid });
        }
        body.push(Step::Finalize { unit: unit_id });

        if unit.filter.is_some() {
            let stage2 = self.new_routine(format!("{}::__parse_body", unit.name), false);
            self.routines[stage2.0].steps = body;
            self.routines[entry.0].steps = vec![
                Step::InitUnit { unit: unit_id },
                Step::InstallFilter { unit: unit_id },
                Step::Call {
                    routine: stage2,
                    args: Vec::new(),
                },
            ];
        } else {
            let mut steps = vec![Step::InitUnit { unit: unit_id }];
            steps.extend(body);
            self.routines[entry.0].steps = steps;
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{Field, Grammar, GrammarSet, LookAheadDefault, UnitDef};
    use crate::value::{Endian, ValueType};

    fn compile_root(root: Production) -> Program {
        let set = GrammarSet::builder()
            .grammar(Grammar::new("G", root))
            .build()
            .unwrap();
        compile(&set, "G").unwrap()
    }

    #[test]
    fn test_sequence_lowers_flat() {
        let program = compile_root(Production::sequence(vec![
            Production::literal(b"a".to_vec()),
            Production::variable(ValueType::UInt16(Endian::Big)),
        ]));
        let root = program.routine(program.root);
        assert_eq!(root.steps.len(), 2);
        assert!(matches!(root.steps[0], Step::MatchLiteral { .. }));
        assert!(matches!(root.steps[1], Step::ParseValue { .. }));
    }

    #[test]
    fn test_unit_lowers_to_guarded_entry() {
        let unit = UnitDef::new("U")
            .field(Field::new("x", Production::variable(ValueType::UInt8)))
            .into_production();
        let program = compile_root(unit);
        // Root wrapper calls the unit entry.
        let root = program.routine(program.root);
        let Step::Call { routine, .. } = &root.steps[0] else {
            panic!("expected a call step");
        };
        let entry = program.routine(*routine);
        assert!(entry.guarded);
        assert!(matches!(entry.steps[0], Step::InitUnit { .. }));
        assert!(matches!(entry.steps.last(), Some(Step::Finalize { .. })));
    }

    #[test]
    fn test_filtered_unit_splits_stages() {
        use crate::grammar::FilterFactory;
        let unit = UnitDef::new("U")
            .filter(FilterFactory::new(|| {
                Box::new(|chunk: &[u8], _| Ok(chunk.to_vec()))
            }))
            .field(Field::new("x", Production::variable(ValueType::UInt8)))
            .into_production();
        let program = compile_root(unit);
        let root = program.routine(program.root);
        let Step::Call { routine, .. } = &root.steps[0] else {
            panic!("expected a call step");
        };
        let entry = program.routine(*routine);
        assert_eq!(entry.steps.len(), 3);
        assert!(matches!(entry.steps[1], Step::InstallFilter { .. }));
        let Step::Call { routine: stage2, .. } = &entry.steps[2] else {
            panic!("expected stage delegation");
        };
        assert!(!program.routine(*stage2).guarded);
    }

    #[test]
    fn test_shared_symbol_compiles_once() {
        let g = Grammar::new(
            "G",
            Production::sequence(vec![Production::forward("x"), Production::forward("x")]),
        )
        .define("x", Production::literal(b"x".to_vec()));
        let set = GrammarSet::builder().grammar(g).build().unwrap();
        let program = compile(&set, "G").unwrap();
        let root = program.routine(program.root);
        let (Step::Call { routine: a, .. }, Step::Call { routine: b, .. }) =
            (&root.steps[0], &root.steps[1])
        else {
            panic!("expected two calls");
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_lookahead_site_splits_candidates() {
        let program = compile_root(Production::look_ahead(
            Production::literal(b"GET".to_vec()),
            Production::regex("[0-9]+"),
            LookAheadDefault::None,
        ));
        assert_eq!(program.sites.len(), 1);
        let site = &program.sites[0];
        assert_eq!(site.literals.len(), 1);
        assert!(site.matcher.is_some());
    }

    #[test]
    fn test_loop_field_is_its_container() {
        let unit = UnitDef::new("U")
            .field(
                Field::new(
                    "items",
                    Production::for_each(Production::variable(ValueType::UInt8), true),
                )
                .until(Expr::new(|s| {
                    Ok(crate::value::Value::Bool(s.dollar()?.as_u64() == Some(0)))
                })),
            )
            .into_production();
        let program = compile_root(unit);
        let mut found = false;
        for routine in &program.routines {
            for step in &routine.steps {
                if let Step::ForEach { container, .. } = step {
                    assert!(container.is_some());
                    found = true;
                }
            }
        }
        assert!(found);
    }

    #[test]
    fn test_parse_at_field_marks_random_access() {
        let unit = UnitDef::new("U")
            .field(Field::new("a", Production::variable(ValueType::UInt8)))
            .field(
                Field::new("p", Production::variable(ValueType::UInt8)).parse_at(Expr::uint(0)),
            )
            .into_production();
        let program = compile_root(unit);
        assert!(program.random_access);

        let plain = compile_root(Production::variable(ValueType::UInt8));
        assert!(!plain.random_access);
    }

    #[test]
    fn test_ambiguous_lookahead_fails_compilation() {
        let set = GrammarSet::builder()
            .grammar(Grammar::new(
                "G",
                Production::look_ahead(
                    Production::literal(b"a".to_vec()),
                    Production::literal(b"a".to_vec()),
                    LookAheadDefault::None,
                ),
            ))
            .build()
            .unwrap();
        let err = compile(&set, "G").unwrap_err();
        assert!(matches!(err, GrammarError::AmbiguousAlternatives { .. }));
    }

    #[test]
    fn test_missing_root_format() {
        let set = GrammarSet::builder()
            .grammar(Grammar::new("G", Production::Epsilon))
            .build()
            .unwrap();
        assert!(matches!(
            compile(&set, "Nope").unwrap_err(),
            GrammarError::MissingRoot(_)
        ));
    }
}
