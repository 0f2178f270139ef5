//! Lookahead-driven alternative selection
//!
//! Alternatives are chosen by scanning for literal tokens at the current
//! position; the longest match wins and the token is then consumed by the
//! chosen alternative without rescanning.

use wireform::{
    Field, Grammar, GrammarSet, LookAheadDefault, NoHooks, Parser, Production, StreamBuffer,
    UnitDef, Value,
};

fn compile(grammar: Grammar) -> Parser {
    let name = grammar.name().to_string();
    let set = GrammarSet::builder().grammar(grammar).build().unwrap();
    Parser::compile(&set, &name).unwrap()
}

fn choice_parser() -> Parser {
    let unit = UnitDef::new("Req")
        .field(Field::new(
            "start",
            Production::look_ahead(
                Production::literal(b"GET".to_vec()),
                Production::regex("[a-z]+"),
                LookAheadDefault::None,
            ),
        ))
        .into_production();
    compile(Grammar::new("Req", unit))
}

#[test]
fn test_byte_literal_candidate_wins() {
    let parser = choice_parser();
    let mut buf = StreamBuffer::frozen(b"GET".to_vec());
    let parsed = parser.parse(&mut buf, &mut NoHooks).unwrap();
    assert_eq!(
        parsed.value().as_unit().unwrap().get("start"),
        Some(&Value::Bytes(b"GET".to_vec()))
    );
}

#[test]
fn test_regex_candidate_wins() {
    let parser = choice_parser();
    let mut buf = StreamBuffer::frozen(b"fetch".to_vec());
    let parsed = parser.parse(&mut buf, &mut NoHooks).unwrap();
    assert_eq!(
        parsed.value().as_unit().unwrap().get("start"),
        Some(&Value::Bytes(b"fetch".to_vec()))
    );
}

#[test]
fn test_no_candidate_matches() {
    let parser = choice_parser();
    let mut buf = StreamBuffer::frozen(b"404".to_vec());
    let err = parser.parse(&mut buf, &mut NoHooks).unwrap_err();
    assert_eq!(err.message(), "no expected look-ahead token found");
    assert_eq!(err.location(), Some("Req.start"));
}

#[test]
fn test_end_of_data_without_epsilon_alternative() {
    let parser = choice_parser();
    let mut buf = StreamBuffer::frozen(Vec::new());
    let err = parser.parse(&mut buf, &mut NoHooks).unwrap_err();
    assert_eq!(
        err.message(),
        "expected look-ahead token, but reached end-of-data"
    );
}

#[test]
fn test_epsilon_alternative_taken_at_end_of_data() {
    let unit = UnitDef::new("Opt")
        .field(Field::new(
            "marker",
            Production::look_ahead(
                Production::literal(b"!".to_vec()),
                Production::Epsilon,
                LookAheadDefault::None,
            ),
        ))
        .into_production();
    let parser = compile(Grammar::new("Opt", unit));

    let mut buf = StreamBuffer::frozen(b"!".to_vec());
    let parsed = parser.parse(&mut buf, &mut NoHooks).unwrap();
    assert_eq!(
        parsed.value().as_unit().unwrap().get("marker"),
        Some(&Value::Bytes(b"!".to_vec()))
    );

    let mut empty = StreamBuffer::frozen(Vec::new());
    let parsed = parser.parse(&mut empty, &mut NoHooks).unwrap();
    assert_eq!(parsed.value().as_unit().unwrap().get("marker"), None);
}

#[test]
fn test_unmatched_token_rejected_despite_epsilon_alternative() {
    let unit = UnitDef::new("Opt")
        .field(Field::new(
            "marker",
            Production::look_ahead(
                Production::literal(b"!".to_vec()),
                Production::Epsilon,
                LookAheadDefault::None,
            ),
        ))
        .into_production();
    let parser = compile(Grammar::new("Opt", unit));

    // The empty alternative admits only end-of-data; a foreign byte is
    // still a parse error.
    let mut buf = StreamBuffer::frozen(b"x".to_vec());
    let err = parser.parse(&mut buf, &mut NoHooks).unwrap_err();
    assert_eq!(err.message(), "no expected look-ahead token found");
    assert_eq!(err.location(), Some("Opt.marker"));
}

#[test]
fn test_runtime_ambiguity_between_regex_candidates() {
    // Statically fine (distinct tokens), but on this input both regexes
    // produce an equally long match.
    let unit = UnitDef::new("Num")
        .field(Field::new(
            "n",
            Production::look_ahead(
                Production::regex("[0-9]+x"),
                Production::regex("[0-9][0-9]x"),
                LookAheadDefault::None,
            ),
        ))
        .into_production();
    let parser = compile(Grammar::new("Num", unit));

    let mut buf = StreamBuffer::frozen(b"12x".to_vec());
    let err = parser.parse(&mut buf, &mut NoHooks).unwrap_err();
    assert_eq!(err.message(), "ambiguous look-ahead token match");
}

#[test]
fn test_longest_match_disambiguates_prefix_literals() {
    let unit = UnitDef::new("Verb")
        .field(Field::new(
            "v",
            Production::look_ahead(
                Production::literal(b"PUT".to_vec()),
                Production::literal(b"PUTX".to_vec()),
                LookAheadDefault::None,
            ),
        ))
        .into_production();
    let parser = compile(Grammar::new("Verb", unit));

    let mut buf = StreamBuffer::frozen(b"PUTX".to_vec());
    let parsed = parser.parse(&mut buf, &mut NoHooks).unwrap();
    assert_eq!(
        parsed.value().as_unit().unwrap().get("v"),
        Some(&Value::Bytes(b"PUTX".to_vec()))
    );

    let mut buf = StreamBuffer::frozen(b"PUT ".to_vec());
    let parsed = parser.parse(&mut buf, &mut NoHooks).unwrap();
    assert_eq!(
        parsed.value().as_unit().unwrap().get("v"),
        Some(&Value::Bytes(b"PUT".to_vec()))
    );
}

#[test]
fn test_lookahead_suspends_until_decidable() {
    let parser = choice_parser();
    let mut buf = StreamBuffer::new();
    let mut run = parser.begin();

    // "GE" could still become "GET" or stay a prefix of nothing useful.
    buf.append(b"GE");
    assert!(matches!(
        run.feed(&mut buf, &mut NoHooks).unwrap(),
        wireform::ParseStatus::Suspended
    ));

    buf.append(b"T");
    buf.freeze();
    let wireform::ParseStatus::Done(parsed) = run.feed(&mut buf, &mut NoHooks).unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(
        parsed.value().as_unit().unwrap().get("start"),
        Some(&Value::Bytes(b"GET".to_vec()))
    );
}

#[test]
fn test_static_ambiguity_rejected_at_compile_time() {
    let set = GrammarSet::builder()
        .grammar(Grammar::new(
            "G",
            Production::look_ahead(
                Production::literal(b"a".to_vec()),
                Production::sequence(vec![
                    Production::literal(b"a".to_vec()),
                    Production::literal(b"b".to_vec()),
                ]),
                LookAheadDefault::None,
            ),
        ))
        .build()
        .unwrap();
    assert!(Parser::compile(&set, "G").is_err());
}
