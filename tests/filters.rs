//! Unit input filters
//!
//! A filtered unit parses the output of a byte transformer instead of the
//! raw stream; the transformer is fed upstream bytes as they arrive, so
//! filtering composes with incremental parsing.

use wireform::{
    Field, FilterFactory, Grammar, GrammarSet, NoHooks, ParseStatus, Parser, Production,
    StreamBuffer, UnitDef, Value, ValueType,
};

fn compile(grammar: Grammar) -> Parser {
    let name = grammar.name().to_string();
    let set = GrammarSet::builder().grammar(grammar).build().unwrap();
    Parser::compile(&set, &name).unwrap()
}

/// Flips ASCII case byte-by-byte
fn case_flip() -> FilterFactory {
    FilterFactory::new(|| {
        Box::new(|chunk: &[u8], _final_chunk| {
            Ok(chunk
                .iter()
                .map(|b| {
                    if b.is_ascii_alphabetic() {
                        b ^ 0x20
                    } else {
                        *b
                    }
                })
                .collect())
        })
    })
}

fn filtered_parser() -> Parser {
    let inner = UnitDef::new("Word")
        .filter(case_flip())
        .field(Field::new("text", Production::literal(b"hi".to_vec())))
        .field(Field::new("n", Production::variable(ValueType::UInt8)))
        .into_production();
    let outer = UnitDef::new("Framed")
        .field(Field::new("mark", Production::literal(b"A".to_vec())))
        .field(Field::new("word", inner))
        .into_production();
    compile(Grammar::new("Framed", outer))
}

#[test]
fn test_fields_parse_filtered_bytes() {
    let parser = filtered_parser();
    let mut buf = StreamBuffer::frozen(b"AHI\x07".to_vec());
    let parsed = parser.parse(&mut buf, &mut NoHooks).unwrap();

    let framed = parsed.value().as_unit().unwrap();
    let word = framed.get("word").and_then(|v| v.as_unit()).unwrap();
    assert_eq!(word.get("text"), Some(&Value::Bytes(b"hi".to_vec())));
    assert_eq!(word.get("n"), Some(&Value::UInt(7)));
    // The parent position accounts for all upstream bytes the filter ate.
    assert_eq!(parsed.remaining().begin, 4);
}

#[test]
fn test_filter_pumps_incrementally() {
    let parser = filtered_parser();
    let mut buf = StreamBuffer::new();
    let mut run = parser.begin();

    buf.append(b"A");
    assert!(matches!(
        run.feed(&mut buf, &mut NoHooks).unwrap(),
        ParseStatus::Suspended
    ));

    buf.append(b"H");
    assert!(matches!(
        run.feed(&mut buf, &mut NoHooks).unwrap(),
        ParseStatus::Suspended
    ));

    buf.append(b"I\x09");
    buf.freeze();
    let ParseStatus::Done(parsed) = run.feed(&mut buf, &mut NoHooks).unwrap() else {
        panic!("expected completion");
    };
    let word = parsed
        .value()
        .as_unit()
        .unwrap()
        .get("word")
        .and_then(|v| v.as_unit())
        .unwrap();
    assert_eq!(word.get("text"), Some(&Value::Bytes(b"hi".to_vec())));
    assert_eq!(word.get("n"), Some(&Value::UInt(9)));
}

#[test]
fn test_expanding_filter_output() {
    // The filtered view can be longer than its upstream input.
    let doubler = FilterFactory::new(|| {
        Box::new(|chunk: &[u8], _| {
            let mut out = Vec::with_capacity(chunk.len() * 2);
            for &b in chunk {
                out.push(b);
                out.push(b);
            }
            Ok(out)
        })
    });
    let unit = UnitDef::new("Echo")
        .filter(doubler)
        .field(Field::new("data", Production::variable(ValueType::Bytes(4))))
        .into_production();
    let parser = compile(Grammar::new("Echo", unit));

    let mut buf = StreamBuffer::frozen(b"ab".to_vec());
    let parsed = parser.parse(&mut buf, &mut NoHooks).unwrap();
    assert_eq!(
        parsed.value().as_unit().unwrap().get("data"),
        Some(&Value::Bytes(b"aabb".to_vec()))
    );
}

#[test]
fn test_filter_error_fails_the_parse() {
    let strict = FilterFactory::new(|| {
        Box::new(|chunk: &[u8], _| {
            if chunk.contains(&0xff) {
                Err(wireform::ParseError::new("invalid byte in filtered input"))
            } else {
                Ok(chunk.to_vec())
            }
        })
    });
    let unit = UnitDef::new("Strict")
        .filter(strict)
        .field(Field::new("b", Production::variable(ValueType::UInt8)))
        .into_production();
    let parser = compile(Grammar::new("Strict", unit));

    let mut buf = StreamBuffer::frozen(vec![0xff]);
    let err = parser.parse(&mut buf, &mut NoHooks).unwrap_err();
    assert_eq!(err.message(), "invalid byte in filtered input");
}
