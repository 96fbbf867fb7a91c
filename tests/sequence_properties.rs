use proptest::prelude::*;
use serde_json::{json, Value};

use tokenmap::grammar::Constraint;
use tokenmap::sequencer::SequenceType;
use tokenmap::{
    compile_sequence, parse_grammar, QueryInterpreter, SqlInterpreter, Token, TokenFactory,
    TokenParser, TokenSequencer,
};

fn identifier() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-z0-9_]{0,10}").unwrap()
}

fn literal() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
        Just(Value::Null),
    ]
}

proptest! {
    #[test]
    fn created_values_keep_their_literal(value in literal()) {
        let token = TokenFactory.create("value", Some(value.clone()), None).unwrap();
        let is_value = matches!(token, Token::Value { .. });
        prop_assert!(is_value);
        prop_assert_eq!(token.value(), Some(&value));
    }

    #[test]
    fn an_alias_always_makes_a_reference(name in identifier(), alias in identifier()) {
        let token = TokenFactory.create("field", Some(json!(name.clone())), Some(&alias)).unwrap();
        prop_assert_eq!(token, TokenFactory.reference("field", &name, &alias));
    }

    #[test]
    fn limits_must_be_positive(limit in any::<i64>(), offset in proptest::option::of(0i64..1000)) {
        let mut sequence = TokenSequencer::for_collection(SequenceType::Find, "orders");
        let result = sequence.limit(limit, offset).map(|sequence| sequence.len());
        if limit <= 0 {
            prop_assert!(result.is_err());
        } else {
            let expected = if offset.is_some() { 4 } else { 2 };
            prop_assert_eq!(result.unwrap(), expected);
        }
    }

    #[test]
    fn repeated_constraints_match_any_count(count in 0usize..8) {
        let parser = parse_grammar("numbers = open int* close ;").unwrap();
        let mut tokens = vec![TokenFactory.tag("open")];
        for n in 0..count {
            tokens.push(TokenFactory.value("int", json!(n)).unwrap());
        }
        tokens.push(TokenFactory.tag("close"));
        prop_assert!(parser.parse_tokens("numbers", &tokens).is_ok());
    }

    #[test]
    fn equality_filters_become_parameters(field in identifier(), value in any::<i64>()) {
        let mut sequence = TokenSequencer::for_collection(SequenceType::Find, "orders");
        sequence.where_().reference(&field).op("=").val(value).unwrap();
        TokenParser::with_default_grammar()
            .unwrap()
            .parse_token_sequence(&sequence)
            .unwrap();

        let compiled = SqlInterpreter::default()
            .interpret(&compile_sequence(&sequence).unwrap())
            .unwrap();
        prop_assert_eq!(
            compiled.arguments,
            vec![json!(format!("SELECT * FROM orders WHERE {} = ?", field)), json!([value])]
        );
    }
}

#[test]
fn empty_closures_are_two_tokens() {
    let mut sequence = TokenSequencer::expression();
    sequence.closure(None).unwrap();
    let kinds: Vec<&str> = sequence.tokens().iter().map(Token::kind).collect();
    assert_eq!(kinds, ["open", "close"]);
}

#[test]
fn rules_can_be_defined_in_code() {
    let mut parser = TokenParser::new();
    parser
        .add_definition(
            "flags",
            vec![Constraint::name("bool").multiple(), Constraint::name("null").optional()],
        )
        .unwrap();

    let tokens = vec![
        TokenFactory.value("bool", json!(true)).unwrap(),
        TokenFactory.value("bool", json!(false)).unwrap(),
    ];
    assert!(parser.parse_tokens("flags", &tokens).is_ok());
    assert!(parser.parse_tokens("flags", &[]).is_err());
}
