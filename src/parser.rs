//! Text front-end: grammar definition files, token sequences in their
//! display form and REPL commands.

use std::borrow::BorrowMut;

use pest::Parser as _;
use pest_derive::Parser;
use serde_json::Value;

use crate::error::{DefinitionError, SyntaxError};
use crate::grammar::{Constraint, Matcher, TokenParser};
use crate::sequencer::{SequenceType, TokenSequencer};
use crate::token::{Token, TokenFactory, KIND_ENTITY};

/// The grammar every repository validates its sequences against.
pub const DEFAULT_GRAMMAR: &str = include_str!("default.grammar");

#[derive(Parser)]
#[grammar = "tokenmap.pest"]
struct Parser;

type Pair<'a> = pest::iterators::Pair<'a, Rule>;
type Pairs<'a> = pest::iterators::Pairs<'a, Rule>;

fn expect_next_rule<'a, P: BorrowMut<Pairs<'a>>>(mut pairs: P, rule: Rule) -> Result<Pair<'a>, String> {
    match pairs.borrow_mut().next() {
        Some(pair) if pair.as_rule() == rule => Ok(pair),
        Some(pair) => Err(format!("expected {:?}, found {:?}", rule, pair.as_rule())),
        None => Err(format!("expected {:?}", rule)),
    }
}

fn expect_identifier<'a, P: BorrowMut<Pairs<'a>>>(pairs: P) -> Result<String, String> {
    expect_next_rule(pairs, Rule::identifier).map(|pair| pair.as_str().to_string())
}

fn convert_json(pair: Pair) -> Result<Value, (String, String)> {
    let text = pair.as_str();
    serde_json::from_str(text).map_err(|err| (text.to_string(), err.to_string()))
}

/// Parses grammar definitions into a new parser.
pub fn parse_grammar(code: &str) -> Result<TokenParser, DefinitionError> {
    let mut parser = TokenParser::new();
    load_grammar(&mut parser, code)?;
    Ok(parser)
}

/// Adds the definitions in `code` to `parser` and checks that every rule
/// they reference exists.
pub fn load_grammar(parser: &mut TokenParser, code: &str) -> Result<(), DefinitionError> {
    let grammar = Parser::parse(Rule::grammar, code)
        .map_err(|err| DefinitionError::Syntax(err.to_string()))?
        .next()
        .ok_or_else(|| DefinitionError::Syntax("empty input".to_owned()))?;

    for definition in grammar
        .into_inner()
        .take_while(|pair| pair.as_rule() != Rule::EOI)
    {
        let mut pairs = definition.into_inner();
        let name = expect_identifier(&mut pairs).map_err(DefinitionError::Syntax)?;
        let constraints = pairs
            .map(convert_constraint)
            .collect::<Result<Vec<_>, _>>()?;
        parser.add_definition(&name, constraints)?;
    }

    parser.check_references()
}

impl TokenParser {
    /// A parser holding the bundled grammar.
    pub fn with_default_grammar() -> Result<Self, DefinitionError> {
        parse_grammar(DEFAULT_GRAMMAR)
    }
}

fn convert_constraint(pair: Pair) -> Result<Constraint, DefinitionError> {
    let mut pairs = pair.into_inner();
    let matcher = expect_next_rule(&mut pairs, Rule::matcher).map_err(DefinitionError::Syntax)?;
    let mut constraint = match convert_matcher(matcher)? {
        Matcher::Name(name) => Constraint::name(&name),
        Matcher::Value(value) => Constraint::value(value),
        Matcher::Type(rule) => Constraint::rule(&rule),
        Matcher::Any { names, types } => {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let types: Vec<&str> = types.iter().map(String::as_str).collect();
            Constraint::any(&names, &types)
        }
    };

    for modifier in pairs {
        match modifier.as_rule() {
            Rule::quantifier => {
                let quantifier = modifier
                    .into_inner()
                    .next()
                    .ok_or_else(|| DefinitionError::Syntax("empty quantifier".to_owned()))?;
                constraint = match quantifier.as_rule() {
                    Rule::maybe => constraint.optional(),
                    Rule::many => constraint.optional().multiple(),
                    Rule::some => constraint.multiple(),
                    Rule::gated => {
                        let mut inner = quantifier.into_inner();
                        let flag = expect_identifier(&mut inner).map_err(DefinitionError::Syntax)?;
                        let gated = constraint.gated(&flag);
                        if inner.next().is_some() {
                            gated.multiple()
                        } else {
                            gated
                        }
                    }
                    other => {
                        return Err(DefinitionError::Syntax(format!("unexpected {:?}", other)))
                    }
                };
            }
            Rule::raise => {
                let flag = expect_identifier(modifier.into_inner()).map_err(DefinitionError::Syntax)?;
                constraint = constraint.raises(&flag);
            }
            other => return Err(DefinitionError::Syntax(format!("unexpected {:?}", other))),
        }
    }

    Ok(constraint)
}

fn convert_matcher(pair: Pair) -> Result<Matcher, DefinitionError> {
    let pair = pair
        .into_inner()
        .next()
        .ok_or_else(|| DefinitionError::Syntax("empty matcher".to_owned()))?;

    match pair.as_rule() {
        Rule::identifier => Ok(Matcher::Name(pair.as_str().to_string())),
        Rule::rule_ref => Ok(Matcher::Type(
            expect_identifier(pair.into_inner()).map_err(DefinitionError::Syntax)?,
        )),
        Rule::literal => {
            let json = expect_next_rule(pair.into_inner(), Rule::json).map_err(DefinitionError::Syntax)?;
            let value = convert_json(json).map_err(|(text, message)| {
                DefinitionError::Syntax(format!("invalid literal '{}': {}", text, message))
            })?;
            Ok(Matcher::Value(value))
        }
        Rule::any => {
            let mut names = Vec::new();
            let mut types = Vec::new();
            for alternative in pair.into_inner() {
                let inner = alternative
                    .into_inner()
                    .next()
                    .ok_or_else(|| DefinitionError::Syntax("empty alternative".to_owned()))?;
                match inner.as_rule() {
                    Rule::rule_ref => types.push(
                        expect_identifier(inner.into_inner()).map_err(DefinitionError::Syntax)?,
                    ),
                    _ => names.push(inner.as_str().to_string()),
                }
            }
            Ok(Matcher::Any { names, types })
        }
        other => Err(DefinitionError::Syntax(format!("unexpected {:?}", other))),
    }
}

/// Parses tokens written in their display form.
pub fn parse_tokens(code: &str) -> Result<Vec<Token>, SyntaxError> {
    let tokens = Parser::parse(Rule::tokens, code)
        .map_err(|err| SyntaxError::Malformed(err.to_string()))?
        .next()
        .ok_or_else(|| SyntaxError::Malformed("empty input".to_owned()))?;

    tokens
        .into_inner()
        .take_while(|pair| pair.as_rule() != Rule::EOI)
        .map(convert_token)
        .collect()
}

fn convert_token(pair: Pair) -> Result<Token, SyntaxError> {
    let factory = TokenFactory;
    let pair = pair
        .into_inner()
        .next()
        .ok_or_else(|| SyntaxError::Malformed("empty token".to_owned()))?;
    let json_error = |(text, message): (String, String)| SyntaxError::Json { text, message };

    let token = match pair.as_rule() {
        Rule::identifier => factory.create(pair.as_str(), None, None)?,
        Rule::entity_token => {
            let object = expect_next_rule(pair.into_inner(), Rule::object).map_err(SyntaxError::Malformed)?;
            factory.create(KIND_ENTITY, Some(convert_json(object).map_err(json_error)?), None)?
        }
        Rule::value_token => {
            let mut pairs = pair.into_inner();
            let kind = expect_identifier(&mut pairs).map_err(SyntaxError::Malformed)?;
            let json = expect_next_rule(&mut pairs, Rule::json).map_err(SyntaxError::Malformed)?;
            factory.create(&kind, Some(convert_json(json).map_err(json_error)?), None)?
        }
        Rule::reference_token => {
            let mut pairs = pair.into_inner();
            let kind = expect_identifier(&mut pairs).map_err(SyntaxError::Malformed)?;
            let mut name = String::new();
            let mut alias = String::new();
            for part in pairs {
                match part.as_rule() {
                    Rule::reference_name => name = part.as_str().to_string(),
                    _ => alias = expect_identifier(part.into_inner()).map_err(SyntaxError::Malformed)?,
                }
            }
            factory.create(&kind, Some(Value::String(name)), Some(&alias))?
        }
        other => return Err(SyntaxError::Malformed(format!("unexpected {:?}", other))),
    };
    Ok(token)
}

/// A REPL line: the sequence type, an optional collection and the tokens.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub sequence_type: SequenceType,
    pub collection: String,
    pub tokens: Vec<Token>,
}

impl Command {
    pub fn into_sequence(self) -> TokenSequencer {
        TokenSequencer::from_tokens(self.sequence_type, &self.collection, self.tokens)
    }
}

pub fn parse_command(line: &str) -> Result<Command, SyntaxError> {
    let command = Parser::parse(Rule::command, line)
        .map_err(|err| SyntaxError::Malformed(err.to_string()))?
        .next()
        .ok_or_else(|| SyntaxError::Malformed("empty input".to_owned()))?;

    let mut pairs = command.into_inner();
    let sequence_type: SequenceType = expect_identifier(&mut pairs)
        .map_err(SyntaxError::Malformed)?
        .parse()?;

    let mut collection = String::new();
    let mut tokens = Vec::new();
    for pair in pairs {
        match pair.as_rule() {
            Rule::identifier => collection = pair.as_str().to_string(),
            Rule::token => tokens.push(convert_token(pair)?),
            _ => {}
        }
    }

    Ok(Command {
        sequence_type,
        collection,
        tokens,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::TokenError;
    use crate::grammar::Optionality;

    #[test]
    fn test_parse_grammar() {
        let parser = parse_grammar(
            r#"
            // a comment
            paging = limit?@limited int?[limited] <rest>* ;
            rest   = =5+ (and | or | <paging>) ;
            "#,
        )
        .unwrap();

        assert_eq!(
            parser.definition("paging").unwrap(),
            &[
                Constraint::name("limit").optional().raises("limited"),
                Constraint::name("int").gated("limited"),
                Constraint::rule("rest").optional().multiple(),
            ]
        );
        assert_eq!(
            parser.definition("rest").unwrap(),
            &[
                Constraint::value(json!(5)).multiple(),
                Constraint::any(&["and", "or"], &["paging"]),
            ]
        );
        assert_eq!(
            parser.definition("paging").unwrap()[1].optional,
            Optionality::Gated("limited".to_owned())
        );
    }

    #[test]
    fn test_grammar_errors() {
        assert!(matches!(
            parse_grammar("broken = ;"),
            Err(DefinitionError::Syntax(_))
        ));
        assert!(matches!(
            parse_grammar("single = (only) ;"),
            Err(DefinitionError::TooFewAlternatives { found: 1, .. })
        ));
        assert!(matches!(
            parse_grammar("dangling = <nowhere> ;"),
            Err(DefinitionError::InvalidConstraint { .. })
        ));
        assert_eq!(
            parse_grammar("a = <b>? x ; b = <a> y ;").err(),
            Some(DefinitionError::LeftRecursion("a".to_owned()))
        );
    }

    #[test]
    fn test_default_grammar_loads() {
        let parser = TokenParser::with_default_grammar().unwrap();
        for rule in ["expression", "find", "save", "update", "delete"] {
            assert!(parser.has_definition(rule), "missing {}", rule);
        }
    }

    #[test]
    fn test_parse_tokens() {
        let factory = TokenFactory;
        let tokens = parse_tokens(
            r#"where field[orders.id] operator("=") int(5)
               left join collection[line_items as items] entity({"id": 1, "tags": ["a"]})
               collection[]"#,
        )
        .unwrap();

        assert_eq!(
            tokens,
            vec![
                factory.tag("where"),
                factory.reference("field", "orders.id", ""),
                factory.keyword("operator", "="),
                factory.value("int", json!(5)).unwrap(),
                factory.tag("left"),
                factory.tag("join"),
                factory.reference("collection", "line_items", "items"),
                factory.entity(json!({"id": 1, "tags": ["a"]})).unwrap(),
                factory.reference("collection", "", ""),
            ]
        );
    }

    #[test]
    fn test_tokens_round_trip_through_display() {
        let mut sequence = TokenSequencer::expression();
        sequence
            .reference("name")
            .op("like")
            .val("A%")
            .unwrap()
            .and()
            .not()
            .reference("score")
            .op("in")
            .closure(Some(vec![json!(1.5), json!(null), json!([1, 2])].into()))
            .unwrap();

        assert_eq!(parse_tokens(&sequence.to_string()).unwrap(), sequence.tokens());
    }

    #[test]
    fn test_token_kinds_are_checked() {
        assert_eq!(
            parse_tokens(r#"int("five")"#),
            Err(SyntaxError::Token(TokenError::KindMismatch {
                kind: "int".to_owned(),
                found: "string"
            }))
        );
        assert!(matches!(parse_tokens("field[a"), Err(SyntaxError::Malformed(_))));
    }

    #[test]
    fn test_parse_command() {
        let command = parse_command(r#"find orders: where field[id] operator("=") int(1)"#).unwrap();
        assert_eq!(command.sequence_type, SequenceType::Find);
        assert_eq!(command.collection, "orders");
        assert_eq!(command.tokens.len(), 4);

        let command = parse_command("expression: field[a]").unwrap();
        assert_eq!(command.sequence_type, SequenceType::Expression);
        assert_eq!(command.collection, "");

        let sequence = command.into_sequence();
        let parser = TokenParser::with_default_grammar().unwrap();
        assert_eq!(parser.parse_token_sequence(&sequence), Ok(()));

        assert!(matches!(
            parse_command("select: field[a]"),
            Err(SyntaxError::Build(_))
        ));
    }
}
