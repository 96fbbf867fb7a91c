//! Named grammar rules and the backtracking matcher that checks a token
//! sequence against them.

use std::collections::{HashMap, HashSet};
use std::fmt;

use itertools::Itertools;
use serde_json::Value;

use crate::error::{DefinitionError, ParseError};
use crate::sequencer::TokenSequencer;
use crate::token::Token;

/// What a constraint compares the current token against.
#[derive(Clone, Debug, PartialEq)]
pub enum Matcher {
    /// A token of the given kind.
    Name(String),
    /// A value token holding exactly this value.
    Value(Value),
    /// A run of tokens matching another rule.
    Type(String),
    /// The first of several names, then of several rules, that matches.
    Any {
        names: Vec<String>,
        types: Vec<String>,
    },
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Name(name) => write!(f, "{}", name),
            Matcher::Value(value) => write!(f, "={}", value),
            Matcher::Type(rule) => write!(f, "<{}>", rule),
            Matcher::Any { names, types } => write!(
                f,
                "({})",
                names
                    .iter()
                    .map(String::from)
                    .chain(types.iter().map(|rule| format!("<{}>", rule)))
                    .join(" | ")
            ),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Optionality {
    #[default]
    Required,
    Optional,
    /// Optional until the named flag has been raised earlier in the rule.
    Gated(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Constraint {
    pub matcher: Matcher,
    pub optional: Optionality,
    pub multiple: bool,
    /// Raised once this constraint has matched.
    pub flag: Option<String>,
}

impl Constraint {
    fn new(matcher: Matcher) -> Self {
        Self {
            matcher,
            optional: Optionality::Required,
            multiple: false,
            flag: None,
        }
    }

    pub fn name(kind: &str) -> Self {
        Self::new(Matcher::Name(kind.to_owned()))
    }

    pub fn value(value: Value) -> Self {
        Self::new(Matcher::Value(value))
    }

    pub fn rule(rule: &str) -> Self {
        Self::new(Matcher::Type(rule.to_owned()))
    }

    pub fn any(names: &[&str], types: &[&str]) -> Self {
        Self::new(Matcher::Any {
            names: names.iter().map(|s| s.to_string()).collect(),
            types: types.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn optional(mut self) -> Self {
        self.optional = Optionality::Optional;
        self
    }

    pub fn gated(mut self, flag: &str) -> Self {
        self.optional = Optionality::Gated(flag.to_owned());
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn raises(mut self, flag: &str) -> Self {
        self.flag = Some(flag.to_owned());
        self
    }

    fn validate(&self) -> Result<(), String> {
        let names: Vec<&String> = match &self.matcher {
            Matcher::Name(name) | Matcher::Type(name) => vec![name],
            Matcher::Value(_) => vec![],
            Matcher::Any { names, types } => names.iter().chain(types).collect(),
        };
        if names.iter().any(|name| name.is_empty()) {
            return Err("token and rule names must not be empty".to_owned());
        }

        let flags = [
            self.flag.as_deref(),
            match &self.optional {
                Optionality::Gated(flag) => Some(flag.as_str()),
                _ => None,
            },
        ];
        if flags.iter().flatten().any(|flag| flag.is_empty()) {
            return Err("flag names must not be empty".to_owned());
        }
        Ok(())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.matcher)?;
        match (&self.optional, self.multiple) {
            (Optionality::Required, false) => {}
            (Optionality::Required, true) => write!(f, "+")?,
            (Optionality::Optional, false) => write!(f, "?")?,
            (Optionality::Optional, true) => write!(f, "*")?,
            (Optionality::Gated(flag), multiple) => {
                write!(f, "?[{}]", flag)?;
                if multiple {
                    write!(f, "*")?;
                }
            }
        }
        if let Some(flag) = &self.flag {
            write!(f, "@{}", flag)?;
        }
        Ok(())
    }
}

/// Holds grammar rules and validates token sequences against them.
#[derive(Clone, Debug, Default)]
pub struct TokenParser {
    definitions: HashMap<String, Vec<Constraint>>,
}

impl TokenParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule, replacing any previous rule of the same name.
    pub fn add_definition(
        &mut self,
        name: &str,
        constraints: Vec<Constraint>,
    ) -> Result<&mut Self, DefinitionError> {
        if name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if constraints.is_empty() {
            return Err(DefinitionError::Empty(name.to_owned()));
        }

        for (index, constraint) in constraints.iter().enumerate() {
            if let Matcher::Any { names, types } = &constraint.matcher {
                let found = names.len() + types.len();
                if found < 2 {
                    return Err(DefinitionError::TooFewAlternatives {
                        rule: name.to_owned(),
                        index,
                        found,
                    });
                }
            }
            constraint
                .validate()
                .map_err(|message| DefinitionError::InvalidConstraint {
                    rule: name.to_owned(),
                    index,
                    message,
                })?;
        }

        tracing::debug!(rule = name, constraints = constraints.len(), "registered grammar rule");
        self.definitions.insert(name.to_owned(), constraints);
        Ok(self)
    }

    pub fn definition(&self, name: &str) -> Option<&[Constraint]> {
        self.definitions.get(name).map(Vec::as_slice)
    }

    pub fn has_definition(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Checks that every rule referenced by another rule exists and that no
    /// rule can reach itself without consuming a token.
    pub fn check_references(&self) -> Result<(), DefinitionError> {
        for (rule, constraints) in &self.definitions {
            for (index, constraint) in constraints.iter().enumerate() {
                let missing = referenced_rules(&constraint.matcher)
                    .into_iter()
                    .find(|r| !self.has_definition(r));
                if let Some(missing) = missing {
                    return Err(DefinitionError::InvalidConstraint {
                        rule: rule.clone(),
                        index,
                        message: format!("the rule '{}' is not defined", missing),
                    });
                }
            }
        }
        self.check_left_recursion()
    }

    fn check_left_recursion(&self) -> Result<(), DefinitionError> {
        let nullable = self.nullable_rules();
        let corners: HashMap<&str, Vec<&str>> = self
            .definitions
            .iter()
            .map(|(rule, constraints)| (rule.as_str(), left_corners(constraints, &nullable)))
            .collect();

        let mut done = HashSet::new();
        for &rule in corners.keys().sorted() {
            let mut path = Vec::new();
            if let Some(cycle) = find_cycle(rule, &corners, &mut path, &mut done) {
                return Err(DefinitionError::LeftRecursion(cycle.to_owned()));
            }
        }
        Ok(())
    }

    /// Rules that can match without consuming a token.
    fn nullable_rules(&self) -> HashSet<&str> {
        let mut nullable = HashSet::new();
        loop {
            let before = nullable.len();
            for (rule, constraints) in &self.definitions {
                if constraints.iter().all(|c| can_skip(c, &nullable)) {
                    nullable.insert(rule.as_str());
                }
            }
            if nullable.len() == before {
                return nullable;
            }
        }
    }

    /// Validates a sequence against the rule named by its type.
    pub fn parse_token_sequence(&self, sequence: &TokenSequencer) -> Result<(), ParseError> {
        self.parse_tokens(sequence.sequence_type().name(), sequence.tokens())
    }

    /// Validates that `tokens` match `rule` in their entirety.
    pub fn parse_tokens(&self, rule: &str, tokens: &[Token]) -> Result<(), ParseError> {
        let position = self.match_rule(rule, tokens, 0)?;
        if position < tokens.len() {
            return Err(ParseError::TrailingTokens {
                position,
                length: tokens.len(),
            });
        }
        Ok(())
    }

    /// Matches `rule` starting at `start`, returning the position after the
    /// last token consumed.
    pub fn match_rule(&self, rule: &str, tokens: &[Token], start: usize) -> Result<usize, ParseError> {
        let constraints = self
            .definitions
            .get(rule)
            .ok_or_else(|| ParseError::UnknownDefinition(rule.to_owned()))?;

        let mut flags: HashSet<&str> = HashSet::new();
        let mut position = start;

        for constraint in constraints {
            let required = match &constraint.optional {
                Optionality::Required => true,
                Optionality::Optional => false,
                Optionality::Gated(flag) => flags.contains(flag.as_str()),
            };

            let (mut next, matcher) = match self.match_constraint(rule, constraint, tokens, position) {
                Ok(matched) => matched,
                Err(err) if !required => {
                    tracing::trace!(rule, position, constraint = %constraint, error = %err, "skipped optional constraint");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if constraint.multiple {
                while let Ok(after) = self.match_matcher(rule, &matcher, tokens, next) {
                    if after == next {
                        break;
                    }
                    next = after;
                }
            }

            tracing::trace!(rule, from = position, to = next, constraint = %constraint, "matched constraint");
            position = next;
            if let Some(flag) = &constraint.flag {
                flags.insert(flag.as_str());
            }
        }

        Ok(position)
    }

    /// Matches a constraint once. An `any` constraint resolves to the first
    /// alternative that matches, which is returned so repetitions reuse it.
    fn match_constraint(
        &self,
        rule: &str,
        constraint: &Constraint,
        tokens: &[Token],
        position: usize,
    ) -> Result<(usize, Matcher), ParseError> {
        match &constraint.matcher {
            Matcher::Any { names, types } => {
                let candidates = names
                    .iter()
                    .map(|name| Matcher::Name(name.clone()))
                    .chain(types.iter().map(|rule| Matcher::Type(rule.clone())));
                for candidate in candidates {
                    if let Ok(next) = self.match_matcher(rule, &candidate, tokens, position) {
                        return Ok((next, candidate));
                    }
                }
                Err(ParseError::NoAlternative {
                    rule: rule.to_owned(),
                    position,
                    alternatives: names
                        .iter()
                        .cloned()
                        .chain(types.iter().map(|rule| format!("<{}>", rule)))
                        .collect(),
                })
            }
            matcher => self
                .match_matcher(rule, matcher, tokens, position)
                .map(|next| (next, matcher.clone())),
        }
    }

    fn match_matcher(
        &self,
        rule: &str,
        matcher: &Matcher,
        tokens: &[Token],
        position: usize,
    ) -> Result<usize, ParseError> {
        let token = tokens.get(position);
        match matcher {
            Matcher::Name(kind) => match token {
                Some(token) if token.is(kind) => Ok(position + 1),
                Some(token) => Err(ParseError::UnexpectedToken {
                    rule: rule.to_owned(),
                    position,
                    expected: kind.clone(),
                    found: token.kind().to_owned(),
                }),
                None => Err(ParseError::UnexpectedEnd {
                    rule: rule.to_owned(),
                    position,
                    expected: kind.clone(),
                }),
            },
            Matcher::Value(expected) => match token {
                Some(Token::Value { value, .. }) if value == expected => Ok(position + 1),
                Some(token) => Err(ParseError::UnexpectedValue {
                    rule: rule.to_owned(),
                    position,
                    expected: expected.to_string(),
                    found: token.value().map(Value::to_string),
                }),
                None => Err(ParseError::UnexpectedEnd {
                    rule: rule.to_owned(),
                    position,
                    expected: expected.to_string(),
                }),
            },
            Matcher::Type(sub_rule) => self
                .match_rule(sub_rule, tokens, position)
                .map_err(|err| match err {
                    ParseError::UnknownDefinition(_) => err,
                    err => ParseError::SubRule {
                        rule: rule.to_owned(),
                        position,
                        sub_rule: sub_rule.clone(),
                        source: Box::new(err),
                    },
                }),
            Matcher::Any { .. } => self
                .match_constraint(rule, &Constraint::new(matcher.clone()), tokens, position)
                .map(|(next, _)| next),
        }
    }
}

fn referenced_rules(matcher: &Matcher) -> Vec<&str> {
    match matcher {
        Matcher::Type(rule) => vec![rule.as_str()],
        Matcher::Any { types, .. } => types.iter().map(String::as_str).collect(),
        _ => vec![],
    }
}

/// Whether matching can move past `constraint` at the same position.
fn can_skip(constraint: &Constraint, nullable: &HashSet<&str>) -> bool {
    constraint.optional != Optionality::Required
        || referenced_rules(&constraint.matcher)
            .iter()
            .any(|rule| nullable.contains(rule))
}

/// The rules a rule may enter before it has consumed any token.
fn left_corners<'a>(constraints: &'a [Constraint], nullable: &HashSet<&str>) -> Vec<&'a str> {
    let mut corners = Vec::new();
    for constraint in constraints {
        corners.extend(referenced_rules(&constraint.matcher));
        if !can_skip(constraint, nullable) {
            break;
        }
    }
    corners
}

fn find_cycle<'a>(
    rule: &'a str,
    corners: &HashMap<&'a str, Vec<&'a str>>,
    path: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Option<&'a str> {
    if path.contains(&rule) {
        return Some(rule);
    }
    if done.contains(rule) {
        return None;
    }

    path.push(rule);
    for &next in corners.get(rule).into_iter().flatten() {
        if let Some(cycle) = find_cycle(next, corners, path, done) {
            return Some(cycle);
        }
    }
    path.pop();
    done.insert(rule);
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::token::TokenFactory;

    fn tags(kinds: &[&str]) -> Vec<Token> {
        kinds.iter().map(|kind| TokenFactory.tag(kind)).collect()
    }

    fn list_parser() -> TokenParser {
        let mut parser = TokenParser::new();
        parser
            .add_definition(
                "list",
                vec![
                    Constraint::name("open"),
                    Constraint::name("item").optional().multiple(),
                    Constraint::name("close"),
                ],
            )
            .unwrap();
        parser
    }

    #[test]
    fn test_definitions_are_validated() {
        let mut parser = TokenParser::new();
        assert_eq!(
            parser.add_definition("", vec![Constraint::name("a")]).err(),
            Some(DefinitionError::EmptyName)
        );
        assert_eq!(
            parser.add_definition("rule", vec![]).err(),
            Some(DefinitionError::Empty("rule".to_owned()))
        );
        assert_eq!(
            parser
                .add_definition("rule", vec![Constraint::name("a"), Constraint::any(&["b"], &[])])
                .err(),
            Some(DefinitionError::TooFewAlternatives {
                rule: "rule".to_owned(),
                index: 1,
                found: 1
            })
        );
        assert!(matches!(
            parser.add_definition("rule", vec![Constraint::name("a").gated("")]),
            Err(DefinitionError::InvalidConstraint { index: 0, .. })
        ));
        assert!(parser
            .add_definition("rule", vec![Constraint::any(&["b"], &["c"])])
            .is_ok());
        assert!(parser.check_references().is_err());
    }

    #[test]
    fn test_multiple_repeats() {
        let parser = list_parser();
        for repeats in [0, 1, 3] {
            let mut tokens = tags(&["open"]);
            tokens.extend(tags(&vec!["item"; repeats]));
            tokens.extend(tags(&["close"]));
            assert_eq!(parser.parse_tokens("list", &tokens), Ok(()), "{} repeats", repeats);
        }

        let err = parser
            .parse_tokens("list", &tags(&["open", "item", "item", "other", "close"]))
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::UnexpectedToken {
                rule: "list".to_owned(),
                position: 3,
                expected: "close".to_owned(),
                found: "other".to_owned()
            }
        );
    }

    #[test]
    fn test_required_tokens_and_trailing_tokens() {
        let parser = list_parser();
        assert!(matches!(
            parser.parse_tokens("list", &tags(&["open", "item"])),
            Err(ParseError::UnexpectedEnd { position: 2, .. })
        ));
        assert!(parser.parse_tokens("list", &tags(&["item", "close"])).is_err());
        assert_eq!(
            parser.parse_tokens("list", &tags(&["open", "close", "close"])),
            Err(ParseError::TrailingTokens {
                position: 2,
                length: 3
            })
        );
        assert_eq!(
            parser.parse_tokens("missing", &[]),
            Err(ParseError::UnknownDefinition("missing".to_owned()))
        );
    }

    #[test]
    fn test_any_tries_names_then_rules() {
        let mut parser = list_parser();
        parser
            .add_definition(
                "operand",
                vec![Constraint::any(&["field", "int"], &["list"])],
            )
            .unwrap();

        assert_eq!(parser.parse_tokens("operand", &tags(&["int"])), Ok(()));
        assert_eq!(
            parser.parse_tokens("operand", &tags(&["open", "item", "close"])),
            Ok(())
        );
        let err = parser.parse_tokens("operand", &tags(&["string"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "in 'operand' at position 0: did not match any of the constraints (field | int | <list>)"
        );
    }

    #[test]
    fn test_sub_rule_errors_cite_the_inner_token() {
        let mut parser = list_parser();
        parser
            .add_definition("call", vec![Constraint::name("function"), Constraint::rule("list")])
            .unwrap();

        let err = parser
            .parse_tokens("call", &tags(&["function", "open", "item"]))
            .unwrap_err();
        assert!(matches!(err, ParseError::SubRule { ref sub_rule, .. } if sub_rule == "list"));
        assert!(matches!(
            err.root_cause(),
            ParseError::UnexpectedEnd { expected, .. } if expected == "close"
        ));
    }

    #[test]
    fn test_left_recursion_is_rejected() {
        let mut parser = TokenParser::new();
        parser
            .add_definition("loop", vec![Constraint::rule("loop"), Constraint::name("x")])
            .unwrap();
        assert_eq!(
            parser.check_references(),
            Err(DefinitionError::LeftRecursion("loop".to_owned()))
        );

        // Reached through an optional prefix and a rule that can match nothing.
        let mut parser = TokenParser::new();
        parser
            .add_definition("head", vec![Constraint::name("x").optional(), Constraint::rule("tail")])
            .unwrap()
            .add_definition("tail", vec![Constraint::rule("empty"), Constraint::rule("head")])
            .unwrap()
            .add_definition("empty", vec![Constraint::name("y").optional().multiple()])
            .unwrap();
        assert!(matches!(
            parser.check_references(),
            Err(DefinitionError::LeftRecursion(_))
        ));

        let mut parser = TokenParser::new();
        parser
            .add_definition("items", vec![Constraint::name("x"), Constraint::rule("items").optional()])
            .unwrap();
        assert_eq!(parser.check_references(), Ok(()));
        assert_eq!(parser.parse_tokens("items", &tags(&["x", "x", "x"])), Ok(()));
    }

    #[test]
    fn test_gated_constraints() {
        let mut parser = TokenParser::new();
        parser
            .add_definition(
                "paging",
                vec![
                    Constraint::name("limit").optional().raises("limited"),
                    Constraint::name("int").gated("limited"),
                    Constraint::name("done"),
                ],
            )
            .unwrap();

        assert_eq!(parser.parse_tokens("paging", &tags(&["done"])), Ok(()));
        assert_eq!(parser.parse_tokens("paging", &tags(&["limit", "int", "done"])), Ok(()));
        assert!(matches!(
            parser.parse_tokens("paging", &tags(&["limit", "done"])),
            Err(ParseError::UnexpectedToken { position: 1, .. })
        ));
    }

    #[test]
    fn test_value_constraints() {
        let mut parser = TokenParser::new();
        parser
            .add_definition("five", vec![Constraint::value(json!(5))])
            .unwrap();

        let factory = TokenFactory;
        let five = factory.value("int", json!(5)).unwrap();
        let six = factory.value("int", json!(6)).unwrap();
        assert_eq!(parser.parse_tokens("five", &[five]), Ok(()));
        assert!(matches!(
            parser.parse_tokens("five", &[six]),
            Err(ParseError::UnexpectedValue { found: Some(ref found), .. }) if found == "6"
        ));
        assert!(parser
            .parse_tokens("five", &[factory.reference("field", "5", "")])
            .is_err());
    }

    #[test]
    fn test_constraint_display() {
        assert_eq!(Constraint::name("int").optional().multiple().to_string(), "int*");
        assert_eq!(Constraint::rule("filter").optional().to_string(), "<filter>?");
        assert_eq!(Constraint::name("int").gated("limited").to_string(), "int?[limited]");
        assert_eq!(
            Constraint::any(&["and", "or"], &["group"]).raises("joined").to_string(),
            "(and | or | <group>)@joined"
        );
        assert_eq!(Constraint::value(json!("x")).multiple().to_string(), "=\"x\"+");
    }
}
