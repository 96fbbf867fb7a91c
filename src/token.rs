//! The token model: the flat intermediate representation that sequences are
//! built from, and the factory that allocates every token.

use std::fmt;

use serde_json::Value;

use crate::error::TokenError;

/// A record payload: an ordered map of field names to values.
pub type Record = serde_json::Map<String, Value>;

pub const KIND_ENTITY: &str = "entity";
pub const KIND_VALUE: &str = "value";

/// Literal kinds whose value must match the runtime type.
pub const LITERAL_KINDS: [&str; 6] = ["string", "int", "float", "bool", "null", "array"];

/// Keyword kinds that carry a string value, such as an operator symbol.
pub const KEYWORD_VALUE_KINDS: [&str; 3] = ["operator", "function", "sort-direction"];

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// A bare keyword or marker.
    Tag(String),
    /// A typed literal or a keyword carrying a value.
    Value { kind: String, value: Value },
    /// A field, table or collection reference. An empty alias means none.
    Reference {
        kind: String,
        name: String,
        alias: String,
    },
    /// A whole record to be persisted.
    Entity(Record),
}

impl Token {
    pub fn kind(&self) -> &str {
        match self {
            Token::Tag(kind) => kind,
            Token::Value { kind, .. } => kind,
            Token::Reference { kind, .. } => kind,
            Token::Entity(_) => KIND_ENTITY,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Token::Value { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind() == kind
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Tag(kind) => write!(f, "{}", kind),
            Token::Value { kind, value } => write!(f, "{}({})", kind, value),
            Token::Reference { kind, name, alias } if alias.is_empty() => {
                write!(f, "{}[{}]", kind, name)
            }
            Token::Reference { kind, name, alias } => write!(f, "{}[{} as {}]", kind, name, alias),
            Token::Entity(record) => write!(f, "{}({})", KIND_ENTITY, Value::Object(record.clone())),
        }
    }
}

/// Name of the literal kind matching the runtime type of `value`.
pub fn literal_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The single allocation point for tokens.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenFactory;

impl TokenFactory {
    /// Creates the token variant implied by the `(kind, value, alias)` triple:
    /// an alias makes a reference, a value makes a value (or entity) token and
    /// a lone kind makes a tag.
    pub fn create(
        &self,
        kind: &str,
        value: Option<Value>,
        alias: Option<&str>,
    ) -> Result<Token, TokenError> {
        if let Some(alias) = alias {
            let name = match value {
                None => String::new(),
                Some(Value::String(name)) => name,
                Some(other) => other.to_string(),
            };
            return Ok(self.reference(kind, &name, alias));
        }

        match value {
            None => Ok(self.tag(kind)),
            Some(value) if kind == KIND_ENTITY => self.entity(value),
            Some(value) => self.value(kind, value),
        }
    }

    pub fn tag(&self, kind: &str) -> Token {
        Token::Tag(kind.to_owned())
    }

    pub fn reference(&self, kind: &str, name: &str, alias: &str) -> Token {
        Token::Reference {
            kind: kind.to_owned(),
            name: name.to_owned(),
            alias: alias.to_owned(),
        }
    }

    /// A keyword token carrying a string, such as `operator("=")`.
    pub fn keyword(&self, kind: &str, value: &str) -> Token {
        Token::Value {
            kind: kind.to_owned(),
            value: Value::String(value.to_owned()),
        }
    }

    pub fn value(&self, kind: &str, value: Value) -> Result<Token, TokenError> {
        let found = literal_kind(&value);
        if found == "object" {
            return Err(TokenError::ObjectLiteral);
        }

        let kind = if kind == KIND_VALUE {
            found
        } else if LITERAL_KINDS.contains(&kind) {
            // Integers are acceptable wherever a float is expected.
            if kind != found && !(kind == "float" && found == "int") {
                return Err(TokenError::KindMismatch {
                    kind: kind.to_owned(),
                    found,
                });
            }
            kind
        } else if KEYWORD_VALUE_KINDS.contains(&kind) {
            if found != "string" {
                return Err(TokenError::KindMismatch {
                    kind: kind.to_owned(),
                    found,
                });
            }
            kind
        } else {
            return Err(TokenError::UnknownKind(kind.to_owned()));
        };

        Ok(Token::Value {
            kind: kind.to_owned(),
            value,
        })
    }

    pub fn entity(&self, payload: Value) -> Result<Token, TokenError> {
        match payload {
            Value::Object(record) => Ok(Token::Entity(record)),
            other => Err(TokenError::InvalidEntity(literal_kind(&other))),
        }
    }
}
