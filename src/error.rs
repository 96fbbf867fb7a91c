use itertools::Itertools;
use thiserror::Error;

use crate::ast::Action;

/// Errors raised while constructing a single token.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TokenError {
    #[error("a token of kind '{kind}' cannot hold a {found} value")]
    KindMismatch { kind: String, found: &'static str },

    #[error("'{0}' is not a valid kind for a value token")]
    UnknownKind(String),

    #[error("an entity token requires an object or a map of fields, found a {0} value")]
    InvalidEntity(&'static str),

    #[error("an object cannot be used as a literal value; use an entity token instead")]
    ObjectLiteral,
}

/// Misconfigured entity metadata. Raised at setup time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetadataError {
    #[error("the field type metadata for '{field}' is invalid: '{field_type}'")]
    InvalidFieldType { field: String, field_type: String },

    #[error("no valid metadata was found for the field '{0}'")]
    EmptyFieldMetadata(String),

    #[error("'{0}' is not a valid relationship type")]
    InvalidRelationshipType(String),

    #[error("cannot add relationship metadata for '{0}' without specifying the property of the parent entity that the relationship refers to")]
    MissingProperty(String),

    #[error("cannot add one-to-one relationship metadata for '{0}' without specifying either our field or their field")]
    MissingJoinField(String),

    #[error("cannot add one-to-many relationship metadata for '{0}' without specifying the field representing the entity's foreign key")]
    MissingTheirField(String),

    #[error("cannot add many-to-many relationship metadata for '{0}' without specifying a join table")]
    MissingJoinTable(String),

    #[error("could not find the {} accessor '{accessor}' on the entity '{entity}'", accessor_origin(.generated))]
    MissingAccessor {
        entity: String,
        accessor: String,
        generated: bool,
    },

    #[error("the field '{field}' for the entity '{entity}' has no metadata")]
    UnknownField { entity: String, field: String },

    #[error("the field '{field}' of '{entity}' has no {access} information set")]
    NoAccess {
        entity: String,
        field: String,
        access: &'static str,
    },

    #[error("the entity '{entity}' has no relationship named '{alias}'")]
    UnknownRelationship { entity: String, alias: String },

    #[error("no metadata has been registered for the entity '{0}'")]
    UnknownEntity(String),

    #[error("the entity '{0}' has been registered twice")]
    DuplicateEntity(String),

    #[error("the property '{property}' of '{entity}' is required to be a collection")]
    NotACollection { entity: String, property: String },

    #[error("the value passed for '{entity}' is not a {expected}")]
    EntityType {
        entity: String,
        expected: &'static str,
    },

    #[error("the many-to-many relationship '{alias}' of '{entity}' uses the join table column '{column}' for both sides")]
    JoinFieldCollision {
        entity: String,
        alias: String,
        column: String,
    },
}

fn accessor_origin(generated: &bool) -> &'static str {
    if *generated {
        "generated"
    } else {
        "declared"
    }
}

/// Malformed grammar definitions. Raised when a rule is registered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("definition names must not be empty")]
    EmptyName,

    #[error("error defining '{0}'. The definition was empty")]
    Empty(String),

    #[error("error defining token #{index} of '{rule}'. {message}")]
    InvalidConstraint {
        rule: String,
        index: usize,
        message: String,
    },

    #[error("error defining token #{index} of '{rule}'. The 'any' constraint requires at least two values, {found} found")]
    TooFewAlternatives {
        rule: String,
        index: usize,
        found: usize,
    },

    #[error("invalid grammar definition: {0}")]
    Syntax(String),

    #[error("the rule '{0}' can reach itself without consuming a token")]
    LeftRecursion(String),
}

/// Malformed textual input: token sequences or REPL commands.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyntaxError {
    #[error("failed to parse input\n{0}")]
    Malformed(String),

    #[error("invalid JSON literal '{text}': {message}")]
    Json { text: String, message: String },

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Misuse of the sequence builder.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("invalid argument for '{operation}': {message}")]
    InvalidArgument {
        operation: &'static str,
        message: String,
    },

    #[error("unsupported join type: '{0}'. Join type must be 'inner' (default), 'left', 'right' or 'full'")]
    UnsupportedJoin(String),

    #[error("'{0}' is not a valid sort direction")]
    InvalidSortDirection(String),

    #[error("'{0}' is not a valid sequence type")]
    InvalidSequenceType(String),

    #[error("cannot {0} on an expression sequence")]
    NotAQuery(&'static str),

    #[error("cannot include entities on a sequence without entity metadata")]
    MissingMetadata,

    #[error("cannot join '{collection}'. The alias '{alias}' is already in use")]
    AliasCollision { collection: String, alias: String },

    #[error("cannot include '{entity}' from '{parent}'. The parent has not been included")]
    UnknownParent { entity: String, parent: String },

    #[error("cannot include '{entity}'. '{parent}' has no relationship named '{alias}'")]
    UnknownRelationship {
        entity: String,
        parent: String,
        alias: String,
    },

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// A token sequence that does not conform to its grammar rule.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("the definition '{0}' does not exist")]
    UnknownDefinition(String),

    #[error("unexpected end of token sequence in '{rule}': expected {expected}")]
    UnexpectedEnd {
        rule: String,
        position: usize,
        expected: String,
    },

    #[error("in '{rule}' at position {position}: expecting a token of type '{expected}', found '{found}'")]
    UnexpectedToken {
        rule: String,
        position: usize,
        expected: String,
        found: String,
    },

    #[error("in '{rule}' at position {position}: expecting a token of value {expected}, found {}", .found.as_deref().unwrap_or("no token value"))]
    UnexpectedValue {
        rule: String,
        position: usize,
        expected: String,
        found: Option<String>,
    },

    #[error("in '{rule}' at position {position}: did not match any of the constraints ({})", .alternatives.iter().join(" | "))]
    NoAlternative {
        rule: String,
        position: usize,
        alternatives: Vec<String>,
    },

    #[error("in '{rule}' at position {position}: did not find the expected token sequence '<{sub_rule}>': {source}")]
    SubRule {
        rule: String,
        position: usize,
        sub_rule: String,
        source: Box<ParseError>,
    },

    #[error("unexpected tokens at the end of the sequence. Reached position {position} of {length}")]
    TrailingTokens { position: usize, length: usize },
}

impl ParseError {
    /// Position in the sequence at which matching failed.
    pub fn position(&self) -> Option<usize> {
        match self {
            ParseError::UnknownDefinition(_) => None,
            ParseError::UnexpectedEnd { position, .. }
            | ParseError::UnexpectedToken { position, .. }
            | ParseError::UnexpectedValue { position, .. }
            | ParseError::NoAlternative { position, .. }
            | ParseError::SubRule { position, .. }
            | ParseError::TrailingTokens { position, .. } => Some(*position),
        }
    }

    /// The innermost failure, following sub-rule causes.
    pub fn root_cause(&self) -> &ParseError {
        match self {
            ParseError::SubRule { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Errors raised while lowering or compiling a query.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("invalid query action: {0}")]
    UnsupportedAction(Action),

    #[error("the '{action}' action does not support {feature} on this backend")]
    Unsupported { action: Action, feature: String },

    #[error("cannot compile an expression sequence into a query")]
    NotAQuery,

    #[error("malformed token sequence at position {position}: expected {expected}, found {found}")]
    Malformed {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),

    #[error("cannot save an entity without a value for the primary key '{0}'")]
    MissingPrimaryKey(String),

    #[error("inserted records must all have the same fields")]
    InconsistentRecords,
}

/// Classification of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    DuplicateKey,
    Driver,
    Plan,
}

/// An opaque driver failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("there was an error performing a '{method}' query on '{collection}': {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub collection: String,
    pub method: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no field could be found for the relationship '{0}'")]
    RelationshipField(String),

    #[error("unexpected storage response for '{0}'")]
    UnexpectedResponse(String),

    #[error("a '{0}' in the relationship has not been saved and has no primary key")]
    UnsavedChild(String),
}
