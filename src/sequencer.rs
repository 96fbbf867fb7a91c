//! The fluent builder that produces token sequences.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use itertools::Itertools;
use serde_json::Value;

use crate::error::BuildError;
use crate::metadata::{EntityMetadata, RelationshipType};
use crate::token::{Token, TokenFactory, KIND_VALUE};

pub const AGGREGATE_FUNCTIONS: [&str; 5] = ["count", "total", "maximum", "minimum", "average"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SequenceType {
    Expression,
    Find,
    Save,
    Update,
    Delete,
}

impl SequenceType {
    pub fn name(self) -> &'static str {
        match self {
            SequenceType::Expression => "expression",
            SequenceType::Find => "find",
            SequenceType::Save => "save",
            SequenceType::Update => "update",
            SequenceType::Delete => "delete",
        }
    }

    pub fn is_query(self) -> bool {
        self != SequenceType::Expression
    }
}

impl FromStr for SequenceType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expression" => Ok(SequenceType::Expression),
            "find" => Ok(SequenceType::Find),
            "save" => Ok(SequenceType::Save),
            "update" => Ok(SequenceType::Update),
            "delete" => Ok(SequenceType::Delete),
            _ => Err(BuildError::InvalidSequenceType(s.to_owned())),
        }
    }
}

impl fmt::Display for SequenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    pub fn keyword(self) -> &'static str {
        match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
            JoinType::Full => "full",
        }
    }
}

impl FromStr for JoinType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "inner" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "full" => Ok(JoinType::Full),
            _ => Err(BuildError::UnsupportedJoin(s.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn name(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ascending",
            SortDirection::Descending => "descending",
        }
    }

    pub fn signum(self) -> i64 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

impl FromStr for SortDirection {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" | "ascending" | "1" => Ok(SortDirection::Ascending),
            "desc" | "descending" | "-1" => Ok(SortDirection::Descending),
            _ => Err(BuildError::InvalidSortDirection(s.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SaveMode {
    /// Update when the record carries an auto-incrementing key, insert
    /// otherwise.
    #[default]
    Auto,
    Insert,
    Update,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    Sequence(Vec<Token>),
    Token(Token),
    Literal(Value),
    List(Vec<Content>),
}

impl From<&TokenSequencer> for Content {
    fn from(sequencer: &TokenSequencer) -> Self {
        Content::Sequence(sequencer.sequence.clone())
    }
}

impl From<TokenSequencer> for Content {
    fn from(sequencer: TokenSequencer) -> Self {
        Content::Sequence(sequencer.sequence)
    }
}

impl From<Token> for Content {
    fn from(token: Token) -> Self {
        Content::Token(token)
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Content::Literal(value)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Literal(Value::from(value))
    }
}

impl From<i64> for Content {
    fn from(value: i64) -> Self {
        Content::Literal(Value::from(value))
    }
}

impl<T: Into<Content>> From<Vec<T>> for Content {
    fn from(items: Vec<T>) -> Self {
        Content::List(items.into_iter().map(Into::into).collect())
    }
}

/// An owned read position over a token slice.
#[derive(Clone, Debug)]
pub struct Cursor<'a> {
    tokens: &'a [Token],
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_done(&self) -> bool {
        self.position >= self.tokens.len()
    }

    pub fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.position)
    }

    pub fn peek_nth(&self, n: usize) -> Option<&'a Token> {
        self.tokens.get(self.position + n)
    }

    pub fn peek_is(&self, kind: &str) -> bool {
        self.peek().map_or(false, |token| token.is(kind))
    }

    pub fn eat(&mut self, kind: &str) -> bool {
        if self.peek_is(kind) {
            self.position += 1;
            true
        } else {
            false
        }
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = &'a Token;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }
}

#[derive(Clone, Debug)]
pub struct TokenSequencer {
    sequence_type: SequenceType,
    collection: String,
    metadata: Option<Arc<EntityMetadata>>,
    sequence: Vec<Token>,
    includes: HashMap<String, Arc<EntityMetadata>>,
    joined: HashSet<String>,
    save_mode: SaveMode,
    factory: TokenFactory,
}

impl TokenSequencer {
    fn with_type(
        sequence_type: SequenceType,
        collection: &str,
        metadata: Option<Arc<EntityMetadata>>,
    ) -> Self {
        Self {
            sequence_type,
            collection: collection.to_owned(),
            metadata,
            sequence: Vec::new(),
            includes: HashMap::new(),
            joined: HashSet::new(),
            save_mode: SaveMode::default(),
            factory: TokenFactory,
        }
    }

    pub fn expression() -> Self {
        Self::with_type(SequenceType::Expression, "", None)
    }

    pub fn query(sequence_type: SequenceType, metadata: Arc<EntityMetadata>) -> Self {
        let collection = metadata.collection().to_owned();
        Self::with_type(sequence_type, &collection, Some(metadata))
    }

    pub fn find(metadata: Arc<EntityMetadata>) -> Self {
        Self::query(SequenceType::Find, metadata)
    }

    pub fn save(metadata: Arc<EntityMetadata>) -> Self {
        Self::query(SequenceType::Save, metadata)
    }

    pub fn update(metadata: Arc<EntityMetadata>) -> Self {
        Self::query(SequenceType::Update, metadata)
    }

    pub fn delete(metadata: Arc<EntityMetadata>) -> Self {
        Self::query(SequenceType::Delete, metadata)
    }

    /// A query against a collection that has no entity metadata.
    pub fn for_collection(sequence_type: SequenceType, collection: &str) -> Self {
        Self::with_type(sequence_type, collection, None)
    }

    /// Wraps tokens that were produced elsewhere, such as read from text.
    pub fn from_tokens(sequence_type: SequenceType, collection: &str, tokens: Vec<Token>) -> Self {
        let mut sequencer = Self::with_type(sequence_type, collection, None);
        sequencer.sequence = tokens;
        sequencer
    }

    pub fn sequence_type(&self) -> SequenceType {
        self.sequence_type
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn metadata(&self) -> Option<&Arc<EntityMetadata>> {
        self.metadata.as_ref()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.sequence
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn includes(&self) -> &HashMap<String, Arc<EntityMetadata>> {
        &self.includes
    }

    pub fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    pub fn set_save_mode(&mut self, save_mode: SaveMode) -> &mut Self {
        self.save_mode = save_mode;
        self
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(&self.sequence)
    }

    pub fn keyword(&mut self, kind: &str) -> &mut Self {
        self.sequence.push(self.factory.tag(kind));
        self
    }

    pub fn where_(&mut self) -> &mut Self {
        self.keyword("where")
    }

    pub fn not(&mut self) -> &mut Self {
        self.keyword("not")
    }

    pub fn and(&mut self) -> &mut Self {
        self.keyword("and")
    }

    pub fn or(&mut self) -> &mut Self {
        self.keyword("or")
    }

    pub fn reference(&mut self, name: &str) -> &mut Self {
        self.reference_with("field", name, "")
    }

    pub fn reference_with(&mut self, kind: &str, name: &str, alias: &str) -> &mut Self {
        self.sequence.push(self.factory.reference(kind, name, alias));
        self
    }

    pub fn op(&mut self, operator: &str) -> &mut Self {
        self.sequence
            .push(self.factory.keyword("operator", &operator.to_lowercase()));
        self
    }

    pub fn val(&mut self, value: impl Into<Value>) -> Result<&mut Self, BuildError> {
        let token = self.factory.value(KIND_VALUE, value.into())?;
        self.sequence.push(token);
        Ok(self)
    }

    pub fn entity(&mut self, payload: Value) -> Result<&mut Self, BuildError> {
        let token = self.factory.entity(payload)?;
        self.sequence.push(token);
        Ok(self)
    }

    /// Brackets `content` with `open` and `close`.
    ///
    /// A sub-sequence is spliced in, a token is appended and a literal goes
    /// through [`val`](Self::val). List elements follow the same rules, except
    /// that sub-sequences and nested lists get brackets of their own.
    pub fn closure(&mut self, content: Option<Content>) -> Result<&mut Self, BuildError> {
        let mut tokens = vec![self.factory.tag("open")];
        match content {
            None => {}
            Some(Content::List(items)) => {
                for item in items {
                    self.list_item_tokens(item, &mut tokens)?;
                }
            }
            Some(Content::Sequence(sequence)) => tokens.extend(sequence),
            Some(item) => self.list_item_tokens(item, &mut tokens)?,
        }
        tokens.push(self.factory.tag("close"));

        self.sequence.extend(tokens);
        Ok(self)
    }

    fn list_item_tokens(&self, item: Content, tokens: &mut Vec<Token>) -> Result<(), BuildError> {
        match item {
            Content::Token(token) => tokens.push(token),
            Content::Literal(value) => tokens.push(self.factory.value(KIND_VALUE, value)?),
            Content::Sequence(sequence) => {
                tokens.push(self.factory.tag("open"));
                tokens.extend(sequence);
                tokens.push(self.factory.tag("close"));
            }
            Content::List(items) => {
                tokens.push(self.factory.tag("open"));
                for item in items {
                    self.list_item_tokens(item, tokens)?;
                }
                tokens.push(self.factory.tag("close"));
            }
        }
        Ok(())
    }

    pub fn func(&mut self, name: &str, args: Vec<Content>) -> Result<&mut Self, BuildError> {
        let mut call = Self::expression();
        call.sequence.push(self.factory.keyword("function", name));
        call.closure(Some(Content::List(args)))?;
        self.sequence.extend(call.sequence);
        Ok(self)
    }

    pub fn aggregate(&mut self, kind: &str, args: Vec<Content>) -> Result<&mut Self, BuildError> {
        if !AGGREGATE_FUNCTIONS.contains(&kind) {
            return Err(BuildError::InvalidArgument {
                operation: "aggregate",
                message: format!(
                    "'{}' is not one of {}",
                    kind,
                    AGGREGATE_FUNCTIONS.iter().join(", ")
                ),
            });
        }
        self.func(kind, args)
    }

    pub fn sort<'a>(
        &mut self,
        by: impl IntoIterator<Item = (&'a str, SortDirection)>,
    ) -> &mut Self {
        self.keyword("sort");
        for (field, direction) in by {
            self.reference(field);
            self.sequence
                .push(self.factory.keyword("sort-direction", direction.name()));
        }
        self
    }

    pub fn group<'a>(&mut self, by: impl IntoIterator<Item = &'a str>) -> &mut Self {
        self.keyword("group");
        for field in by {
            self.reference(field);
        }
        self
    }

    pub fn limit(&mut self, limit: i64, offset: Option<i64>) -> Result<&mut Self, BuildError> {
        if limit <= 0 {
            return Err(BuildError::InvalidArgument {
                operation: "limit",
                message: format!("the limit must be greater than 0, {} given", limit),
            });
        }
        if let Some(offset) = offset {
            if offset < 0 {
                return Err(BuildError::InvalidArgument {
                    operation: "limit",
                    message: format!("the offset must not be negative, {} given", offset),
                });
            }
        }

        self.keyword("limit");
        self.val(limit)?;
        if let Some(offset) = offset {
            self.keyword("offset");
            self.val(offset)?;
        }
        Ok(self)
    }

    pub fn join(
        &mut self,
        collection: &str,
        on: Option<Content>,
        alias: &str,
        kind: JoinType,
    ) -> Result<&mut Self, BuildError> {
        if !self.sequence_type.is_query() {
            return Err(BuildError::NotAQuery("join"));
        }

        let key = if alias.is_empty() { collection } else { alias };
        if self.joined.contains(key) {
            return Err(BuildError::AliasCollision {
                collection: collection.to_owned(),
                alias: key.to_owned(),
            });
        }

        let mut clause = Self::expression();
        clause.keyword(kind.keyword());
        if kind == JoinType::Full {
            clause.keyword("outer");
        }
        clause
            .keyword("join")
            .reference_with("collection", collection, alias)
            .keyword("on")
            .closure(on)?;

        self.joined.insert(key.to_owned());
        self.sequence.extend(clause.sequence);
        Ok(self)
    }

    /// Joins a related entity using the relationship its parent declares.
    pub fn include_entity(
        &mut self,
        child: &Arc<EntityMetadata>,
        alias: &str,
        parent_alias: &str,
        extra_on: Option<&TokenSequencer>,
    ) -> Result<&mut Self, BuildError> {
        if !self.sequence_type.is_query() {
            return Err(BuildError::NotAQuery("include entities"));
        }

        let (parent, parent_prefix) = if parent_alias.is_empty() {
            let root = self.metadata.clone().ok_or(BuildError::MissingMetadata)?;
            let prefix = root.collection().to_owned();
            (root, prefix)
        } else {
            let parent = self.includes.get(parent_alias).cloned().ok_or_else(|| {
                BuildError::UnknownParent {
                    entity: child.entity().to_owned(),
                    parent: parent_alias.to_owned(),
                }
            })?;
            (parent, parent_alias.to_owned())
        };

        let key = if alias.is_empty() { child.entity() } else { alias };
        let relationship = parent.relationship(key).ok_or_else(|| BuildError::UnknownRelationship {
            entity: child.entity().to_owned(),
            parent: parent.entity().to_owned(),
            alias: key.to_owned(),
        })?;

        let child_alias = if alias.is_empty() { child.collection() } else { alias };
        let parent_field = format!(
            "{}.{}",
            parent_prefix,
            relationship.our_field.as_deref().unwrap_or(parent.primary_key())
        );
        let child_field = format!(
            "{}.{}",
            child_alias,
            relationship.their_field.as_deref().unwrap_or(child.primary_key())
        );

        if relationship.relationship_type == RelationshipType::ManyToMany {
            let join_table = relationship.join_table.as_deref().unwrap_or_default();
            let fields = relationship.join_table_fields(&parent, child);

            let mut to_join_table = Self::expression();
            to_join_table
                .reference(&parent_field)
                .op("=")
                .reference(&format!("{}.{}", join_table, fields.ours));

            let mut to_child = Self::expression();
            to_child
                .reference(&format!("{}.{}", join_table, fields.theirs))
                .op("=")
                .reference(&child_field);
            if let Some(extra) = extra_on {
                to_child.and().sequence.extend_from_slice(extra.tokens());
            }

            // Both joins go in or neither does.
            let (length, joined) = (self.sequence.len(), self.joined.clone());
            let result = self
                .join(join_table, Some(to_join_table.into()), "", JoinType::Left)
                .and_then(|sequence| {
                    sequence.join(child.collection(), Some(to_child.into()), alias, JoinType::Left)
                })
                .map(|_| ());
            if let Err(err) = result {
                self.sequence.truncate(length);
                self.joined = joined;
                return Err(err);
            }
        } else {
            let mut on = Self::expression();
            on.reference(&parent_field).op("=").reference(&child_field);
            if let Some(extra) = extra_on {
                on.and().sequence.extend_from_slice(extra.tokens());
            }

            self.join(child.collection(), Some(on.into()), alias, JoinType::Left)?;
        }

        self.includes.insert(child_alias.to_owned(), child.clone());
        Ok(self)
    }
}

impl fmt::Display for TokenSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sequence.iter().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::metadata::{FieldAccessor, RelationshipOptions};

    fn render(sequencer: &TokenSequencer) -> String {
        sequencer
            .tokens()
            .iter()
            .map(|token| match token {
                Token::Reference { name, .. } => name.clone(),
                Token::Value { value: Value::String(s), .. } => s.clone(),
                Token::Value { value, .. } => value.to_string(),
                other => other.to_string(),
            })
            .join(" ")
    }

    fn metadata(name: &str, relationships: Vec<(&str, RelationshipOptions)>) -> Arc<EntityMetadata> {
        let mut metadata = EntityMetadata::new(name);
        metadata.register_accessor("related", FieldAccessor::read_only(|_: &()| Value::Null));
        for (entity, options) in relationships {
            metadata
                .add_relationship_metadata(entity, options.property("related"))
                .unwrap();
        }
        Arc::new(metadata)
    }

    fn one_to_many() -> (Arc<EntityMetadata>, Arc<EntityMetadata>) {
        let one = metadata(
            "one",
            vec![("two", RelationshipOptions::one_to_many().their_field("one_id"))],
        );
        (one, metadata("two", vec![]))
    }

    #[test]
    fn test_empty_closure() {
        let mut sequencer = TokenSequencer::expression();
        sequencer.closure(None).unwrap();
        assert_eq!(sequencer.len(), 2);
        assert_eq!(render(&sequencer), "open close");
    }

    #[test]
    fn test_closure_with_mixed_content() {
        let mut inner = TokenSequencer::expression();
        inner.reference("a").op("=").val(1).unwrap();

        let mut sequencer = TokenSequencer::expression();
        sequencer
            .closure(Some(Content::List(vec![
                json!(2).into(),
                TokenFactory.tag("x").into(),
                (&inner).into(),
            ])))
            .unwrap();
        assert_eq!(render(&sequencer), "open 2 x open a = 1 close close");

        let mut spliced = TokenSequencer::expression();
        spliced.closure(Some(inner.into())).unwrap();
        assert_eq!(render(&spliced), "open a = 1 close");
    }

    #[test]
    fn test_closure_rejects_object_literals() {
        let mut sequencer = TokenSequencer::expression();
        assert!(sequencer
            .closure(Some(Content::List(vec![json!(1).into(), json!({"a": 1}).into()])))
            .is_err());
        assert!(sequencer.is_empty());
    }

    #[test]
    fn test_limit() {
        let mut sequencer = TokenSequencer::for_collection(SequenceType::Find, "t");
        assert!(sequencer.limit(0, None).is_err());
        assert!(sequencer.limit(-1, None).is_err());
        assert!(sequencer.limit(5, Some(-1)).is_err());
        assert!(sequencer.is_empty());

        sequencer.limit(5, None).unwrap();
        assert_eq!(sequencer.len(), 2);

        let mut sequencer = TokenSequencer::for_collection(SequenceType::Find, "t");
        sequencer.limit(5, Some(10)).unwrap();
        assert_eq!(sequencer.len(), 4);
        assert_eq!(render(&sequencer), "limit 5 offset 10");

        let mut sequencer = TokenSequencer::for_collection(SequenceType::Find, "t");
        sequencer.limit(5, Some(0)).unwrap();
        assert_eq!(sequencer.len(), 4);
    }

    #[test]
    fn test_aggregate_matches_function() {
        let mut aggregate = TokenSequencer::for_collection(SequenceType::Find, "t");
        aggregate.aggregate("count", vec!["*".into()]).unwrap();

        let mut function = TokenSequencer::for_collection(SequenceType::Find, "t");
        function.func("count", vec!["*".into()]).unwrap();

        assert_eq!(aggregate.len(), 4);
        assert_eq!(aggregate.tokens(), function.tokens());
        assert!(matches!(
            aggregate.aggregate("median", vec![]),
            Err(BuildError::InvalidArgument { operation: "aggregate", .. })
        ));
    }

    #[test]
    fn test_sort_and_group() {
        let mut sequencer = TokenSequencer::for_collection(SequenceType::Find, "t");
        sequencer
            .group(["a", "b"])
            .sort([("a", SortDirection::Descending), ("b", "asc".parse().unwrap())]);
        assert_eq!(render(&sequencer), "group a b sort a descending b ascending");
        assert!("sideways".parse::<SortDirection>().is_err());
        assert_eq!("-1".parse::<SortDirection>().unwrap().signum(), -1);
    }

    #[test]
    fn test_op_is_lowercased() {
        let mut sequencer = TokenSequencer::expression();
        sequencer.reference("a").op("NOT IN").closure(Some(vec![1_i64, 2].into())).unwrap();
        assert_eq!(render(&sequencer), "a not in open 1 2 close");
    }

    #[test]
    fn test_join() {
        let mut on = TokenSequencer::expression();
        on.reference("a.id").op("=").reference("b.a_id");

        let mut sequencer = TokenSequencer::for_collection(SequenceType::Find, "a");
        sequencer
            .join("b", Some((&on).into()), "", "full".parse().unwrap())
            .unwrap();
        assert_eq!(render(&sequencer), "full outer join b on open a.id = b.a_id close");

        assert_eq!(
            sequencer.join("b", None, "", JoinType::Inner).err(),
            Some(BuildError::AliasCollision {
                collection: "b".to_owned(),
                alias: "b".to_owned()
            })
        );
        assert!(sequencer.join("b", None, "b2", JoinType::Inner).is_ok());
        assert_eq!(
            "sideways".parse::<JoinType>(),
            Err(BuildError::UnsupportedJoin("sideways".to_owned()))
        );
        assert_eq!("".parse::<JoinType>(), Ok(JoinType::Inner));

        let mut expression = TokenSequencer::expression();
        assert_eq!(
            expression.join("b", None, "", JoinType::Inner).err(),
            Some(BuildError::NotAQuery("join"))
        );
    }

    #[test]
    fn test_include_one_to_many() {
        let (one, two) = one_to_many();
        let mut sequencer = TokenSequencer::find(one);
        sequencer.include_entity(&two, "", "", None).unwrap();

        assert_eq!(sequencer.len(), 9);
        assert_eq!(
            sequencer.tokens(),
            &[
                Token::Tag("left".to_owned()),
                Token::Tag("join".to_owned()),
                TokenFactory.reference("collection", "two", ""),
                Token::Tag("on".to_owned()),
                Token::Tag("open".to_owned()),
                TokenFactory.reference("field", "one.id", ""),
                TokenFactory.keyword("operator", "="),
                TokenFactory.reference("field", "two.one_id", ""),
                Token::Tag("close".to_owned()),
            ]
        );
        assert!(sequencer.includes().contains_key("two"));
    }

    #[test]
    fn test_include_with_extra_condition() {
        let (one, two) = one_to_many();
        let mut extra = TokenSequencer::expression();
        extra.reference("two.active").op("=").val(true).unwrap();

        let mut sequencer = TokenSequencer::find(one);
        sequencer.include_entity(&two, "", "", Some(&extra)).unwrap();
        assert_eq!(
            render(&sequencer),
            "left join two on open one.id = two.one_id and two.active = true close"
        );
    }

    #[test]
    fn test_include_with_aliases() {
        let one = metadata(
            "one",
            vec![(
                "two",
                RelationshipOptions::one_to_many().their_field("one_id").alias("twos"),
            )],
        );
        let two = metadata(
            "two",
            vec![("three", RelationshipOptions::one_to_one().our_field("three_id"))],
        );
        let three = metadata("three", vec![]);

        let mut sequencer = TokenSequencer::find(one);
        sequencer
            .include_entity(&two, "twos", "", None)
            .unwrap()
            .include_entity(&three, "", "twos", None)
            .unwrap();

        assert_eq!(
            render(&sequencer),
            "left join two on open one.id = twos.one_id close \
             left join three on open twos.three_id = three.id close"
        );
        assert_eq!(
            sequencer.tokens()[2],
            TokenFactory.reference("collection", "two", "twos")
        );
    }

    #[test]
    fn test_include_many_to_many() {
        let one = metadata(
            "one",
            vec![("two", RelationshipOptions::many_to_many().join_table("one_two"))],
        );
        let two = metadata("two", vec![]);

        let mut sequencer = TokenSequencer::find(one);
        sequencer.include_entity(&two, "", "", None).unwrap();
        assert_eq!(
            render(&sequencer),
            "left join one_two on open one.id = one_two.one_id close \
             left join two on open one_two.two_id = two.id close"
        );
    }

    #[test]
    fn test_failed_include_leaves_sequence_unchanged() {
        let one = metadata(
            "one",
            vec![("two", RelationshipOptions::many_to_many().join_table("one_two"))],
        );
        let two = metadata("two", vec![]);

        let mut sequencer = TokenSequencer::find(one);
        sequencer.join("two", None, "", JoinType::Inner).unwrap();
        let before = render(&sequencer);

        assert_eq!(
            sequencer.include_entity(&two, "", "", None).err(),
            Some(BuildError::AliasCollision {
                collection: "two".to_owned(),
                alias: "two".to_owned()
            })
        );
        assert_eq!(render(&sequencer), before);
        assert!(sequencer.includes().is_empty());

        // The join table was not left marked as joined.
        sequencer.join("one_two", None, "", JoinType::Inner).unwrap();
        assert_eq!(
            sequencer.join("one_two", None, "", JoinType::Left).err(),
            Some(BuildError::AliasCollision {
                collection: "one_two".to_owned(),
                alias: "one_two".to_owned()
            })
        );
        assert_eq!(
            render(&sequencer),
            "inner join two on open close inner join one_two on open close"
        );
    }

    #[test]
    fn test_include_errors() {
        let (one, two) = one_to_many();

        let mut expression = TokenSequencer::expression();
        assert_eq!(
            expression.include_entity(&two, "", "", None).err(),
            Some(BuildError::NotAQuery("include entities"))
        );

        let mut sequencer = TokenSequencer::find(one.clone());
        assert!(matches!(
            sequencer.include_entity(&one, "", "", None),
            Err(BuildError::UnknownRelationship { .. })
        ));
        assert!(matches!(
            sequencer.include_entity(&two, "", "nowhere", None),
            Err(BuildError::UnknownParent { .. })
        ));

        assert!(sequencer.is_empty());

        sequencer.include_entity(&two, "", "", None).unwrap();
        let length = sequencer.len();
        assert!(matches!(
            sequencer.include_entity(&two, "", "", None),
            Err(BuildError::AliasCollision { .. })
        ));
        assert_eq!(sequencer.len(), length);

        let mut bare = TokenSequencer::for_collection(SequenceType::Find, "one");
        assert_eq!(
            bare.include_entity(&two, "", "", None).err(),
            Some(BuildError::MissingMetadata)
        );
    }

    #[test]
    fn test_cursor() {
        let mut sequencer = TokenSequencer::expression();
        sequencer.where_().reference("a");
        let mut cursor = sequencer.cursor();
        assert!(cursor.eat("where"));
        assert!(!cursor.eat("where"));
        assert_eq!(cursor.peek().map(Token::kind), Some("field"));
        assert_eq!(cursor.next().map(Token::kind), Some("field"));
        assert!(cursor.is_done());
    }
}
