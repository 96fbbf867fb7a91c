//! Repositories: entity level operations on top of sequences, the grammar,
//! an interpreter and a storage driver.

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;

use crate::compiler::compile_sequence;
use crate::error::RepositoryError;
use crate::grammar::TokenParser;
use crate::interpreter::QueryInterpreter;
use crate::metadata::{Changes, EntityMetadata, Relationship, RelationshipType};
use crate::normaliser::NormaliseOptions;
use crate::registry::{MetadataProvider, MetadataRegistry};
use crate::sequencer::{Content, SaveMode, SortDirection, TokenSequencer};
use crate::storage::{Storage, StorageResponse};
use crate::token::Record;

/// Which relationships are joined into find queries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum IncludeRelationships {
    #[default]
    None,
    All,
    /// Only the relationships with these aliases.
    Only(Vec<String>),
}

impl IncludeRelationships {
    fn includes(&self, alias: &str) -> bool {
        match self {
            IncludeRelationships::None => false,
            IncludeRelationships::All => true,
            IncludeRelationships::Only(aliases) => aliases.iter().any(|a| a == alias),
        }
    }
}

/// Everything repositories share: metadata, grammar and backend.
#[derive(Clone, Debug)]
pub struct RepositoryManager {
    registry: Arc<MetadataRegistry>,
    parser: Arc<TokenParser>,
    interpreter: Arc<dyn QueryInterpreter>,
    storage: Arc<dyn Storage>,
}

impl RepositoryManager {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        parser: Arc<TokenParser>,
        interpreter: Arc<dyn QueryInterpreter>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            registry,
            parser,
            interpreter,
            storage,
        }
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn repository(&self, entity: &str) -> Result<Repository, RepositoryError> {
        Ok(Repository {
            metadata: self.registry.entity_metadata(entity)?,
            manager: self.clone(),
            include_by_default: IncludeRelationships::None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Repository {
    metadata: Arc<EntityMetadata>,
    manager: RepositoryManager,
    include_by_default: IncludeRelationships,
}

impl Repository {
    /// Sets the relationships included when a call does not choose.
    pub fn with_includes(mut self, include: IncludeRelationships) -> Self {
        self.include_by_default = include;
        self
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    pub fn find(
        &self,
        id: impl Into<Value>,
        include: Option<&IncludeRelationships>,
    ) -> Result<Option<Record>, RepositoryError> {
        let mut sequence = TokenSequencer::find(self.metadata.clone());
        let included = self.add_includes(&mut sequence, include)?;

        let key = self.column(self.metadata.primary_key(), included);
        sequence.where_().reference(&key).op("=").val(id)?;

        let rows = self.rows(self.execute(&sequence)?)?;
        Ok(rows.into_iter().next())
    }

    pub fn filter(
        &self,
        filters: &Record,
        sort: &[(&str, SortDirection)],
        limit: Option<i64>,
        include: Option<&IncludeRelationships>,
    ) -> Result<Vec<Record>, RepositoryError> {
        let mut sequence = TokenSequencer::find(self.metadata.clone());
        let included = self.add_includes(&mut sequence, include)?;
        self.add_filters(&mut sequence, filters, included)?;
        if !sort.is_empty() {
            let sort = sort
                .iter()
                .map(|(field, direction)| (self.column(field, included), *direction))
                .collect::<Vec<_>>();
            sequence.sort(sort.iter().map(|(field, direction)| (field.as_str(), *direction)));
        }
        if let Some(limit) = limit {
            sequence.limit(limit, None)?;
        }

        self.rows(self.execute(&sequence)?)
    }

    /// Persists `entity` and the pending changes of its to-many
    /// relationships.
    ///
    /// A new auto-incrementing key is written back to the entity. Tracked
    /// collections are left untouched, committing them is up to the caller.
    pub fn save(&self, entity: &mut dyn Any) -> Result<StorageResponse, RepositoryError> {
        let primary_key = self.metadata.primary_key();
        let auto_increment = self.metadata.primary_key_metadata().is_auto_increment();

        let mut record = self.metadata.to_record(&*entity)?;
        if auto_increment && record.get(primary_key).map_or(false, Value::is_null) {
            record.remove(primary_key);
        }

        let mut sequence = TokenSequencer::save(self.metadata.clone());
        sequence.entity(Value::Object(record))?;
        let response = match self.execute(&sequence) {
            Err(RepositoryError::Storage(error))
                if !auto_increment && self.manager.storage.is_duplicate_key(&error) =>
            {
                tracing::warn!(
                    entity = self.metadata.entity(),
                    error = %error,
                    "duplicate key, saving as an update"
                );
                sequence.set_save_mode(SaveMode::Update);
                self.execute(&sequence)?
            }
            response => response?,
        };

        let new_key = match &response {
            StorageResponse::Inserted(Some(id)) if auto_increment => {
                let writable = self
                    .metadata
                    .field(primary_key)
                    .map_or(false, |field| field.has_setter());
                if writable {
                    self.metadata
                        .set_entity_value(entity, primary_key, id.clone())?;
                }
                Some(id.clone())
            }
            _ => None,
        };

        for (alias, relationship) in self.metadata.relationships() {
            if relationship.relationship_type == RelationshipType::OneToOne {
                continue;
            }

            let changes = self.metadata.relation_changes(&*entity, alias)?;
            if changes.is_empty() {
                continue;
            }

            let child = self.manager.registry.entity_metadata(&relationship.entity)?;
            let their_field = relationship
                .their_field
                .as_deref()
                .unwrap_or(child.primary_key());
            let our_value = match (&relationship.our_field, &new_key) {
                (None, Some(key)) => key.clone(),
                (our_field, _) => {
                    let our_field = our_field.as_deref().unwrap_or(primary_key);
                    self.metadata.get_entity_value(&*entity, our_field)?
                }
            };

            match relationship.relationship_type {
                RelationshipType::OneToMany => {
                    self.save_one_to_many(&child, their_field, our_value, &changes)?
                }
                RelationshipType::ManyToMany => {
                    self.save_many_to_many(relationship, &child, their_field, our_value, &changes)?
                }
                RelationshipType::OneToOne => {}
            }
        }

        Ok(response)
    }

    /// Points added children at the parent and detaches removed ones.
    fn save_one_to_many(
        &self,
        child: &Arc<EntityMetadata>,
        their_field: &str,
        our_value: Value,
        changes: &Changes<'_>,
    ) -> Result<(), RepositoryError> {
        let updates = [(&changes.added, our_value), (&changes.removed, Value::Null)];
        for (children, value) in updates {
            if children.is_empty() {
                continue;
            }

            let keys = self.child_values(child, children, child.primary_key())?;
            let mut sequence = TokenSequencer::update(child.clone());
            sequence
                .reference(their_field)
                .op("=")
                .val(value)?
                .where_()
                .reference(child.primary_key())
                .op("in")
                .closure(Some(keys))?;
            self.execute(&sequence)?;
        }
        Ok(())
    }

    /// Inserts and deletes rows of the join table.
    fn save_many_to_many(
        &self,
        relationship: &Relationship,
        child: &Arc<EntityMetadata>,
        their_field: &str,
        our_value: Value,
        changes: &Changes<'_>,
    ) -> Result<(), RepositoryError> {
        let join_table = relationship.join_table.as_deref().unwrap_or_default();
        let intermediary = self.manager.registry.intermediary_metadata(join_table);
        let fields = relationship.join_table_fields(&self.metadata, child);

        if !changes.added.is_empty() {
            let mut insert = TokenSequencer::save(intermediary.clone());
            insert.set_save_mode(SaveMode::Insert);
            for entity in &changes.added {
                let mut row = Record::new();
                row.insert(fields.ours.clone(), our_value.clone());
                row.insert(
                    fields.theirs.clone(),
                    child.get_entity_value(*entity, their_field)?,
                );
                insert.entity(Value::Object(row))?;
            }
            self.execute(&insert)?;
        }

        if !changes.removed.is_empty() {
            let values = self.child_values(child, &changes.removed, their_field)?;
            let mut delete = TokenSequencer::delete(intermediary);
            delete
                .where_()
                .reference(&fields.ours)
                .op("=")
                .val(our_value)?
                .and()
                .reference(&fields.theirs)
                .op("in")
                .closure(Some(values))?;
            self.execute(&delete)?;
        }
        Ok(())
    }

    fn child_values(
        &self,
        child: &EntityMetadata,
        children: &[&dyn Any],
        field: &str,
    ) -> Result<Content, RepositoryError> {
        let mut values = Vec::with_capacity(children.len());
        for entity in children {
            let value = child.get_entity_value(*entity, field)?;
            if value.is_null() {
                return Err(RepositoryError::UnsavedChild(child.entity().to_owned()));
            }
            values.push(Content::Literal(value));
        }
        Ok(Content::List(values))
    }

    /// Deletes the entity with the given key, returning the number of
    /// deleted records.
    pub fn delete(&self, id: impl Into<Value>) -> Result<u64, RepositoryError> {
        let mut sequence = TokenSequencer::delete(self.metadata.clone());
        sequence
            .where_()
            .reference(self.metadata.primary_key())
            .op("=")
            .val(id)?;
        self.affected(self.execute(&sequence)?)
    }

    pub fn delete_with_filter(&self, filters: &Record) -> Result<u64, RepositoryError> {
        let mut sequence = TokenSequencer::delete(self.metadata.clone());
        self.add_filters(&mut sequence, filters, false)?;
        self.affected(self.execute(&sequence)?)
    }

    /// Counts matching records, one row per group with the total under
    /// `count`.
    pub fn count(
        &self,
        conditions: &Record,
        group_by: &[&str],
    ) -> Result<Vec<Record>, RepositoryError> {
        let mut sequence = TokenSequencer::find(self.metadata.clone());
        sequence.aggregate("count", vec!["*".into()])?;
        self.add_filters(&mut sequence, conditions, false)?;
        if !group_by.is_empty() {
            sequence.group(group_by.iter().copied());
        }
        self.rows(self.execute(&sequence)?)
    }

    fn add_includes(
        &self,
        sequence: &mut TokenSequencer,
        include: Option<&IncludeRelationships>,
    ) -> Result<bool, RepositoryError> {
        let include = include.unwrap_or(&self.include_by_default);
        let mut included = false;
        for (alias, relationship) in self.metadata.relationships() {
            if !include.includes(alias) {
                continue;
            }

            let child = self.manager.registry.entity_metadata(&relationship.entity)?;
            let alias = if alias == child.entity() { "" } else { alias };
            sequence.include_entity(&child, alias, "", None)?;
            included = true;
        }
        Ok(included)
    }

    /// `where a = x and b = y …`, with one-to-one relationship aliases
    /// replaced by the field holding the related key.
    fn add_filters(
        &self,
        sequence: &mut TokenSequencer,
        filters: &Record,
        included: bool,
    ) -> Result<(), RepositoryError> {
        for (index, (field, value)) in filters.iter().enumerate() {
            let field = match self.metadata.relationship(field) {
                Some(relationship) => match (&relationship.relationship_type, &relationship.our_field) {
                    (RelationshipType::OneToOne, Some(our_field)) => our_field.as_str(),
                    _ => return Err(RepositoryError::RelationshipField(field.clone())),
                },
                None => field.as_str(),
            };

            if index == 0 {
                sequence.where_();
            } else {
                sequence.and();
            }
            sequence
                .reference(&self.column(field, included))
                .op("=")
                .val(value.clone())?;
        }
        Ok(())
    }

    /// Joined collections may share column names, so fields of this
    /// entity are qualified once anything is included.
    fn column(&self, field: &str, included: bool) -> String {
        if included && !field.contains('.') {
            format!("{}.{}", self.metadata.collection(), field)
        } else {
            field.to_owned()
        }
    }

    fn execute(&self, sequence: &TokenSequencer) -> Result<StorageResponse, RepositoryError> {
        self.manager.parser.parse_token_sequence(sequence)?;
        let query = compile_sequence(sequence)?;
        let compiled = self.manager.interpreter.interpret(&query)?;

        let span = tracing::debug_span!(
            "execute",
            collection = %compiled.collection,
            method = %compiled.method
        );
        let _enter = span.enter();
        tracing::debug!("executing compiled query");
        match self.manager.storage.execute(&compiled) {
            Ok(response) => {
                tracing::debug!("query finished");
                Ok(response)
            }
            // Callers decide whether a duplicate key is a failure.
            Err(error) if self.manager.storage.is_duplicate_key(&error) => {
                tracing::debug!(message = %error.message, "duplicate key");
                Err(error.into())
            }
            Err(error) => {
                tracing::error!(
                    collection = %error.collection,
                    method = %error.method,
                    message = %error.message,
                    "storage query failed"
                );
                Err(error.into())
            }
        }
    }

    fn rows(&self, response: StorageResponse) -> Result<Vec<Record>, RepositoryError> {
        let rows = match response {
            StorageResponse::Rows(rows) => rows,
            _ => return Err(self.unexpected()),
        };

        let normaliser = self.manager.interpreter.normaliser();
        Ok(rows
            .into_iter()
            .map(|row| {
                match normaliser.denormalise(Value::Object(row), NormaliseOptions::Both) {
                    Value::Object(row) => row,
                    _ => Record::new(),
                }
            })
            .collect())
    }

    fn affected(&self, response: StorageResponse) -> Result<u64, RepositoryError> {
        match response {
            StorageResponse::Affected(affected) => Ok(affected),
            _ => Err(self.unexpected()),
        }
    }

    fn unexpected(&self) -> RepositoryError {
        RepositoryError::UnexpectedResponse(self.metadata.collection().to_owned())
    }
}
