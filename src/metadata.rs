use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::collection::{Collection, Identifiable};
use crate::error::MetadataError;
use crate::token::Record;

pub const DEFAULT_PRIMARY_KEY: &str = "id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    String,
    Array,
    DateTime,
}

impl FromStr for FieldType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(FieldType::Bool),
            "int" => Ok(FieldType::Int),
            "float" => Ok(FieldType::Float),
            "string" => Ok(FieldType::String),
            "array" => Ok(FieldType::Array),
            "datetime" => Ok(FieldType::DateTime),
            _ => Err(()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Array => "array",
            FieldType::DateTime => "datetime",
        };
        write!(f, "{}", name)
    }
}

/// Reads and writes one property of an entity.
pub trait Accessor: Send + Sync + fmt::Debug {
    fn get(&self, entity: &dyn Any) -> Option<Value>;

    fn set(&self, entity: &mut dyn Any, value: Value) -> Option<()>;

    fn can_set(&self) -> bool;
}

type Getter<E> = Box<dyn Fn(&E) -> Value + Send + Sync>;
type Setter<E> = Box<dyn Fn(&mut E, Value) + Send + Sync>;

pub struct FieldAccessor<E> {
    getter: Getter<E>,
    setter: Option<Setter<E>>,
}

impl<E: Any> FieldAccessor<E> {
    pub fn new(
        getter: impl Fn(&E) -> Value + Send + Sync + 'static,
        setter: impl Fn(&mut E, Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            getter: Box::new(getter),
            setter: Some(Box::new(setter)),
        }
    }

    pub fn read_only(getter: impl Fn(&E) -> Value + Send + Sync + 'static) -> Self {
        Self {
            getter: Box::new(getter),
            setter: None,
        }
    }
}

impl<E> fmt::Debug for FieldAccessor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("entity", &type_name::<E>())
            .field("writable", &self.setter.is_some())
            .finish()
    }
}

impl<E: Any> Accessor for FieldAccessor<E> {
    fn get(&self, entity: &dyn Any) -> Option<Value> {
        entity.downcast_ref::<E>().map(|entity| (self.getter)(entity))
    }

    fn set(&self, entity: &mut dyn Any, value: Value) -> Option<()> {
        let setter = self.setter.as_ref()?;
        let entity = entity.downcast_mut::<E>()?;
        setter(entity, value);
        Some(())
    }

    fn can_set(&self) -> bool {
        self.setter.is_some()
    }
}

#[derive(Default)]
pub struct Changes<'a> {
    pub added: Vec<&'a dyn Any>,
    pub removed: Vec<&'a dyn Any>,
}

impl Changes<'_> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Exposes the change set of a to-many relationship property.
pub trait RelationAccessor: Send + Sync + fmt::Debug {
    fn changes<'a>(&self, entity: &'a dyn Any) -> Option<Changes<'a>>;
}

type CollectionGetter<P, C> = Box<dyn Fn(&P) -> &Collection<C> + Send + Sync>;

pub struct CollectionAccessor<P, C> {
    getter: CollectionGetter<P, C>,
}

impl<P: Any, C: Identifiable + Any> CollectionAccessor<P, C> {
    pub fn new(getter: impl Fn(&P) -> &Collection<C> + Send + Sync + 'static) -> Self {
        Self {
            getter: Box::new(getter),
        }
    }
}

impl<P, C> fmt::Debug for CollectionAccessor<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionAccessor")
            .field("parent", &type_name::<P>())
            .field("child", &type_name::<C>())
            .finish()
    }
}

impl<P: Any, C: Identifiable + Any> RelationAccessor for CollectionAccessor<P, C> {
    fn changes<'a>(&self, entity: &'a dyn Any) -> Option<Changes<'a>> {
        let parent = entity.downcast_ref::<P>()?;
        let collection = (self.getter)(parent);
        Some(Changes {
            added: collection.added().map(|c| c as &dyn Any).collect(),
            removed: collection.removed().map(|c| c as &dyn Any).collect(),
        })
    }
}

#[derive(Clone, Debug)]
pub enum PropertyAccessor {
    Value(Arc<dyn Accessor>),
    Collection(Arc<dyn RelationAccessor>),
}

impl<E: Any> From<FieldAccessor<E>> for PropertyAccessor {
    fn from(accessor: FieldAccessor<E>) -> Self {
        PropertyAccessor::Value(Arc::new(accessor))
    }
}

impl<P: Any, C: Identifiable + Any> From<CollectionAccessor<P, C>> for PropertyAccessor {
    fn from(accessor: CollectionAccessor<P, C>) -> Self {
        PropertyAccessor::Collection(Arc::new(accessor))
    }
}

#[derive(Clone, Debug, Default)]
pub struct FieldOptions {
    pub field_type: Option<String>,
    pub auto_increment: Option<bool>,
    pub nullable: Option<bool>,
    pub getter: Option<String>,
    pub setter: Option<String>,
}

impl FieldOptions {
    pub fn typed(field_type: &str) -> Self {
        Self {
            field_type: Some(field_type.to_owned()),
            ..Self::default()
        }
    }

    pub fn auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = Some(auto_increment);
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn getter(mut self, name: &str) -> Self {
        self.getter = Some(name.to_owned());
        self
    }

    pub fn setter(mut self, name: &str) -> Self {
        self.setter = Some(name.to_owned());
        self
    }

    fn is_empty(&self) -> bool {
        self.field_type.is_none()
            && self.auto_increment.is_none()
            && self.nullable.is_none()
            && self.getter.is_none()
            && self.setter.is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct FieldMetadata {
    pub field_type: Option<FieldType>,
    pub auto_increment: Option<bool>,
    pub nullable: bool,
    getter: Option<Arc<dyn Accessor>>,
    setter: Option<Arc<dyn Accessor>>,
}

impl FieldMetadata {
    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment.unwrap_or(false)
    }

    pub fn has_getter(&self) -> bool {
        self.getter.is_some()
    }

    pub fn has_setter(&self) -> bool {
        self.setter.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelationshipType {
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl RelationshipType {
    pub fn is_to_many(self) -> bool {
        self != RelationshipType::OneToOne
    }
}

impl FromStr for RelationshipType {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], " ").as_str() {
            "one to one" | "many to one" => Ok(RelationshipType::OneToOne),
            "one to many" => Ok(RelationshipType::OneToMany),
            "many to many" => Ok(RelationshipType::ManyToMany),
            _ => Err(MetadataError::InvalidRelationshipType(s.to_owned())),
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationshipType::OneToOne => "one-to-one",
            RelationshipType::OneToMany => "one-to-many",
            RelationshipType::ManyToMany => "many-to-many",
        };
        write!(f, "{}", name)
    }
}

/// Column names of a many-to-many join table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinTableFields {
    pub ours: String,
    pub theirs: String,
}

#[derive(Clone, Debug)]
pub struct RelationshipOptions {
    pub relationship_type: RelationshipType,
    pub property: Option<String>,
    pub our_field: Option<String>,
    pub their_field: Option<String>,
    pub join_table: Option<String>,
    pub join_fields: Option<JoinTableFields>,
    pub alias: Option<String>,
    pub getter: Option<String>,
}

impl RelationshipOptions {
    pub fn new(relationship_type: RelationshipType) -> Self {
        Self {
            relationship_type,
            property: None,
            our_field: None,
            their_field: None,
            join_table: None,
            join_fields: None,
            alias: None,
            getter: None,
        }
    }

    pub fn one_to_one() -> Self {
        Self::new(RelationshipType::OneToOne)
    }

    pub fn one_to_many() -> Self {
        Self::new(RelationshipType::OneToMany)
    }

    pub fn many_to_many() -> Self {
        Self::new(RelationshipType::ManyToMany)
    }

    pub fn property(mut self, property: &str) -> Self {
        self.property = Some(property.to_owned());
        self
    }

    pub fn our_field(mut self, field: &str) -> Self {
        self.our_field = Some(field.to_owned());
        self
    }

    pub fn their_field(mut self, field: &str) -> Self {
        self.their_field = Some(field.to_owned());
        self
    }

    pub fn join_table(mut self, table: &str) -> Self {
        self.join_table = Some(table.to_owned());
        self
    }

    pub fn join_fields(mut self, ours: &str, theirs: &str) -> Self {
        self.join_fields = Some(JoinTableFields {
            ours: ours.to_owned(),
            theirs: theirs.to_owned(),
        });
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_owned());
        self
    }

    pub fn getter(mut self, name: &str) -> Self {
        self.getter = Some(name.to_owned());
        self
    }
}

#[derive(Clone, Debug)]
pub struct Relationship {
    pub entity: String,
    pub relationship_type: RelationshipType,
    pub property: String,
    pub our_field: Option<String>,
    pub their_field: Option<String>,
    pub join_table: Option<String>,
    pub join_fields: Option<JoinTableFields>,
    accessor: Option<PropertyAccessor>,
}

impl Relationship {
    /// Join table column names, either declared or derived as
    /// `{collection}_{field}` for each side.
    pub fn join_table_fields(&self, parent: &EntityMetadata, child: &EntityMetadata) -> JoinTableFields {
        if let Some(fields) = &self.join_fields {
            return fields.clone();
        }

        let ours = self.our_field.as_deref().unwrap_or(parent.primary_key());
        let theirs = self.their_field.as_deref().unwrap_or(child.primary_key());
        JoinTableFields {
            ours: format!("{}_{}", parent.collection(), ours),
            theirs: format!("{}_{}", child.collection(), theirs),
        }
    }

    pub fn accessor(&self) -> Option<&PropertyAccessor> {
        self.accessor.as_ref()
    }
}

#[derive(Clone, Debug)]
pub struct EntityMetadata {
    entity: String,
    primary_key: String,
    collection: String,
    fields: BTreeMap<String, FieldMetadata>,
    relationships: BTreeMap<String, Relationship>,
    accessors: HashMap<String, PropertyAccessor>,
}

impl EntityMetadata {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_owned(),
            primary_key: DEFAULT_PRIMARY_KEY.to_owned(),
            collection: entity.to_owned(),
            fields: BTreeMap::new(),
            relationships: BTreeMap::new(),
            accessors: HashMap::new(),
        }
    }

    /// Metadata with no owning entity, used to name a join table.
    pub fn anonymous(collection: &str) -> Self {
        let mut metadata = Self::new("");
        metadata.collection = collection.to_owned();
        metadata
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn is_anonymous(&self) -> bool {
        self.entity.is_empty()
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn set_primary_key(&mut self, primary_key: &str) -> &mut Self {
        self.primary_key = primary_key.to_owned();
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn set_collection(&mut self, collection: &str) -> &mut Self {
        self.collection = collection.to_owned();
        self
    }

    pub fn register_accessor(
        &mut self,
        name: &str,
        accessor: impl Into<PropertyAccessor>,
    ) -> &mut Self {
        self.accessors.insert(name.to_owned(), accessor.into());
        self
    }

    pub fn add_field_metadata(
        &mut self,
        name: &str,
        options: FieldOptions,
    ) -> Result<&mut Self, MetadataError> {
        if options.is_empty() {
            return Err(MetadataError::EmptyFieldMetadata(name.to_owned()));
        }

        let field_type = match &options.field_type {
            Some(field_type) => Some(field_type.parse::<FieldType>().map_err(|_| {
                MetadataError::InvalidFieldType {
                    field: name.to_owned(),
                    field_type: field_type.clone(),
                }
            })?),
            None => None,
        };

        let getter = self.resolve_value_accessor(name, options.getter.as_deref(), false)?;
        let setter = self.resolve_value_accessor(name, options.setter.as_deref(), true)?;

        self.fields.insert(
            name.to_owned(),
            FieldMetadata {
                field_type,
                auto_increment: options.auto_increment,
                nullable: options.nullable.unwrap_or(false),
                getter,
                setter,
            },
        );
        Ok(self)
    }

    fn resolve_value_accessor(
        &self,
        field: &str,
        declared: Option<&str>,
        writable: bool,
    ) -> Result<Option<Arc<dyn Accessor>>, MetadataError> {
        let name = declared.unwrap_or(field);
        match self.accessors.get(name) {
            Some(PropertyAccessor::Value(accessor)) if !writable || accessor.can_set() => {
                Ok(Some(accessor.clone()))
            }
            _ if declared.is_some() => Err(MetadataError::MissingAccessor {
                entity: self.entity.clone(),
                accessor: name.to_owned(),
                generated: false,
            }),
            _ => Ok(None),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldMetadata)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Metadata of the primary key; an undeclared key is an auto-incrementing
    /// integer.
    pub fn primary_key_metadata(&self) -> FieldMetadata {
        let mut metadata = self.fields.get(&self.primary_key).cloned().unwrap_or_default();
        metadata.field_type.get_or_insert(FieldType::Int);
        metadata.auto_increment.get_or_insert(true);
        metadata
    }

    pub fn add_relationship_metadata(
        &mut self,
        related_entity: &str,
        options: RelationshipOptions,
    ) -> Result<&mut Self, MetadataError> {
        let property = match options.property {
            Some(property) => property,
            None if self.is_anonymous() => String::new(),
            None => return Err(MetadataError::MissingProperty(related_entity.to_owned())),
        };

        match options.relationship_type {
            RelationshipType::OneToOne
                if options.our_field.is_none() && options.their_field.is_none() =>
            {
                return Err(MetadataError::MissingJoinField(related_entity.to_owned()));
            }
            RelationshipType::OneToMany if options.their_field.is_none() => {
                return Err(MetadataError::MissingTheirField(related_entity.to_owned()));
            }
            RelationshipType::ManyToMany if options.join_table.is_none() => {
                return Err(MetadataError::MissingJoinTable(related_entity.to_owned()));
            }
            _ => {}
        }

        let accessor = if self.is_anonymous() {
            None
        } else {
            let name = options.getter.as_deref().unwrap_or(&property);
            let accessor = self.accessors.get(name).cloned().ok_or_else(|| {
                MetadataError::MissingAccessor {
                    entity: self.entity.clone(),
                    accessor: name.to_owned(),
                    generated: options.getter.is_none(),
                }
            })?;
            Some(accessor)
        };

        let alias = options.alias.unwrap_or_else(|| related_entity.to_owned());
        self.relationships.insert(
            alias,
            Relationship {
                entity: related_entity.to_owned(),
                relationship_type: options.relationship_type,
                property,
                our_field: options.our_field,
                their_field: options.their_field,
                join_table: options.join_table,
                join_fields: options.join_fields,
                accessor,
            },
        );
        Ok(self)
    }

    pub fn relationship(&self, alias: &str) -> Option<&Relationship> {
        self.relationships.get(alias)
    }

    pub fn has_relationship(&self, alias: &str) -> bool {
        self.relationships.contains_key(alias)
    }

    pub fn relationships(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.relationships
            .iter()
            .map(|(alias, relationship)| (alias.as_str(), relationship))
    }

    pub fn get_entity_value(&self, entity: &dyn Any, field: &str) -> Result<Value, MetadataError> {
        let accessor = self
            .field_metadata(field)?
            .getter
            .as_ref()
            .ok_or_else(|| self.no_access(field, "getter"))?;
        accessor.get(entity).ok_or_else(|| self.wrong_type())
    }

    pub fn set_entity_value(
        &self,
        entity: &mut dyn Any,
        field: &str,
        value: Value,
    ) -> Result<(), MetadataError> {
        let accessor = self
            .field_metadata(field)?
            .setter
            .as_ref()
            .ok_or_else(|| self.no_access(field, "setter"))?;
        accessor.set(entity, value).ok_or_else(|| self.wrong_type())
    }

    pub fn to_record(&self, entity: &dyn Any) -> Result<Record, MetadataError> {
        let mut record = Record::new();
        for (name, field) in &self.fields {
            if let Some(getter) = &field.getter {
                let value = getter.get(entity).ok_or_else(|| self.wrong_type())?;
                record.insert(name.clone(), value);
            }
        }
        Ok(record)
    }

    pub fn relation_changes<'a>(
        &self,
        entity: &'a dyn Any,
        alias: &str,
    ) -> Result<Changes<'a>, MetadataError> {
        let relationship = self.relationship(alias).ok_or_else(|| {
            MetadataError::UnknownRelationship {
                entity: self.entity.clone(),
                alias: alias.to_owned(),
            }
        })?;

        match relationship.accessor() {
            Some(PropertyAccessor::Collection(accessor)) => {
                accessor.changes(entity).ok_or_else(|| self.wrong_type())
            }
            _ => Err(MetadataError::NotACollection {
                entity: self.entity.clone(),
                property: relationship.property.clone(),
            }),
        }
    }

    fn field_metadata(&self, field: &str) -> Result<&FieldMetadata, MetadataError> {
        self.fields.get(field).ok_or_else(|| MetadataError::UnknownField {
            entity: self.entity.clone(),
            field: field.to_owned(),
        })
    }

    fn no_access(&self, field: &str, access: &'static str) -> MetadataError {
        MetadataError::NoAccess {
            entity: self.entity.clone(),
            field: field.to_owned(),
            access,
        }
    }

    fn wrong_type(&self) -> MetadataError {
        MetadataError::EntityType {
            entity: self.entity.clone(),
            expected: "registered entity type",
        }
    }
}
