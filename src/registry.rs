use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MetadataError;
use crate::metadata::{EntityMetadata, RelationshipType};

/// Resolves metadata for entities taking part in a relationship.
pub trait MetadataProvider {
    fn entity_metadata(&self, entity: &str) -> Result<Arc<EntityMetadata>, MetadataError>;

    /// Anonymous metadata naming a many-to-many join table.
    fn intermediary_metadata(&self, join_table: &str) -> Arc<EntityMetadata> {
        Arc::new(EntityMetadata::anonymous(join_table))
    }
}

/// The metadata of every entity, validated as a whole and read-only once
/// built. Repositories share one registry instead of asking each other for
/// metadata.
#[derive(Clone, Debug, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl MetadataRegistry {
    pub fn new(
        entities: impl IntoIterator<Item = EntityMetadata>,
    ) -> Result<Self, MetadataError> {
        let mut registry = Self::default();
        for metadata in entities {
            let name = metadata.entity().to_owned();
            if registry.entities.contains_key(&name) {
                return Err(MetadataError::DuplicateEntity(name));
            }
            registry.entities.insert(name, Arc::new(metadata));
        }

        registry.validate()?;
        tracing::debug!(entities = registry.entities.len(), "built metadata registry");
        Ok(registry)
    }

    fn validate(&self) -> Result<(), MetadataError> {
        for parent in self.entities.values() {
            for (alias, relationship) in parent.relationships() {
                let child = self.entity_metadata(&relationship.entity)?;
                if relationship.relationship_type != RelationshipType::ManyToMany {
                    continue;
                }

                let fields = relationship.join_table_fields(parent, &child);
                if fields.ours == fields.theirs {
                    return Err(MetadataError::JoinFieldCollision {
                        entity: parent.entity().to_owned(),
                        alias: alias.to_owned(),
                        column: fields.ours,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.values()
    }
}

impl MetadataProvider for MetadataRegistry {
    fn entity_metadata(&self, entity: &str) -> Result<Arc<EntityMetadata>, MetadataError> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| MetadataError::UnknownEntity(entity.to_owned()))
    }
}
