//! Column catalog
//!
//! Static per-entity metadata: property names, physical columns, column kinds,
//! nullability, the primary key, and the relationships between entities.
//! Descriptors are built once at startup and are read-only afterwards.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{MetadataStoreError, Result};
use crate::sql::sanitize::validate_identifier;
use crate::types::ColumnType;

/// A physical column exposed under a property name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDescriptor {
    /// Name used in filters and result rows
    #[serde(rename = "propertyName")]
    pub property_name: String,
    /// Physical column name
    #[serde(rename = "databaseName")]
    pub database_name: String,
    #[serde(flatten)]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, rename = "primaryKey")]
    pub primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDescriptor {
    /// Create a nullable column whose physical name equals its property name
    pub fn new(property_name: impl Into<String>, column_type: ColumnType) -> Self {
        let property_name = property_name.into();
        Self {
            database_name: property_name.clone(),
            property_name,
            column_type,
            nullable: true,
            primary_key: false,
        }
    }

    /// Map the property onto a differently named physical column
    pub fn column(mut self, database_name: impl Into<String>) -> Self {
        self.database_name = database_name.into();
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the column as the primary key (implies NOT NULL)
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn is_json(&self) -> bool {
        self.column_type.is_json()
    }
}

/// Cardinality of a relationship, seen from the owning entity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Junction table of a many-to-many relationship
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Junction {
    pub table: String,
    /// Junction columns referencing the source entity's `source_columns`
    #[serde(rename = "sourceColumns")]
    pub source_columns: Vec<String>,
    /// Junction columns referencing the target entity's `target_columns`
    #[serde(rename = "targetColumns")]
    pub target_columns: Vec<String>,
}

/// A named single-hop relationship from one entity to another
///
/// `source_columns` are properties of the owning entity and `target_columns`
/// properties of the target entity, compared pairwise. For many-to-many
/// relationships both sides are compared against the junction columns instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationDescriptor {
    pub name: String,
    pub kind: RelationKind,
    /// Name of the target entity
    pub target: String,
    #[serde(rename = "sourceColumns")]
    pub source_columns: Vec<String>,
    #[serde(rename = "targetColumns")]
    pub target_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub junction: Option<Junction>,
}

impl RelationDescriptor {
    /// The owning entity holds a foreign key to the target
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
        referenced: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::ManyToOne,
            target: target.into(),
            source_columns: vec![foreign_key.into()],
            target_columns: vec![referenced.into()],
            junction: None,
        }
    }

    /// The target entity holds a foreign key to the owning entity
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        referenced: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::OneToMany,
            target: target.into(),
            source_columns: vec![referenced.into()],
            target_columns: vec![foreign_key.into()],
            junction: None,
        }
    }

    pub fn one_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        source_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::OneToOne,
            target: target.into(),
            source_columns: vec![source_column.into()],
            target_columns: vec![target_column.into()],
            junction: None,
        }
    }

    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        source_key: impl Into<String>,
        target_key: impl Into<String>,
        junction: Junction,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::ManyToMany,
            target: target.into(),
            source_columns: vec![source_key.into()],
            target_columns: vec![target_key.into()],
            junction: Some(junction),
        }
    }

    /// Check the relationship's columns against both endpoint descriptors
    pub fn validate(&self, source: &EntityDescriptor, target: &EntityDescriptor) -> Result<()> {
        let unsupported = |msg: String| {
            MetadataStoreError::unsupported_relationship(format!(
                "{}.{}: {}",
                source.name, self.name, msg
            ))
        };

        if self.source_columns.is_empty() || self.source_columns.len() != self.target_columns.len()
        {
            return Err(unsupported(
                "source and target columns must be non-empty and pairwise".to_string(),
            ));
        }
        for col in &self.source_columns {
            if source.column(col).is_none() {
                return Err(unsupported(format!("unknown source column '{}'", col)));
            }
        }
        for col in &self.target_columns {
            if target.column(col).is_none() {
                return Err(unsupported(format!("unknown target column '{}'", col)));
            }
        }

        match (self.kind, &self.junction) {
            (RelationKind::ManyToMany, Some(junction)) => {
                validate_identifier(&junction.table, &[]).map_err(unsupported)?;
                if junction.source_columns.len() != self.source_columns.len()
                    || junction.target_columns.len() != self.target_columns.len()
                {
                    return Err(unsupported(
                        "junction columns must pair with the key columns".to_string(),
                    ));
                }
                Ok(())
            }
            (RelationKind::ManyToMany, None) => {
                Err(unsupported("many-to-many requires a junction table".to_string()))
            }
            (_, Some(_)) => Err(unsupported(
                "only many-to-many relationships use a junction table".to_string(),
            )),
            (_, None) => Ok(()),
        }
    }
}

/// Static metadata for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    columns: Vec<ColumnDescriptor>,
    relations: Vec<RelationDescriptor>,
    primary_key: usize,
}

impl EntityDescriptor {
    /// Create a descriptor, checking that it has exactly one primary key and
    /// unique property names
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
    ) -> Result<Self> {
        let name = name.into();
        let table = table.into();

        validate_identifier(&table, &[]).map_err(MetadataStoreError::validation)?;

        let mut seen = HashSet::new();
        for col in &columns {
            if col.property_name.is_empty() || col.database_name.is_empty() {
                return Err(MetadataStoreError::validation(format!(
                    "Entity '{}' has a column with an empty name",
                    name
                )));
            }
            if !seen.insert(col.property_name.as_str()) {
                return Err(MetadataStoreError::validation(format!(
                    "Entity '{}' declares property '{}' twice",
                    name, col.property_name
                )));
            }
        }

        let keys: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect();
        let primary_key = match keys.as_slice() {
            [single] => *single,
            _ => {
                return Err(MetadataStoreError::validation(format!(
                    "Entity '{}' must have exactly one primary key column, found {}",
                    name,
                    keys.len()
                )));
            }
        };

        Ok(Self {
            name,
            table,
            columns,
            relations: Vec::new(),
            primary_key,
        })
    }

    /// Attach a relationship (validated when the catalog is assembled)
    pub fn with_relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn relations(&self) -> &[RelationDescriptor] {
        &self.relations
    }

    /// Look up a column by property name
    pub fn column(&self, property_name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.property_name == property_name)
    }

    pub fn primary_key(&self) -> &ColumnDescriptor {
        &self.columns[self.primary_key]
    }

    /// The JSON column aggregated by default (first JSON column declared)
    pub fn payload_column(&self) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.is_json())
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Registry of entity descriptors, shared read-only across requests
#[derive(Debug, Clone)]
pub struct Catalog {
    entities: BTreeMap<String, EntityDescriptor>,
}

impl Catalog {
    /// Assemble a catalog, resolving every relationship against its target
    pub fn from_entities(entities: Vec<EntityDescriptor>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entity in entities {
            if map.contains_key(&entity.name) {
                return Err(MetadataStoreError::validation(format!(
                    "Entity '{}' registered twice",
                    entity.name
                )));
            }
            map.insert(entity.name.clone(), entity);
        }

        let catalog = Self { entities: map };
        for entity in catalog.entities.values() {
            for relation in &entity.relations {
                let target = catalog.entities.get(&relation.target).ok_or_else(|| {
                    MetadataStoreError::unsupported_relationship(format!(
                        "{}.{} targets unknown entity '{}'",
                        entity.name, relation.name, relation.target
                    ))
                })?;
                relation.validate(entity, target)?;
            }
        }
        Ok(catalog)
    }

    /// Built-in catalog of the metadata API:
    /// resources, libraries, signatures, entities and schemas
    pub fn metadata() -> Result<Self> {
        let id = || ColumnDescriptor::new("id", ColumnType::Uuid).primary_key();
        let meta = || ColumnDescriptor::new("meta", ColumnType::Json).not_null();

        let entities = vec![
            EntityDescriptor::new("resources", "resources", vec![id(), meta()]),
            EntityDescriptor::new(
                "libraries",
                "libraries",
                vec![
                    id(),
                    ColumnDescriptor::new("resource", ColumnType::Uuid),
                    ColumnDescriptor::new("dataset", ColumnType::String).not_null(),
                    ColumnDescriptor::new("dataset_type", ColumnType::String).not_null(),
                    meta(),
                ],
            ),
            EntityDescriptor::new(
                "signatures",
                "signatures",
                vec![
                    id(),
                    ColumnDescriptor::new("library", ColumnType::Uuid).not_null(),
                    meta(),
                ],
            ),
            EntityDescriptor::new("entities", "entities", vec![id(), meta()]),
            EntityDescriptor::new("schemas", "schemas", vec![id(), meta()]),
        ];

        let relations: [(&str, RelationDescriptor); 4] = [
            (
                "resources",
                RelationDescriptor::one_to_many("libraries", "libraries", "id", "resource"),
            ),
            (
                "libraries",
                RelationDescriptor::many_to_one("resource", "resources", "resource", "id"),
            ),
            (
                "libraries",
                RelationDescriptor::one_to_many("signatures", "signatures", "id", "library"),
            ),
            (
                "signatures",
                RelationDescriptor::many_to_one("library", "libraries", "library", "id"),
            ),
        ];

        let entities = entities
            .into_iter()
            .map(|entity| {
                let mut entity = entity?;
                for (owner, relation) in &relations {
                    if *owner == entity.name {
                        entity = entity.with_relation(relation.clone());
                    }
                }
                Ok(entity)
            })
            .collect::<Result<Vec<_>>>()?;

        Self::from_entities(entities)
    }

    pub fn entity(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entities
            .get(name)
            .ok_or_else(|| MetadataStoreError::entity_not_found(name))
    }

    /// Resolve a named relationship of `entity` and its target descriptor
    pub fn relation(
        &self,
        entity: &str,
        name: &str,
    ) -> Result<(&RelationDescriptor, &EntityDescriptor)> {
        let source = self.entity(entity)?;
        let relation = source.relation(name).ok_or_else(|| {
            MetadataStoreError::unsupported_relationship(format!(
                "Entity '{}' has no relationship '{}'",
                entity, name
            ))
        })?;
        let target = self.entity(&relation.target).map_err(|_| {
            MetadataStoreError::unsupported_relationship(format!(
                "Relationship '{}' targets unknown entity '{}'",
                name, relation.target
            ))
        })?;
        Ok((relation, target))
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}
