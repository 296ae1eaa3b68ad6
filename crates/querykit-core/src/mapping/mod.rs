//! Entity-to-table mapping.
//!
//! The mapping is resolved once when it is built; the translator only reads it.

mod entity;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::Expr;

pub use entity::{Cardinality, ColumnMapping, EntityMapping, Relationship};

/// Mapping metadata consumed by the translator.
pub trait QueryMapping: Send + Sync {
    /// Look up an entity by name.
    fn entity(&self, name: &str) -> Option<&EntityMapping>;

    /// Look up an entity, failing with an unmapped-type error.
    fn require_entity(&self, name: &str) -> Result<&EntityMapping> {
        self.entity(name)
            .ok_or_else(|| Error::UnmappedType(name.to_string()))
    }

    /// Decide whether a node may be computed on the client before translation.
    fn can_be_evaluated_locally(&self, expr: &Expr) -> bool {
        !matches!(
            expr,
            Expr::Parameter(_) | Expr::Table(_) | Expr::Query(_) | Expr::New(_) | Expr::Member(..)
        )
    }
}

/// In-memory catalog of entity mappings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mapping {
    entities: HashMap<String, EntityMapping>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityMapping) -> Self {
        self.entities.insert(entity.entity.clone(), entity);
        self
    }

    /// Load a catalog from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let mapping: Mapping = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("mapping document: {}", e)))?;
        mapping.validate()?;
        Ok(mapping)
    }

    /// Iterate over all mapped entities.
    pub fn entities(&self) -> impl Iterator<Item = &EntityMapping> {
        self.entities.values()
    }

    /// Check relationship targets and key members.
    pub fn validate(&self) -> Result<()> {
        for entity in self.entities.values() {
            for relationship in &entity.relationships {
                let related = self.require_entity(&relationship.related_entity)?;
                if relationship.keys.is_empty() {
                    return Err(Error::AmbiguousRelationship(format!(
                        "'{}.{}' declares no join keys",
                        entity.entity, relationship.member
                    )));
                }
                for (this_member, related_member) in &relationship.keys {
                    entity.require_column(this_member)?;
                    related.require_column(related_member)?;
                }
            }
        }
        Ok(())
    }
}

impl QueryMapping for Mapping {
    fn entity(&self, name: &str) -> Option<&EntityMapping> {
        self.entities.get(name)
    }
}
