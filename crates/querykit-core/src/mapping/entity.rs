//! Entity, column and relationship mappings.

use querykit_proto::DbQueryType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A mapped member stored in a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Member name on the entity.
    pub member: String,
    /// Column name in the table.
    pub column: String,
    /// Declared column type.
    pub db_type: DbQueryType,
    /// Part of the primary key.
    pub primary_key: bool,
    /// Value assigned by the store on insert.
    pub generated: bool,
}

impl ColumnMapping {
    /// Map a member onto a column of the same name.
    pub fn new(member: impl Into<String>, db_type: DbQueryType) -> Self {
        let member = member.into();
        Self {
            column: member.clone(),
            member,
            db_type,
            primary_key: false,
            generated: false,
        }
    }

    /// Parse the column type from a declaration such as `NVARCHAR(40) NOT NULL`.
    pub fn declared(member: impl Into<String>, declaration: &str) -> Result<Self> {
        Ok(Self::new(member, DbQueryType::parse(declaration)?))
    }

    /// Store the member under a different column name.
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.db_type.not_null = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// Cardinality of a relationship seen from the declaring entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    /// At most one related row sharing this entity's key.
    OneToOne,
    /// At most one related row referenced by this entity's foreign key.
    ManyToOne,
    /// Any number of related rows referencing this entity.
    OneToMany,
}

impl Cardinality {
    /// Check if the relationship yields zero or one related row.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }
}

/// A navigation member joining this entity to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Member name on the declaring entity.
    pub member: String,
    /// Related entity name.
    pub related_entity: String,
    pub cardinality: Cardinality,
    /// Pairs of (declaring member, related member) that must be equal.
    pub keys: Vec<(String, String)>,
}

impl Relationship {
    fn build(
        member: impl Into<String>,
        related_entity: impl Into<String>,
        cardinality: Cardinality,
        keys: &[(&str, &str)],
    ) -> Self {
        Self {
            member: member.into(),
            related_entity: related_entity.into(),
            cardinality,
            keys: keys
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    /// Foreign key on this entity referencing the related entity's key.
    pub fn many_to_one(
        member: impl Into<String>,
        related_entity: impl Into<String>,
        keys: &[(&str, &str)],
    ) -> Self {
        Self::build(member, related_entity, Cardinality::ManyToOne, keys)
    }

    /// Related entity shares this entity's key.
    pub fn one_to_one(
        member: impl Into<String>,
        related_entity: impl Into<String>,
        keys: &[(&str, &str)],
    ) -> Self {
        Self::build(member, related_entity, Cardinality::OneToOne, keys)
    }

    /// Related rows reference this entity's key.
    pub fn one_to_many(
        member: impl Into<String>,
        related_entity: impl Into<String>,
        keys: &[(&str, &str)],
    ) -> Self {
        Self::build(member, related_entity, Cardinality::OneToMany, keys)
    }

    pub fn is_singleton(&self) -> bool {
        self.cardinality.is_singleton()
    }
}

/// How an entity maps onto a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    /// Entity (type) name used in queries.
    pub entity: String,
    /// Table name in the store.
    pub table: String,
    pub columns: Vec<ColumnMapping>,
    pub relationships: Vec<Relationship>,
}

impl EntityMapping {
    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            columns: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnMapping) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn column(&self, member: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.member == member)
    }

    pub fn relationship(&self, member: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.member == member)
    }

    /// Look up a column member, failing with an unmapped-member error.
    pub fn require_column(&self, member: &str) -> Result<&ColumnMapping> {
        self.column(member)
            .ok_or_else(|| Error::unmapped_member(&self.entity, member))
    }

    /// Check if the member is mapped at all.
    pub fn has_member(&self, member: &str) -> bool {
        self.column(member).is_some() || self.relationship(member).is_some()
    }

    /// Primary key columns in declaration order.
    pub fn primary_key(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// Check if the entity declares a primary key.
    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key)
    }
}
