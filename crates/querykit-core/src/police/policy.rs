//! Declarative loading policy.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::expr::{Expr, Lambda};
use crate::mapping::QueryMapping;

/// Parameter name standing for the relationship sequence in association
/// operations.
pub const ASSOCIATION_ROOT: &str = "__root";

/// Which relationships are loaded with their owners, which load lazily, and
/// which extra operators apply to tables and relationships.
///
/// Built once, then shared read-only by every translation.
#[derive(Debug, Clone, Default)]
pub struct EntityPolicy {
    included: HashSet<(String, String)>,
    deferred: HashSet<(String, String)>,
    operations: HashMap<String, Vec<Lambda>>,
    associations: HashMap<(String, String), Vec<Lambda>>,
}

impl EntityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `entity.member` with every owning entity.
    pub fn include(
        &mut self,
        mapping: &dyn QueryMapping,
        entity: &str,
        member: &str,
        deferred: bool,
    ) -> Result<()> {
        let owner = mapping.require_entity(entity)?;
        if owner.relationship(member).is_none() {
            if deferred && owner.column(member).is_some() {
                return Err(Error::Policy(format!(
                    "The member '{}.{}' cannot be deferred due to its type.",
                    entity, member
                )));
            }
            return Err(Error::unmapped_member(entity, member));
        }
        let key = (entity.to_string(), member.to_string());
        if deferred {
            self.deferred.insert(key.clone());
        }
        self.included.insert(key);
        Ok(())
    }

    /// Include the relationship a selector such as `c => c.Orders` names.
    ///
    /// Operators applied on top of the member (`c => c.Orders.Where(..)`)
    /// also become an association for that member.
    pub fn include_with(
        &mut self,
        mapping: &dyn QueryMapping,
        entity: &str,
        selector: Lambda,
        deferred: bool,
    ) -> Result<()> {
        let (member, is_body) = root_member(&selector)?;
        self.include(mapping, entity, &member, deferred)?;
        if !is_body {
            self.associate_with(mapping, entity, selector)?;
        }
        Ok(())
    }

    /// Apply the operators of `member_query` whenever the relationship it
    /// starts from is loaded, e.g. `c => c.Orders.Where(o => o.Freight > 10)`.
    pub fn associate_with(
        &mut self,
        mapping: &dyn QueryMapping,
        entity: &str,
        member_query: Lambda,
    ) -> Result<()> {
        let (member, is_body) = root_member(&member_query)?;
        let owner = mapping.require_entity(entity)?;
        if owner.relationship(&member).is_none() {
            return Err(Error::unmapped_member(entity, &member));
        }
        if is_body {
            return Ok(());
        }
        let root = Expr::Member(
            Box::new(Expr::Parameter(member_query.parameter().to_string())),
            member.clone(),
        );
        let body = member_query
            .body
            .replace(&root, &Expr::Parameter(ASSOCIATION_ROOT.to_string()));
        self.associations
            .entry((entity.to_string(), member))
            .or_default()
            .push(Lambda::new(ASSOCIATION_ROOT, body));
        Ok(())
    }

    /// Apply a sequence operator every time `entity`'s table is queried.
    ///
    /// The operation's parameter stands for the table, e.g.
    /// `q => q.Where(c => c.Active == true)`.
    pub fn apply(&mut self, entity: &str, operation: Lambda) {
        self.operations
            .entry(entity.to_string())
            .or_default()
            .push(operation);
    }

    pub fn is_included(&self, entity: &str, member: &str) -> bool {
        self.included
            .contains(&(entity.to_string(), member.to_string()))
    }

    pub fn is_deferred(&self, entity: &str, member: &str) -> bool {
        self.deferred
            .contains(&(entity.to_string(), member.to_string()))
    }

    /// Included relationship members of `entity`, sorted by name.
    pub fn included_members(&self, entity: &str) -> Vec<&str> {
        let mut members: Vec<&str> = self
            .included
            .iter()
            .filter(|(e, _)| e == entity)
            .map(|(_, m)| m.as_str())
            .collect();
        members.sort_unstable();
        members
    }

    /// Operations applied to `entity`'s table.
    pub fn operations(&self, entity: &str) -> &[Lambda] {
        self.operations
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Operations applied to the `entity.member` relationship.
    pub fn associations(&self, entity: &str, member: &str) -> &[Lambda] {
        self.associations
            .get(&(entity.to_string(), member.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Check if the policy changes nothing.
    pub fn is_empty(&self) -> bool {
        self.included.is_empty() && self.operations.is_empty() && self.associations.is_empty()
    }
}

/// The member access on the lambda parameter that a selector starts from,
/// and whether it is the whole body.
fn root_member(lambda: &Lambda) -> Result<(String, bool)> {
    let parameter = lambda.parameter();
    let mut current: &Expr = &lambda.body;
    loop {
        match current {
            Expr::Member(inner, member) if matches!(&**inner, Expr::Parameter(p) if p == parameter) => {
                return Ok((member.clone(), std::ptr::eq(current, &*lambda.body)));
            }
            Expr::Query(op) => current = op.source(),
            _ => {
                return Err(Error::Policy(
                    "Subquery does not originate with a member access".into(),
                ))
            }
        }
    }
}
