use crate::error::{Error, Result};
use crate::ir::fold::{self, Fold};
use crate::ir::{AliasGenerator, SqlExpr};
use crate::mapping::QueryMapping;
use crate::translate::QueryBinder;

use super::policy::EntityPolicy;

/// Adds the relationships the policy includes to every entity a projector
/// builds.
///
/// A relationship already present on the entity is left alone, and a member
/// is not included again below itself, so cyclic includes terminate.
pub struct RelationshipIncluder<'a, 'g> {
    mapping: &'a dyn QueryMapping,
    policy: &'a EntityPolicy,
    aliases: &'g mut AliasGenerator,
    path: Vec<(String, String)>,
    error: Option<Error>,
}

impl<'a, 'g> RelationshipIncluder<'a, 'g> {
    pub fn include(
        expr: SqlExpr,
        mapping: &'a dyn QueryMapping,
        policy: &'a EntityPolicy,
        aliases: &'g mut AliasGenerator,
    ) -> Result<SqlExpr> {
        let mut this = RelationshipIncluder {
            mapping,
            policy,
            aliases,
            path: Vec::new(),
            error: None,
        };
        let expr = this.fold_expr(expr);
        match this.error {
            Some(e) => Err(e),
            None => Ok(expr),
        }
    }

    fn in_path(&self, entity: &str, member: &str) -> bool {
        self.path.iter().any(|(e, m)| e == entity && m == member)
    }

    fn with_path<T>(&mut self, entity: &str, member: &str, f: impl FnOnce(&mut Self) -> T) -> T {
        self.path.push((entity.to_string(), member.to_string()));
        let result = f(self);
        self.path.pop();
        result
    }

    fn entity(&mut self, entity: String, fields: Vec<(String, SqlExpr)>) -> SqlExpr {
        let catalog = self.mapping;
        let policy = self.policy;
        let Some(mapping) = catalog.entity(&entity) else {
            return SqlExpr::Entity { entity, fields };
        };
        let mut folded = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            let value = if mapping.relationship(&name).is_some() {
                self.with_path(&entity, &name, |this| this.fold_expr(value))
            } else {
                self.fold_expr(value)
            };
            folded.push((name, value));
        }

        let owner = SqlExpr::Entity {
            entity: entity.clone(),
            fields: folded,
        };
        let mut added = Vec::new();
        for member in policy.included_members(&entity) {
            let present = matches!(&owner, SqlExpr::Entity { fields, .. } if fields.iter().any(|(n, _)| n == member));
            if present || self.in_path(&entity, member) {
                continue;
            }
            let Some(relationship) = mapping.relationship(member) else {
                continue;
            };
            let bound = QueryBinder::new(catalog, policy, &mut *self.aliases)
                .relationship(&owner, relationship);
            let projection = match bound {
                Ok(p) => p,
                Err(e) => {
                    self.error.get_or_insert(e);
                    continue;
                }
            };
            let nested = if policy.is_deferred(&entity, member) {
                SqlExpr::Deferred(Box::new(projection))
            } else {
                SqlExpr::Projection(Box::new(projection))
            };
            let nested = self.with_path(&entity, member, |this| this.fold_expr(nested));
            added.push((member.to_string(), nested));
        }

        match owner {
            SqlExpr::Entity { entity, mut fields } => {
                fields.extend(added);
                SqlExpr::Entity { entity, fields }
            }
            other => other,
        }
    }
}

impl Fold for RelationshipIncluder<'_, '_> {
    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        match expr {
            SqlExpr::Entity { entity, fields } => self.entity(entity, fields),
            other => fold::walk_expr(self, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Aggregator, Projection};
    use crate::testing::northwind;

    fn customers(aliases: &mut AliasGenerator, policy: &EntityPolicy) -> SqlExpr {
        let mapping = northwind();
        let projection = QueryBinder::new(&mapping, policy, aliases)
            .bind(&crate::expr::Expr::table("Customer"))
            .unwrap();
        SqlExpr::Projection(Box::new(projection))
    }

    fn field<'e>(projection: &'e Projection, member: &str) -> Option<&'e SqlExpr> {
        match &projection.projector {
            SqlExpr::Entity { fields, .. } => fields.iter().find(|(n, _)| n == member).map(|(_, e)| e),
            _ => None,
        }
    }

    #[test]
    fn test_empty_policy_includes_nothing() {
        let mapping = northwind();
        let policy = EntityPolicy::new();
        let mut aliases = AliasGenerator::new();
        let expr = customers(&mut aliases, &policy);
        let included = RelationshipIncluder::include(expr.clone(), &mapping, &policy, &mut aliases).unwrap();
        assert_eq!(included, expr);
    }

    #[test]
    fn test_included_member_is_nested_once() {
        let mapping = northwind();
        let mut policy = EntityPolicy::new();
        policy.include(&mapping, "Customer", "Orders", false).unwrap();
        policy.include(&mapping, "Order", "Customer", false).unwrap();
        let mut aliases = AliasGenerator::new();
        let expr = customers(&mut aliases, &policy);

        let once = RelationshipIncluder::include(expr, &mapping, &policy, &mut aliases).unwrap();
        let SqlExpr::Projection(p) = &once else {
            panic!("expected projection");
        };
        let Some(SqlExpr::Projection(orders)) = field(p, "Orders") else {
            panic!("expected nested orders");
        };
        assert_eq!(orders.aggregator, None);
        // Order.Customer is included below Customer.Orders, but not Orders again.
        let Some(SqlExpr::Projection(customer)) = field(orders, "Customer") else {
            panic!("expected nested customer");
        };
        assert_eq!(customer.aggregator, Some(Aggregator::SingleOrDefault));
        assert!(field(customer, "Orders").is_none());

        let twice = RelationshipIncluder::include(once.clone(), &mapping, &policy, &mut aliases).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_deferred_member_is_wrapped() {
        let mapping = northwind();
        let mut policy = EntityPolicy::new();
        policy.include(&mapping, "Customer", "Orders", true).unwrap();
        let mut aliases = AliasGenerator::new();
        let expr = customers(&mut aliases, &policy);
        let SqlExpr::Projection(p) = RelationshipIncluder::include(expr, &mapping, &policy, &mut aliases).unwrap()
        else {
            panic!("expected projection");
        };
        assert!(matches!(field(&p, "Orders"), Some(SqlExpr::Deferred(_))));
    }
}
