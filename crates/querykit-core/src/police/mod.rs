//! Query police: policy-driven rewrites of translated projections.
//!
//! The police includes the relationships an [`EntityPolicy`] asks for, turns
//! singleton relationships into outer joins and collection relationships
//! into batched client joins, cleaning the tree after every rewrite that
//! changed it.

mod client_join;
mod includer;
mod policy;
mod singleton;

use std::collections::HashSet;

use tracing::debug;

use crate::cleanup;
use crate::config::TranslatorConfig;
use crate::error::Result;
use crate::ir::gather;
use crate::ir::{unique_name, AliasGenerator, ColumnDecl, Select, SqlExpr, TableAlias};
use crate::mapping::QueryMapping;

pub use client_join::ClientJoinedProjectionRewriter;
pub use includer::RelationshipIncluder;
pub use policy::{EntityPolicy, ASSOCIATION_ROOT};
pub use singleton::SingletonProjectionRewriter;

/// Applies an [`EntityPolicy`] to translated queries.
pub struct QueryPolice<'a> {
    mapping: &'a dyn QueryMapping,
    policy: &'a EntityPolicy,
    config: &'a TranslatorConfig,
}

impl<'a> QueryPolice<'a> {
    pub fn new(
        mapping: &'a dyn QueryMapping,
        policy: &'a EntityPolicy,
        config: &'a TranslatorConfig,
    ) -> Self {
        Self {
            mapping,
            policy,
            config,
        }
    }

    pub fn policy(&self) -> &'a EntityPolicy {
        self.policy
    }

    /// Run the include, singleton and client-join passes until none of them
    /// changes the tree or the configured number of rounds is spent.
    pub fn apply(&self, expr: SqlExpr, aliases: &mut AliasGenerator) -> Result<SqlExpr> {
        let mut expr = expr;
        for round in 0..self.config.max_policy_passes {
            let start = expr.clone();

            let included = RelationshipIncluder::include(expr.clone(), self.mapping, self.policy, aliases)?;
            expr = self.settle("include", expr, included);

            let joined = SingletonProjectionRewriter::rewrite(expr.clone());
            expr = self.settle("singleton", expr, joined);

            let client_joined = ClientJoinedProjectionRewriter::rewrite(expr.clone());
            expr = self.settle("client join", expr, client_joined);

            if expr == start {
                debug!(round, "query police converged");
                return Ok(expr);
            }
        }
        debug!(
            rounds = self.config.max_policy_passes,
            "query police stopped at the round limit"
        );
        Ok(expr)
    }

    fn settle(&self, pass: &str, before: SqlExpr, after: SqlExpr) -> SqlExpr {
        if after == before {
            return before;
        }
        debug!(pass, "policy pass rewrote the query");
        cleanup::clean(after)
    }
}

/// Expose the columns of `scope` that `expr` references through `select`,
/// returning `expr` rewritten against `select.alias`.
fn project_columns(expr: SqlExpr, select: &mut Select, scope: &HashSet<TableAlias>) -> SqlExpr {
    let alias = select.alias;
    let columns = &mut select.columns;
    gather::map_columns(expr, |c| {
        if !scope.contains(&c.alias) {
            return None;
        }
        let source = SqlExpr::Column(c.clone());
        let name = match columns.iter().find(|d| d.expr == source) {
            Some(decl) => decl.name.clone(),
            None => {
                let name = unique_name(&c.name, |n| columns.iter().any(|d| d.name == n));
                columns.push(ColumnDecl::new(name.clone(), source));
                name
            }
        };
        Some(SqlExpr::column(alias, name, c.db_type))
    })
}
