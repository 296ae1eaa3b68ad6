use std::collections::HashSet;

use crate::expr::BinaryOp;
use crate::ir::fold::{self, Fold};
use crate::ir::gather;
use crate::ir::{ClientJoin, Projection, Select, SqlExpr, TableAlias};

use super::project_columns;

/// Turns nested collections correlated to their parent by key equality into
/// client joins: one query for all parents, matched back by key.
///
/// Collections correlated any other way (group elements compared with null
/// handling, limited collections) stay per-row subqueries.
#[derive(Default)]
pub struct ClientJoinedProjectionRewriter;

impl ClientJoinedProjectionRewriter {
    pub fn rewrite(expr: SqlExpr) -> SqlExpr {
        ClientJoinedProjectionRewriter.fold_expr(expr)
    }
}

impl Fold for ClientJoinedProjectionRewriter {
    fn fold_projection(&mut self, projection: Projection) -> Projection {
        let projection = fold::walk_projection(self, projection);
        let mut finder = CollectionFinder {
            outer: projection.select.alias,
        };
        let projector = finder.fold_expr(projection.projector);
        Projection {
            select: projection.select,
            projector,
            aggregator: projection.aggregator,
        }
    }
}

struct CollectionFinder {
    outer: TableAlias,
}

impl Fold for CollectionFinder {
    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        match expr {
            SqlExpr::Projection(p) if p.aggregator.is_none() => match client_join(*p, self.outer) {
                Ok(join) => SqlExpr::ClientJoin(Box::new(join)),
                Err(p) => SqlExpr::Projection(Box::new(p)),
            },
            SqlExpr::Entity { .. }
            | SqlExpr::New { .. }
            | SqlExpr::OuterJoined { .. }
            | SqlExpr::Grouping { .. } => fold::walk_expr(self, expr),
            other => other,
        }
    }
}

fn conjuncts(expr: SqlExpr, out: &mut Vec<SqlExpr>) {
    match expr {
        SqlExpr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            conjuncts(*left, out);
            conjuncts(*right, out);
        }
        other => out.push(other),
    }
}

/// Check if every alias `expr` references is in `allowed`, and there is one.
fn only_references(expr: &SqlExpr, allowed: &HashSet<TableAlias>) -> bool {
    let refs = gather::referenced_aliases(expr);
    !refs.is_empty() && refs.iter().all(|a| allowed.contains(a))
}

/// Split a correlated collection into key pairs and a self-contained query.
fn client_join(nested: Projection, outer: TableAlias) -> Result<ClientJoin, Projection> {
    let select = &nested.select;
    if select.take.is_some() || select.skip.is_some() || !select.group_by.is_empty() || select.from.is_none() {
        return Err(nested);
    }
    let Some(condition) = select.where_clause.clone() else {
        return Err(nested);
    };
    let inner = gather::all_declared_aliases(select);
    let outer_scope = HashSet::from([outer]);

    let mut parts = Vec::new();
    conjuncts(condition, &mut parts);
    let mut outer_key = Vec::new();
    let mut inner_key = Vec::new();
    let mut rest = None;
    for part in parts {
        if let SqlExpr::Binary {
            op: BinaryOp::Equal,
            left,
            right,
        } = &part
        {
            if only_references(left, &outer_scope) && only_references(right, &inner) {
                outer_key.push((**left).clone());
                inner_key.push((**right).clone());
                continue;
            }
            if only_references(right, &outer_scope) && only_references(left, &inner) {
                outer_key.push((**right).clone());
                inner_key.push((**left).clone());
                continue;
            }
        }
        if gather::referenced_aliases(&part).iter().any(|a| !inner.contains(a)) {
            return Err(nested);
        }
        rest = SqlExpr::and_also(rest, Some(part));
    }
    if outer_key.is_empty() {
        return Err(nested);
    }

    let mut unkeyed: Select = nested.select.clone();
    unkeyed.where_clause = None;
    let self_contained = gather::referenced_aliases_in_select(&unkeyed)
        .iter()
        .all(|a| inner.contains(a))
        && !gather::referenced_aliases(&nested.projector).contains(&outer);
    if !self_contained {
        return Err(nested);
    }

    let Projection {
        mut select,
        projector,
        aggregator,
    } = nested;
    select.where_clause = rest;
    let scope = select
        .from
        .as_ref()
        .map(gather::declared_aliases)
        .unwrap_or_default();
    let inner_key = inner_key
        .into_iter()
        .map(|k| project_columns(k, &mut select, &scope))
        .collect();
    Ok(ClientJoin {
        projection: Projection {
            select,
            projector,
            aggregator,
        },
        outer_key,
        inner_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, Lambda};
    use crate::ir::AliasGenerator;
    use crate::police::EntityPolicy;
    use crate::testing::northwind;
    use crate::translate::QueryBinder;

    fn bind(query: &Expr, aliases: &mut AliasGenerator) -> SqlExpr {
        let mapping = northwind();
        let policy = EntityPolicy::new();
        let projection = QueryBinder::new(&mapping, &policy, aliases).bind(query).unwrap();
        SqlExpr::Projection(Box::new(projection))
    }

    fn nested_field(expr: &SqlExpr, name: &str) -> SqlExpr {
        let SqlExpr::Projection(p) = expr else {
            panic!("expected projection");
        };
        let SqlExpr::New { fields } = &p.projector else {
            panic!("expected record, got {:?}", p.projector);
        };
        fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
            .unwrap_or_else(|| panic!("no field {}", name))
    }

    #[test]
    fn test_key_correlated_collection_becomes_client_join() {
        let mut aliases = AliasGenerator::new();
        let query = Expr::table("Customer").select(Lambda::new(
            "c",
            Expr::record([
                ("Name", Expr::param("c").member("ContactName")),
                ("Orders", Expr::param("c").member("Orders")),
            ]),
        ));
        let expr = ClientJoinedProjectionRewriter::rewrite(bind(&query, &mut aliases));
        let SqlExpr::ClientJoin(join) = nested_field(&expr, "Orders") else {
            panic!("expected client join");
        };
        let SqlExpr::Projection(parent) = &expr else {
            unreachable!()
        };
        assert!(join
            .outer_key
            .iter()
            .all(|k| gather::referenced_aliases(k) == HashSet::from([parent.select.alias])));
        assert!(join
            .inner_key
            .iter()
            .all(|k| gather::referenced_aliases(k) == HashSet::from([join.projection.select.alias])));
        assert!(join.projection.select.where_clause.is_none());
    }

    #[test]
    fn test_limited_collection_stays_nested() {
        let mut aliases = AliasGenerator::new();
        let query = Expr::table("Customer").select(Lambda::new(
            "c",
            Expr::record([("Orders", Expr::param("c").member("Orders").take(2))]),
        ));
        let expr = ClientJoinedProjectionRewriter::rewrite(bind(&query, &mut aliases));
        assert!(matches!(nested_field(&expr, "Orders"), SqlExpr::Projection(_)));
    }
}
