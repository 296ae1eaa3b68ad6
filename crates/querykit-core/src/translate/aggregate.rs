//! Folds aggregates over groups back into the grouping select.

use std::collections::HashMap;

use crate::ir::fold::{self, Fold};
use crate::ir::visit::{self, Visit};
use crate::ir::{ColumnDecl, Select, SqlExpr, TableAlias};

/// Rewrites [`SqlExpr::AggregateSubquery`] nodes into columns of the select
/// that owns the matching GROUP BY.
///
/// `g.Sum(x)` over a group is bound as both a correlated scalar subquery and
/// the in-group aggregate. When the grouping select is part of the same tree
/// the aggregate is appended to its columns (`agg0`, `agg1`, ...) and the
/// subquery is replaced by a reference to that column. Otherwise the scalar
/// subquery is kept.
pub struct AggregateRewriter {
    by_group: HashMap<TableAlias, Vec<SqlExpr>>,
    replacements: Vec<(SqlExpr, SqlExpr)>,
}

#[derive(Default)]
struct AggregateGatherer {
    found: Vec<SqlExpr>,
}

impl Visit for AggregateGatherer {
    fn visit_expr(&mut self, expr: &SqlExpr) {
        match expr {
            SqlExpr::AggregateSubquery { .. } => {
                if !self.found.contains(expr) {
                    self.found.push(expr.clone());
                }
            }
            _ => visit::walk_expr(self, expr),
        }
    }
}

impl AggregateRewriter {
    pub fn rewrite(expr: SqlExpr) -> SqlExpr {
        let mut gatherer = AggregateGatherer::default();
        gatherer.visit_expr(&expr);
        if gatherer.found.is_empty() {
            return expr;
        }
        let mut by_group: HashMap<TableAlias, Vec<SqlExpr>> = HashMap::new();
        for aggregate in gatherer.found {
            if let SqlExpr::AggregateSubquery { group_alias, .. } = &aggregate {
                by_group.entry(*group_alias).or_default().push(aggregate);
            }
        }
        AggregateRewriter {
            by_group,
            replacements: Vec::new(),
        }
        .fold_expr(expr)
    }
}

impl Fold for AggregateRewriter {
    fn fold_select(&mut self, select: Select) -> Select {
        let mut select = fold::walk_select(self, select);
        if let Some(aggregates) = self.by_group.remove(&select.alias) {
            for aggregate in aggregates {
                let SqlExpr::AggregateSubquery { in_group, .. } = &aggregate else {
                    continue;
                };
                let name = format!("agg{}", select.columns.len());
                let decl = ColumnDecl::new(name.clone(), (**in_group).clone());
                let column = SqlExpr::column(select.alias, name, decl.db_type);
                select.columns.push(decl);
                self.replacements.push((aggregate, column));
            }
        }
        select
    }

    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        match expr {
            SqlExpr::AggregateSubquery { .. } => {
                if let Some((_, column)) = self.replacements.iter().find(|(a, _)| *a == expr) {
                    return column.clone();
                }
                match expr {
                    SqlExpr::AggregateSubquery { subquery, .. } => {
                        let subquery = self.fold_select(*subquery);
                        SqlExpr::ScalarSubquery(Box::new(subquery))
                    }
                    other => other,
                }
            }
            other => fold::walk_expr(self, other),
        }
    }
}
