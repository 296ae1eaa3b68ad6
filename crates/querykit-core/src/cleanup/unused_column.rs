use std::collections::{HashMap, HashSet};

use crate::ir::fold::{self, Fold};
use crate::ir::gather;
use crate::ir::{ClientJoin, InValues, Join, Projection, Select, Source, SqlExpr, TableAlias};

/// Shrinks every select's columns to the ones referenced from outside it.
///
/// References are collected top-down: a projection's projector marks the
/// columns of its select, a select's own clauses mark the columns of its
/// sources. DISTINCT selects keep all columns since every column takes part
/// in the comparison. EXISTS subqueries lose all columns.
#[derive(Default)]
pub struct UnusedColumnRemover {
    used: HashMap<TableAlias, HashSet<String>>,
}

impl UnusedColumnRemover {
    pub fn remove(expr: SqlExpr) -> SqlExpr {
        UnusedColumnRemover::default().fold_expr(expr)
    }

    fn mark(&mut self, expr: &SqlExpr) {
        for column in gather::referenced_columns(expr) {
            self.used.entry(column.alias).or_default().insert(column.name);
        }
    }

    fn mark_all(&mut self, select: &Select) {
        let used = self.used.entry(select.alias).or_default();
        used.extend(select.columns.iter().map(|c| c.name.clone()));
    }
}

impl Fold for UnusedColumnRemover {
    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        match expr {
            SqlExpr::Exists(select) => {
                let mut select = *select;
                select.columns.clear();
                SqlExpr::Exists(Box::new(self.fold_select(select)))
            }
            SqlExpr::ScalarSubquery(select) => {
                self.mark_all(&select);
                SqlExpr::ScalarSubquery(Box::new(self.fold_select(*select)))
            }
            SqlExpr::In {
                expr,
                values: InValues::Select(select),
            } => {
                self.mark_all(&select);
                SqlExpr::In {
                    expr: Box::new(self.fold_expr(*expr)),
                    values: InValues::Select(Box::new(self.fold_select(*select))),
                }
            }
            SqlExpr::AggregateSubquery {
                group_alias,
                in_group,
                subquery,
            } => {
                self.mark_all(&subquery);
                SqlExpr::AggregateSubquery {
                    group_alias,
                    in_group: Box::new(self.fold_expr(*in_group)),
                    subquery: Box::new(self.fold_select(*subquery)),
                }
            }
            other => fold::walk_expr(self, other),
        }
    }

    fn fold_select(&mut self, select: Select) -> Select {
        let mut select = select;
        if !select.distinct {
            let used = self.used.get(&select.alias);
            select
                .columns
                .retain(|c| used.map_or(false, |u| u.contains(&c.name)));
        }
        for column in &select.columns {
            self.mark(&column.expr);
        }
        if let Some(w) = &select.where_clause {
            self.mark(w);
        }
        for o in &select.order_by {
            self.mark(&o.expr);
        }
        for g in &select.group_by {
            self.mark(g);
        }
        if let Some(skip) = &select.skip {
            self.mark(skip);
        }
        if let Some(take) = &select.take {
            self.mark(take);
        }
        fold::walk_select(self, select)
    }

    fn fold_join(&mut self, join: Join) -> Source {
        if let Some(condition) = &join.condition {
            self.mark(condition);
        }
        Source::Join(Box::new(fold::walk_join(self, join)))
    }

    fn fold_projection(&mut self, projection: Projection) -> Projection {
        self.mark(&projection.projector);
        fold::walk_projection(self, projection)
    }

    fn fold_client_join(&mut self, join: ClientJoin) -> ClientJoin {
        for key in join.outer_key.iter().chain(&join.inner_key) {
            self.mark(key);
        }
        fold::walk_client_join(self, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AliasGenerator, ColumnDecl, Table};

    fn customers(aliases: &mut AliasGenerator) -> Select {
        let t = aliases.next_alias();
        Select::new(
            aliases.next_alias(),
            vec![
                ColumnDecl::new("CustomerID", SqlExpr::column(t, "CustomerID", None)),
                ColumnDecl::new("City", SqlExpr::column(t, "City", None)),
                ColumnDecl::new("Region", SqlExpr::column(t, "Region", None)),
            ],
            Some(Source::Table(Table {
                alias: t,
                entity: "Customer".into(),
                name: "Customers".into(),
            })),
        )
    }

    #[test]
    fn test_removes_columns_the_projector_ignores() {
        let mut aliases = AliasGenerator::new();
        let select = customers(&mut aliases);
        let projector = SqlExpr::column(select.alias, "City", None);
        let projection = Projection::new(select, projector);

        let result = UnusedColumnRemover::remove(SqlExpr::Projection(Box::new(projection)));
        let SqlExpr::Projection(p) = result else {
            panic!("expected projection");
        };
        let names: Vec<_> = p.select.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["City"]);
    }

    #[test]
    fn test_inner_columns_used_by_outer_where_survive() {
        let mut aliases = AliasGenerator::new();
        let inner = customers(&mut aliases);
        let inner_alias = inner.alias;
        let outer_alias = aliases.next_alias();
        let outer = Select::new(
            outer_alias,
            vec![ColumnDecl::new("City", SqlExpr::column(inner_alias, "City", None))],
            Some(Source::Select(Box::new(inner))),
        )
        .with_where(Some(SqlExpr::IsNull(Box::new(SqlExpr::column(
            inner_alias,
            "Region",
            None,
        )))));
        let projection = Projection::new(outer, SqlExpr::column(outer_alias, "City", None));

        let SqlExpr::Projection(p) = UnusedColumnRemover::remove(SqlExpr::Projection(Box::new(projection)))
        else {
            panic!("expected projection");
        };
        let Some(Source::Select(inner)) = &p.select.from else {
            panic!("expected subquery");
        };
        let names: Vec<_> = inner.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["City", "Region"]);
    }

    #[test]
    fn test_distinct_keeps_columns() {
        let mut aliases = AliasGenerator::new();
        let mut select = customers(&mut aliases);
        select.distinct = true;
        let projector = SqlExpr::column(select.alias, "City", None);
        let projection = Projection::new(select, projector);
        let SqlExpr::Projection(p) = UnusedColumnRemover::remove(SqlExpr::Projection(Box::new(projection)))
        else {
            panic!("expected projection");
        };
        assert_eq!(p.select.columns.len(), 3);
    }
}
