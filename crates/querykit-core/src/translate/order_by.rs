//! Moves orderings to the outermost select that can carry them.

use std::collections::HashSet;

use crate::ir::fold::{self, Fold};
use crate::ir::gather;
use crate::ir::{ColumnDecl, InValues, Join, OrderClause, Select, Source, SqlExpr, TableAlias};
use crate::language::AggregateChecker;

/// Lifts ORDER BY clauses out of nested selects.
///
/// SQL ignores orderings of derived tables, so orderings are gathered while
/// walking up and re-emitted on the first select allowed to carry them: the
/// outermost select of a projection, or a select with a skip or take. Inner
/// orderings are re-projected as columns of each intermediate select.
/// Grouping and DISTINCT discard orderings gathered beneath them.
pub struct OrderByRewriter {
    gathered: Vec<OrderClause>,
    outer_most: bool,
}

impl OrderByRewriter {
    pub fn rewrite(expr: SqlExpr) -> SqlExpr {
        OrderByRewriter::new().fold_expr(expr)
    }

    /// Rewrite a select that is the outermost query of a command.
    pub fn rewrite_select(select: Select) -> Select {
        OrderByRewriter::new().fold_select(select)
    }

    fn new() -> Self {
        Self {
            gathered: Vec::new(),
            outer_most: true,
        }
    }

    fn prepend(&mut self, orderings: Vec<OrderClause>) {
        let mut merged = orderings;
        merged.append(&mut self.gathered);
        let mut seen = HashSet::new();
        merged.retain(|o| match &o.expr {
            SqlExpr::Column(c) => seen.insert((c.alias, c.name.clone())),
            _ => true,
        });
        self.gathered = merged;
    }

    fn reverse(&mut self) {
        for o in &mut self.gathered {
            o.descending = !o.descending;
        }
    }

    fn with_cleared<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = std::mem::take(&mut self.gathered);
        let result = f(self);
        self.gathered = saved;
        result
    }
}

/// Re-express orderings through the columns of the select `alias`.
///
/// Column orderings over aliases the select does not declare are dropped.
fn rebind(
    orderings: Vec<OrderClause>,
    alias: TableAlias,
    declared: &HashSet<TableAlias>,
    mut columns: Vec<ColumnDecl>,
) -> (Vec<ColumnDecl>, Vec<OrderClause>) {
    let mut rebound = Vec::new();
    for ordering in orderings {
        let column = match &ordering.expr {
            SqlExpr::Column(c) if !declared.contains(&c.alias) => continue,
            SqlExpr::Column(c) => Some(c.clone()),
            _ => None,
        };
        let existing = columns.iter().find(|decl| {
            decl.expr == ordering.expr
                || match (&decl.expr, &column) {
                    (SqlExpr::Column(d), Some(c)) => d.alias == c.alias && d.name == c.name,
                    _ => false,
                }
        });
        let expr = match existing {
            Some(decl) => SqlExpr::column(alias, decl.name.clone(), decl.db_type),
            None => {
                let base = column.as_ref().map_or("c", |c| c.name.as_str());
                let name = crate::ir::unique_name(base, |n| columns.iter().any(|c| c.name == n));
                let decl = ColumnDecl::new(name.clone(), ordering.expr);
                let db_type = decl.db_type;
                columns.push(decl);
                SqlExpr::column(alias, name, db_type)
            }
        };
        rebound.push(OrderClause::new(expr, ordering.descending));
    }
    (columns, rebound)
}

impl Fold for OrderByRewriter {
    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        match expr {
            SqlExpr::Exists(_)
            | SqlExpr::ScalarSubquery(_)
            | SqlExpr::AggregateSubquery { .. }
            | SqlExpr::In {
                values: InValues::Select(_),
                ..
            } => self.with_cleared(|this| fold::walk_expr(this, expr)),
            other => fold::walk_expr(self, other),
        }
    }

    fn fold_select(&mut self, select: Select) -> Select {
        let outer_most = std::mem::replace(&mut self.outer_most, false);
        let mut select = fold::walk_select(self, select);
        self.outer_most = outer_most;

        let grouped = !select.group_by.is_empty();
        let can_have_order_by = outer_most || select.take.is_some() || select.skip.is_some();
        let can_receive = can_have_order_by
            && !grouped
            && !select.distinct
            && !AggregateChecker::has_aggregates(&select);

        let own = std::mem::take(&mut select.order_by);
        if !own.is_empty() {
            self.prepend(own.clone());
        }
        if select.reverse {
            self.reverse();
        }

        let orderings = if can_receive {
            self.gathered.clone()
        } else if can_have_order_by {
            own
        } else {
            Vec::new()
        };

        let can_pass_on = !outer_most && !grouped && !select.distinct;
        let gathered = std::mem::take(&mut self.gathered);
        if can_pass_on && !gathered.is_empty() {
            let declared = select
                .from
                .as_ref()
                .map(gather::declared_aliases)
                .unwrap_or_default();
            let columns = std::mem::take(&mut select.columns);
            let (columns, rebound) = rebind(gathered, select.alias, &declared, columns);
            select.columns = columns;
            self.prepend(rebound);
        }

        select.order_by = orderings;
        select.reverse = false;
        select
    }

    fn fold_join(&mut self, join: Join) -> Source {
        let left = self.fold_source(join.left);
        let left_orderings = std::mem::take(&mut self.gathered);
        let right = self.fold_source(join.right);
        self.prepend(left_orderings);
        let condition = join.condition.map(|c| self.fold_expr(c));
        Source::Join(Box::new(Join {
            kind: join.kind,
            left,
            right,
            condition,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AliasGenerator, Projection, Table};
    use pretty_assertions::assert_eq;

    fn table(aliases: &mut AliasGenerator) -> (Select, TableAlias) {
        let t = aliases.next_alias();
        let s = aliases.next_alias();
        let select = Select::new(
            s,
            vec![
                ColumnDecl::new("City", SqlExpr::column(t, "City", None)),
                ColumnDecl::new("Name", SqlExpr::column(t, "Name", None)),
            ],
            Some(Source::Table(Table {
                alias: t,
                entity: "Customer".into(),
                name: "Customers".into(),
            })),
        );
        (select, t)
    }

    fn wrap(inner: Select, alias: TableAlias) -> Select {
        let columns = inner
            .columns
            .iter()
            .map(|c| ColumnDecl::new(c.name.clone(), SqlExpr::column(inner.alias, c.name.clone(), None)))
            .collect();
        Select::new(alias, columns, Some(Source::Select(Box::new(inner))))
    }

    #[test]
    fn test_inner_ordering_lifts_to_outermost() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table(&mut aliases);
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "City", None), false)];
        let inner_alias = inner.alias;
        let outer = wrap(inner, aliases.next_alias());

        let result = OrderByRewriter::rewrite_select(outer);
        assert_eq!(
            result.order_by,
            vec![OrderClause::new(SqlExpr::column(inner_alias, "City", None), false)]
        );
        match result.from {
            Some(Source::Select(inner)) => assert!(inner.order_by.is_empty()),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_ordering_on_unprojected_expression_adds_column() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table(&mut aliases);
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "Region", None), true)];
        let outer = wrap(inner, aliases.next_alias());

        let result = OrderByRewriter::rewrite_select(outer);
        assert_eq!(result.order_by.len(), 1);
        assert!(result.order_by[0].descending);
        match result.from {
            Some(Source::Select(inner)) => {
                assert!(inner.column("Region").is_some());
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_take_keeps_its_ordering() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table(&mut aliases);
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "City", None), false)];
        inner.take = Some(SqlExpr::Literal(10.into()));
        let outer = wrap(inner, aliases.next_alias());

        let result = OrderByRewriter::rewrite_select(outer);
        assert_eq!(result.order_by.len(), 1);
        match result.from {
            Some(Source::Select(inner)) => assert_eq!(inner.order_by.len(), 1),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_group_by_drops_gathered_orderings() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table(&mut aliases);
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "Name", None), false)];
        let mut outer = wrap(inner, aliases.next_alias());
        outer.group_by = vec![outer.columns[0].expr.clone()];

        let result = OrderByRewriter::rewrite_select(outer);
        assert!(result.order_by.is_empty());
    }

    #[test]
    fn test_reverse_flips_directions() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table(&mut aliases);
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "City", None), false)];
        let mut outer = wrap(inner, aliases.next_alias());
        outer.reverse = true;

        let result = OrderByRewriter::rewrite_select(outer);
        assert!(result.order_by[0].descending);
        assert!(!result.reverse);
    }

    #[test]
    fn test_nested_projection_is_outermost() {
        let mut aliases = AliasGenerator::new();
        let (outer, _) = table(&mut aliases);
        let (mut nested, t) = table(&mut aliases);
        nested.order_by = vec![OrderClause::new(SqlExpr::column(t, "City", None), false)];
        let projection = Projection::new(
            outer,
            SqlExpr::Projection(Box::new(Projection::new(nested, SqlExpr::Literal(1.into())))),
        );

        match OrderByRewriter::rewrite(SqlExpr::Projection(Box::new(projection))) {
            SqlExpr::Projection(p) => match p.projector {
                SqlExpr::Projection(nested) => assert_eq!(nested.select.order_by.len(), 1),
                other => panic!("unexpected projector {:?}", other),
            },
            other => panic!("unexpected result {:?}", other),
        }
    }
}
