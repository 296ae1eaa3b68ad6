use std::collections::HashMap;

use crate::ir::fold::{self, Fold};
use crate::ir::gather;
use crate::ir::{ColumnRef, Join, Projection, Select, Source, SqlExpr, TableAlias};
use crate::language::AggregateChecker;

/// Removes subqueries that only rename their source's columns, then merges
/// subqueries into the select that consumes them where SQL semantics allow.
pub struct RedundantSubqueryRemover {
    removed: HashMap<TableAlias, Vec<(String, SqlExpr)>>,
    in_join: bool,
}

impl RedundantSubqueryRemover {
    pub fn remove(expr: SqlExpr) -> SqlExpr {
        let expr = RedundantSubqueryRemover {
            removed: HashMap::new(),
            in_join: false,
        }
        .fold_expr(expr);
        SubqueryMerger::merge(expr)
    }
}

/// A select that passes its source's rows through unchanged.
fn is_redundant(select: &Select) -> bool {
    select.from.is_some()
        && select.where_clause.is_none()
        && select.order_by.is_empty()
        && select.group_by.is_empty()
        && !select.distinct
        && !select.reverse
        && select.skip.is_none()
        && select.take.is_none()
        && select.columns.iter().all(|c| matches!(c.expr, SqlExpr::Column(_)))
}

impl Fold for RedundantSubqueryRemover {
    fn fold_select(&mut self, select: Select) -> Select {
        let in_join = std::mem::replace(&mut self.in_join, false);
        let select = fold::walk_select(self, select);
        self.in_join = in_join;
        select
    }

    fn fold_join(&mut self, join: Join) -> Source {
        let in_join = std::mem::replace(&mut self.in_join, true);
        let join = fold::walk_join(self, join);
        self.in_join = in_join;
        Source::Join(Box::new(join))
    }

    fn fold_source(&mut self, source: Source) -> Source {
        match source {
            Source::Select(select) => {
                let select = self.fold_select(*select);
                // A join side cannot become a nested join without parentheses.
                let nested_join = self.in_join && matches!(select.from, Some(Source::Join(_)));
                if !is_redundant(&select) || nested_join {
                    return Source::Select(Box::new(select));
                }
                let Select { alias, columns, from, .. } = select;
                let Some(from) = from else {
                    return Source::Select(Box::new(Select::new(alias, columns, None)));
                };
                self.removed
                    .insert(alias, columns.into_iter().map(|c| (c.name, c.expr)).collect());
                from
            }
            other => fold::walk_source(self, other),
        }
    }

    fn fold_column(&mut self, column: ColumnRef) -> SqlExpr {
        let replacement = self
            .removed
            .get(&column.alias)
            .and_then(|cols| cols.iter().find(|(name, _)| *name == column.name))
            .map(|(_, expr)| expr.clone());
        replacement.unwrap_or(SqlExpr::Column(column))
    }
}

/// Merges a select into the select it reads from.
struct SubqueryMerger {
    top: bool,
}

impl SubqueryMerger {
    fn merge(expr: SqlExpr) -> SqlExpr {
        SubqueryMerger { top: false }.fold_expr(expr)
    }
}

fn has_name_map_projection(select: &Select, from: &Select) -> bool {
    select.columns.len() == from.columns.len()
        && select.columns.iter().zip(&from.columns).all(|(c, f)| {
            matches!(&c.expr, SqlExpr::Column(col) if col.alias == from.alias && col.name == f.name)
        })
}

/// The select orders exactly as its source already does.
fn restates_order(select: &Select, from: &Select) -> bool {
    !select.order_by.is_empty()
        && select.order_by.len() == from.order_by.len()
        && select.order_by.iter().zip(&from.order_by).all(|(s, f)| {
            s.descending == f.descending && gather::inline_columns(s.expr.clone(), from) == f.expr
        })
}

fn can_merge_with_from(select: &Select, from: &Select, is_top: bool) -> bool {
    if !from.is_column_projection() {
        return false;
    }
    let name_map = has_name_map_projection(select, from);
    let sel_order = !select.order_by.is_empty() && !restates_order(select, from);
    let sel_group = !select.group_by.is_empty();
    let sel_aggregates = AggregateChecker::has_aggregates(select);
    let frm_order = !from.order_by.is_empty();
    let frm_group = !from.group_by.is_empty();
    let frm_limited = from.take.is_some() || from.skip.is_some();

    if sel_order && frm_order {
        return false;
    }
    if frm_group {
        return false;
    }
    if select.reverse || from.reverse {
        return false;
    }
    if frm_order && (sel_group || sel_aggregates || select.distinct) {
        return false;
    }
    if frm_limited && (select.where_clause.is_some() || sel_order) {
        return false;
    }
    if from.take.is_some()
        && (select.take.is_some() || select.skip.is_some() || select.distinct || sel_aggregates || sel_group)
    {
        return false;
    }
    if from.skip.is_some()
        && (select.skip.is_some() || select.distinct || sel_aggregates || sel_group)
    {
        return false;
    }
    if from.distinct
        && (select.take.is_some()
            || select.skip.is_some()
            || !name_map
            || sel_group
            || sel_aggregates
            || (sel_order && !is_top))
    {
        return false;
    }
    true
}

fn merge_with_from(select: Select, from: Select) -> Select {
    let inline = |e: SqlExpr| gather::inline_columns(e, &from);
    let columns = select
        .columns
        .into_iter()
        .map(|mut c| {
            c.expr = inline(c.expr);
            c
        })
        .collect();
    let where_clause = SqlExpr::and_also(from.where_clause.clone(), select.where_clause.map(inline));
    let order_by = if select.order_by.is_empty() {
        from.order_by.clone()
    } else {
        select
            .order_by
            .into_iter()
            .map(|mut o| {
                o.expr = inline(o.expr);
                o
            })
            .collect()
    };
    let group_by = if select.group_by.is_empty() {
        from.group_by.clone()
    } else {
        select.group_by.into_iter().map(inline).collect()
    };
    let skip = select.skip.map(inline).or_else(|| from.skip.clone());
    let take = select.take.map(inline).or_else(|| from.take.clone());
    Select {
        alias: select.alias,
        columns,
        from: from.from,
        where_clause,
        order_by,
        group_by,
        distinct: select.distinct || from.distinct,
        skip,
        take,
        reverse: false,
    }
}

impl Fold for SubqueryMerger {
    fn fold_projection(&mut self, projection: Projection) -> Projection {
        self.top = true;
        fold::walk_projection(self, projection)
    }

    fn fold_select(&mut self, select: Select) -> Select {
        let is_top = std::mem::replace(&mut self.top, false);
        let mut select = fold::walk_select(self, select);
        loop {
            let mergeable = match &select.from {
                Some(Source::Select(from)) => can_merge_with_from(&select, from, is_top),
                _ => false,
            };
            if !mergeable {
                return select;
            }
            let Some(Source::Select(from)) = select.from.take() else {
                return select;
            };
            select = merge_with_from(select, *from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AliasGenerator, ColumnDecl, OrderClause, Table};
    use querykit_proto::Value;

    fn table_select(aliases: &mut AliasGenerator) -> (Select, TableAlias) {
        let t = aliases.next_alias();
        let select = Select::new(
            aliases.next_alias(),
            vec![
                ColumnDecl::new("City", SqlExpr::column(t, "City", None)),
                ColumnDecl::new("Freight", SqlExpr::column(t, "Freight", None)),
            ],
            Some(Source::Table(Table {
                alias: t,
                entity: "Order".into(),
                name: "Orders".into(),
            })),
        );
        (select, t)
    }

    fn pass_through(inner: Select, alias: TableAlias) -> Select {
        let columns = inner
            .columns
            .iter()
            .map(|c| ColumnDecl::new(c.name.clone(), SqlExpr::column(inner.alias, c.name.clone(), None)))
            .collect();
        Select::new(alias, columns, Some(Source::Select(Box::new(inner))))
    }

    fn project(select: Select) -> SqlExpr {
        let projector = SqlExpr::column(select.alias, "City", None);
        SqlExpr::Projection(Box::new(Projection::new(select, projector)))
    }

    #[test]
    fn test_layers_merge_into_table_select() {
        let mut aliases = AliasGenerator::new();
        let (inner, t) = table_select(&mut aliases);
        let middle = pass_through(inner, aliases.next_alias());
        let middle_alias = middle.alias;
        let outer_alias = aliases.next_alias();
        let outer = pass_through(middle, outer_alias).with_where(Some(SqlExpr::equal(
            SqlExpr::column(middle_alias, "City", None),
            SqlExpr::Literal("London".into()),
        )));

        let SqlExpr::Projection(p) = RedundantSubqueryRemover::remove(project(outer)) else {
            panic!("expected projection");
        };
        assert_eq!(p.select.alias, outer_alias);
        assert!(matches!(p.select.from, Some(Source::Table(ref table)) if table.alias == t));
        assert!(p.select.where_clause.is_some());
    }

    #[test]
    fn test_filter_over_take_is_not_merged() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table_select(&mut aliases);
        inner.take = Some(SqlExpr::Literal(Value::Int32(10)));
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "Freight", None), false)];
        let inner_alias = inner.alias;
        let outer = Select::new(
            aliases.next_alias(),
            vec![ColumnDecl::new("City", SqlExpr::column(inner_alias, "City", None))],
            Some(Source::Select(Box::new(inner))),
        )
        .with_where(Some(SqlExpr::IsNull(Box::new(SqlExpr::column(inner_alias, "City", None)))));

        let SqlExpr::Projection(p) = RedundantSubqueryRemover::remove(project(outer)) else {
            panic!("expected projection");
        };
        assert!(matches!(p.select.from, Some(Source::Select(_))));
    }

    #[test]
    fn test_take_over_ordered_skip_merges() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table_select(&mut aliases);
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "Freight", None), false)];
        inner.skip = Some(SqlExpr::Literal(Value::Int32(5)));
        let inner_alias = inner.alias;
        let mut outer = pass_through(inner, aliases.next_alias());
        outer.order_by = vec![OrderClause::new(SqlExpr::column(inner_alias, "Freight", None), false)];
        outer.take = Some(SqlExpr::Literal(Value::Int32(10)));

        let SqlExpr::Projection(p) = RedundantSubqueryRemover::remove(project(outer)) else {
            panic!("expected projection");
        };
        assert!(matches!(p.select.from, Some(Source::Table(_))));
        assert_eq!(
            p.select.order_by,
            vec![OrderClause::new(SqlExpr::column(t, "Freight", None), false)]
        );
        assert_eq!(p.select.skip, Some(SqlExpr::Literal(Value::Int32(5))));
        assert_eq!(p.select.take, Some(SqlExpr::Literal(Value::Int32(10))));
    }

    #[test]
    fn test_new_order_over_skip_is_not_merged() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table_select(&mut aliases);
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "Freight", None), false)];
        inner.skip = Some(SqlExpr::Literal(Value::Int32(5)));
        let inner_alias = inner.alias;
        let mut outer = pass_through(inner, aliases.next_alias());
        outer.order_by = vec![OrderClause::new(SqlExpr::column(inner_alias, "City", None), false)];

        let SqlExpr::Projection(p) = RedundantSubqueryRemover::remove(project(outer)) else {
            panic!("expected projection");
        };
        assert!(matches!(p.select.from, Some(Source::Select(_))));
    }

    #[test]
    fn test_take_over_order_merges() {
        let mut aliases = AliasGenerator::new();
        let (mut inner, t) = table_select(&mut aliases);
        inner.order_by = vec![OrderClause::new(SqlExpr::column(t, "Freight", None), true)];
        let mut outer = pass_through(inner, aliases.next_alias());
        outer.take = Some(SqlExpr::Literal(Value::Int32(5)));

        let SqlExpr::Projection(p) = RedundantSubqueryRemover::remove(project(outer)) else {
            panic!("expected projection");
        };
        assert!(matches!(p.select.from, Some(Source::Table(_))));
        assert_eq!(p.select.order_by.len(), 1);
        assert!(p.select.take.is_some());
    }
}
