use std::collections::HashSet;

use crate::ir::fold::{self, Fold};
use crate::ir::gather;
use crate::ir::{ColumnProjector, Join, JoinKind, Projection, Select, Source, SqlExpr, TableAlias};
use crate::language::AggregateChecker;

use super::project_columns;

/// Turns nested singleton projections into outer joins of the projection
/// that contains them.
///
/// The nested query's WHERE clause becomes the join condition, so a parent
/// row without a related row is still produced once, with the related
/// object null.
#[derive(Default)]
pub struct SingletonProjectionRewriter;

impl SingletonProjectionRewriter {
    pub fn rewrite(expr: SqlExpr) -> SqlExpr {
        SingletonProjectionRewriter.fold_expr(expr)
    }
}

impl Fold for SingletonProjectionRewriter {
    fn fold_projection(&mut self, projection: Projection) -> Projection {
        let projection = fold::walk_projection(self, projection);
        let Projection {
            select,
            projector,
            aggregator,
        } = projection;
        if !can_join_into(&select) {
            return Projection {
                select,
                projector,
                aggregator,
            };
        }
        let mut lifter = SingletonLifter { select };
        let projector = lifter.fold_expr(projector);
        Projection {
            select: lifter.select,
            projector,
            aggregator,
        }
    }
}

/// Check if joining another row source onto `select` keeps its rows intact.
fn can_join_into(select: &Select) -> bool {
    select.from.is_some()
        && !select.distinct
        && select.group_by.is_empty()
        && !AggregateChecker::has_aggregates(select)
}

/// A singleton whose only dependency on `outer` is its WHERE clause.
fn is_joinable(nested: &Projection, outer: TableAlias) -> bool {
    let select = &nested.select;
    if !nested.is_singleton()
        || select.take.is_some()
        || select.skip.is_some()
        || select.distinct
        || !select.group_by.is_empty()
        || select.from.is_none()
        || AggregateChecker::has_aggregates(select)
    {
        return false;
    }
    let Some(condition) = &select.where_clause else {
        return false;
    };
    let inner = gather::all_declared_aliases(select);
    let condition_refs = gather::referenced_aliases(condition);
    if !condition_refs.contains(&outer)
        || !condition_refs.iter().all(|a| *a == outer || inner.contains(a))
    {
        return false;
    }
    let mut rest = select.clone();
    rest.where_clause = None;
    let rest_refs = gather::referenced_aliases_in_select(&rest);
    let projector_refs = gather::referenced_aliases(&nested.projector);
    rest_refs.iter().all(|a| inner.contains(a)) && !projector_refs.contains(&outer)
}

/// Joins the singletons of one projector into the projection's select.
struct SingletonLifter {
    select: Select,
}

impl SingletonLifter {
    fn lift(&mut self, nested: Projection) -> SqlExpr {
        let Projection {
            select: mut inner,
            projector,
            ..
        } = nested;
        let Some(condition) = inner.where_clause.take() else {
            return SqlExpr::Projection(Box::new(Projection::new(inner, projector)));
        };
        let inner_alias = inner.alias;
        let condition = gather::inline_columns(condition, &self.select);
        let inner_scope = inner
            .from
            .as_ref()
            .map(gather::declared_aliases)
            .unwrap_or_default();
        let condition = project_columns(condition, &mut inner, &inner_scope);

        let test = gather::referenced_columns(&condition)
            .into_iter()
            .find(|c| c.alias == inner_alias)
            .map(SqlExpr::Column);
        let Some(test) = test else {
            // Condition does not touch the related row; keep it nested.
            inner.where_clause = Some(condition);
            return SqlExpr::Projection(Box::new(Projection::new(inner, projector)));
        };

        let from = self.select.from.take();
        self.select.from = from.map(|left| {
            Source::Join(Box::new(Join {
                kind: JoinKind::SingletonOuter,
                left,
                right: Source::Select(Box::new(inner)),
                condition: Some(condition),
            }))
        });

        let joined = SqlExpr::OuterJoined {
            test: Box::new(test),
            expr: Box::new(projector),
        };
        let existing = HashSet::from([inner_alias]);
        let projected = ColumnProjector::project(
            joined,
            std::mem::take(&mut self.select.columns),
            self.select.alias,
            &existing,
        );
        self.select.columns = projected.columns;
        // The lifted projector may hold further singletons.
        self.fold_expr(projected.projector)
    }
}

impl Fold for SingletonLifter {
    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        match expr {
            SqlExpr::Projection(p) if is_joinable(&p, self.select.alias) => self.lift(*p),
            // Collections and deferred loads stay nested; their own singletons
            // were handled when they were folded as projections.
            SqlExpr::Projection(_) | SqlExpr::Deferred(_) | SqlExpr::ClientJoin(_) => expr,
            SqlExpr::Entity { .. }
            | SqlExpr::New { .. }
            | SqlExpr::OuterJoined { .. }
            | SqlExpr::Grouping { .. } => fold::walk_expr(self, expr),
            other => other,
        }
    }
}
