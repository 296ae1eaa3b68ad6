//! Ownership-based tree rewriting.
//!
//! Each `fold_*` hook defaults to the matching `walk_*` function, which
//! rebuilds the node from its folded children.

use super::node::{
    ClientJoin, ColumnDecl, ColumnRef, InValues, Join, OrderClause, Projection, Select, Source,
    SqlExpr,
};

pub trait Fold {
    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        walk_expr(self, expr)
    }

    fn fold_column(&mut self, column: ColumnRef) -> SqlExpr {
        SqlExpr::Column(column)
    }

    fn fold_select(&mut self, select: Select) -> Select {
        walk_select(self, select)
    }

    fn fold_source(&mut self, source: Source) -> Source {
        walk_source(self, source)
    }

    /// Joins may fold into a different source (for example their left side).
    fn fold_join(&mut self, join: Join) -> Source {
        Source::Join(Box::new(walk_join(self, join)))
    }

    fn fold_projection(&mut self, projection: Projection) -> Projection {
        walk_projection(self, projection)
    }

    fn fold_client_join(&mut self, join: ClientJoin) -> ClientJoin {
        walk_client_join(self, join)
    }
}

fn boxed<F: Fold + ?Sized>(f: &mut F, expr: Box<SqlExpr>) -> Box<SqlExpr> {
    Box::new(f.fold_expr(*expr))
}

pub fn fold_exprs<F: Fold + ?Sized>(f: &mut F, exprs: Vec<SqlExpr>) -> Vec<SqlExpr> {
    exprs.into_iter().map(|e| f.fold_expr(e)).collect()
}

pub fn fold_order_by<F: Fold + ?Sized>(f: &mut F, order_by: Vec<OrderClause>) -> Vec<OrderClause> {
    order_by
        .into_iter()
        .map(|o| OrderClause {
            expr: f.fold_expr(o.expr),
            descending: o.descending,
        })
        .collect()
}

pub fn fold_columns<F: Fold + ?Sized>(f: &mut F, columns: Vec<ColumnDecl>) -> Vec<ColumnDecl> {
    columns
        .into_iter()
        .map(|c| ColumnDecl {
            name: c.name,
            expr: f.fold_expr(c.expr),
            db_type: c.db_type,
        })
        .collect()
}

fn fold_fields<F: Fold + ?Sized>(f: &mut F, fields: Vec<(String, SqlExpr)>) -> Vec<(String, SqlExpr)> {
    fields
        .into_iter()
        .map(|(name, e)| (name, f.fold_expr(e)))
        .collect()
}

pub fn walk_expr<F: Fold + ?Sized>(f: &mut F, expr: SqlExpr) -> SqlExpr {
    match expr {
        SqlExpr::Column(c) => f.fold_column(c),
        SqlExpr::Literal(_) | SqlExpr::Variable { .. } => expr,
        SqlExpr::NamedValue {
            name,
            value,
            db_type,
        } => SqlExpr::NamedValue {
            name,
            value: boxed(f, value),
            db_type,
        },
        SqlExpr::Binary { op, left, right } => SqlExpr::Binary {
            op,
            left: boxed(f, left),
            right: boxed(f, right),
        },
        SqlExpr::Unary { op, operand } => SqlExpr::Unary {
            op,
            operand: boxed(f, operand),
        },
        SqlExpr::Function { function, args } => SqlExpr::Function {
            function,
            args: fold_exprs(f, args),
        },
        SqlExpr::Case {
            test,
            if_true,
            if_false,
        } => SqlExpr::Case {
            test: boxed(f, test),
            if_true: boxed(f, if_true),
            if_false: boxed(f, if_false),
        },
        SqlExpr::IsNull(e) => SqlExpr::IsNull(boxed(f, e)),
        SqlExpr::Between { expr, lower, upper } => SqlExpr::Between {
            expr: boxed(f, expr),
            lower: boxed(f, lower),
            upper: boxed(f, upper),
        },
        SqlExpr::In { expr, values } => SqlExpr::In {
            expr: boxed(f, expr),
            values: match values {
                InValues::List(list) => InValues::List(fold_exprs(f, list)),
                InValues::Select(s) => InValues::Select(Box::new(f.fold_select(*s))),
            },
        },
        SqlExpr::Exists(s) => SqlExpr::Exists(Box::new(f.fold_select(*s))),
        SqlExpr::ScalarSubquery(s) => SqlExpr::ScalarSubquery(Box::new(f.fold_select(*s))),
        SqlExpr::Aggregate {
            kind,
            arg,
            distinct,
        } => SqlExpr::Aggregate {
            kind,
            arg: arg.map(|a| boxed(f, a)),
            distinct,
        },
        SqlExpr::AggregateSubquery {
            group_alias,
            in_group,
            subquery,
        } => SqlExpr::AggregateSubquery {
            group_alias,
            in_group: boxed(f, in_group),
            subquery: Box::new(f.fold_select(*subquery)),
        },
        SqlExpr::RowNumber { order_by } => SqlExpr::RowNumber {
            order_by: fold_order_by(f, order_by),
        },
        SqlExpr::Entity { entity, fields } => SqlExpr::Entity {
            entity,
            fields: fold_fields(f, fields),
        },
        SqlExpr::New { fields } => SqlExpr::New {
            fields: fold_fields(f, fields),
        },
        SqlExpr::OuterJoined { test, expr } => SqlExpr::OuterJoined {
            test: boxed(f, test),
            expr: boxed(f, expr),
        },
        SqlExpr::Grouping { key, elements } => SqlExpr::Grouping {
            key: boxed(f, key),
            elements: boxed(f, elements),
        },
        SqlExpr::Projection(p) => SqlExpr::Projection(Box::new(f.fold_projection(*p))),
        SqlExpr::ClientJoin(j) => SqlExpr::ClientJoin(Box::new(f.fold_client_join(*j))),
        SqlExpr::Deferred(p) => SqlExpr::Deferred(Box::new(f.fold_projection(*p))),
    }
}

/// Folds the source first, then where, order-by, group-by, skip, take and
/// finally the columns.
pub fn walk_select<F: Fold + ?Sized>(f: &mut F, select: Select) -> Select {
    let from = select.from.map(|s| f.fold_source(s));
    let where_clause = select.where_clause.map(|w| f.fold_expr(w));
    let order_by = fold_order_by(f, select.order_by);
    let group_by = fold_exprs(f, select.group_by);
    let skip = select.skip.map(|s| f.fold_expr(s));
    let take = select.take.map(|t| f.fold_expr(t));
    let columns = fold_columns(f, select.columns);
    Select {
        alias: select.alias,
        columns,
        from,
        where_clause,
        order_by,
        group_by,
        distinct: select.distinct,
        skip,
        take,
        reverse: select.reverse,
    }
}

pub fn walk_source<F: Fold + ?Sized>(f: &mut F, source: Source) -> Source {
    match source {
        Source::Table(t) => Source::Table(t),
        Source::Select(s) => Source::Select(Box::new(f.fold_select(*s))),
        Source::Join(j) => f.fold_join(*j),
    }
}

pub fn walk_join<F: Fold + ?Sized>(f: &mut F, join: Join) -> Join {
    let left = f.fold_source(join.left);
    let right = f.fold_source(join.right);
    let condition = join.condition.map(|c| f.fold_expr(c));
    Join {
        kind: join.kind,
        left,
        right,
        condition,
    }
}

pub fn walk_projection<F: Fold + ?Sized>(f: &mut F, projection: Projection) -> Projection {
    let select = f.fold_select(projection.select);
    let projector = f.fold_expr(projection.projector);
    Projection {
        select,
        projector,
        aggregator: projection.aggregator,
    }
}

pub fn walk_client_join<F: Fold + ?Sized>(f: &mut F, join: ClientJoin) -> ClientJoin {
    let outer_key = fold_exprs(f, join.outer_key);
    let projection = f.fold_projection(join.projection);
    let inner_key = fold_exprs(f, join.inner_key);
    ClientJoin {
        projection,
        outer_key,
        inner_key,
    }
}
