//! Read-only tree traversal.

use super::node::{ClientJoin, InValues, Join, Projection, Select, Source, SqlExpr};

pub trait Visit {
    fn visit_expr(&mut self, expr: &SqlExpr) {
        walk_expr(self, expr)
    }

    fn visit_select(&mut self, select: &Select) {
        walk_select(self, select)
    }

    fn visit_source(&mut self, source: &Source) {
        walk_source(self, source)
    }

    fn visit_join(&mut self, join: &Join) {
        walk_join(self, join)
    }

    fn visit_projection(&mut self, projection: &Projection) {
        walk_projection(self, projection)
    }

    fn visit_client_join(&mut self, join: &ClientJoin) {
        walk_client_join(self, join)
    }
}

pub fn walk_expr<V: Visit + ?Sized>(v: &mut V, expr: &SqlExpr) {
    match expr {
        SqlExpr::Column(_) | SqlExpr::Literal(_) | SqlExpr::Variable { .. } => {}
        SqlExpr::NamedValue { value, .. } => v.visit_expr(value),
        SqlExpr::Binary { left, right, .. } => {
            v.visit_expr(left);
            v.visit_expr(right);
        }
        SqlExpr::Unary { operand, .. } => v.visit_expr(operand),
        SqlExpr::Function { args, .. } => args.iter().for_each(|a| v.visit_expr(a)),
        SqlExpr::Case {
            test,
            if_true,
            if_false,
        } => {
            v.visit_expr(test);
            v.visit_expr(if_true);
            v.visit_expr(if_false);
        }
        SqlExpr::IsNull(e) => v.visit_expr(e),
        SqlExpr::Between { expr, lower, upper } => {
            v.visit_expr(expr);
            v.visit_expr(lower);
            v.visit_expr(upper);
        }
        SqlExpr::In { expr, values } => {
            v.visit_expr(expr);
            match values {
                InValues::List(list) => list.iter().for_each(|e| v.visit_expr(e)),
                InValues::Select(s) => v.visit_select(s),
            }
        }
        SqlExpr::Exists(s) | SqlExpr::ScalarSubquery(s) => v.visit_select(s),
        SqlExpr::Aggregate { arg, .. } => {
            if let Some(arg) = arg {
                v.visit_expr(arg);
            }
        }
        SqlExpr::AggregateSubquery {
            in_group, subquery, ..
        } => {
            v.visit_expr(in_group);
            v.visit_select(subquery);
        }
        SqlExpr::RowNumber { order_by } => order_by.iter().for_each(|o| v.visit_expr(&o.expr)),
        SqlExpr::Entity { fields, .. } | SqlExpr::New { fields } => {
            fields.iter().for_each(|(_, e)| v.visit_expr(e))
        }
        SqlExpr::OuterJoined { test, expr } => {
            v.visit_expr(test);
            v.visit_expr(expr);
        }
        SqlExpr::Grouping { key, elements } => {
            v.visit_expr(key);
            v.visit_expr(elements);
        }
        SqlExpr::Projection(p) | SqlExpr::Deferred(p) => v.visit_projection(p),
        SqlExpr::ClientJoin(j) => v.visit_client_join(j),
    }
}

pub fn walk_select<V: Visit + ?Sized>(v: &mut V, select: &Select) {
    if let Some(from) = &select.from {
        v.visit_source(from);
    }
    if let Some(w) = &select.where_clause {
        v.visit_expr(w);
    }
    select.order_by.iter().for_each(|o| v.visit_expr(&o.expr));
    select.group_by.iter().for_each(|g| v.visit_expr(g));
    if let Some(s) = &select.skip {
        v.visit_expr(s);
    }
    if let Some(t) = &select.take {
        v.visit_expr(t);
    }
    select.columns.iter().for_each(|c| v.visit_expr(&c.expr));
}

pub fn walk_source<V: Visit + ?Sized>(v: &mut V, source: &Source) {
    match source {
        Source::Table(_) => {}
        Source::Select(s) => v.visit_select(s),
        Source::Join(j) => v.visit_join(j),
    }
}

pub fn walk_join<V: Visit + ?Sized>(v: &mut V, join: &Join) {
    v.visit_source(&join.left);
    v.visit_source(&join.right);
    if let Some(c) = &join.condition {
        v.visit_expr(c);
    }
}

pub fn walk_projection<V: Visit + ?Sized>(v: &mut V, projection: &Projection) {
    v.visit_select(&projection.select);
    v.visit_expr(&projection.projector);
}

pub fn walk_client_join<V: Visit + ?Sized>(v: &mut V, join: &ClientJoin) {
    join.outer_key.iter().for_each(|k| v.visit_expr(k));
    v.visit_projection(&join.projection);
    join.inner_key.iter().for_each(|k| v.visit_expr(k));
}
