//! Aggregate detection on a single select level.

use crate::ir::visit::{self, Visit};
use crate::ir::{InValues, Select, SqlExpr};

/// Reports whether a select's own where, order-by or columns contain an
/// aggregate call. Nested subqueries and the select's source do not count.
#[derive(Debug, Default)]
pub struct AggregateChecker {
    found: bool,
}

impl AggregateChecker {
    pub fn has_aggregates(select: &Select) -> bool {
        let mut checker = AggregateChecker::default();
        if let Some(w) = &select.where_clause {
            checker.visit_expr(w);
        }
        for o in &select.order_by {
            checker.visit_expr(&o.expr);
        }
        for c in &select.columns {
            checker.visit_expr(&c.expr);
        }
        checker.found
    }
}

impl Visit for AggregateChecker {
    fn visit_expr(&mut self, expr: &SqlExpr) {
        match expr {
            SqlExpr::Aggregate { .. } => self.found = true,
            SqlExpr::Exists(_)
            | SqlExpr::ScalarSubquery(_)
            | SqlExpr::AggregateSubquery { .. }
            | SqlExpr::In {
                values: InValues::Select(_),
                ..
            }
            | SqlExpr::Projection(_)
            | SqlExpr::ClientJoin(_)
            | SqlExpr::Deferred(_) => {}
            _ => visit::walk_expr(self, expr),
        }
    }

    fn visit_select(&mut self, _select: &Select) {}
}
