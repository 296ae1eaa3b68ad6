//! Column projection: lifting projector expressions into select columns.

use std::collections::HashSet;

use super::fold::{self, Fold};
use super::node::{unique_name, ColumnDecl, InValues, SqlExpr, TableAlias};

/// Select columns plus the projector rewritten to reference them.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedColumns {
    pub projector: SqlExpr,
    pub columns: Vec<ColumnDecl>,
}

/// Splits a projector into server-side columns of a new select and a
/// client-side remainder that references them through `new_alias`.
///
/// Columns of `existing_aliases`, aggregates and subqueries are always lifted;
/// scalar composites are lifted whole when every column they touch is in
/// scope. Inside nested projections only outer correlations (columns and
/// scalars over in-scope columns) are lifted.
pub struct ColumnProjector<'a> {
    new_alias: TableAlias,
    existing: &'a HashSet<TableAlias>,
    columns: Vec<ColumnDecl>,
    depth: usize,
}

impl<'a> ColumnProjector<'a> {
    pub fn project(
        projector: SqlExpr,
        existing_columns: Vec<ColumnDecl>,
        new_alias: TableAlias,
        existing_aliases: &'a HashSet<TableAlias>,
    ) -> ProjectedColumns {
        let mut this = ColumnProjector {
            new_alias,
            existing: existing_aliases,
            columns: existing_columns,
            depth: 0,
        };
        let projector = this.fold_expr(projector);
        ProjectedColumns {
            projector,
            columns: this.columns,
        }
    }

    fn declare(&mut self, expr: SqlExpr) -> SqlExpr {
        if let Some(decl) = self.columns.iter().find(|c| c.expr == expr) {
            return SqlExpr::column(self.new_alias, decl.name.clone(), decl.db_type);
        }
        let base = match &expr {
            SqlExpr::Column(c) => c.name.clone(),
            _ => "c".to_string(),
        };
        let name = unique_name(&base, |n| self.columns.iter().any(|c| c.name == n));
        let decl = ColumnDecl::new(name.clone(), expr);
        let db_type = decl.db_type;
        self.columns.push(decl);
        SqlExpr::column(self.new_alias, name, db_type)
    }

    fn is_candidate(&self, expr: &SqlExpr) -> bool {
        match expr {
            SqlExpr::Column(c) => self.existing.contains(&c.alias),
            SqlExpr::Aggregate { .. }
            | SqlExpr::AggregateSubquery { .. }
            | SqlExpr::ScalarSubquery(_)
            | SqlExpr::Exists(_)
            | SqlExpr::RowNumber { .. }
            | SqlExpr::In {
                values: InValues::Select(_),
                ..
            } => true,
            SqlExpr::Literal(_) | SqlExpr::NamedValue { .. } | SqlExpr::Variable { .. } => false,
            e => {
                let mut saw_column = false;
                self.is_server_scalar(e, &mut saw_column) && saw_column
            }
        }
    }

    /// Inside nested queries only outer scalars over in-scope columns lift.
    fn is_correlation(&self, expr: &SqlExpr) -> bool {
        match expr {
            SqlExpr::Column(c) => self.existing.contains(&c.alias),
            SqlExpr::Literal(_) | SqlExpr::NamedValue { .. } | SqlExpr::Variable { .. } => false,
            e if e.is_predicate() => false,
            e => {
                let mut saw_column = false;
                self.is_server_scalar(e, &mut saw_column) && saw_column
            }
        }
    }

    fn is_server_scalar(&self, expr: &SqlExpr, saw_column: &mut bool) -> bool {
        match expr {
            SqlExpr::Column(c) => {
                *saw_column = true;
                self.existing.contains(&c.alias)
            }
            SqlExpr::Literal(_) | SqlExpr::NamedValue { .. } | SqlExpr::Variable { .. } => true,
            SqlExpr::Binary { left, right, .. } => {
                self.is_server_scalar(left, saw_column) && self.is_server_scalar(right, saw_column)
            }
            SqlExpr::Unary { operand, .. } => self.is_server_scalar(operand, saw_column),
            SqlExpr::Function { args, .. } => args.iter().all(|a| self.is_server_scalar(a, saw_column)),
            SqlExpr::Case {
                test,
                if_true,
                if_false,
            } => {
                self.is_server_scalar(test, saw_column)
                    && self.is_server_scalar(if_true, saw_column)
                    && self.is_server_scalar(if_false, saw_column)
            }
            SqlExpr::IsNull(e) => self.is_server_scalar(e, saw_column),
            SqlExpr::Between { expr, lower, upper } => {
                self.is_server_scalar(expr, saw_column)
                    && self.is_server_scalar(lower, saw_column)
                    && self.is_server_scalar(upper, saw_column)
            }
            SqlExpr::In {
                expr,
                values: InValues::List(list),
            } => {
                self.is_server_scalar(expr, saw_column)
                    && list.iter().all(|e| self.is_server_scalar(e, saw_column))
            }
            _ => false,
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }
}

impl Fold for ColumnProjector<'_> {
    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        if self.depth == 0 && self.is_candidate(&expr) {
            return self.declare(expr);
        }
        if self.depth > 0 && self.is_correlation(&expr) {
            return self.declare(expr);
        }
        match expr {
            SqlExpr::Projection(p) => {
                SqlExpr::Projection(Box::new(self.nested(|this| this.fold_projection(*p))))
            }
            SqlExpr::Deferred(p) => {
                SqlExpr::Deferred(Box::new(self.nested(|this| this.fold_projection(*p))))
            }
            SqlExpr::ClientJoin(j) => {
                let j = *j;
                let outer_key = fold::fold_exprs(self, j.outer_key);
                let (projection, inner_key) = self.nested(|this| {
                    let projection = this.fold_projection(j.projection);
                    let inner_key = fold::fold_exprs(this, j.inner_key);
                    (projection, inner_key)
                });
                SqlExpr::ClientJoin(Box::new(super::node::ClientJoin {
                    projection,
                    outer_key,
                    inner_key,
                }))
            }
            SqlExpr::Exists(_)
            | SqlExpr::ScalarSubquery(_)
            | SqlExpr::AggregateSubquery { .. }
            | SqlExpr::In {
                values: InValues::Select(_),
                ..
            } if self.depth > 0 => self.nested(|this| fold::walk_expr(this, expr)),
            other => fold::walk_expr(self, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{AggregateKind, BinaryOp, ScalarFunction};
    use crate::ir::{AliasGenerator, Projection, Select};

    #[test]
    fn test_lifts_columns_and_composites() {
        let mut aliases = AliasGenerator::new();
        let t = aliases.next_alias();
        let s = aliases.next_alias();
        let existing = HashSet::from([t]);

        let projector = SqlExpr::New {
            fields: vec![
                ("Name".into(), SqlExpr::column(t, "ContactName", None)),
                (
                    "Upper".into(),
                    SqlExpr::Function {
                        function: ScalarFunction::Upper,
                        args: vec![SqlExpr::column(t, "City", None)],
                    },
                ),
                ("Again".into(), SqlExpr::column(t, "ContactName", None)),
            ],
        };
        let projected = ColumnProjector::project(projector, Vec::new(), s, &existing);

        let names: Vec<_> = projected.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ContactName", "c"]);
        match projected.projector {
            SqlExpr::New { fields } => {
                assert_eq!(fields[0].1, SqlExpr::column(s, "ContactName", None));
                assert_eq!(fields[2].1, fields[0].1);
            }
            other => panic!("unexpected projector {:?}", other),
        }
    }

    #[test]
    fn test_name_collisions_get_suffix() {
        let mut aliases = AliasGenerator::new();
        let a = aliases.next_alias();
        let b = aliases.next_alias();
        let s = aliases.next_alias();
        let existing = HashSet::from([a, b]);

        let projector = SqlExpr::New {
            fields: vec![
                ("A".into(), SqlExpr::column(a, "ID", None)),
                ("B".into(), SqlExpr::column(b, "ID", None)),
            ],
        };
        let projected = ColumnProjector::project(projector, Vec::new(), s, &existing);
        let names: Vec<_> = projected.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ID", "ID1"]);
    }

    #[test]
    fn test_nested_projection_lifts_only_correlations() {
        let mut aliases = AliasGenerator::new();
        let outer = aliases.next_alias();
        let inner = aliases.next_alias();
        let s = aliases.next_alias();
        let existing = HashSet::from([outer]);

        let nested = Select::new(
            inner,
            vec![ColumnDecl::new("OrderID", SqlExpr::column(inner, "OrderID", None))],
            None,
        )
        .with_where(Some(SqlExpr::binary(
            BinaryOp::Equal,
            SqlExpr::column(inner, "CustomerID", None),
            SqlExpr::column(outer, "CustomerID", None),
        )));
        let projector = SqlExpr::Projection(Box::new(Projection::new(
            nested,
            SqlExpr::column(inner, "OrderID", None),
        )));
        let projected = ColumnProjector::project(projector, Vec::new(), s, &existing);

        assert_eq!(projected.columns.len(), 1);
        assert_eq!(projected.columns[0].expr, SqlExpr::column(outer, "CustomerID", None));
    }

    #[test]
    fn test_aggregates_always_lifted() {
        let mut aliases = AliasGenerator::new();
        let t = aliases.next_alias();
        let s = aliases.next_alias();
        let existing = HashSet::from([t]);
        let projector = SqlExpr::Aggregate {
            kind: AggregateKind::Count,
            arg: None,
            distinct: false,
        };
        let projected = ColumnProjector::project(projector, Vec::new(), s, &existing);
        assert_eq!(projected.columns.len(), 1);
        assert!(matches!(projected.projector, SqlExpr::Column(_)));
    }
}
