//! Alias and column gatherers plus reference-rewriting folds.

use std::collections::{HashMap, HashSet};

use super::fold::Fold;
use super::node::{ColumnRef, Projection, Select, Source, SqlExpr, TableAlias};
use super::visit::{self, Visit};

#[derive(Default)]
struct AliasReferences {
    aliases: HashSet<TableAlias>,
}

impl Visit for AliasReferences {
    fn visit_expr(&mut self, expr: &SqlExpr) {
        if let SqlExpr::Column(c) = expr {
            self.aliases.insert(c.alias);
        }
        visit::walk_expr(self, expr)
    }
}

/// Aliases referenced by any column inside `expr`, nested selects included.
pub fn referenced_aliases(expr: &SqlExpr) -> HashSet<TableAlias> {
    let mut gatherer = AliasReferences::default();
    gatherer.visit_expr(expr);
    gatherer.aliases
}

/// Aliases referenced anywhere inside `select`.
pub fn referenced_aliases_in_select(select: &Select) -> HashSet<TableAlias> {
    let mut gatherer = AliasReferences::default();
    gatherer.visit_select(select);
    gatherer.aliases
}

/// Aliases a source introduces into the scope of its select.
pub fn declared_aliases(source: &Source) -> HashSet<TableAlias> {
    let mut aliases = HashSet::new();
    collect_declared(source, &mut aliases);
    aliases
}

fn collect_declared(source: &Source, aliases: &mut HashSet<TableAlias>) {
    match source {
        Source::Table(t) => {
            aliases.insert(t.alias);
        }
        Source::Select(s) => {
            aliases.insert(s.alias);
        }
        Source::Join(j) => {
            collect_declared(&j.left, aliases);
            collect_declared(&j.right, aliases);
        }
    }
}

/// Every alias declared anywhere inside a select, including nested sources.
pub fn all_declared_aliases(select: &Select) -> HashSet<TableAlias> {
    #[derive(Default)]
    struct Declared {
        aliases: HashSet<TableAlias>,
    }
    impl Visit for Declared {
        fn visit_select(&mut self, select: &Select) {
            self.aliases.insert(select.alias);
            visit::walk_select(self, select)
        }

        fn visit_source(&mut self, source: &Source) {
            if let Source::Table(t) = source {
                self.aliases.insert(t.alias);
            }
            visit::walk_source(self, source)
        }
    }
    let mut gatherer = Declared::default();
    gatherer.visit_select(select);
    gatherer.aliases
}

#[derive(Default)]
struct ColumnReferences {
    columns: Vec<ColumnRef>,
}

impl Visit for ColumnReferences {
    fn visit_expr(&mut self, expr: &SqlExpr) {
        if let SqlExpr::Column(c) = expr {
            if !self.columns.contains(c) {
                self.columns.push(c.clone());
            }
        }
        visit::walk_expr(self, expr)
    }
}

/// Distinct column references inside `expr`, in first-seen order.
pub fn referenced_columns(expr: &SqlExpr) -> Vec<ColumnRef> {
    let mut gatherer = ColumnReferences::default();
    gatherer.visit_expr(expr);
    gatherer.columns
}

/// Check if the expression contains a nested projection or client join.
pub fn has_nested_queries(expr: &SqlExpr) -> bool {
    #[derive(Default)]
    struct Nested {
        found: bool,
    }
    impl Visit for Nested {
        fn visit_expr(&mut self, expr: &SqlExpr) {
            match expr {
                SqlExpr::Projection(_) | SqlExpr::ClientJoin(_) => self.found = true,
                _ => visit::walk_expr(self, expr),
            }
        }
    }
    let mut gatherer = Nested::default();
    gatherer.visit_expr(expr);
    gatherer.found
}

/// Rewrites column references through a caller-supplied mapping.
pub struct ColumnMapper<F> {
    map: F,
}

impl<F> Fold for ColumnMapper<F>
where
    F: FnMut(&ColumnRef) -> Option<SqlExpr>,
{
    fn fold_column(&mut self, column: ColumnRef) -> SqlExpr {
        (self.map)(&column).unwrap_or(SqlExpr::Column(column))
    }
}

/// Replace columns of `expr` for which `map` returns a substitute.
pub fn map_columns<F>(expr: SqlExpr, map: F) -> SqlExpr
where
    F: FnMut(&ColumnRef) -> Option<SqlExpr>,
{
    ColumnMapper { map }.fold_expr(expr)
}

/// Replace columns anywhere inside a select.
pub fn map_columns_in_select<F>(select: Select, map: F) -> Select
where
    F: FnMut(&ColumnRef) -> Option<SqlExpr>,
{
    ColumnMapper { map }.fold_select(select)
}

/// Replace columns anywhere inside a projection.
pub fn map_columns_in_projection<F>(projection: Projection, map: F) -> Projection
where
    F: FnMut(&ColumnRef) -> Option<SqlExpr>,
{
    ColumnMapper { map }.fold_projection(projection)
}

/// Replace columns anywhere inside a source.
pub fn map_columns_in_source<F>(source: Source, map: F) -> Source
where
    F: FnMut(&ColumnRef) -> Option<SqlExpr>,
{
    ColumnMapper { map }.fold_source(source)
}

/// Point column references at different aliases, keeping column names.
pub fn map_aliases(expr: SqlExpr, aliases: &HashMap<TableAlias, TableAlias>) -> SqlExpr {
    map_columns(expr, |c| {
        aliases.get(&c.alias).map(|alias| SqlExpr::Column(ColumnRef {
            alias: *alias,
            name: c.name.clone(),
            db_type: c.db_type,
        }))
    })
}

/// Resolve references to a select's columns into the column expressions.
pub fn inline_columns(expr: SqlExpr, select: &Select) -> SqlExpr {
    let alias = select.alias;
    map_columns(expr, |c| {
        if c.alias != alias {
            return None;
        }
        select.column(&c.name).map(|decl| decl.expr.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;
    use crate::ir::{AliasGenerator, ColumnDecl, Join, JoinKind, Table};

    #[test]
    fn test_referenced_and_declared_aliases() {
        let mut aliases = AliasGenerator::new();
        let a = aliases.next_alias();
        let b = aliases.next_alias();
        let expr = SqlExpr::equal(SqlExpr::column(a, "x", None), SqlExpr::column(b, "y", None));
        let refs = referenced_aliases(&expr);
        assert!(refs.contains(&a) && refs.contains(&b));

        let join = Source::Join(Box::new(Join {
            kind: JoinKind::Inner,
            left: Source::Table(Table {
                alias: a,
                entity: "A".into(),
                name: "A".into(),
            }),
            right: Source::Table(Table {
                alias: b,
                entity: "B".into(),
                name: "B".into(),
            }),
            condition: Some(expr),
        }));
        let declared = declared_aliases(&join);
        assert_eq!(declared.len(), 2);
    }

    #[test]
    fn test_map_aliases() {
        let mut aliases = AliasGenerator::new();
        let a = aliases.next_alias();
        let b = aliases.next_alias();
        let expr = SqlExpr::binary(
            BinaryOp::Add,
            SqlExpr::column(a, "x", None),
            SqlExpr::column(b, "y", None),
        );
        let mapped = map_aliases(expr, &HashMap::from([(a, b)]));
        assert_eq!(referenced_aliases(&mapped), HashSet::from([b]));
    }

    #[test]
    fn test_inline_columns() {
        let mut aliases = AliasGenerator::new();
        let t = aliases.next_alias();
        let s = aliases.next_alias();
        let select = Select::new(
            s,
            vec![ColumnDecl::new("total", SqlExpr::column(t, "Freight", None))],
            None,
        );
        let inlined = inline_columns(SqlExpr::column(s, "total", None), &select);
        assert_eq!(inlined, SqlExpr::column(t, "Freight", None));
    }
}
