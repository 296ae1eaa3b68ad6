//! Structural simplifications that preserve query results.
//!
//! Every pass is a no-op on a tree that is already minimal, so [`clean`] can
//! run after any rewrite without changing the outcome of a second call.

mod redundant_column;
mod redundant_join;
mod redundant_subquery;
mod unused_column;

use tracing::trace;

use crate::ir::SqlExpr;

pub use redundant_column::RedundantColumnRemover;
pub use redundant_join::RedundantJoinRemover;
pub use redundant_subquery::RedundantSubqueryRemover;
pub use unused_column::UnusedColumnRemover;

const MAX_CLEANUP_ROUNDS: usize = 4;

/// Run the cleanup passes until the tree stops changing.
pub fn clean(expr: SqlExpr) -> SqlExpr {
    let mut expr = expr;
    for round in 0..MAX_CLEANUP_ROUNDS {
        let before = expr.clone();
        expr = UnusedColumnRemover::remove(expr);
        expr = RedundantColumnRemover::remove(expr);
        expr = RedundantSubqueryRemover::remove(expr);
        expr = RedundantJoinRemover::remove(expr);
        expr = UnusedColumnRemover::remove(expr);
        if expr == before {
            trace!(round, "cleanup converged");
            break;
        }
    }
    expr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AliasGenerator, ColumnDecl, Projection, Select, Source, Table, TableAlias};
    use proptest::prelude::*;

    const COLUMNS: [&str; 5] = ["CustomerID", "ContactName", "City", "Country", "Region"];

    fn layered(aliases: &mut AliasGenerator, layers: usize, projected: &[usize]) -> SqlExpr {
        let t = aliases.next_alias();
        let mut select = Select::new(
            aliases.next_alias(),
            COLUMNS
                .iter()
                .map(|c| ColumnDecl::new(*c, SqlExpr::column(t, *c, None)))
                .collect(),
            Some(Source::Table(Table {
                alias: t,
                entity: "Customer".into(),
                name: "Customers".into(),
            })),
        );
        for _ in 0..layers {
            let inner: TableAlias = select.alias;
            let columns = select
                .columns
                .iter()
                .map(|c| ColumnDecl::new(c.name.clone(), SqlExpr::column(inner, c.name.clone(), None)))
                .collect();
            select = Select::new(aliases.next_alias(), columns, Some(Source::Select(Box::new(select))));
        }
        let alias = select.alias;
        let projector = SqlExpr::New {
            fields: projected
                .iter()
                .map(|i| (COLUMNS[*i].to_string(), SqlExpr::column(alias, COLUMNS[*i], None)))
                .collect(),
        };
        SqlExpr::Projection(Box::new(Projection::new(select, projector)))
    }

    #[test]
    fn test_clean_flattens_and_prunes() {
        let mut aliases = AliasGenerator::new();
        let SqlExpr::Projection(p) = clean(layered(&mut aliases, 3, &[2])) else {
            panic!("expected projection");
        };
        assert!(matches!(p.select.from, Some(Source::Table(_))));
        assert_eq!(p.select.columns.len(), 1);
        assert_eq!(p.select.columns[0].name, "City");
    }

    proptest! {
        #[test]
        fn test_clean_is_idempotent(
            layers in 0usize..4,
            projected in proptest::collection::vec(0usize..COLUMNS.len(), 1..4),
        ) {
            let mut aliases = AliasGenerator::new();
            let once = clean(layered(&mut aliases, layers, &projected));
            let twice = clean(once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_every_column_is_referenced(
            layers in 0usize..4,
            projected in proptest::collection::vec(0usize..COLUMNS.len(), 1..4),
        ) {
            let mut aliases = AliasGenerator::new();
            let SqlExpr::Projection(p) = clean(layered(&mut aliases, layers, &projected)) else {
                panic!("expected projection");
            };
            let referenced = crate::ir::gather::referenced_columns(&p.projector);
            for column in &p.select.columns {
                prop_assert!(referenced.iter().any(|c| c.name == column.name));
            }
        }
    }
}
