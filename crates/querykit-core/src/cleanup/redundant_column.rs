use std::collections::HashMap;

use crate::ir::fold::{self, Fold};
use crate::ir::gather;
use crate::ir::{ColumnDecl, ColumnRef, Select, SqlExpr, TableAlias};

/// Collapses columns of one select that compute the same expression and
/// points their references at the surviving column.
#[derive(Default)]
pub struct RedundantColumnRemover {
    renamed: HashMap<(TableAlias, String), String>,
}

impl RedundantColumnRemover {
    pub fn remove(expr: SqlExpr) -> SqlExpr {
        let mut this = RedundantColumnRemover::default();
        let expr = this.fold_expr(expr);
        if this.renamed.is_empty() {
            return expr;
        }
        let renamed = this.renamed;
        gather::map_columns(expr, |c| {
            renamed.get(&(c.alias, c.name.clone())).map(|name| {
                SqlExpr::Column(ColumnRef {
                    alias: c.alias,
                    name: name.clone(),
                    db_type: c.db_type,
                })
            })
        })
    }
}

impl Fold for RedundantColumnRemover {
    fn fold_select(&mut self, select: Select) -> Select {
        let mut select = fold::walk_select(self, select);
        let mut kept: Vec<ColumnDecl> = Vec::with_capacity(select.columns.len());
        for decl in std::mem::take(&mut select.columns) {
            match kept.iter().find(|k| k.expr == decl.expr) {
                Some(existing) => {
                    self.renamed
                        .insert((select.alias, decl.name), existing.name.clone());
                }
                None => kept.push(decl),
            }
        }
        select.columns = kept;
        select
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AliasGenerator, Projection, Source, Table};

    #[test]
    fn test_duplicate_columns_collapse() {
        let mut aliases = AliasGenerator::new();
        let t = aliases.next_alias();
        let s = aliases.next_alias();
        let select = Select::new(
            s,
            vec![
                ColumnDecl::new("City", SqlExpr::column(t, "City", None)),
                ColumnDecl::new("City1", SqlExpr::column(t, "City", None)),
            ],
            Some(Source::Table(Table {
                alias: t,
                entity: "Customer".into(),
                name: "Customers".into(),
            })),
        );
        let projector = SqlExpr::New {
            fields: vec![
                ("A".into(), SqlExpr::column(s, "City", None)),
                ("B".into(), SqlExpr::column(s, "City1", None)),
            ],
        };
        let projection = Projection::new(select, projector);
        let SqlExpr::Projection(p) = RedundantColumnRemover::remove(SqlExpr::Projection(Box::new(projection)))
        else {
            panic!("expected projection");
        };
        assert_eq!(p.select.columns.len(), 1);
        let SqlExpr::New { fields } = p.projector else {
            panic!("expected record");
        };
        assert_eq!(fields[0].1, fields[1].1);
    }
}
