use std::collections::HashMap;

use crate::ir::fold::{self, Fold};
use crate::ir::visit::{self, Visit};
use crate::ir::{ColumnRef, Join, Select, Source, SqlExpr, TableAlias};

/// Drops a join whose right side repeats an earlier join of the same kind
/// with an equivalent condition, redirecting references to the earlier one.
#[derive(Default)]
pub struct RedundantJoinRemover {
    redirected: HashMap<TableAlias, TableAlias>,
}

impl RedundantJoinRemover {
    pub fn remove(expr: SqlExpr) -> SqlExpr {
        RedundantJoinRemover::default().fold_expr(expr)
    }
}

impl Fold for RedundantJoinRemover {
    fn fold_join(&mut self, join: Join) -> Source {
        let join = fold::walk_join(self, join);
        let Some(right_alias) = join.right.alias() else {
            return Source::Join(Box::new(join));
        };
        if let Some(similar) = find_similar_right(&join.left, &join) {
            self.redirected.insert(right_alias, similar);
            return join.left;
        }
        Source::Join(Box::new(join))
    }

    fn fold_column(&mut self, column: ColumnRef) -> SqlExpr {
        let mut column = column;
        if let Some(alias) = self.redirected.get(&column.alias) {
            column.alias = *alias;
        }
        SqlExpr::Column(column)
    }
}

/// Alias of a right side inside `source` equivalent to `compare_to`'s.
fn find_similar_right(source: &Source, compare_to: &Join) -> Option<TableAlias> {
    let Source::Join(join) = source else {
        return None;
    };
    if join.kind == compare_to.kind {
        let a = declared_in_order(&join.right);
        let b = declared_in_order(&compare_to.right);
        if a.len() == b.len() {
            let map: HashMap<TableAlias, TableAlias> = b.into_iter().zip(a).collect();
            let mut mapper = AliasMapper { map: &map };
            let right = mapper.fold_source(compare_to.right.clone());
            let condition = compare_to.condition.clone().map(|c| mapper.fold_expr(c));
            if right == join.right && condition == join.condition {
                return join.right.alias();
            }
        }
    }
    find_similar_right(&join.left, compare_to).or_else(|| find_similar_right(&join.right, compare_to))
}

/// Aliases declared inside a source, in traversal order.
fn declared_in_order(source: &Source) -> Vec<TableAlias> {
    #[derive(Default)]
    struct Declared {
        aliases: Vec<TableAlias>,
    }
    impl Visit for Declared {
        fn visit_select(&mut self, select: &Select) {
            self.aliases.push(select.alias);
            visit::walk_select(self, select)
        }

        fn visit_source(&mut self, source: &Source) {
            if let Source::Table(t) = source {
                self.aliases.push(t.alias);
            }
            visit::walk_source(self, source)
        }
    }
    let mut declared = Declared::default();
    declared.visit_source(source);
    declared.aliases
}

/// Renames declared and referenced aliases.
struct AliasMapper<'a> {
    map: &'a HashMap<TableAlias, TableAlias>,
}

impl Fold for AliasMapper<'_> {
    fn fold_select(&mut self, select: Select) -> Select {
        let mut select = fold::walk_select(self, select);
        if let Some(alias) = self.map.get(&select.alias) {
            select.alias = *alias;
        }
        select
    }

    fn fold_source(&mut self, source: Source) -> Source {
        match source {
            Source::Table(mut t) => {
                if let Some(alias) = self.map.get(&t.alias) {
                    t.alias = *alias;
                }
                Source::Table(t)
            }
            other => fold::walk_source(self, other),
        }
    }

    fn fold_column(&mut self, column: ColumnRef) -> SqlExpr {
        let mut column = column;
        if let Some(alias) = self.map.get(&column.alias) {
            column.alias = *alias;
        }
        SqlExpr::Column(column)
    }
}
