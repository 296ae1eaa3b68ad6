//! Offset emulation with ROW_NUMBER.

use querykit_proto::{DbQueryType, SqlType, Value};

use crate::error::Error;
use crate::expr::{eval, BinaryOp};
use crate::ir::fold::{self, Fold};
use crate::ir::{AliasGenerator, ColumnDecl, Select, Source, SqlExpr};

/// Name of the synthesized row-number column.
pub const ROW_NUMBER_COLUMN: &str = "_rownumber";

/// Rewrites every select with a skip into a row-numbered inner select and an
/// outer select filtering on the row number.
///
/// ```text
/// SELECT .. FROM (SELECT .., ROW_NUMBER() OVER (ORDER BY ..) AS _rownumber ..) AS t
/// WHERE t._rownumber BETWEEN skip + 1 AND skip + take
/// ```
pub struct SkipToRowNumberRewriter<'a> {
    aliases: &'a mut AliasGenerator,
    supports_row_number: bool,
    error: Option<Error>,
}

impl<'a> SkipToRowNumberRewriter<'a> {
    pub fn rewrite(
        expr: SqlExpr,
        aliases: &'a mut AliasGenerator,
        supports_row_number: bool,
    ) -> crate::Result<SqlExpr> {
        let mut rewriter = SkipToRowNumberRewriter {
            aliases,
            supports_row_number,
            error: None,
        };
        let expr = rewriter.fold_expr(expr);
        match rewriter.error {
            Some(e) => Err(e),
            None => Ok(expr),
        }
    }

    fn emulate(&mut self, mut select: Select) -> Select {
        let Some(skip) = select.skip.take() else {
            return select;
        };
        if !self.supports_row_number {
            self.error = Some(Error::Legalization(
                "the language supports neither offsets nor row numbers".into(),
            ));
            return select;
        }
        if select.order_by.is_empty() {
            self.error = Some(Error::Legalization(
                "skip without an ordering cannot be emulated with row numbers".into(),
            ));
            return select;
        }
        let take = select.take.take();

        if select.distinct || !select.group_by.is_empty() {
            select = self.wrap_keeping_order(select);
        }

        let rn_type = DbQueryType::new(SqlType::Int).not_null();
        let rn_name = select.unique_column_name(ROW_NUMBER_COLUMN);
        select.columns.push(ColumnDecl {
            name: rn_name.clone(),
            expr: SqlExpr::RowNumber {
                order_by: select.order_by.clone(),
            },
            db_type: Some(rn_type),
        });

        let inner_alias = self.aliases.next_alias();
        let mut outer = select.add_redundant_select(inner_alias);
        outer.columns.retain(|c| c.name != rn_name);

        let rn = SqlExpr::column(inner_alias, rn_name, Some(rn_type));
        let predicate = match take {
            Some(take) => SqlExpr::Between {
                expr: Box::new(rn),
                lower: Box::new(add(skip.clone(), SqlExpr::Literal(Value::Int32(1)))),
                upper: Box::new(add(skip, take)),
            },
            None => SqlExpr::binary(BinaryOp::GreaterThan, rn, skip),
        };
        outer.where_clause = SqlExpr::and_also(outer.where_clause.take(), Some(predicate));
        outer
    }

    /// Add a redundant layer so the row number does not take part in
    /// DISTINCT or GROUP BY, rebinding the ordering to the new layer.
    fn wrap_keeping_order(&mut self, select: Select) -> Select {
        let new_alias = self.aliases.next_alias();
        let mut order_by = select.order_by.clone();
        let mut wrapper = select.add_redundant_select(new_alias);
        let Some(Source::Select(inner)) = wrapper.from.as_mut() else {
            return wrapper;
        };
        inner.order_by.clear();
        for clause in order_by.iter_mut() {
            let existing = inner.columns.iter().find(|c| c.expr == clause.expr);
            let (name, db_type) = match existing {
                Some(c) => (c.name.clone(), c.db_type),
                None => {
                    let name = inner.unique_column_name("c");
                    let decl = ColumnDecl::new(name.clone(), clause.expr.clone());
                    let db_type = decl.db_type;
                    inner.columns.push(decl);
                    (name, db_type)
                }
            };
            clause.expr = SqlExpr::column(new_alias, name, db_type);
        }
        wrapper.order_by = order_by;
        wrapper
    }
}

/// Add two offsets, folding literal operands.
fn add(left: SqlExpr, right: SqlExpr) -> SqlExpr {
    if let (SqlExpr::Literal(a), SqlExpr::Literal(b)) = (&left, &right) {
        if let Ok(sum) = eval::binary(BinaryOp::Add, a, b) {
            return SqlExpr::Literal(sum);
        }
    }
    SqlExpr::binary(BinaryOp::Add, left, right)
}

impl Fold for SkipToRowNumberRewriter<'_> {
    fn fold_select(&mut self, select: Select) -> Select {
        let select = fold::walk_select(self, select);
        if self.error.is_some() {
            return select;
        }
        self.emulate(select)
    }
}
