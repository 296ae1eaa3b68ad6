//! Turns inline values into named command parameters.

use std::collections::HashSet;

use querykit_proto::{DbQueryType, DbTypeSystem, Value};

use crate::ir::fold::{self, Fold};
use crate::ir::gather;
use crate::ir::{InValues, Select, SqlExpr, TableAlias, WriteCommand};

/// Replaces every non-null literal, every variable and every reference to a
/// row outside the command with a [`SqlExpr::NamedValue`] `p0, p1, ...`.
///
/// A value compared with (or combined with) a typed operand takes that
/// operand's type. Equal values of the same type share one parameter.
pub struct Parameterizer {
    declared: HashSet<TableAlias>,
    values: Vec<(SqlExpr, Option<DbQueryType>, String)>,
    expected: Option<DbQueryType>,
    types: DbTypeSystem,
}

impl Parameterizer {
    fn new(declared: HashSet<TableAlias>, types: DbTypeSystem) -> Self {
        Self {
            declared,
            values: Vec::new(),
            expected: None,
            types,
        }
    }

    /// Parameterize one select command.
    pub fn parameterize(select: Select, types: DbTypeSystem) -> Select {
        let declared = gather::all_declared_aliases(&select);
        Parameterizer::new(declared, types).fold_select(select)
    }

    /// Parameterize one write command.
    pub fn parameterize_write(command: WriteCommand, types: DbTypeSystem) -> WriteCommand {
        let declared = HashSet::from([command.table().alias]);
        let mut this = Parameterizer::new(declared, types);
        match command {
            WriteCommand::Insert { table, values } => WriteCommand::Insert {
                values: this.assignments(values),
                table,
            },
            WriteCommand::Update {
                table,
                assignments,
                where_clause,
            } => WriteCommand::Update {
                assignments: this.assignments(assignments),
                where_clause: where_clause.map(|w| this.fold_expr(w)),
                table,
            },
            WriteCommand::Delete {
                table,
                where_clause,
            } => WriteCommand::Delete {
                where_clause: where_clause.map(|w| this.fold_expr(w)),
                table,
            },
        }
    }

    fn assignments(&mut self, values: Vec<(String, SqlExpr)>) -> Vec<(String, SqlExpr)> {
        values
            .into_iter()
            .map(|(column, e)| {
                let e = match e {
                    SqlExpr::Variable { name, db_type } => {
                        self.named(SqlExpr::Variable { name, db_type }, db_type)
                    }
                    other => self.fold_expr(other),
                };
                (column, e)
            })
            .collect()
    }

    fn named(&mut self, value: SqlExpr, db_type: Option<DbQueryType>) -> SqlExpr {
        let existing = self
            .values
            .iter()
            .find(|(v, t, _)| *v == value && *t == db_type);
        let name = match existing {
            Some((_, _, name)) => name.clone(),
            None => {
                let name = format!("p{}", self.values.len());
                self.values.push((value.clone(), db_type, name.clone()));
                name
            }
        };
        SqlExpr::NamedValue {
            name,
            value: Box::new(value),
            db_type,
        }
    }

    fn with_expected<T>(&mut self, expected: Option<DbQueryType>, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = std::mem::replace(&mut self.expected, expected);
        let result = f(self);
        self.expected = saved;
        result
    }
}

/// Declared type of an operand that can type its counterpart.
fn operand_type(expr: &SqlExpr) -> Option<DbQueryType> {
    match expr {
        SqlExpr::Literal(_) | SqlExpr::Variable { .. } => None,
        e => e.db_type(),
    }
}

impl Fold for Parameterizer {
    fn fold_expr(&mut self, expr: SqlExpr) -> SqlExpr {
        match expr {
            SqlExpr::Literal(Value::Null) | SqlExpr::NamedValue { .. } => expr,
            SqlExpr::Literal(v) => {
                let db_type = self
                    .expected
                    .or_else(|| Some(self.types.column_type(v.kind())));
                self.named(SqlExpr::Literal(v), db_type)
            }
            SqlExpr::Variable { name, db_type } => {
                let ty = db_type.or(self.expected);
                self.named(SqlExpr::Variable { name, db_type }, ty)
            }
            SqlExpr::Column(c) if !self.declared.contains(&c.alias) => {
                let ty = c.db_type;
                self.named(SqlExpr::Column(c), ty)
            }
            SqlExpr::Binary { op, left, right } if !op.is_logical() => {
                let left_ty = operand_type(&left);
                let right_ty = operand_type(&right);
                let left = self.with_expected(right_ty, |this| this.fold_expr(*left));
                let right = self.with_expected(left_ty, |this| this.fold_expr(*right));
                SqlExpr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            SqlExpr::Between { expr, lower, upper } => {
                let ty = operand_type(&expr);
                let expr = self.with_expected(None, |this| this.fold_expr(*expr));
                let (lower, upper) = self.with_expected(ty, |this| {
                    (this.fold_expr(*lower), this.fold_expr(*upper))
                });
                SqlExpr::Between {
                    expr: Box::new(expr),
                    lower: Box::new(lower),
                    upper: Box::new(upper),
                }
            }
            SqlExpr::In {
                expr,
                values: InValues::List(list),
            } => {
                let ty = operand_type(&expr);
                let expr = self.with_expected(None, |this| this.fold_expr(*expr));
                let list = self.with_expected(ty, |this| fold::fold_exprs(this, list));
                SqlExpr::In {
                    expr: Box::new(expr),
                    values: InValues::List(list),
                }
            }
            other => self.with_expected(None, |this| fold::walk_expr(this, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;
    use crate::ir::{AliasGenerator, ColumnDecl, Source, Table};
    use querykit_proto::SqlType;

    fn customers(aliases: &mut AliasGenerator) -> (Select, TableAlias) {
        let t = aliases.next_alias();
        let select = Select::new(
            aliases.next_alias(),
            vec![ColumnDecl::new("City", SqlExpr::column(t, "City", None))],
            Some(Source::Table(Table {
                alias: t,
                entity: "Customer".into(),
                name: "Customers".into(),
            })),
        );
        (select, t)
    }

    #[test]
    fn test_literal_takes_column_type() {
        let mut aliases = AliasGenerator::new();
        let (select, t) = customers(&mut aliases);
        let city_type = DbQueryType::new(SqlType::NVarChar).with_length(15);
        let select = select.with_where(Some(SqlExpr::equal(
            SqlExpr::column(t, "City", Some(city_type)),
            SqlExpr::Literal("London".into()),
        )));

        let select = Parameterizer::parameterize(select, DbTypeSystem);
        match select.where_clause.unwrap() {
            SqlExpr::Binary { right, .. } => match *right {
                SqlExpr::NamedValue { name, db_type, value } => {
                    assert_eq!(name, "p0");
                    assert_eq!(db_type, Some(city_type));
                    assert_eq!(*value, SqlExpr::Literal("London".into()));
                }
                other => panic!("expected named value, got {:?}", other),
            },
            other => panic!("unexpected where {:?}", other),
        }
    }

    #[test]
    fn test_equal_values_share_a_parameter() {
        let mut aliases = AliasGenerator::new();
        let (select, t) = customers(&mut aliases);
        let city = || SqlExpr::column(t, "City", None);
        let predicate = SqlExpr::binary(
            BinaryOp::Or,
            SqlExpr::equal(city(), SqlExpr::Literal("London".into())),
            SqlExpr::equal(city(), SqlExpr::Literal("London".into())),
        );
        let mut p = Parameterizer::new(HashSet::from([t]), DbTypeSystem);
        p.fold_select(select.with_where(Some(predicate)));
        assert_eq!(p.values.len(), 1);
    }

    #[test]
    fn test_null_and_outer_references() {
        let mut aliases = AliasGenerator::new();
        let (select, t) = customers(&mut aliases);
        let outer = aliases.next_alias();
        let predicate = SqlExpr::binary(
            BinaryOp::And,
            SqlExpr::IsNull(Box::new(SqlExpr::Literal(Value::Null))),
            SqlExpr::equal(
                SqlExpr::column(t, "CustomerID", None),
                SqlExpr::column(outer, "CustomerID", None),
            ),
        );
        let select = Parameterizer::parameterize(select.with_where(Some(predicate)), DbTypeSystem);
        let where_clause = select.where_clause.unwrap();
        assert!(gather::referenced_aliases(&where_clause).contains(&outer));
        let text = format!("{:?}", where_clause);
        assert!(text.contains("Literal(Null)"));
        assert!(text.contains("NamedValue"));
    }
}
