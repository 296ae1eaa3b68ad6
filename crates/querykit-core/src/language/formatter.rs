//! SQL text generation.

use querykit_proto::Value;

use super::QueryLanguage;
use crate::error::{Error, Result};
use crate::expr::{AggregateKind, BinaryOp, ScalarFunction, UnaryOp};
use crate::ir::{InValues, JoinKind, OrderClause, Select, Source, SqlExpr, TableAlias, WriteCommand};

const INDENT: usize = 2;

/// Renders legalized, parameterized IR as SQL text for one language.
pub struct SqlFormatter<'a> {
    language: &'a dyn QueryLanguage,
    out: String,
    depth: usize,
    /// Alias whose columns render unqualified (write commands).
    hidden_alias: Option<TableAlias>,
}

impl<'a> SqlFormatter<'a> {
    pub fn new(language: &'a dyn QueryLanguage) -> Self {
        Self {
            language,
            out: String::new(),
            depth: 0,
            hidden_alias: None,
        }
    }

    pub fn format(language: &'a dyn QueryLanguage, select: &Select) -> Result<String> {
        let mut f = SqlFormatter::new(language);
        f.write_select(select)?;
        Ok(f.out)
    }

    pub fn format_write(language: &'a dyn QueryLanguage, command: &WriteCommand) -> Result<String> {
        let mut f = SqlFormatter::new(language);
        f.hidden_alias = Some(command.table().alias);
        f.write_command(command)?;
        Ok(f.out)
    }

    fn newline(&mut self) {
        self.out.push('\n');
        for _ in 0..self.depth * INDENT {
            self.out.push(' ');
        }
    }

    fn write(&mut self, text: &str) {
        self.out.push_str(text);
    }

    fn write_command(&mut self, command: &WriteCommand) -> Result<()> {
        match command {
            WriteCommand::Insert { table, values } => {
                let name = self.language.quote(&table.name);
                self.write(&format!("INSERT INTO {}(", name));
                for (i, (column, _)) in values.iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    let column = self.language.quote(column);
                    self.write(&column);
                }
                self.write(")");
                self.newline();
                self.write("VALUES (");
                for (i, (_, value)) in values.iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.write_value(value)?;
                }
                self.write(")");
            }
            WriteCommand::Update {
                table,
                assignments,
                where_clause,
            } => {
                let name = self.language.quote(&table.name);
                self.write(&format!("UPDATE {}", name));
                self.newline();
                self.write("SET ");
                for (i, (column, value)) in assignments.iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    let column = self.language.quote(column);
                    self.write(&format!("{} = ", column));
                    self.write_value(value)?;
                }
                self.write_where(where_clause.as_ref())?;
            }
            WriteCommand::Delete {
                table,
                where_clause,
            } => {
                let name = self.language.quote(&table.name);
                self.write(&format!("DELETE FROM {}", name));
                self.write_where(where_clause.as_ref())?;
            }
        }
        Ok(())
    }

    fn write_where(&mut self, predicate: Option<&SqlExpr>) -> Result<()> {
        if let Some(predicate) = predicate {
            self.newline();
            self.write("WHERE ");
            self.write_predicate(predicate)?;
        }
        Ok(())
    }

    fn write_select(&mut self, select: &Select) -> Result<()> {
        self.write("SELECT ");
        if select.distinct {
            self.write("DISTINCT ");
        }
        if select.columns.is_empty() {
            self.write("NULL AS tmp");
        }
        for (i, column) in select.columns.iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.write_value(&column.expr)?;
            let same_name = matches!(&column.expr, SqlExpr::Column(c) if c.name == column.name);
            if !same_name {
                let name = self.language.quote(&column.name);
                self.write(&format!(" AS {}", name));
            }
        }
        if let Some(from) = &select.from {
            self.newline();
            self.write("FROM ");
            self.write_source(from)?;
        }
        self.write_where(select.where_clause.as_ref())?;
        if !select.group_by.is_empty() {
            self.newline();
            self.write("GROUP BY ");
            for (i, g) in select.group_by.iter().enumerate() {
                if i > 0 {
                    self.write(", ");
                }
                self.write_value(g)?;
            }
        }
        if !select.order_by.is_empty() {
            self.newline();
            self.write("ORDER BY ");
            self.write_orderings(&select.order_by)?;
        }
        if select.skip.is_some() || select.take.is_some() {
            let skip = select.skip.as_ref().map(|s| self.render(s)).transpose()?;
            let take = select.take.as_ref().map(|t| self.render(t)).transpose()?;
            self.newline();
            self.language
                .write_limit(&mut self.out, skip.as_deref(), take.as_deref());
        }
        Ok(())
    }

    /// Render an expression into a separate buffer.
    fn render(&self, expr: &SqlExpr) -> Result<String> {
        let mut f = SqlFormatter::new(self.language);
        f.hidden_alias = self.hidden_alias;
        f.write_value(expr)?;
        Ok(f.out)
    }

    fn write_orderings(&mut self, order_by: &[OrderClause]) -> Result<()> {
        for (i, o) in order_by.iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.write_value(&o.expr)?;
            if o.descending {
                self.write(" DESC");
            }
        }
        Ok(())
    }

    fn write_source(&mut self, source: &Source) -> Result<()> {
        match source {
            Source::Table(t) => {
                let name = self.language.quote(&t.name);
                self.write(&format!("{} AS {}", name, t.alias));
            }
            Source::Select(s) => {
                self.write_nested_select(s)?;
                self.write(&format!(" AS {}", s.alias));
            }
            Source::Join(j) => {
                self.write_source(&j.left)?;
                self.newline();
                self.write(match j.kind {
                    JoinKind::Cross => "CROSS JOIN ",
                    JoinKind::Inner => "INNER JOIN ",
                    JoinKind::Outer | JoinKind::SingletonOuter => "LEFT OUTER JOIN ",
                });
                self.write_source(&j.right)?;
                if let Some(condition) = &j.condition {
                    self.depth += 1;
                    self.newline();
                    self.write("ON ");
                    self.write_predicate(condition)?;
                    self.depth -= 1;
                }
            }
        }
        Ok(())
    }

    fn write_nested_select(&mut self, select: &Select) -> Result<()> {
        self.write("(");
        self.depth += 1;
        self.newline();
        self.write_select(select)?;
        self.depth -= 1;
        self.newline();
        self.write(")");
        Ok(())
    }

    /// Write an expression where SQL expects a condition.
    fn write_predicate(&mut self, expr: &SqlExpr) -> Result<()> {
        if expr.is_predicate() {
            return self.write_expr(expr);
        }
        match expr {
            SqlExpr::Literal(Value::Bool(true)) => self.write("(1 = 1)"),
            SqlExpr::Literal(Value::Bool(false)) => self.write("(1 = 0)"),
            other => {
                self.write("(");
                self.write_expr(other)?;
                self.write(" <> 0)");
            }
        }
        Ok(())
    }

    /// Write an expression where SQL expects a value.
    fn write_value(&mut self, expr: &SqlExpr) -> Result<()> {
        if expr.is_predicate() {
            self.write("CASE WHEN ");
            self.write_expr(expr)?;
            self.write(" THEN 1 ELSE 0 END");
            return Ok(());
        }
        self.write_expr(expr)
    }

    fn write_literal(&mut self, value: &Value) {
        let text = match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
            Value::Int32(i) => i.to_string(),
            Value::Int64(i) => i.to_string(),
            Value::Float64(f) => format!("{:?}", f),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => {
                let hex: String = b.iter().map(|byte| format!("{:02X}", byte)).collect();
                format!("X'{}'", hex)
            }
        };
        self.write(&text);
    }

    fn write_expr(&mut self, expr: &SqlExpr) -> Result<()> {
        match expr {
            SqlExpr::Column(c) => {
                let name = self.language.quote(&c.name);
                if self.hidden_alias == Some(c.alias) {
                    self.write(&name);
                } else {
                    self.write(&format!("{}.{}", c.alias, name));
                }
            }
            SqlExpr::Literal(v) => self.write_literal(v),
            SqlExpr::NamedValue { name, .. } | SqlExpr::Variable { name, .. } => {
                let prefix = self.language.parameter_prefix().to_string();
                self.write(&format!("{}{}", prefix, name));
            }
            SqlExpr::Binary { op, left, right } => self.write_binary(*op, left, right)?,
            SqlExpr::Unary { op, operand } => match op {
                UnaryOp::Not => {
                    self.write("NOT ");
                    self.write_predicate(operand)?;
                }
                UnaryOp::Negate => {
                    self.write("-");
                    self.write_value(operand)?;
                }
            },
            SqlExpr::Function { function, args } => self.write_function(*function, args)?,
            SqlExpr::Case {
                test,
                if_true,
                if_false,
            } => {
                self.write("CASE WHEN ");
                self.write_predicate(test)?;
                self.write(" THEN ");
                self.write_value(if_true)?;
                self.write(" ELSE ");
                self.write_value(if_false)?;
                self.write(" END");
            }
            SqlExpr::IsNull(e) => {
                self.write("(");
                self.write_value(e)?;
                self.write(" IS NULL)");
            }
            SqlExpr::Between { expr, lower, upper } => {
                self.write("(");
                self.write_value(expr)?;
                self.write(" BETWEEN ");
                self.write_value(lower)?;
                self.write(" AND ");
                self.write_value(upper)?;
                self.write(")");
            }
            SqlExpr::In { expr, values } => match values {
                InValues::List(list) if list.is_empty() => self.write("(1 = 0)"),
                InValues::List(list) => {
                    self.write("(");
                    self.write_value(expr)?;
                    self.write(" IN (");
                    for (i, v) in list.iter().enumerate() {
                        if i > 0 {
                            self.write(", ");
                        }
                        self.write_value(v)?;
                    }
                    self.write("))");
                }
                InValues::Select(select) => {
                    self.write("(");
                    self.write_value(expr)?;
                    self.write(" IN ");
                    self.write_nested_select(select)?;
                    self.write(")");
                }
            },
            SqlExpr::Exists(select) => {
                self.write("EXISTS");
                self.write_nested_select(select)?;
            }
            SqlExpr::ScalarSubquery(select) => self.write_nested_select(select)?,
            SqlExpr::AggregateSubquery { subquery, .. } => self.write_nested_select(subquery)?,
            SqlExpr::Aggregate {
                kind,
                arg,
                distinct,
            } => {
                let name = match kind {
                    AggregateKind::Count | AggregateKind::LongCount => "COUNT",
                    AggregateKind::Sum => "SUM",
                    AggregateKind::Min => "MIN",
                    AggregateKind::Max => "MAX",
                    AggregateKind::Average => "AVG",
                };
                self.write(name);
                self.write("(");
                if *distinct {
                    self.write("DISTINCT ");
                }
                match arg {
                    Some(arg) => self.write_value(arg)?,
                    None => self.write("*"),
                }
                self.write(")");
            }
            SqlExpr::RowNumber { order_by } => {
                self.write("ROW_NUMBER() OVER (");
                if !order_by.is_empty() {
                    self.write("ORDER BY ");
                    self.write_orderings(order_by)?;
                }
                self.write(")");
            }
            other => {
                return Err(Error::unsupported(format!(
                    "client-side expression cannot be rendered as SQL: {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn write_binary(&mut self, op: BinaryOp, left: &SqlExpr, right: &SqlExpr) -> Result<()> {
        if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) {
            let operand = match (left, right) {
                (e, SqlExpr::Literal(Value::Null)) | (SqlExpr::Literal(Value::Null), e) => Some(e),
                _ => None,
            };
            if let Some(e) = operand {
                self.write("(");
                self.write_value(e)?;
                self.write(if op == BinaryOp::Equal {
                    " IS NULL)"
                } else {
                    " IS NOT NULL)"
                });
                return Ok(());
            }
        }
        let symbol = match op {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "<>",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        };
        self.write("(");
        if op.is_logical() {
            self.write_predicate(left)?;
            self.write(&format!(" {} ", symbol));
            self.write_predicate(right)?;
        } else {
            self.write_value(left)?;
            self.write(&format!(" {} ", symbol));
            self.write_value(right)?;
        }
        self.write(")");
        Ok(())
    }

    fn write_function(&mut self, function: ScalarFunction, args: &[SqlExpr]) -> Result<()> {
        let arg = |i: usize| {
            args.get(i).ok_or_else(|| {
                Error::unsupported(format!("{:?} expects at least {} arguments", function, i + 1))
            })
        };
        match function {
            ScalarFunction::Concat => {
                self.write("(");
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        self.write(" || ");
                    }
                    self.write_value(a)?;
                }
                self.write(")");
            }
            ScalarFunction::StartsWith | ScalarFunction::EndsWith | ScalarFunction::Contains => {
                let (subject, pattern) = (arg(0)?, arg(1)?);
                self.write("(");
                self.write_value(subject)?;
                self.write(" LIKE ");
                if function != ScalarFunction::StartsWith {
                    self.write("'%' || ");
                }
                self.write_value(pattern)?;
                if function != ScalarFunction::EndsWith {
                    self.write(" || '%'");
                }
                self.write(")");
            }
            _ => {
                let name = match function {
                    ScalarFunction::Upper => "UPPER",
                    ScalarFunction::Lower => "LOWER",
                    ScalarFunction::Length => "LENGTH",
                    ScalarFunction::Trim => "TRIM",
                    ScalarFunction::Substring => "SUBSTR",
                    ScalarFunction::Abs => "ABS",
                    ScalarFunction::Round => "ROUND",
                    _ => "COALESCE",
                };
                self.write(name);
                self.write("(");
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.write_value(a)?;
                }
                self.write(")");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AliasGenerator, ColumnDecl, Join, Table};
    use crate::language::StandardLanguage;
    use pretty_assertions::assert_eq;

    fn table(alias: TableAlias, name: &str) -> Source {
        Source::Table(Table {
            alias,
            entity: name.into(),
            name: name.into(),
        })
    }

    #[test]
    fn test_simple_select() {
        let mut aliases = AliasGenerator::new();
        let t = aliases.next_alias();
        let select = Select::new(
            aliases.next_alias(),
            vec![
                ColumnDecl::new("CustomerID", SqlExpr::column(t, "CustomerID", None)),
                ColumnDecl::new("Town", SqlExpr::column(t, "City", None)),
            ],
            Some(table(t, "Customers")),
        )
        .with_where(Some(SqlExpr::equal(
            SqlExpr::column(t, "City", None),
            SqlExpr::NamedValue {
                name: "p0".into(),
                value: Box::new(SqlExpr::Literal("London".into())),
                db_type: None,
            },
        )));

        let sql = SqlFormatter::format(&StandardLanguage, &select).unwrap();
        assert_eq!(
            sql,
            "SELECT t0.CustomerID, t0.City AS Town\nFROM Customers AS t0\nWHERE (t0.City = @p0)"
        );
    }

    #[test]
    fn test_join_and_nested_select() {
        let mut aliases = AliasGenerator::new();
        let o = aliases.next_alias();
        let c = aliases.next_alias();
        let inner = aliases.next_alias();
        let outer = aliases.next_alias();
        let join = Source::Join(Box::new(Join {
            kind: JoinKind::SingletonOuter,
            left: table(o, "Orders"),
            right: table(c, "Customers"),
            condition: Some(SqlExpr::equal(
                SqlExpr::column(c, "CustomerID", None),
                SqlExpr::column(o, "CustomerID", None),
            )),
        }));
        let mut nested = Select::new(
            inner,
            vec![ColumnDecl::new("City", SqlExpr::column(c, "City", None))],
            Some(join),
        );
        nested.distinct = true;
        let select = Select::new(
            outer,
            vec![ColumnDecl::new("City", SqlExpr::column(inner, "City", None))],
            Some(Source::Select(Box::new(nested))),
        );

        let sql = SqlFormatter::format(&StandardLanguage, &select).unwrap();
        let expected = "SELECT t2.City\n\
                        FROM (\n  \
                        SELECT DISTINCT t1.City\n  \
                        FROM Orders AS t0\n  \
                        LEFT OUTER JOIN Customers AS t1\n    \
                        ON (t1.CustomerID = t0.CustomerID)\n\
                        ) AS t2";
        assert_eq!(sql, expected);
    }

    #[test]
    fn test_predicates_in_value_position() {
        let mut aliases = AliasGenerator::new();
        let t = aliases.next_alias();
        let select = Select::new(
            aliases.next_alias(),
            vec![ColumnDecl::new(
                "c",
                SqlExpr::Function {
                    function: ScalarFunction::StartsWith,
                    args: vec![
                        SqlExpr::column(t, "ContactName", None),
                        SqlExpr::Literal("M".into()),
                    ],
                },
            )],
            Some(table(t, "Customers")),
        );
        let sql = SqlFormatter::format(&StandardLanguage, &select).unwrap();
        assert_eq!(
            sql,
            "SELECT CASE WHEN (t0.ContactName LIKE 'M' || '%') THEN 1 ELSE 0 END AS c\nFROM Customers AS t0"
        );
    }

    #[test]
    fn test_write_commands() {
        let mut aliases = AliasGenerator::new();
        let t = aliases.next_alias();
        let table = Table {
            alias: t,
            entity: "Customer".into(),
            name: "Customers".into(),
        };
        let param = |n: &str| SqlExpr::NamedValue {
            name: n.into(),
            value: Box::new(SqlExpr::Literal(Value::Null)),
            db_type: None,
        };
        let update = WriteCommand::Update {
            table: table.clone(),
            assignments: vec![("City".into(), param("p0"))],
            where_clause: Some(SqlExpr::equal(SqlExpr::column(t, "CustomerID", None), param("p1"))),
        };
        assert_eq!(
            SqlFormatter::format_write(&StandardLanguage, &update).unwrap(),
            "UPDATE Customers\nSET City = @p0\nWHERE (CustomerID = @p1)"
        );

        let insert = WriteCommand::Insert {
            table,
            values: vec![("CustomerID".into(), param("p0")), ("City".into(), param("p1"))],
        };
        assert_eq!(
            SqlFormatter::format_write(&StandardLanguage, &insert).unwrap(),
            "INSERT INTO Customers(CustomerID, City)\nVALUES (@p0, @p1)"
        );
    }

    #[test]
    fn test_client_nodes_are_rejected() {
        let mut aliases = AliasGenerator::new();
        let select = Select::new(
            aliases.next_alias(),
            vec![ColumnDecl::new("x", SqlExpr::New { fields: vec![] })],
            None,
        );
        assert!(SqlFormatter::format(&StandardLanguage, &select).is_err());
    }
}
