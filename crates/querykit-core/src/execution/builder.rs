//! Compiles translated projections into execution plans.

use std::sync::Arc;

use querykit_proto::{QueryCommand, QueryParameter, ValueKind};
use tracing::trace;

use crate::error::{Error, Result};
use crate::expr::BinaryOp;
use crate::ir::gather;
use crate::ir::visit::{self, Visit};
use crate::ir::{ClientJoin, InValues, Projection, Select, SqlExpr, WriteCommand};
use crate::language::Linguist;

use super::plan::{Argument, ClientJoinPlan, QueryPlan, Reader};

/// Name of the variable carrying key `index` of parent `row` in a batched
/// client-join command.
pub(crate) fn key_variable(row: usize, index: usize) -> String {
    format!("__k{}_{}", row, index)
}

/// `select` restricted to rows matching one of `rows` parent keys, supplied
/// through [`key_variable`]s.
pub(crate) fn keyed_select(select: &Select, key_exprs: &[SqlExpr], rows: usize) -> Select {
    let variable = |row: usize, index: usize, key: &SqlExpr| SqlExpr::Variable {
        name: key_variable(row, index),
        db_type: key.db_type(),
    };
    let filter = match key_exprs {
        [key] => Some(SqlExpr::In {
            expr: Box::new(key.clone()),
            values: InValues::List((0..rows).map(|row| variable(row, 0, key)).collect()),
        }),
        keys => (0..rows).fold(None, |filter, row| {
            let matched = keys.iter().enumerate().fold(None, |acc, (index, key)| {
                SqlExpr::and_also(acc, Some(SqlExpr::equal(key.clone(), variable(row, index, key))))
            });
            match (filter, matched) {
                (Some(f), Some(m)) => Some(SqlExpr::binary(BinaryOp::Or, f, m)),
                (f, m) => f.or(m),
            }
        }),
    };
    let mut keyed = select.clone();
    keyed.where_clause = SqlExpr::and_also(keyed.where_clause.take(), filter);
    keyed
}

/// Named values of a parameterized command, in parameter order.
#[derive(Default)]
struct NamedValues {
    values: Vec<(String, SqlExpr, Option<querykit_proto::DbQueryType>)>,
}

impl NamedValues {
    fn of_select(select: &Select) -> Self {
        let mut this = Self::default();
        this.visit_select(select);
        this.sort();
        this
    }

    fn of_write(command: &WriteCommand) -> Self {
        let mut this = Self::default();
        match command {
            WriteCommand::Insert { values, .. } => values.iter().for_each(|(_, e)| this.visit_expr(e)),
            WriteCommand::Update {
                assignments,
                where_clause,
                ..
            } => {
                assignments.iter().for_each(|(_, e)| this.visit_expr(e));
                where_clause.iter().for_each(|e| this.visit_expr(e));
            }
            WriteCommand::Delete { where_clause, .. } => {
                where_clause.iter().for_each(|e| this.visit_expr(e))
            }
        }
        this.sort();
        this
    }

    fn sort(&mut self) {
        self.values
            .sort_by_key(|(name, _, _)| name.trim_start_matches('p').parse::<usize>().unwrap_or(usize::MAX));
    }
}

impl Visit for NamedValues {
    fn visit_expr(&mut self, expr: &SqlExpr) {
        match expr {
            SqlExpr::NamedValue { name, value, db_type } => {
                if !self.values.iter().any(|(n, _, _)| n == name) {
                    self.values.push((name.clone(), (**value).clone(), *db_type));
                }
            }
            other => visit::walk_expr(self, other),
        }
    }
}

/// Turns projections into [`QueryPlan`]s for one language.
pub struct ExecutionBuilder<'l, 'a> {
    linguist: &'l Linguist<'a>,
}

impl<'l, 'a> ExecutionBuilder<'l, 'a> {
    pub fn new(linguist: &'l Linguist<'a>) -> Self {
        Self { linguist }
    }

    /// Compile a translated projection.
    pub fn build(&self, projection: &Projection) -> Result<QueryPlan> {
        let plan = self.plan(projection.clone(), None)?;
        trace!(commands = plan.commands().len(), streaming = plan.streaming, "execution plan built");
        Ok(plan)
    }

    /// Render a write command and the sources of its parameters.
    pub fn build_write(&self, command: WriteCommand) -> Result<(QueryCommand, Vec<Argument>)> {
        let (text, command) = self.linguist.format_write(command)?;
        let (parameters, arguments) = self.arguments(NamedValues::of_write(&command), None)?;
        Ok((QueryCommand::new(text, parameters), arguments))
    }

    /// Render the command loading a client-joined collection for `rows`
    /// parent keys.
    pub(crate) fn batch_command(&self, join: &ClientJoinPlan, rows: usize) -> Result<(QueryCommand, Vec<Argument>)> {
        self.keyed_command(&join.select, &join.key_exprs, rows)
    }

    fn keyed_command(
        &self,
        select: &Select,
        key_exprs: &[SqlExpr],
        rows: usize,
    ) -> Result<(QueryCommand, Vec<Argument>)> {
        let (text, keyed) = self.linguist.format(keyed_select(select, key_exprs, rows))?;
        let (parameters, arguments) = self.arguments(NamedValues::of_select(&keyed), None)?;
        Ok((QueryCommand::new(text, parameters), arguments))
    }

    fn plan(&self, projection: Projection, outer: Option<&Select>) -> Result<QueryPlan> {
        let Projection {
            select,
            projector,
            aggregator,
        } = projection;
        let (text, select) = self.linguist.format(select)?;
        let (parameters, arguments) = self.arguments(NamedValues::of_select(&select), outer)?;
        let reader = self.reader(&projector, &select)?;
        Ok(QueryPlan {
            command: QueryCommand::new(text, parameters),
            arguments,
            streaming: !reader.runs_commands(),
            reader,
            aggregator,
        })
    }

    fn arguments(
        &self,
        named: NamedValues,
        outer: Option<&Select>,
    ) -> Result<(Vec<QueryParameter>, Vec<Argument>)> {
        let types = self.linguist.language().type_system();
        let mut parameters = Vec::with_capacity(named.values.len());
        let mut arguments = Vec::with_capacity(named.values.len());
        for (name, value, db_type) in named.values {
            let argument = match value {
                SqlExpr::Literal(v) => Argument::Constant(v),
                SqlExpr::Variable { name, .. } => Argument::Variable(name),
                column @ SqlExpr::Column(_) => {
                    let outer = outer.ok_or_else(|| {
                        Error::unsupported(format!("parameter {} refers to a row outside the query", name))
                    })?;
                    Argument::Outer(self.reader(&column, outer)?)
                }
                other => {
                    return Err(Error::unsupported(format!(
                        "cannot supply parameter {} from {:?}",
                        name, other
                    )))
                }
            };
            let db_type = db_type.unwrap_or_else(|| types.column_type(ValueKind::Null));
            parameters.push(QueryParameter::new(name, db_type));
            arguments.push(argument);
        }
        Ok((parameters, arguments))
    }

    fn readers(&self, exprs: &[SqlExpr], select: &Select) -> Result<Vec<Reader>> {
        exprs.iter().map(|e| self.reader(e, select)).collect()
    }

    fn reader(&self, expr: &SqlExpr, select: &Select) -> Result<Reader> {
        let boxed = |e: &SqlExpr| self.reader(e, select).map(Box::new);
        Ok(match expr {
            SqlExpr::Column(c) => {
                let index = select
                    .columns
                    .iter()
                    .position(|d| d.name == c.name)
                    .filter(|_| c.alias == select.alias)
                    .ok_or_else(|| {
                        Error::unsupported(format!("column '{}' is not produced by the query", c.name))
                    })?;
                Reader::Field {
                    index,
                    db_type: c.db_type.or(select.columns[index].db_type),
                }
            }
            SqlExpr::Literal(v) => Reader::Constant(v.clone()),
            SqlExpr::NamedValue { value, .. } => self.reader(value, select)?,
            SqlExpr::Variable { name, .. } => Reader::Variable(name.clone()),
            SqlExpr::Binary { op, left, right } => Reader::Binary(*op, boxed(left)?, boxed(right)?),
            SqlExpr::Unary { op, operand } => Reader::Unary(*op, boxed(operand)?),
            SqlExpr::Function { function, args } => Reader::Call(*function, self.readers(args, select)?),
            SqlExpr::Case {
                test,
                if_true,
                if_false,
            } => Reader::Case(boxed(test)?, boxed(if_true)?, boxed(if_false)?),
            SqlExpr::IsNull(e) => Reader::IsNull(boxed(e)?),
            SqlExpr::Entity { entity, fields } => Reader::Record {
                entity: Some(entity.clone()),
                fields: self.fields(fields, select)?,
            },
            SqlExpr::New { fields } => Reader::Record {
                entity: None,
                fields: self.fields(fields, select)?,
            },
            SqlExpr::OuterJoined { test, expr } => Reader::OuterJoined {
                test: boxed(test)?,
                reader: boxed(expr)?,
            },
            SqlExpr::Grouping { key, elements } => Reader::Grouping {
                key: boxed(key)?,
                elements: boxed(elements)?,
            },
            SqlExpr::Projection(p) => Reader::Nested(Arc::new(self.plan((**p).clone(), Some(select))?)),
            SqlExpr::Deferred(p) => Reader::Deferred(Arc::new(self.plan((**p).clone(), Some(select))?)),
            SqlExpr::ClientJoin(join) => Reader::ClientJoin(Arc::new(self.client_join(join, select)?)),
            other => {
                return Err(Error::unsupported(format!(
                    "cannot compute {:?} on the client",
                    other
                )))
            }
        })
    }

    fn fields(&self, fields: &[(String, SqlExpr)], select: &Select) -> Result<Vec<(String, Reader)>> {
        fields
            .iter()
            .map(|(name, e)| Ok((name.clone(), self.reader(e, select)?)))
            .collect()
    }

    fn client_join(&self, join: &ClientJoin, outer: &Select) -> Result<ClientJoinPlan> {
        let select = &join.projection.select;
        let key_exprs: Vec<SqlExpr> = join
            .inner_key
            .iter()
            .map(|k| gather::inline_columns(k.clone(), select))
            .collect();
        let (command, _) = self.keyed_command(select, &key_exprs, 1)?;
        Ok(ClientJoinPlan {
            select: select.clone(),
            command,
            reader: self.reader(&join.projection.projector, select)?,
            aggregator: join.projection.aggregator,
            outer_key: self.readers(&join.outer_key, outer)?,
            inner_key: self.readers(&join.inner_key, select)?,
            key_exprs,
        })
    }
}
