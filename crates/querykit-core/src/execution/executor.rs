//! Runs execution plans against a driver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use querykit_proto::{QueryCommand, Value};
use tracing::{debug, trace};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::expr::{eval, Bindings};
use crate::ir::Aggregator;
use crate::language::Linguist;
use crate::provider::driver::{read_row, Driver};

use super::builder::{key_variable, ExecutionBuilder};
use super::object::{Deferred, Grouping, Object, Record};
use super::plan::{Argument, ClientJoinPlan, QueryPlan, Reader};
use super::QueryState;

type Row = Vec<Value>;

/// Client-joined collections of one result set, by join and parent key.
#[derive(Default)]
struct JoinedRows {
    groups: HashMap<usize, HashMap<Row, Vec<Object>>>,
}

impl JoinedRows {
    fn key(join: &Arc<ClientJoinPlan>) -> usize {
        Arc::as_ptr(join) as usize
    }

    fn insert(&mut self, join: &Arc<ClientJoinPlan>, groups: HashMap<Row, Vec<Object>>) {
        self.groups.insert(Self::key(join), groups);
    }

    fn get(&self, join: &Arc<ClientJoinPlan>, key: &Row) -> Vec<Object> {
        self.groups
            .get(&Self::key(join))
            .and_then(|g| g.get(key))
            .cloned()
            .unwrap_or_default()
    }
}

/// Collapse the objects of a projection by its aggregator.
pub fn aggregate(aggregator: Option<Aggregator>, objects: Vec<Object>) -> Result<Object> {
    let count = objects.len();
    let mut objects = objects.into_iter();
    match aggregator {
        None => Ok(Object::List(objects.collect())),
        Some(Aggregator::Scalar) | Some(Aggregator::FirstOrDefault) => {
            Ok(objects.next().unwrap_or_else(Object::null))
        }
        Some(Aggregator::First) => objects
            .next()
            .ok_or_else(|| Error::evaluation("sequence contains no elements")),
        Some(Aggregator::Single) | Some(Aggregator::SingleOrDefault) if count > 1 => {
            Err(Error::evaluation("sequence contains more than one element"))
        }
        Some(Aggregator::Single) => objects
            .next()
            .ok_or_else(|| Error::evaluation("sequence contains no elements")),
        Some(Aggregator::SingleOrDefault) => Ok(objects.next().unwrap_or_else(Object::null)),
    }
}

/// Runs the commands of a plan and builds its objects.
pub struct Executor<'e, 'a> {
    driver: &'e dyn Driver,
    linguist: &'e Linguist<'a>,
    log_commands: bool,
    batch_size: usize,
    prepared: Option<&'e DashMap<QueryCommand, u64>>,
}

impl<'e, 'a> Executor<'e, 'a> {
    pub fn new(driver: &'e dyn Driver, linguist: &'e Linguist<'a>, config: &ProviderConfig) -> Self {
        Self {
            driver,
            linguist,
            log_commands: config.log_commands,
            batch_size: config.client_join_batch_size.max(1),
            prepared: None,
        }
    }

    /// Prepare every distinct command once, recording it in `prepared`.
    pub fn with_prepared(mut self, prepared: &'e DashMap<QueryCommand, u64>) -> Self {
        self.prepared = Some(prepared);
        self
    }

    /// Run a plan with the given variable values.
    pub fn execute(&self, plan: &QueryPlan, bindings: &Bindings) -> Result<Object> {
        trace!(state = %QueryState::Executing, "running plan");
        let objects = self.run(plan, bindings, None)?;
        aggregate(plan.aggregator, objects)
    }

    /// Load a deferred relationship.
    pub fn load(&self, deferred: &Deferred) -> Result<Object> {
        let objects = self.run(&deferred.plan, &deferred.bindings, Some(&deferred.row))?;
        aggregate(deferred.plan.aggregator, objects)
    }

    /// Run a write command, returning the number of affected rows.
    pub fn execute_write(&self, command: &QueryCommand, arguments: &[Argument], bindings: &Bindings) -> Result<u64> {
        let values = self.argument_values(arguments, bindings, None)?;
        self.before(command, &values)?;
        self.driver.execute_non_query(command, &values)
    }

    /// Run an unparameterized query, returning its raw rows.
    pub fn query_rows(&self, text: &str) -> Result<Vec<Row>> {
        let command = QueryCommand::new(text, Vec::new());
        self.before(&command, &[])?;
        self.rows(&command, &[])
    }

    fn run(&self, plan: &QueryPlan, bindings: &Bindings, outer: Option<&[Value]>) -> Result<Vec<Object>> {
        let values = self.argument_values(&plan.arguments, bindings, outer)?;
        self.before(&plan.command, &values)?;
        if plan.streaming {
            let joined = JoinedRows::default();
            let mut objects = Vec::new();
            self.driver.with_reader(&plan.command, &values, &mut |cursor| {
                while cursor.read()? {
                    let row = read_row(&*cursor)?;
                    objects.push(self.build(&plan.reader, &row, bindings, &joined)?);
                }
                Ok(())
            })?;
            trace!(state = %QueryState::Streaming, objects = objects.len(), "rows read");
            Ok(objects)
        } else {
            let rows = self.rows(&plan.command, &values)?;
            trace!(state = %QueryState::Materialized, rows = rows.len(), "rows read");
            self.materialize(&plan.reader, &rows, bindings)
        }
    }

    fn before(&self, command: &QueryCommand, values: &[Value]) -> Result<()> {
        if let Some(prepared) = self.prepared {
            if !prepared.contains_key(command) {
                self.driver.prepare(command)?;
            }
            *prepared.entry(command.clone()).or_insert(0) += 1;
        }
        if self.log_commands {
            debug!(command = %command.log_text(values), "executing command");
        }
        Ok(())
    }

    fn rows(&self, command: &QueryCommand, values: &[Value]) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        self.driver.with_reader(command, values, &mut |cursor| {
            while cursor.read()? {
                rows.push(read_row(&*cursor)?);
            }
            Ok(())
        })?;
        Ok(rows)
    }

    fn argument_values(&self, arguments: &[Argument], bindings: &Bindings, outer: Option<&[Value]>) -> Result<Vec<Value>> {
        arguments
            .iter()
            .map(|argument| match argument {
                Argument::Constant(v) => Ok(v.clone()),
                Argument::Variable(name) => variable(bindings, name),
                Argument::Outer(reader) => {
                    let row = outer.ok_or_else(|| Error::evaluation("correlated command run without its outer row"))?;
                    self.scalar(reader, row, bindings)
                }
            })
            .collect()
    }

    /// Build the objects of fully read rows, loading client joins first.
    fn materialize(&self, reader: &Reader, rows: &[Row], bindings: &Bindings) -> Result<Vec<Object>> {
        let mut joined = JoinedRows::default();
        for join in reader.client_joins() {
            let groups = self.client_join(join, rows, bindings)?;
            joined.insert(join, groups);
        }
        rows.iter()
            .map(|row| self.build(reader, row, bindings, &joined))
            .collect()
    }

    fn client_join(&self, join: &ClientJoinPlan, parents: &[Row], bindings: &Bindings) -> Result<HashMap<Row, Vec<Object>>> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for row in parents {
            let key = self.key(&join.outer_key, row, bindings)?;
            // Null keys never compare equal on the server.
            if key.iter().any(Value::is_null) {
                continue;
            }
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        let builder = ExecutionBuilder::new(self.linguist);
        let mut groups: HashMap<Row, Vec<Object>> = HashMap::new();
        for batch in keys.chunks(self.batch_size) {
            let (command, arguments) = builder.batch_command(join, batch.len())?;
            let mut keyed = bindings.clone();
            for (row, key) in batch.iter().enumerate() {
                for (index, value) in key.iter().enumerate() {
                    keyed.insert(key_variable(row, index), value.clone());
                }
            }
            let values = self.argument_values(&arguments, &keyed, None)?;
            self.before(&command, &values)?;
            let rows = self.rows(&command, &values)?;
            debug!(keys = batch.len(), rows = rows.len(), "client join batch loaded");

            let objects = self.materialize(&join.reader, &rows, bindings)?;
            for (row, object) in rows.iter().zip(objects) {
                let key = self.key(&join.inner_key, row, bindings)?;
                groups.entry(key).or_default().push(object);
            }
        }
        Ok(groups)
    }

    fn key(&self, readers: &[Reader], row: &[Value], bindings: &Bindings) -> Result<Row> {
        readers.iter().map(|r| self.scalar(r, row, bindings)).collect()
    }

    fn build(&self, reader: &Reader, row: &[Value], bindings: &Bindings, joined: &JoinedRows) -> Result<Object> {
        match reader {
            Reader::Record { entity, fields } => {
                let fields = fields
                    .iter()
                    .map(|(name, r)| Ok((name.clone(), self.build(r, row, bindings, joined)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Object::Record(Record::from_fields(entity.clone(), fields)))
            }
            Reader::OuterJoined { test, reader } => {
                if self.scalar(test, row, bindings)?.is_null() {
                    Ok(Object::null())
                } else {
                    self.build(reader, row, bindings, joined)
                }
            }
            Reader::Grouping { key, elements } => {
                let key = self.build(key, row, bindings, joined)?;
                let elements = match self.build(elements, row, bindings, joined)? {
                    Object::List(items) => items,
                    other => vec![other],
                };
                Ok(Object::Grouping(Grouping {
                    key: Box::new(key),
                    elements,
                }))
            }
            Reader::Nested(plan) => {
                let objects = self.run(plan, bindings, Some(row))?;
                aggregate(plan.aggregator, objects)
            }
            Reader::ClientJoin(join) => {
                let key = self.key(&join.outer_key, row, bindings)?;
                aggregate(join.aggregator, joined.get(join, &key))
            }
            Reader::Deferred(plan) => Ok(Object::Deferred(Deferred::new(
                Arc::clone(plan),
                row.to_vec(),
                bindings.clone(),
            ))),
            scalar => Ok(Object::Value(self.scalar(scalar, row, bindings)?)),
        }
    }

    fn scalar(&self, reader: &Reader, row: &[Value], bindings: &Bindings) -> Result<Value> {
        match reader {
            Reader::Field { index, db_type } => {
                let value = row
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| Error::Materialize(format!("row has no field {}", index)))?;
                match db_type {
                    Some(ty) => Ok(self.linguist.language().type_system().convert(value, ty)?),
                    None => Ok(value),
                }
            }
            Reader::Constant(v) => Ok(v.clone()),
            Reader::Variable(name) => variable(bindings, name),
            Reader::Binary(op, left, right) => {
                let left = self.scalar(left, row, bindings)?;
                let right = self.scalar(right, row, bindings)?;
                eval::binary(*op, &left, &right)
            }
            Reader::Unary(op, operand) => eval::unary(*op, &self.scalar(operand, row, bindings)?),
            Reader::Call(function, args) => {
                let args = self.key(args, row, bindings)?;
                eval::call(*function, &args)
            }
            Reader::Case(test, if_true, if_false) => {
                if eval::truthy(&self.scalar(test, row, bindings)?)? {
                    self.scalar(if_true, row, bindings)
                } else {
                    self.scalar(if_false, row, bindings)
                }
            }
            Reader::IsNull(operand) => Ok(Value::Bool(self.scalar(operand, row, bindings)?.is_null())),
            Reader::OuterJoined { test, reader } => {
                if self.scalar(test, row, bindings)?.is_null() {
                    Ok(Value::Null)
                } else {
                    self.scalar(reader, row, bindings)
                }
            }
            other => Err(Error::Materialize(format!(
                "expected a scalar reader, found {:?}",
                other
            ))),
        }
    }
}

fn variable(bindings: &Bindings, name: &str) -> Result<Value> {
    bindings
        .get(name)
        .cloned()
        .ok_or_else(|| Error::evaluation(format!("unbound variable '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(items: &[i32]) -> Vec<Object> {
        items.iter().map(|i| Object::Value(Value::Int32(*i))).collect()
    }

    #[test]
    fn test_aggregate_sequences() {
        assert_eq!(aggregate(None, values(&[1, 2])).unwrap(), Object::List(values(&[1, 2])));
        assert_eq!(aggregate(Some(Aggregator::First), values(&[1, 2])).unwrap(), values(&[1])[0]);
        assert!(aggregate(Some(Aggregator::First), Vec::new()).is_err());
        assert!(aggregate(Some(Aggregator::FirstOrDefault), Vec::new()).unwrap().is_null());
        assert!(aggregate(Some(Aggregator::Scalar), Vec::new()).unwrap().is_null());
    }

    #[test]
    fn test_aggregate_single() {
        assert_eq!(aggregate(Some(Aggregator::Single), values(&[3])).unwrap(), values(&[3])[0]);
        assert!(aggregate(Some(Aggregator::Single), Vec::new()).is_err());
        assert!(aggregate(Some(Aggregator::Single), values(&[1, 2])).is_err());
        assert!(aggregate(Some(Aggregator::SingleOrDefault), Vec::new()).unwrap().is_null());
        assert!(aggregate(Some(Aggregator::SingleOrDefault), values(&[1, 2])).is_err());
    }
}
