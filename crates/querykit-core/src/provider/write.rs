//! Insert, update and delete of mapped entities.

use std::sync::Arc;

use querykit_proto::{DbQueryType, QueryCommand, Value};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::execution::{Argument, ExecutionBuilder, Executor, Object, QueryPlan, Record, ToRecord};
use crate::expr::{Bindings, Expr, Lambda};
use crate::ir::{AliasGenerator, SqlExpr, Table, WriteCommand};
use crate::mapping::EntityMapping;
use crate::translate::{QueryBinder, QueryTranslator};

use super::batch::BatchResults;
use super::driver::Driver;
use super::EntityProvider;

/// Prefix of the variables holding the written item's field values.
const ITEM_PREFIX: &str = "__item.";

fn item_variable(member: &str) -> String {
    format!("{}{}", ITEM_PREFIX, member)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    InsertOrUpdate,
    Delete,
}

struct Compiled {
    command: QueryCommand,
    arguments: Vec<Argument>,
}

/// Everything needed to write items of one entity, compiled once and
/// reused for every item of a batch.
struct WritePlan {
    kind: WriteKind,
    entity: String,
    members: Vec<String>,
    generated: Option<(String, DbQueryType)>,
    insert: Option<Compiled>,
    update: Option<Compiled>,
    delete: Option<Compiled>,
    exists: Option<Arc<QueryPlan>>,
    result: Option<Arc<QueryPlan>>,
}

impl WritePlan {
    fn bind(&self, item: &Record) -> Bindings {
        self.members.iter().fold(Bindings::new(), |bindings, member| {
            bindings.with(item_variable(member), item.value(member))
        })
    }
}

impl<D: Driver> EntityProvider<D> {
    /// Insert an item.
    ///
    /// Returns the result selector applied to the stored row when one is
    /// given, otherwise the number of inserted rows.
    pub fn insert<T: ToRecord + ?Sized>(&self, entity: &str, item: &T, result: Option<&Lambda>) -> Result<Object> {
        let plan = self.write_plan(WriteKind::Insert, entity, None, result)?;
        self.write_one(&plan, item.to_record())
    }

    /// Update the stored row with the item's key.
    ///
    /// With a `check` predicate the row is only updated when the stored row
    /// satisfies it. When no row is updated the result is null if a result
    /// selector was given and zero otherwise.
    pub fn update<T: ToRecord + ?Sized>(
        &self,
        entity: &str,
        item: &T,
        check: Option<&Lambda>,
        result: Option<&Lambda>,
    ) -> Result<Object> {
        let plan = self.write_plan(WriteKind::Update, entity, check, result)?;
        self.write_one(&plan, item.to_record())
    }

    /// Update the item if a row with its key exists, insert it otherwise.
    pub fn insert_or_update<T: ToRecord + ?Sized>(
        &self,
        entity: &str,
        item: &T,
        check: Option<&Lambda>,
        result: Option<&Lambda>,
    ) -> Result<Object> {
        let plan = self.write_plan(WriteKind::InsertOrUpdate, entity, check, result)?;
        self.write_one(&plan, item.to_record())
    }

    /// Delete the stored row with the item's key, returning the number of
    /// deleted rows.
    pub fn delete<T: ToRecord + ?Sized>(&self, entity: &str, item: &T, check: Option<&Lambda>) -> Result<Object> {
        let plan = self.write_plan(WriteKind::Delete, entity, check, None)?;
        self.write_one(&plan, item.to_record())
    }

    pub fn batch_insert<'p, T, I>(&'p self, entity: &str, items: I, result: Option<&Lambda>) -> Result<BatchResults<'p>>
    where
        T: ToRecord + 'p,
        I: IntoIterator<Item = T>,
        I::IntoIter: 'p,
    {
        let plan = self.write_plan(WriteKind::Insert, entity, None, result)?;
        self.write_batch(plan, items)
    }

    pub fn batch_update<'p, T, I>(
        &'p self,
        entity: &str,
        items: I,
        check: Option<&Lambda>,
        result: Option<&Lambda>,
    ) -> Result<BatchResults<'p>>
    where
        T: ToRecord + 'p,
        I: IntoIterator<Item = T>,
        I::IntoIter: 'p,
    {
        let plan = self.write_plan(WriteKind::Update, entity, check, result)?;
        self.write_batch(plan, items)
    }

    pub fn batch_insert_or_update<'p, T, I>(
        &'p self,
        entity: &str,
        items: I,
        check: Option<&Lambda>,
        result: Option<&Lambda>,
    ) -> Result<BatchResults<'p>>
    where
        T: ToRecord + 'p,
        I: IntoIterator<Item = T>,
        I::IntoIter: 'p,
    {
        let plan = self.write_plan(WriteKind::InsertOrUpdate, entity, check, result)?;
        self.write_batch(plan, items)
    }

    pub fn batch_delete<'p, T, I>(&'p self, entity: &str, items: I, check: Option<&Lambda>) -> Result<BatchResults<'p>>
    where
        T: ToRecord + 'p,
        I: IntoIterator<Item = T>,
        I::IntoIter: 'p,
    {
        let plan = self.write_plan(WriteKind::Delete, entity, check, None)?;
        self.write_batch(plan, items)
    }

    fn write_batch<'p, T, I>(&'p self, plan: WritePlan, items: I) -> Result<BatchResults<'p>>
    where
        T: ToRecord + 'p,
        I: IntoIterator<Item = T>,
        I::IntoIter: 'p,
    {
        // A connection already held open outlives the lazy results.
        if self.is_connected() || self.driver.is_open() {
            let results = items
                .into_iter()
                .map(move |item| self.write_one(&plan, item.to_record()));
            return Ok(BatchResults::streamed(results));
        }
        let results = self.do_connected(|| {
            Ok(items
                .into_iter()
                .map(|item| self.write_one(&plan, item.to_record()))
                .collect::<Vec<_>>())
        })?;
        debug!(entity = %plan.entity, items = results.len(), "batch written");
        Ok(BatchResults::eager(results))
    }

    fn write_plan(
        &self,
        kind: WriteKind,
        entity: &str,
        check: Option<&Lambda>,
        result: Option<&Lambda>,
    ) -> Result<WritePlan> {
        let mapping = self.entity(entity)?;
        let translator = self.translator();
        let builder = ExecutionBuilder::new(translator.linguist());
        let mut aliases = AliasGenerator::new();
        let table = Table {
            alias: aliases.next_alias(),
            entity: mapping.entity.clone(),
            name: mapping.table.clone(),
        };

        let needs_key = kind != WriteKind::Insert || result.is_some();
        if needs_key && !mapping.has_primary_key() {
            return Err(Error::unsupported(format!("entity '{}' has no primary key", entity)));
        }

        let compile = |command: WriteCommand| -> Result<Compiled> {
            let (command, arguments) = builder.build_write(command)?;
            trace!(command = %command.text, "write command compiled");
            Ok(Compiled { command, arguments })
        };

        let check = match check {
            Some(check) => Some(QueryBinder::new(&*self.mapping, &self.policy, &mut aliases).predicate(
                entity,
                table.alias,
                check,
            )?),
            None => None,
        };

        let inserts = matches!(kind, WriteKind::Insert | WriteKind::InsertOrUpdate);
        let updates = matches!(kind, WriteKind::Update | WriteKind::InsertOrUpdate);

        let insert = if inserts {
            Some(compile(insert_command(mapping, table.clone()))?)
        } else {
            None
        };
        let update = if updates {
            Some(compile(update_command(mapping, table.clone(), check.clone()))?)
        } else {
            None
        };
        let delete = if kind == WriteKind::Delete {
            Some(compile(WriteCommand::Delete {
                where_clause: SqlExpr::and_also(key_predicate(mapping, &table), check),
                table,
            })?)
        } else {
            None
        };

        let exists = if kind == WriteKind::InsertOrUpdate {
            let query = Expr::table(entity).any_where(key_lambda(mapping)?);
            Some(self.compile_internal(&translator, &query)?)
        } else {
            None
        };
        let result = match result {
            Some(selector) => {
                let query = Expr::table(entity)
                    .filter(key_lambda(mapping)?)
                    .select(selector.clone())
                    .single_or_default();
                Some(self.compile_internal(&translator, &query)?)
            }
            None => None,
        };

        Ok(WritePlan {
            kind,
            entity: entity.to_string(),
            members: mapping.columns.iter().map(|c| c.member.clone()).collect(),
            generated: mapping
                .columns
                .iter()
                .find(|c| c.generated)
                .map(|c| (c.member.clone(), c.db_type)),
            insert,
            update,
            delete,
            exists,
            result,
        })
    }

    fn compile_internal(&self, translator: &QueryTranslator<'_>, query: &Expr) -> Result<Arc<QueryPlan>> {
        let projection = translator.translate_evaluated(query)?;
        Ok(Arc::new(ExecutionBuilder::new(translator.linguist()).build(&projection)?))
    }

    fn write_one(&self, plan: &WritePlan, item: Record) -> Result<Object> {
        self.do_connected(|| {
            let translator = self.translator();
            let executor = self.executor(&translator);
            let mut bindings = plan.bind(&item);

            let (command, inserted) = match plan.kind {
                WriteKind::Insert => (&plan.insert, true),
                WriteKind::Update => (&plan.update, false),
                WriteKind::Delete => (&plan.delete, false),
                WriteKind::InsertOrUpdate => {
                    let exists = match &plan.exists {
                        Some(exists) => executor.execute(exists, &bindings)?,
                        None => Object::null(),
                    };
                    if exists.as_value().and_then(Value::as_bool).unwrap_or(false) {
                        (&plan.update, false)
                    } else {
                        (&plan.insert, true)
                    }
                }
            };
            let command = command
                .as_ref()
                .ok_or_else(|| Error::evaluation("write plan has no command for this write"))?;
            let affected = executor.execute_write(&command.command, &command.arguments, &bindings)?;
            trace!(entity = %plan.entity, affected, "item written");

            // The generated key only matters to the result selector.
            if inserted && affected > 0 && plan.result.is_some() {
                if let Some((member, db_type)) = &plan.generated {
                    let key = self.generated_key(&executor, db_type)?;
                    debug!(entity = %plan.entity, key = %key, "generated key read");
                    bindings.insert(item_variable(member), key);
                }
            }

            match &plan.result {
                Some(_) if affected == 0 => Ok(Object::null()),
                Some(result) => executor.execute(result, &bindings),
                None => Ok(Object::Value(Value::Int64(affected as i64))),
            }
        })
    }

    fn generated_key(&self, executor: &Executor<'_, '_>, db_type: &DbQueryType) -> Result<Value> {
        let query = self.language.generated_key_query().ok_or_else(|| {
            Error::unsupported(format!("{} cannot report generated keys", self.language.name()))
        })?;
        let value = executor
            .query_rows(query)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .ok_or_else(|| Error::evaluation("generated key query returned no rows"))?;
        Ok(self.language.type_system().convert(value, db_type)?)
    }
}

fn item_value(member: &str, db_type: DbQueryType) -> SqlExpr {
    SqlExpr::Variable {
        name: item_variable(member),
        db_type: Some(db_type),
    }
}

fn insert_command(mapping: &EntityMapping, table: Table) -> WriteCommand {
    let values = mapping
        .columns
        .iter()
        .filter(|c| !c.generated)
        .map(|c| (c.column.clone(), item_value(&c.member, c.db_type)))
        .collect();
    WriteCommand::Insert { table, values }
}

fn update_command(mapping: &EntityMapping, table: Table, check: Option<SqlExpr>) -> WriteCommand {
    let assignments = mapping
        .columns
        .iter()
        .filter(|c| !c.primary_key && !c.generated)
        .map(|c| (c.column.clone(), item_value(&c.member, c.db_type)))
        .collect();
    let where_clause = SqlExpr::and_also(key_predicate(mapping, &table), check);
    WriteCommand::Update {
        table,
        assignments,
        where_clause,
    }
}

/// Key columns of the written table equal to the item's key fields.
fn key_predicate(mapping: &EntityMapping, table: &Table) -> Option<SqlExpr> {
    mapping.primary_key().fold(None, |predicate, c| {
        let test = SqlExpr::equal(
            SqlExpr::column(table.alias, c.column.clone(), Some(c.db_type)),
            item_value(&c.member, c.db_type),
        );
        SqlExpr::and_also(predicate, Some(test))
    })
}

/// `e => e.K1 == item.K1 && ...` over the primary key members.
fn key_lambda(mapping: &EntityMapping) -> Result<Lambda> {
    let predicate = mapping
        .primary_key()
        .map(|c| Expr::param("e").member(c.member.as_str()).equals(Expr::var(item_variable(&c.member))))
        .reduce(|left, right| left.and(right))
        .ok_or_else(|| Error::unsupported(format!("entity '{}' has no primary key", mapping.entity)))?;
    Ok(Lambda::new("e", predicate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::StandardLanguage;
    use crate::mapping::QueryMapping;
    use crate::testing::northwind;

    fn order_table(mapping: &EntityMapping) -> Table {
        Table {
            alias: AliasGenerator::new().next_alias(),
            entity: mapping.entity.clone(),
            name: mapping.table.clone(),
        }
    }

    #[test]
    fn test_insert_skips_generated_columns() {
        let mapping = northwind();
        let orders = mapping.entity("Order").unwrap();
        match insert_command(orders, order_table(orders)) {
            WriteCommand::Insert { values, .. } => {
                let columns: Vec<&str> = values.iter().map(|(c, _)| c.as_str()).collect();
                assert_eq!(columns, vec!["CustomerID", "OrderDate", "Freight"]);
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_update_assigns_non_key_columns() {
        let mapping = northwind();
        let customers = mapping.entity("Customer").unwrap();
        match update_command(customers, order_table(customers), None) {
            WriteCommand::Update {
                assignments,
                where_clause,
                ..
            } => {
                assert_eq!(assignments.len(), 4);
                assert!(assignments.iter().all(|(c, _)| c != "CustomerID"));
                assert!(matches!(where_clause, Some(SqlExpr::Binary { .. })));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_key_lambda_compares_key_members() {
        let mapping = northwind();
        let lambda = key_lambda(mapping.entity("Customer").unwrap()).unwrap();
        assert_eq!(
            *lambda.body,
            Expr::param("e")
                .member("CustomerID")
                .equals(Expr::var("__item.CustomerID"))
        );
    }

    #[test]
    fn test_write_text_uses_named_parameters() {
        let mapping = northwind();
        let config = crate::config::TranslatorConfig::default();
        let policy = crate::police::EntityPolicy::new();
        let translator = QueryTranslator::new(&mapping, &policy, &StandardLanguage, &config);
        let builder = ExecutionBuilder::new(translator.linguist());
        let customers = mapping.entity("Customer").unwrap();
        let table = order_table(customers);
        let delete = WriteCommand::Delete {
            where_clause: key_predicate(customers, &table),
            table,
        };
        let (command, arguments) = builder.build_write(delete).unwrap();
        assert_eq!(command.text, "DELETE FROM Customers\nWHERE (CustomerID = @p0)");
        assert_eq!(arguments, vec![Argument::Variable("__item.CustomerID".into())]);
    }
}
