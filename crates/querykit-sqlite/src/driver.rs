//! SQLite driver over rusqlite.

use parking_lot::Mutex;
use querykit_core::{Driver, Error, QueryCommand, Result, RowCursor, Value};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{CachedStatement, Connection};
use tracing::{debug, trace};

use crate::config::SqliteConfig;

/// Runs commands on one SQLite connection.
///
/// Statements are prepared through the connection's statement cache and
/// parameters are bound by name. An in-memory database keeps its connection
/// across close and reopen, since closing it would discard the data.
pub struct SqliteDriver {
    config: SqliteConfig,
    state: Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<Connection>,
    open: bool,
}

impl SqliteDriver {
    pub fn new(config: SqliteConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    /// A driver over a private in-memory database.
    pub fn in_memory() -> Self {
        Self::new(SqliteConfig::in_memory())
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    fn connect(&self) -> Result<Connection> {
        let connection = match &self.config.path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(Error::driver)?;
        connection
            .busy_timeout(self.config.busy_timeout())
            .map_err(Error::driver)?;
        connection.set_prepared_statement_cache_capacity(self.config.statement_cache_capacity);
        Ok(connection)
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        match (&state.connection, state.open) {
            (Some(connection), true) => f(connection),
            _ => Err(Error::driver(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "sqlite connection is not open",
            ))),
        }
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Int32(i) => SqlValue::Integer(*i as i64),
        Value::Int64(i) => SqlValue::Integer(*i),
        Value::Float64(f) => SqlValue::Real(*f),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(bytes) => Value::String(
            std::str::from_utf8(bytes)
                .map_err(|e| Error::driver(rusqlite::Error::Utf8Error(e)))?
                .to_string(),
        ),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    })
}

/// Bind arguments to the command's named parameters.
fn bind(
    statement: &mut CachedStatement<'_>,
    prefix: &str,
    command: &QueryCommand,
    arguments: &[Value],
) -> Result<()> {
    if command.parameters.len() != arguments.len() {
        return Err(Error::evaluation(format!(
            "command declares {} parameters, {} values given",
            command.parameters.len(),
            arguments.len()
        )));
    }
    for (parameter, value) in command.parameters.iter().zip(arguments) {
        let name = format!("{}{}", prefix, parameter.name);
        let index = statement
            .parameter_index(&name)
            .map_err(Error::driver)?
            .ok_or_else(|| Error::evaluation(format!("command has no parameter '{}'", name)))?;
        statement
            .raw_bind_parameter(index, to_sql(value))
            .map_err(Error::driver)?;
    }
    Ok(())
}

struct SqliteCursor<'s> {
    rows: rusqlite::Rows<'s>,
    columns: usize,
    current: Vec<Value>,
}

impl RowCursor for SqliteCursor<'_> {
    fn read(&mut self) -> Result<bool> {
        match self.rows.next().map_err(Error::driver)? {
            Some(row) => {
                self.current = (0..self.columns)
                    .map(|i| from_sql(row.get_ref(i).map_err(Error::driver)?))
                    .collect::<Result<_>>()?;
                Ok(true)
            }
            None => {
                self.current.clear();
                Ok(false)
            }
        }
    }

    fn field_count(&self) -> usize {
        self.columns
    }

    fn get(&self, ordinal: usize) -> Result<Value> {
        self.current
            .get(ordinal)
            .cloned()
            .ok_or_else(|| Error::Materialize(format!("row has no field {}", ordinal)))
    }
}

/// Parameter marker SQLite sees; the language renders `@name`.
const PARAMETER_PREFIX: &str = "@";

impl Driver for SqliteDriver {
    fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.connection.is_none() {
            state.connection = Some(self.connect()?);
            debug!(path = ?self.config.path, "sqlite connection opened");
        }
        state.open = true;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.open = false;
        if self.config.is_in_memory() {
            return Ok(());
        }
        if let Some(connection) = state.connection.take() {
            connection.close().map_err(|(_, e)| Error::driver(e))?;
            debug!(path = ?self.config.path, "sqlite connection closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn prepare(&self, command: &QueryCommand) -> Result<()> {
        self.with_connection(|connection| {
            connection.prepare_cached(&command.text).map_err(Error::driver)?;
            trace!(command = %command.text, "statement prepared");
            Ok(())
        })
    }

    fn with_reader(
        &self,
        command: &QueryCommand,
        arguments: &[Value],
        read: &mut dyn FnMut(&mut dyn RowCursor) -> Result<()>,
    ) -> Result<()> {
        self.with_connection(|connection| {
            let mut statement = connection.prepare_cached(&command.text).map_err(Error::driver)?;
            bind(&mut statement, PARAMETER_PREFIX, command, arguments)?;
            let columns = statement.column_count();
            let mut cursor = SqliteCursor {
                rows: statement.raw_query(),
                columns,
                current: Vec::new(),
            };
            read(&mut cursor)
        })
    }

    fn execute_non_query(&self, command: &QueryCommand, arguments: &[Value]) -> Result<u64> {
        self.with_connection(|connection| {
            let mut statement = connection.prepare_cached(&command.text).map_err(Error::driver)?;
            bind(&mut statement, PARAMETER_PREFIX, command, arguments)?;
            let affected = statement.raw_execute().map_err(Error::driver)?;
            Ok(affected as u64)
        })
    }

    fn execute_script(&self, text: &str) -> Result<u64> {
        self.with_connection(|connection| {
            connection.execute_batch(text).map_err(Error::driver)?;
            Ok(connection.changes() as u64)
        })
    }

    fn begin(&self) -> Result<()> {
        self.with_connection(|connection| connection.execute_batch("BEGIN").map_err(Error::driver))
    }

    fn commit(&self) -> Result<()> {
        self.with_connection(|connection| connection.execute_batch("COMMIT").map_err(Error::driver))
    }

    fn rollback(&self) -> Result<()> {
        self.with_connection(|connection| {
            connection.execute_batch("ROLLBACK").map_err(Error::driver)
        })
    }

    fn in_transaction(&self) -> bool {
        let state = self.state.lock();
        match (&state.connection, state.open) {
            (Some(connection), true) => !connection.is_autocommit(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querykit_core::{DbQueryType, QueryParameter, SqlType};

    fn driver() -> SqliteDriver {
        let driver = SqliteDriver::in_memory();
        driver.open().unwrap();
        driver
            .execute_script("CREATE TABLE Items (Id INTEGER PRIMARY KEY, Name TEXT, Price FLOAT)")
            .unwrap();
        driver
    }

    fn read_all(driver: &SqliteDriver, command: &QueryCommand, arguments: &[Value]) -> Vec<Vec<Value>> {
        let mut rows = Vec::new();
        driver
            .with_reader(command, arguments, &mut |cursor| {
                while cursor.read()? {
                    rows.push(querykit_core::provider::driver::read_row(&*cursor)?);
                }
                Ok(())
            })
            .unwrap();
        rows
    }

    #[test]
    fn test_named_parameters_round_trip() {
        let driver = driver();
        let insert = QueryCommand::new(
            "INSERT INTO Items(Name, Price) VALUES (@p0, @p1)",
            vec![
                QueryParameter::new("p0", DbQueryType::new(SqlType::NVarChar)),
                QueryParameter::new("p1", DbQueryType::new(SqlType::Float)),
            ],
        );
        let affected = driver
            .execute_non_query(&insert, &[Value::from("tea"), Value::Float64(2.5)])
            .unwrap();
        assert_eq!(affected, 1);

        let select = QueryCommand::new(
            "SELECT Id, Name, Price FROM Items WHERE Name = @p0",
            vec![QueryParameter::new("p0", DbQueryType::new(SqlType::NVarChar))],
        );
        let rows = read_all(&driver, &select, &[Value::from("tea")]);
        assert_eq!(
            rows,
            vec![vec![Value::Int64(1), Value::from("tea"), Value::Float64(2.5)]]
        );
    }

    #[test]
    fn test_argument_count_mismatch() {
        let driver = driver();
        let select = QueryCommand::new(
            "SELECT Id FROM Items WHERE Name = @p0",
            vec![QueryParameter::new("p0", DbQueryType::new(SqlType::NVarChar))],
        );
        assert!(driver.execute_non_query(&select, &[]).is_err());
    }

    #[test]
    fn test_transactions() {
        let driver = driver();
        driver.begin().unwrap();
        assert!(driver.in_transaction());
        driver.execute_script("INSERT INTO Items(Name) VALUES ('x')").unwrap();
        driver.rollback().unwrap();
        assert!(!driver.in_transaction());

        let count = QueryCommand::new("SELECT COUNT(*) FROM Items", Vec::new());
        assert_eq!(read_all(&driver, &count, &[]), vec![vec![Value::Int64(0)]]);
    }

    #[test]
    fn test_in_memory_survives_close() {
        let driver = driver();
        driver.execute_script("INSERT INTO Items(Name) VALUES ('kept')").unwrap();
        driver.close().unwrap();
        assert!(!driver.is_open());
        assert!(driver.execute_script("SELECT 1").is_err());

        driver.open().unwrap();
        let count = QueryCommand::new("SELECT COUNT(*) FROM Items", Vec::new());
        assert_eq!(read_all(&driver, &count, &[]), vec![vec![Value::Int64(1)]]);
    }
}
