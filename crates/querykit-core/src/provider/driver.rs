//! Database driver abstraction.

use querykit_proto::{QueryCommand, Value};

use crate::error::Result;

/// Forward-only cursor over the rows of one command.
pub trait RowCursor {
    /// Advance to the next row, returning false past the last one.
    fn read(&mut self) -> Result<bool>;

    fn field_count(&self) -> usize;

    /// Value of a field of the current row.
    fn get(&self, ordinal: usize) -> Result<Value>;
}

/// A connection to a store that runs rendered commands.
///
/// Argument values are passed in `command.parameters` order.
pub trait Driver: Send + Sync {
    fn open(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Called once per provider the first time a command is run.
    fn prepare(&self, _command: &QueryCommand) -> Result<()> {
        Ok(())
    }

    /// Run a query and hand its rows to `read`.
    ///
    /// No other command may run on the connection until `read` returns.
    fn with_reader(
        &self,
        command: &QueryCommand,
        arguments: &[Value],
        read: &mut dyn FnMut(&mut dyn RowCursor) -> Result<()>,
    ) -> Result<()>;

    /// Run a command, returning the number of affected rows.
    fn execute_non_query(&self, command: &QueryCommand, arguments: &[Value]) -> Result<u64>;

    /// Run raw statement text without parameters.
    fn execute_script(&self, text: &str) -> Result<u64>;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn in_transaction(&self) -> bool;
}

/// Read the current row of a cursor.
pub fn read_row(cursor: &dyn RowCursor) -> Result<Vec<Value>> {
    (0..cursor.field_count()).map(|i| cursor.get(i)).collect()
}
