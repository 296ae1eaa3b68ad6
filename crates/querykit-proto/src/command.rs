//! Executable SQL commands.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::DbQueryType;
use crate::value::Value;

/// A named, typed command parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub db_type: DbQueryType,
}

impl QueryParameter {
    pub fn new(name: impl Into<String>, db_type: DbQueryType) -> Self {
        Self {
            name: name.into(),
            db_type,
        }
    }
}

/// SQL text plus its ordered parameter declarations.
///
/// Commands carry no values, so two executions of the same query shape share
/// one command and one prepared statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryCommand {
    pub text: String,
    pub parameters: Vec<QueryParameter>,
}

impl QueryCommand {
    pub fn new(text: impl Into<String>, parameters: Vec<QueryParameter>) -> Self {
        Self {
            text: text.into(),
            parameters,
        }
    }

    /// Render the command followed by one `-- name = [value]` line per binding.
    pub fn log_text(&self, values: &[Value]) -> String {
        let mut out = self.text.clone();
        for (param, value) in self.parameters.iter().zip(values) {
            out.push('\n');
            if value.is_null() {
                out.push_str(&format!("-- {} = NULL", param.name));
            } else {
                out.push_str(&format!("-- {} = [{}]", param.name, value));
            }
        }
        out
    }
}

impl fmt::Display for QueryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SqlType;
    use std::collections::HashMap;

    #[test]
    fn test_log_text() {
        let command = QueryCommand::new(
            "SELECT t0.City FROM Customers AS t0 WHERE (t0.City = @p0) AND (t0.Region = @p1)",
            vec![
                QueryParameter::new("p0", DbQueryType::new(SqlType::NVarChar).with_length(15)),
                QueryParameter::new("p1", DbQueryType::new(SqlType::NVarChar).with_length(15)),
            ],
        );
        let log = command.log_text(&[Value::from("London"), Value::Null]);
        assert!(log.ends_with("-- p0 = [London]\n-- p1 = NULL"));
    }

    #[test]
    fn test_commands_key_by_shape() {
        let ty = DbQueryType::new(SqlType::Int);
        let a = QueryCommand::new("SELECT 1", vec![QueryParameter::new("p0", ty)]);
        let b = QueryCommand::new("SELECT 1", vec![QueryParameter::new("p0", ty)]);

        let mut cache = HashMap::new();
        cache.insert(a, 1);
        assert_eq!(cache.get(&b), Some(&1));
    }
}
