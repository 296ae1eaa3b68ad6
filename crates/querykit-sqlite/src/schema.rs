//! DDL for mapped entities.

use querykit_core::{EntityMapping, SqlType};
use querykit_proto::DbTypeSystem;

/// `CREATE TABLE IF NOT EXISTS` statement for an entity's table.
///
/// A single generated integer key becomes the table's rowid alias so
/// `last_insert_rowid()` reports it.
pub fn create_table(entity: &EntityMapping) -> String {
    let types = DbTypeSystem;
    let keys: Vec<_> = entity.primary_key().collect();
    let rowid_key = match keys.as_slice() {
        [key] if key.generated && is_integer(key.db_type.sql_type) => Some(key.column.as_str()),
        _ => None,
    };

    let mut lines: Vec<String> = entity
        .columns
        .iter()
        .map(|c| {
            if rowid_key == Some(c.column.as_str()) {
                format!("  {} INTEGER PRIMARY KEY AUTOINCREMENT", quote(&c.column))
            } else {
                let not_null = if c.db_type.not_null || c.primary_key { " NOT NULL" } else { "" };
                format!(
                    "  {} {}{}",
                    quote(&c.column),
                    types.declaration(&c.db_type, false),
                    not_null
                )
            }
        })
        .collect();
    if rowid_key.is_none() && !keys.is_empty() {
        let columns: Vec<String> = keys.iter().map(|k| quote(&k.column)).collect();
        lines.push(format!("  PRIMARY KEY ({})", columns.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote(&entity.table),
        lines.join(",\n")
    )
}

fn is_integer(sql_type: SqlType) -> bool {
    matches!(
        sql_type,
        SqlType::Int | SqlType::BigInt | SqlType::SmallInt | SqlType::TinyInt
    )
}

fn quote(name: &str) -> String {
    querykit_core::language::quote_identifier(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use querykit_core::{ColumnMapping, DbQueryType};

    #[test]
    fn test_generated_key_is_rowid() {
        let orders = EntityMapping::new("Order", "Orders")
            .with_column(
                ColumnMapping::new("OrderID", DbQueryType::new(SqlType::Int))
                    .primary_key()
                    .generated(),
            )
            .with_column(ColumnMapping::new(
                "CustomerID",
                DbQueryType::new(SqlType::NChar).with_length(5),
            ));
        assert_eq!(
            create_table(&orders),
            "CREATE TABLE IF NOT EXISTS Orders (\n  OrderID INTEGER PRIMARY KEY AUTOINCREMENT,\n  CustomerID CHAR(5)\n)"
        );
    }

    #[test]
    fn test_composite_key() {
        let details = EntityMapping::new("OrderDetail", "Order Details")
            .with_column(ColumnMapping::new("OrderID", DbQueryType::new(SqlType::Int)).primary_key())
            .with_column(ColumnMapping::new("ProductID", DbQueryType::new(SqlType::Int)).primary_key())
            .with_column(ColumnMapping::new("Quantity", DbQueryType::new(SqlType::SmallInt)));
        assert_eq!(
            create_table(&details),
            "CREATE TABLE IF NOT EXISTS \"Order Details\" (\n  OrderID INTEGER NOT NULL,\n  ProductID INTEGER NOT NULL,\n  Quantity INTEGER,\n  PRIMARY KEY (OrderID, ProductID)\n)"
        );
    }
}
