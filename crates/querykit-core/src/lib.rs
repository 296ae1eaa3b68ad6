//! QueryKit Core - Query translation, execution plans and entity providers.
//!
//! Logical queries are built as [`Expr`] trees over mapped entities. The
//! [`QueryTranslator`] binds them into relational projections, applies the
//! [`EntityPolicy`] and legalizes the result for a [`QueryLanguage`]; the
//! [`ExecutionBuilder`] compiles that into a [`QueryPlan`] which an
//! [`EntityProvider`] runs against a [`Driver`].

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod execution;
pub mod expr;
pub mod ir;
pub mod language;
pub mod mapping;
pub mod police;
pub mod provider;
pub mod translate;

pub use cache::{CacheStats, MruCache, QueryCache};
pub use config::{ProviderConfig, TranslatorConfig};
pub use error::{Error, Result};
pub use execution::{
    Deferred, ExecutionBuilder, Executor, FromObject, Grouping, Object, QueryPlan, QueryState,
    Record, ToRecord,
};
pub use expr::{Bindings, Expr, Lambda, PartialEvaluator};
pub use language::{Linguist, QueryLanguage, StandardLanguage};
pub use mapping::{ColumnMapping, EntityMapping, Mapping, QueryMapping, Relationship};
pub use police::{EntityPolicy, QueryPolice};
pub use provider::{BatchResults, Driver, EntityProvider, RowCursor};
pub use translate::QueryTranslator;

// Type system re-exports
pub use querykit_proto::{DbQueryType, QueryCommand, QueryParameter, SqlType, Value};

#[cfg(test)]
pub(crate) mod testing {
    use querykit_proto::{DbQueryType, SqlType};

    use crate::mapping::{ColumnMapping, EntityMapping, Mapping, Relationship};

    /// Customers and their orders.
    pub fn northwind() -> Mapping {
        Mapping::new()
            .with_entity(
                EntityMapping::new("Customer", "Customers")
                    .with_column(
                        ColumnMapping::new("CustomerID", DbQueryType::new(SqlType::NChar).with_length(5))
                            .primary_key(),
                    )
                    .with_column(ColumnMapping::new(
                        "ContactName",
                        DbQueryType::new(SqlType::NVarChar).with_length(30),
                    ))
                    .with_column(ColumnMapping::new(
                        "City",
                        DbQueryType::new(SqlType::NVarChar).with_length(15),
                    ))
                    .with_column(ColumnMapping::new(
                        "Country",
                        DbQueryType::new(SqlType::NVarChar).with_length(15),
                    ))
                    .with_column(ColumnMapping::new(
                        "Region",
                        DbQueryType::new(SqlType::NVarChar).with_length(15),
                    ))
                    .with_relationship(Relationship::one_to_many(
                        "Orders",
                        "Order",
                        &[("CustomerID", "CustomerID")],
                    )),
            )
            .with_entity(
                EntityMapping::new("Order", "Orders")
                    .with_column(
                        ColumnMapping::new("OrderID", DbQueryType::new(SqlType::Int))
                            .primary_key()
                            .generated(),
                    )
                    .with_column(ColumnMapping::new(
                        "CustomerID",
                        DbQueryType::new(SqlType::NChar).with_length(5),
                    ))
                    .with_column(ColumnMapping::new("OrderDate", DbQueryType::new(SqlType::DateTime)))
                    .with_column(ColumnMapping::new("Freight", DbQueryType::new(SqlType::Float)))
                    .with_relationship(Relationship::many_to_one(
                        "Customer",
                        "Customer",
                        &[("CustomerID", "CustomerID")],
                    )),
            )
    }
}
