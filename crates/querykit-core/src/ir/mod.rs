//! Relational intermediate representation.
//!
//! The translator binds logical queries into [`Projection`] trees: a
//! [`Select`] producing rows and a projector building client objects from
//! them. Rewrite passes are written against [`Fold`] (ownership-based) and
//! [`Visit`] (read-only).

pub mod fold;
pub mod gather;
mod node;
mod projector;
pub mod visit;

pub use fold::Fold;
pub use node::{
    unique_name, Aggregator, AliasGenerator, ClientJoin, ColumnDecl, ColumnRef, InValues, Join,
    JoinKind, OrderClause, Projection, Select, Source, SqlExpr, Table, TableAlias, WriteCommand,
};
pub use projector::{ColumnProjector, ProjectedColumns};
pub use visit::Visit;
