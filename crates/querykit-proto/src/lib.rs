//! querykit value vocabulary.
//!
//! Types shared by the translator and its backends:
//!
//! - [`value`] - Runtime scalar values for parameters and result rows
//! - [`types`] - SQL column types and the value/column type system
//! - [`command`] - Executable commands with typed parameters
//! - [`error`] - Type and conversion errors

pub mod command;
pub mod error;
pub mod types;
pub mod value;

pub use command::{QueryCommand, QueryParameter};
pub use error::Error;
pub use types::{DbQueryType, DbTypeSystem, SqlType};
pub use value::{Value, ValueKind};
