//! Value and type errors.

use thiserror::Error;

use crate::types::SqlType;

/// Errors raised while parsing type declarations or converting values.
#[derive(Debug, Error)]
pub enum Error {
    /// A type declaration names an unknown type or carries malformed arguments.
    #[error("invalid type declaration: {0}")]
    InvalidType(String),

    /// A value cannot be represented in the requested column type.
    #[error("cannot convert '{value}' to {target:?}")]
    Conversion { value: String, target: SqlType },
}
