//! Error types for translation and execution.

use thiserror::Error;

/// Result type alias using the querykit error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while translating or executing a query.
#[derive(Debug, Error)]
pub enum Error {
    /// The query names an entity type the mapping does not know.
    #[error("unmapped entity type '{0}'")]
    UnmappedType(String),

    /// A member access has no column or relationship mapping.
    #[error("unmapped member '{member}' on entity '{entity}'")]
    UnmappedMember { entity: String, member: String },

    /// A relationship cannot be resolved to a single root.
    #[error("ambiguous relationship: {0}")]
    AmbiguousRelationship(String),

    /// Policy configuration is invalid.
    #[error("policy error: {0}")]
    Policy(String),

    /// The target dialect cannot express a required construct.
    #[error("cannot legalize query: {0}")]
    Legalization(String),

    /// A configuration or mapping document could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The query shape cannot be translated.
    #[error("unsupported query: {0}")]
    Unsupported(String),

    /// Evaluating a local sub-expression or projector failed.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// A materialized object could not be converted to the requested type.
    #[error("materialization error: {0}")]
    Materialize(String),

    /// The driver reported a failure.
    #[error("driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Type system error.
    #[error(transparent)]
    Proto(#[from] querykit_proto::Error),
}

impl Error {
    pub fn unmapped_member(entity: impl Into<String>, member: impl Into<String>) -> Self {
        Error::UnmappedMember {
            entity: entity.into(),
            member: member.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Error::Evaluation(message.into())
    }

    /// Wrap a driver failure, keeping it as the error source.
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Driver(Box::new(err))
    }

    /// Check if this error came from the driver.
    pub fn is_driver(&self) -> bool {
        matches!(self, Error::Driver(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::unmapped_member("Customer", "Nickname");
        assert_eq!(
            err.to_string(),
            "unmapped member 'Nickname' on entity 'Customer'"
        );

        let err = Error::UnmappedType("Shipper".into());
        assert_eq!(err.to_string(), "unmapped entity type 'Shipper'");
    }

    #[test]
    fn test_driver_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = Error::driver(io);
        assert!(err.is_driver());
        assert!(std::error::Error::source(&err).is_some());
    }
}
