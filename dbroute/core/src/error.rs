//! Router Error Types
//!
//! Errors fall into three groups:
//! - Configuration errors, raised synchronously and never retried
//! - Data-access errors, the only kind the slave failover loop retries
//! - Everything else raised by a unit of work, propagated untouched

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// ConfigError
// ============================================================================

/// Errors raised while configuring entities or loading a routing file
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Two slaves of one entity share a connection name
    #[error("entity {entity}: duplicate slave connection name '{name}'")]
    DuplicateSlave {
        /// Entity being configured
        entity: String,
        /// The repeated connection name
        name: String,
    },

    /// Entity section without a master connection
    #[error("entity {entity}: no master connection configured")]
    MissingMaster {
        /// Entity being configured
        entity: String,
    },

    /// Remapping table rejected
    #[error("invalid remapping table: {0}")]
    InvalidRemapping(String),

    /// Routing file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Routing file is not valid TOML for the expected schema
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Parser message
        message: String,
    },
}

// ============================================================================
// RouterError
// ============================================================================

/// Errors surfaced by routing calls
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Slave routing requested for an entity without slaves
    #[error("No slaves found for {entity} and no slave connection given")]
    NoSlaves {
        /// Entity being routed
        entity: String,
    },

    /// Entity was never configured
    #[error("Unknown entity: {entity}")]
    UnknownEntity {
        /// Entity being routed
        entity: String,
    },

    /// Connection was required to exist but is not established
    #[error("Connection not available: {name}")]
    ConnectionNotAvailable {
        /// Connection name
        name: String,
    },

    /// Transient failure talking to the database
    #[error("Data access error on {connection}: {message}")]
    DataAccess {
        /// Connection the failure happened on
        connection: String,
        /// Driver message
        message: String,
    },

    /// Error raised by a unit of work that is not a data-access failure
    #[error("Application error: {0}")]
    Application(String),
}

impl RouterError {
    /// Create a data-access error
    pub fn data_access(connection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataAccess {
            connection: connection.into(),
            message: message.into(),
        }
    }

    /// Create an application error
    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    /// Create a no-slaves error
    pub fn no_slaves(entity: impl Into<String>) -> Self {
        Self::NoSlaves {
            entity: entity.into(),
        }
    }

    /// Create an unknown-entity error
    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        Self::UnknownEntity {
            entity: entity.into(),
        }
    }

    /// Create a connection-not-available error
    pub fn connection_not_available(name: impl Into<String>) -> Self {
        Self::ConnectionNotAvailable { name: name.into() }
    }

    /// Whether the slave failover loop may retry after this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DataAccess { .. })
    }

    /// Whether this error comes from configuration rather than execution
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::NoSlaves { .. } | Self::UnknownEntity { .. }
        )
    }
}

/// Router result type
pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_data_access_is_retryable() {
        assert!(RouterError::data_access("s1", "connection reset").is_retryable());
        assert!(!RouterError::application("bad input").is_retryable());
        assert!(!RouterError::no_slaves("Order").is_retryable());
        assert!(!RouterError::connection_not_available("s1").is_retryable());
    }

    #[test]
    fn test_configuration_classification() {
        let err: RouterError = ConfigError::InvalidRemapping("empty key".into()).into();
        assert!(err.is_configuration());
        assert!(RouterError::no_slaves("Order").is_configuration());
        assert!(!RouterError::data_access("s1", "gone").is_configuration());
    }

    #[test]
    fn test_error_display() {
        let err = RouterError::data_access("orders_s1", "connection reset");
        assert_eq!(
            err.to_string(),
            "Data access error on orders_s1: connection reset"
        );

        let err = ConfigError::DuplicateSlave {
            entity: "Order".into(),
            name: "s1".into(),
        };
        assert_eq!(
            err.to_string(),
            "entity Order: duplicate slave connection name 's1'"
        );
    }
}
