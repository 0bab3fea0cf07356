use thiserror::Error;

/// Canonical error type shared by every Silt crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The caller's connection alias is not registered.
    #[error("should create connect first: alias `{alias}` is not connected")]
    NotConnected {
        /// Connection alias the call was issued under.
        alias: String,
    },

    /// Entity was not found in the catalog.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"segment"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be created again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"collection"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// Operation violates current state machine rules.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// A blocking wait elapsed before the awaited condition was reached.
    #[error("timed out after {elapsed_ms}ms waiting for {what}")]
    Timeout {
        /// What the caller was waiting for.
        what: String,
        /// Elapsed wait in milliseconds.
        elapsed_ms: u64,
    },

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// Persisted data failed format or checksum verification.
    #[error("corruption detected in `{key}`: {message}")]
    Corruption {
        /// Object key of the corrupted log.
        key: String,
        /// What failed to verify.
        message: String,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Validation error for input data.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Creates a `NotConnected` variant.
    #[must_use]
    pub fn not_connected(alias: impl Into<String>) -> Self {
        Self::NotConnected {
            alias: alias.into(),
        }
    }

    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` variant.
    #[must_use]
    pub fn timeout(what: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            elapsed_ms,
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a `Corruption` variant.
    #[must_use]
    pub fn corruption(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corruption {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a `ValidationError` variant.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// Returns true when the error came from the connection layer.
    #[must_use]
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_message() {
        let err = CoreError::not_connected("default");
        assert!(err.is_not_connected());
        assert!(err.to_string().contains("should create connect first"));
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let err: CoreError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, CoreError::SerializationError(_)));
    }
}
