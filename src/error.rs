//! Error types for the converge reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation: configuration, desired-state validation, the scheduler
//! transport, the artifact registry, the state store and the rectification
//! machinery itself.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Desired state failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Scheduler API errors.
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Artifact registry errors.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// State store errors.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Rectification errors.
    #[error("Rectification error: {0}")]
    Rectify(#[from] RectifyError),

    /// An internal invariant was broken. These are programming errors and are
    /// never recovered from.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// A configuration value is invalid.
    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue {
        /// Field that holds the invalid value.
        field: String,
        /// Description of the problem.
        message: String,
    },
}

/// Desired-state validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A resource value could not be parsed and has no safe repair.
    #[error("Malformed resource {field}={value:?} for {context}")]
    MalformedResource {
        /// Resource name.
        field: String,
        /// Offending value.
        value: String,
        /// Deployment or cluster the resource belongs to.
        context: String,
    },

    /// A deployment references a cluster that is not defined.
    #[error("Deployment {deployment} references undefined cluster {cluster}")]
    UnknownCluster {
        /// Deployment identity.
        deployment: String,
        /// Missing cluster name.
        cluster: String,
    },

    /// Generic validation failure for a field.
    #[error("{field}: {message}")]
    Field {
        /// Field path that failed validation.
        field: String,
        /// The error message.
        message: String,
    },
}

/// Scheduler API (transport) errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Authentication failed.
    #[error("Scheduler authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// API request was rejected.
    #[error("Scheduler request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// Rate limited.
    #[error("Scheduler rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds the scheduler asked us to wait.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("Network error communicating with scheduler at {url}: {message}")]
    NetworkError {
        /// URL that was being contacted.
        url: String,
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the API.
    #[error("Invalid response from scheduler: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Artifact registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No artifact exists for the requested source version.
    #[error("No artifact found for {source_id}")]
    ArtifactNotFound {
        /// Source identifier that was looked up.
        source_id: String,
    },

    /// The registry could not be reached or answered unexpectedly.
    #[error("Registry request to {url} failed: {message}")]
    RequestFailed {
        /// URL that was being contacted.
        url: String,
        /// Description of the failure.
        message: String,
    },
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Could not connect to the backing store.
    #[error("Failed to connect to state store: {0}")]
    Connection(String),

    /// A transaction could not be opened, committed or was aborted.
    #[error("Transaction failed while {stage}: {message}")]
    Transaction {
        /// What the transaction was doing.
        stage: String,
        /// Underlying error message.
        message: String,
    },

    /// A query failed.
    #[error("Query failed: {0}")]
    Query(String),

    /// Persisted data could not be decoded.
    #[error("Corrupted stored data: {0}")]
    Corrupted(String),
}

/// Rectification errors.
#[derive(Debug, Error)]
pub enum RectifyError {
    /// The desired state moved on after this diff was computed.
    #[error("Desired state for {deployment} changed since the diff was computed")]
    StaleDiff {
        /// Deployment identity.
        deployment: String,
    },

    /// The rectification task panicked or was aborted.
    #[error("Rectification of {deployment} was abandoned: {reason}")]
    Abandoned {
        /// Deployment identity.
        deployment: String,
        /// Why the task did not finish.
        reason: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new invariant violation with the given message.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Returns true if this error is expected to clear up on its own, so the
    /// next reconciliation cycle is likely to succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Scheduler(
                SchedulerError::RateLimited { .. } | SchedulerError::NetworkError { .. }
            ) | Self::Registry(RegistryError::RequestFailed { .. })
                | Self::Storage(StorageError::Transaction { .. } | StorageError::Connection(_))
                | Self::Rectify(RectifyError::StaleDiff { .. })
        )
    }
}

impl ConfigError {
    /// Creates an invalid value error for a specific field.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl ValidationError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl SchedulerError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NetworkError {
            url: url.into(),
            message: message.into(),
        }
    }
}

impl StorageError {
    /// Creates a transaction error for the given stage.
    #[must_use]
    pub fn transaction(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transaction {
            stage: stage.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let network = ConvergeError::from(SchedulerError::network("http://east", "reset"));
        assert!(network.is_transient());

        let rejected = ConvergeError::from(SchedulerError::api_error(400, "bad deploy"));
        assert!(!rejected.is_transient());

        let invariant = ConvergeError::invariant("nil target");
        assert!(!invariant.is_transient());
    }

    #[test]
    fn test_error_display_nests_source() {
        let err = ConvergeError::from(StorageError::transaction("committing", "disk full"));
        assert_eq!(
            err.to_string(),
            "Storage error: Transaction failed while committing: disk full"
        );
    }
}
