//! Error types for the provisio engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration and graph building, state management, provider operations,
//! planning, and apply.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the provisio engine.
#[derive(Debug, Error)]
pub enum ProvisioError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider operation errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
///
/// All of these are raised before any provider operation runs.
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

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A resource address is malformed.
    #[error("Invalid resource address '{address}': {message}")]
    InvalidAddress {
        /// The offending address text.
        address: String,
        /// What is wrong with it.
        message: String,
    },

    /// Two declarations share the same address.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// A reference expression is malformed or not allowed where it appears.
    #[error("Invalid reference '{expression}' in {from}: {message}")]
    InvalidReference {
        /// Address of the resource holding the reference.
        from: String,
        /// The reference expression.
        expression: String,
        /// What is wrong with it.
        message: String,
    },

    /// A reference targets a resource or attribute that does not exist.
    #[error("Unresolved reference from {from} to {target}")]
    UnresolvedReference {
        /// Address of the resource holding the reference.
        from: String,
        /// The missing target.
        target: String,
    },

    /// Circular dependency detected while building the resource graph.
    #[error("Circular dependency detected: {cycle}")]
    Cycle {
        /// Description of the cycle.
        cycle: String,
    },

    /// No provider is registered under the requested name.
    #[error("Unknown provider '{provider}' for resource {address}")]
    UnknownProvider {
        /// Provider name.
        provider: String,
        /// Resource requesting it.
        address: String,
    },

    /// The provider does not manage this resource type.
    #[error("Provider '{provider}' does not support resource type '{resource_type}'")]
    UnsupportedResourceType {
        /// Provider name.
        provider: String,
        /// Requested resource type.
        resource_type: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// The lock this process held was released or taken over.
    #[error("State lock {lock_id} is no longer held by this process")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// A record changed since it was last read.
    #[error("State conflict on {address}: expected serial {expected}, found {found}")]
    Conflict {
        /// Address (or `<lineage>`) that conflicted.
        address: String,
        /// Serial the caller read.
        expected: String,
        /// Serial currently stored.
        found: String,
    },

    /// The store was opened without a lock and cannot be written.
    #[error("State store is read-only")]
    ReadOnly,

    /// The store was used after `close`.
    #[error("State store is closed")]
    Closed,
}

/// Provider operation errors.
///
/// A provider error on one node is contained by the executor: the node fails,
/// its dependents are skipped and independent branches continue.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// A provider operation failed.
    #[error("{operation} {resource_type} failed: {message}")]
    OperationFailed {
        /// Operation name (create, read, update, delete).
        operation: String,
        /// Resource type being operated on.
        resource_type: String,
        /// Provider-specific detail.
        message: String,
        /// Whether retrying may succeed (throttling, transient network).
        retryable: bool,
    },

    /// The remote object does not exist.
    #[error("{resource_type} '{id}' not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Provider identifier.
        id: String,
    },

    /// The operation did not finish in time.
    #[error("{operation} {address} timed out after {secs}s")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Resource address.
        address: String,
        /// Timeout in seconds.
        secs: u64,
    },

    /// The provider rejected the attributes it was given.
    #[error("Invalid attributes for {resource_type}: {message}")]
    InvalidAttributes {
        /// Resource type.
        resource_type: String,
        /// What is wrong.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The change set cannot be ordered.
    #[error("Plan contains a dependency cycle: {cycle}")]
    Cycle {
        /// Description of the cycle.
        cycle: String,
    },

    /// A resource protected by `prevent_destroy` would be destroyed.
    #[error("Resource {address} has prevent_destroy set but the plan would {action} it")]
    PreventDestroy {
        /// Protected resource.
        address: String,
        /// Action that was refused (destroy or replace).
        action: String,
    },

    /// A saved plan could not be read or written.
    #[error("Invalid plan file: {message}")]
    InvalidPlanFile {
        /// Description of the problem.
        message: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Apply was aborted before any provider operation.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// A worker task panicked or was torn down.
    #[error("Worker failure: {message}")]
    WorkerFailure {
        /// Description of the failure.
        message: String,
    },
}

/// Result type alias for provisio operations.
pub type Result<T> = std::result::Result<T, ProvisioError>;

/// Result type alias for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ProvisioError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::OperationFailed { retryable: true, .. }) => Some(5),
            Self::Provider(ProviderError::Timeout { .. }) => Some(10),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if this is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_state_conflict(&self) -> bool {
        matches!(self, Self::State(StateError::Conflict { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an invalid reference error.
    #[must_use]
    pub fn invalid_reference(
        from: impl Into<String>,
        expression: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidReference {
            from: from.into(),
            expression: expression.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a conflict error from the expected and found serials.
    #[must_use]
    pub fn conflict(address: impl Into<String>, expected: Option<u64>, found: Option<u64>) -> Self {
        let describe = |serial: Option<u64>| serial.map_or_else(|| String::from("<absent>"), |s| s.to_string());
        Self::Conflict {
            address: address.into(),
            expected: describe(expected),
            found: describe(found),
        }
    }
}

impl ProviderError {
    /// Creates a non-retryable operation failure.
    #[must_use]
    pub fn failed(
        operation: impl Into<String>,
        resource_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            resource_type: resource_type.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a retryable operation failure (throttling, transient network).
    #[must_use]
    pub fn transient(
        operation: impl Into<String>,
        resource_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            resource_type: resource_type.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Returns true if the operation may succeed when retried.
    ///
    /// A timed-out operation may already have taken effect and is not retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OperationFailed { retryable: true, .. })
    }
}
