//! Error types and result alias.
//!
//! Backend clients report failures as [`BackendError`], tagged with the
//! store's coded [`ErrorCode`]. The [`classify`](crate::classify) module maps
//! each of them exactly once into a [`ClassifiedError`], the single error type
//! the gateway exposes. Its flags drive every retry and suppression decision.
//!
//! # Taxonomy
//!
//! | [`ErrorKind`] | Retried | Suppressible |
//! |---------------|---------|--------------|
//! | `ObjectNil`, `Precondition`, `Serialization` | never | never |
//! | `Backend(code)` | per code | per code |
//! | `Reconciliation` | never | never |
//! | `Shutdown`, `Timeout`, `Cancelled` | never | never |
//! | `Panicked` | never | never |
//!
//! Errors crossing a layer are wrapped with a short prefix via
//! [`ClassifiedError::with_prefix`]; the flags are carried through unchanged.

use std::fmt;

use thiserror::Error;

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, ClassifiedError>;

/// Coded error category reported by a backend client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    ResourceNotFound,
    ResourceInUse,
    TableNotFound,
    TableAlreadyExists,
    IndexNotFound,
    ConditionalCheckFailed,
    IdempotentParameterMismatch,
    TransactionInProgress,
    TransactionConflict,
    TransactionCanceled,
    ItemCollectionSizeLimitExceeded,
    LimitExceeded,
    ProvisionedThroughputExceeded,
    RequestLimitExceeded,
    InternalServerError,
    Validation,
    /// Any other coded error, carrying the backend's code string.
    Other(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResourceNotFound => "ResourceNotFoundException",
            Self::ResourceInUse => "ResourceInUseException",
            Self::TableNotFound => "TableNotFoundException",
            Self::TableAlreadyExists => "TableAlreadyExistsException",
            Self::IndexNotFound => "IndexNotFoundException",
            Self::ConditionalCheckFailed => "ConditionalCheckFailedException",
            Self::IdempotentParameterMismatch => "IdempotentParameterMismatchException",
            Self::TransactionInProgress => "TransactionInProgressException",
            Self::TransactionConflict => "TransactionConflictException",
            Self::TransactionCanceled => "TransactionCanceledException",
            Self::ItemCollectionSizeLimitExceeded => "ItemCollectionSizeLimitExceededException",
            Self::LimitExceeded => "LimitExceededException",
            Self::ProvisionedThroughputExceeded => "ProvisionedThroughputExceededException",
            Self::RequestLimitExceeded => "RequestLimitExceeded",
            Self::InternalServerError => "InternalServerError",
            Self::Validation => "ValidationException",
            Self::Other(code) => code,
        };
        f.write_str(name)
    }
}

/// Error returned by a backend client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// A coded service error.
    #[error("{code}: {message}")]
    Service {
        /// Service error category.
        code: ErrorCode,
        /// Service-provided message.
        message: String,
    },
    /// Transport or client-side failure without a service code.
    #[error("{0}")]
    Transport(String),
}

impl BackendError {
    /// Creates a coded service error.
    #[must_use]
    pub fn service(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Service { code, message: message.into() }
    }

    /// Creates an uncoded transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Returns the service code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Service { code, .. } => Some(code),
            Self::Transport(_) => None,
        }
    }
}

/// The taxonomy class of a [`ClassifiedError`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The operation was invoked on a gateway without connected backends.
    ObjectNil,
    /// Missing configuration or malformed caller input, rejected before any call.
    Precondition,
    /// Item could not be marshaled or unmarshaled.
    Serialization,
    /// A coded backend error.
    Backend(ErrorCode),
    /// An uncoded transport failure.
    Transport,
    /// Results could not be reconciled with the request, or work remained
    /// unprocessed after the retry budget.
    Reconciliation,
    /// The admission gate is shutting down.
    Shutdown,
    /// A deadline elapsed.
    Timeout,
    /// The caller cancelled the operation.
    Cancelled,
    /// The wrapped operation panicked.
    Panicked,
}

/// A classified failure.
///
/// Produced once per backend error by [`classify`](crate::classify::classify)
/// (or directly by the gateway for non-backend failures) and never mutated
/// afterwards. [`with_prefix`](Self::with_prefix) returns a new value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    allow_retry: bool,
    retry_needs_backoff: bool,
    suppress: bool,
    conditional_check_failed: bool,
}

impl ClassifiedError {
    /// Creates a classification with explicit flags.
    #[must_use]
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        allow_retry: bool,
        retry_needs_backoff: bool,
        suppress: bool,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            allow_retry,
            retry_needs_backoff,
            suppress,
            conditional_check_failed: false,
        }
    }

    fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, false, false, false)
    }

    /// Fixed classification for an operation invoked on an absent object.
    #[must_use]
    pub fn object_nil(object: &str) -> Self {
        Self::fatal(ErrorKind::ObjectNil, format!("{object} object nil"))
    }

    /// Creates a precondition error.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Precondition, message)
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Serialization, message)
    }

    /// Creates a reconciliation-integrity error.
    #[must_use]
    pub fn reconciliation(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Reconciliation, message)
    }

    /// Creates a shutdown error.
    #[must_use]
    pub fn shutdown() -> Self {
        Self::fatal(ErrorKind::Shutdown, "admission gate is shutting down")
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Timeout, message)
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Cancelled, message)
    }

    /// Creates an error for a panic caught at the admission boundary.
    #[must_use]
    pub fn panicked(payload: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::Panicked, format!("operation panicked: {}", payload.into()))
    }

    /// Marks this error as an optimistic-concurrency conflict.
    #[must_use]
    pub(crate) fn with_conditional_check_failed(mut self) -> Self {
        self.conditional_check_failed = true;
        self
    }

    /// Returns a copy whose message is prefixed with `prefix`.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Self {
        let mut wrapped = self.clone();
        if !prefix.is_empty() {
            wrapped.message = format!("{prefix} {}", self.message);
        }
        wrapped
    }

    /// Returns the taxonomy class.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns the (possibly prefixed) message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether another attempt may succeed.
    #[must_use]
    pub fn allow_retry(&self) -> bool {
        self.allow_retry
    }

    /// Whether a retry should wait the long backoff rather than the short one.
    #[must_use]
    pub fn retry_needs_backoff(&self) -> bool {
        self.retry_needs_backoff
    }

    /// Whether the caller may treat this failure as success once retries
    /// are exhausted.
    #[must_use]
    pub fn suppress(&self) -> bool {
        self.suppress
    }

    /// Whether this failure signals an optimistic-concurrency conflict.
    #[must_use]
    pub fn conditional_check_failed(&self) -> bool {
        self.conditional_check_failed
    }

    /// Returns the backend code, when this is a backend error.
    #[must_use]
    pub fn code(&self) -> Option<&ErrorCode> {
        match &self.kind {
            ErrorKind::Backend(code) => Some(code),
            _ => None,
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Field name.
        field: &'static str,
        /// Minimum allowed value.
        min: String,
        /// Supplied value.
        value: String,
    },
    /// A value is above its allowed maximum.
    #[error("{field} must be at most {max}, got {value}")]
    AboveMaximum {
        /// Field name.
        field: &'static str,
        /// Maximum allowed value.
        max: String,
        /// Supplied value.
        value: String,
    },
    /// A duration or count must be positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Field name.
        field: &'static str,
        /// Supplied value.
        value: String,
    },
    /// Two related values are inconsistent.
    #[error("{field}: {message}")]
    InvalidRange {
        /// Field name.
        field: &'static str,
        /// Description of the inconsistency.
        message: String,
    },
    /// A required value is missing or empty.
    #[error("{field} is required")]
    Missing {
        /// Field name.
        field: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_prefix_keeps_flags() {
        let err = ClassifiedError::new(
            ErrorKind::Backend(ErrorCode::ProvisionedThroughputExceeded),
            "slow down",
            true,
            true,
            true,
        );
        let wrapped = err.with_prefix("PutItem");

        assert_eq!(wrapped.message(), "PutItem slow down");
        assert!(wrapped.allow_retry());
        assert!(wrapped.retry_needs_backoff());
        assert!(wrapped.suppress());
        assert_eq!(err.message(), "slow down");
    }

    #[test]
    fn test_object_nil_is_fatal() {
        let err = ClassifiedError::object_nil("Gateway");
        assert_eq!(err.kind(), &ErrorKind::ObjectNil);
        assert_eq!(err.to_string(), "Gateway object nil");
        assert!(!err.allow_retry());
        assert!(!err.suppress());
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::service(ErrorCode::TableNotFound, "no such table");
        assert_eq!(err.to_string(), "TableNotFoundException: no such table");
        assert_eq!(err.code(), Some(&ErrorCode::TableNotFound));
        assert_eq!(BackendError::transport("reset").code(), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::BelowMinimum { field: "capacity", min: "1".into(), value: "0".into() };
        assert_eq!(err.to_string(), "capacity must be at least 1, got 0");
    }
}
