//! Error types for geowatch.
//!
//! All errors in geowatch are strongly typed using thiserror.
//! Validation and registry errors are returned synchronously to the caller;
//! store and delivery failures are best-effort and surface through logs and
//! counters instead of failing the ingestion pipeline.

use thiserror::Error;

use crate::broadcast::SubscriptionId;
use crate::fence::FenceId;

/// Validation errors that occur during input validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid coordinate: lat {lat} must be in [-90, 90] and lng {lng} in [-180, 180]")]
    InvalidCoordinate {
        lat: f64,
        lng: f64,
    },

    #[error("Circle radius {radius_meters}m must be finite and greater than zero")]
    InvalidRadius {
        radius_meters: f64,
    },

    #[error("Polygon needs at least 3 distinct vertices, got {count}")]
    TooFewVertices {
        count: usize,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Fence registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate fence id: {id}")]
    DuplicateFenceId {
        id: FenceId,
    },
}

/// Per-delivery errors. These never fail a publish; they affect one subscriber
/// for one alert.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Subscriber {subscription_id} unreachable: {reason}")]
    SubscriberUnreachable {
        subscription_id: SubscriptionId,
        reason: String,
    },

    #[error("Sink rejected alert: {reason}")]
    SinkFailed {
        reason: String,
    },

    #[error("Delivery attempt exceeded {timeout_ms}ms")]
    TimedOut {
        timeout_ms: u64,
    },
}

/// Execution errors that occur while running the pipeline.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Queue full on {path} (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("History store unavailable: {message}")]
    StoreUnavailable {
        message: String,
    },
}

/// Top-level error type for geowatch.
#[derive(Debug, Error)]
pub enum GeowatchError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl GeowatchError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a registry error.
    #[must_use]
    pub const fn is_registry(&self) -> bool {
        matches!(self, Self::Registry(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Registry(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. }
                    | ExecutionError::QueueFull { .. }
                    | ExecutionError::StoreUnavailable { .. }
            ),
            Self::Delivery(_) => true,
        }
    }
}

/// Result type alias for geowatch operations.
pub type GeowatchResult<T> = Result<T, GeowatchError>;
