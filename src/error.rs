//! Error types for the BlockDevice claim operator
//!
//! Provides structured error types for the object store adapters, the
//! claim reconciler, and the API surface, plus the requeue policy the
//! dispatcher applies to each of them.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflicting write to {kind}/{name}: object was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    // =========================================================================
    // Claim Errors
    // =========================================================================
    #[error("Invalid requirements on claim {claim}: {reason}")]
    InvalidRequirement { claim: String, reason: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Quantity parse error: {0}")]
    QuantityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Metrics / IO Errors
    // =========================================================================
    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Build a conflict error for the given kind and name
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::StoreUnavailable(_) => ErrorAction::RequeueWithBackoff,

            // Lost race or vanished object - re-read right away
            Error::Conflict { .. } | Error::ResourceNotFound { .. } => {
                ErrorAction::RequeueAfter(Duration::ZERO)
            }

            // Needs a spec change or operator attention
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::InvalidRequirement { .. }
            | Error::InvariantViolation(_)
            | Error::QuantityParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::StoreUnavailable(_))
    }

    /// Errors the reconciler turns into a plain requeue instead of surfacing
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. } | Error::ResourceNotFound { .. }
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
