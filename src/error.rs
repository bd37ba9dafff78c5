//! Core error taxonomy
//!
//! This module defines the error taxonomy shared across the core and the
//! stable wire codes the boundary adapter exposes. Module-specific errors
//! (crypto, store, policy, ...) convert into [`CoreError`] via `From`; the
//! adapter translates a [`CoreError`] into a [`WireCode`] plus a correlation
//! id for audit cross-reference. Full internal details never cross the
//! boundary.

use thiserror::Error;
use uuid::Uuid;

/// Core error taxonomy
#[derive(Error, Debug)]
pub enum CoreError {
    /// Input failed validation before any state was touched
    #[error("Validation error: {0}")]
    Validation(String),

    /// The referenced resource does not exist in the caller's scope
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller is not authorized for this operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Compliance mode rejected the operation
    #[error("Compliance blocked: {0}")]
    ComplianceBlocked(String),

    /// Promotion requires a recorded consent token for the item's PII kinds
    #[error("PII consent required for kinds: {}", kinds.join(", "))]
    PiiConsentRequired {
        /// The PII kinds consent is missing for
        kinds: Vec<String>,
    },

    /// The hardware backend could not surface the requested key
    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    /// AEAD authentication failed; the affected item is quarantined
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    /// The vector index has not finished its initial build
    #[error("Vector index not ready for user {0}")]
    IndexNotReady(String),

    /// A pluggable backend (embedder, summarizer, store, crypto) is down
    #[error("Backend unavailable: {backend}: {reason}")]
    BackendUnavailable {
        /// Name of the failing backend
        backend: String,
        /// Short failure description
        reason: String,
    },

    /// Concurrency limits exceeded; the request was shed
    #[error("Overloaded: {0}")]
    Overloaded(String),

    /// Rate limit exceeded for this user
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the next permitted attempt
        retry_after_secs: u64,
    },

    /// The call's deadline expired before completion
    #[error("Deadline exceeded during {0}")]
    DeadlineExceeded(String),

    /// Unexpected internal failure; details stay behind the boundary
    #[error("Internal error [{correlation_id}]")]
    Internal {
        /// Correlation id recorded alongside the audit trail
        correlation_id: Uuid,
    },
}

impl CoreError {
    /// Wrap an internal failure, generating a fresh correlation id.
    ///
    /// The underlying cause is logged at `error` level and never surfaced.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        tracing::error!(%correlation_id, %cause, "internal error");
        CoreError::Internal { correlation_id }
    }

    /// The stable wire code for this error (§ external interfaces)
    pub fn wire_code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Unauthorized(_) => "authentication_failed",
            CoreError::ComplianceBlocked(_) => "compliance_blocked",
            CoreError::PiiConsentRequired { .. } => "pii_consent_required",
            CoreError::KeyUnavailable(_) => "integrity_failure",
            CoreError::IntegrityFailure(_) => "integrity_failure",
            CoreError::IndexNotReady(_) => "overloaded",
            CoreError::BackendUnavailable { .. } => "internal_error",
            CoreError::Overloaded(_) => "overloaded",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::DeadlineExceeded(_) => "deadline_exceeded",
            CoreError::Internal { .. } => "internal_error",
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
