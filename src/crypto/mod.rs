//! # Crypto and key management
//!
//! Envelope encryption with per-topic key partitioning:
//!
//! 1. Each record is encrypted with a fresh random Data Encryption Key (DEK)
//!    using XChaCha20-Poly1305 (24-byte nonce, 16-byte tag).
//! 2. The DEK is wrapped by a topic Key Encryption Key (KEK) derived via
//!    HKDF-SHA256 from a sealed per-topic seed, salt `acms_topic_kek_v1`,
//!    info = topic identifier.
//! 3. Topic seeds live in a hardware-custody backend (`backend` module);
//!    destroying a topic's seeds makes every record under that topic
//!    unrecoverable.
//!
//! Nonces are never reused under a given DEK because DEKs are per-record and
//! random. Algorithm, nonce size, and tag size are fixed; the leading version
//! byte of the blob is the only negotiation. All comparisons involving secret
//! material use constant-time primitives.

pub mod backend;
pub mod envelope;
pub mod keys;

pub use backend::{HardwareBackend, KeychainBackend, SecretBytes, SoftwareBackend, TpmBackend};
pub use envelope::{open_envelope, seal_envelope, ENVELOPE_VERSION};
pub use keys::{KeyId, KeyManager};

use thiserror::Error;

use crate::error::CoreError;

/// Crypto subsystem errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The hardware backend cannot surface the requested key
    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    /// AEAD tag mismatch: the blob was tampered with or the key is wrong
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    /// The blob's version byte is not supported by this build
    #[error("Unsupported envelope version {0}")]
    VersionUnsupported(u8),

    /// The blob is structurally malformed
    #[error("Malformed envelope: {0}")]
    InvalidFormat(String),

    /// The custody backend failed
    #[error("Crypto backend '{backend}' failed: {reason}")]
    Backend {
        /// Backend name
        backend: String,
        /// Short failure description
        reason: String,
    },
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

impl From<CryptoError> for CoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyUnavailable(msg) => CoreError::KeyUnavailable(msg),
            CryptoError::IntegrityFailure(msg) => CoreError::IntegrityFailure(msg),
            CryptoError::VersionUnsupported(v) => {
                CoreError::IntegrityFailure(format!("unsupported envelope version {v}"))
            }
            CryptoError::InvalidFormat(msg) => {
                CoreError::IntegrityFailure(format!("malformed envelope: {msg}"))
            }
            CryptoError::Backend { backend, reason } => {
                CoreError::BackendUnavailable { backend, reason }
            }
        }
    }
}
