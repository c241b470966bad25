//! Error types for the certificate authority.

use thiserror::Error;

/// Certificate authority error type.
///
/// Any of these aborts the start attempt that triggered it.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Supplied certificate or key material is unusable.
    #[error("invalid CA material: {0}")]
    InvalidMaterial(String),

    /// Failed to generate root key material.
    #[error("failed to generate CA: {0}")]
    Generation(String),

    /// Failed to issue a leaf certificate.
    #[error("failed to issue certificate for {host}: {reason}")]
    Issue {
        /// Host the leaf was requested for.
        host: String,
        /// Underlying failure.
        reason: String,
    },

    /// Host name cannot be placed in a certificate.
    #[error("invalid host name: {0:?}")]
    InvalidHost(String),

    /// IO error while reading external material.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keystore error type.
///
/// Never surfaced by [`crate::CertificateAuthority::initialize`]; a keystore
/// that fails to load is replaced by freshly generated material.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Failed to read or write the keystore file.
    #[error("keystore IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Keystore contents could not be decoded.
    #[error("keystore is corrupt: {0}")]
    Corrupt(String),

    /// Keystore was written under a different alias.
    #[error("keystore alias mismatch: expected {expected}, found {found}")]
    AliasMismatch {
        /// Alias requested by the caller.
        expected: String,
        /// Alias recorded in the keystore.
        found: String,
    },

    /// Private key could not be decrypted (wrong passphrase or tampering).
    #[error("failed to decrypt keystore private key")]
    Decrypt,

    /// Failed to encode or decode the keystore document.
    #[error("keystore format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Result type for certificate authority operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
