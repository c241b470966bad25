//! Error types for trust installation.

use thiserror::Error;

/// Why a platform install did not complete.
///
/// Neither variant is retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    /// The user dismissed or refused the install prompt.
    #[error("certificate install declined by user")]
    UserDeclined,

    /// The platform refused the certificate or the install tool failed.
    #[error("certificate install rejected by platform: {0}")]
    PlatformRejected(String),
}

/// Failure to read the platform trust store.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    /// The trust store could not be queried.
    #[error("trust store unavailable: {0}")]
    Unavailable(String),

    /// IO error while reading trust anchors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No trust store integration for this platform.
    #[error("unsupported operating system")]
    Unsupported,
}
