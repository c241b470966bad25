//! Error types for the session controller.

use tapwire_ca::CryptoError;
use tapwire_trust::InstallError;
use thiserror::Error;

use crate::state::SessionState;

/// Configuration rejected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// External CA material needs both a certificate and a key path.
    #[error("external CA material is incomplete: missing {missing}")]
    IncompletePair {
        /// The absent path or paths.
        missing: String,
    },

    /// Required root subject fields are blank.
    #[error("invalid root subject: {0}")]
    InvalidSubject(String),

    /// Any other out-of-range setting.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The capture collaborator could not start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The user or platform denied capture permission.
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    /// The capture tunnel could not be established.
    #[error("capture tunnel unavailable: {0}")]
    TunnelUnavailable(String),
}

/// Session controller error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Certificate authority error.
    #[error("certificate authority error: {0}")]
    Crypto(#[from] CryptoError),

    /// Trust install failed.
    #[error("trust install failed: {0}")]
    Install(#[from] InstallError),

    /// Capture failed to start.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// The operation is not valid in the current state.
    #[error("cannot {op} while session is {state}")]
    InvalidState {
        /// Requested operation.
        op: &'static str,
        /// State at the time of the request.
        state: SessionState,
    },

    /// Start or stop called from inside an observer callback.
    #[error("session lifecycle calls are not allowed from observer callbacks")]
    Reentrant,

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Worker(e.to_string())
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
