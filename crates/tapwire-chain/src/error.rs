//! Error types for interceptor pipelines.

use thiserror::Error;

/// A stage failure. Closes the connection it happened on and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterceptorFault {
    /// The interceptor deliberately aborted the connection.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The interceptor failed while transforming a message.
    #[error("failed: {0}")]
    Failed(String),

    /// The interceptor panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The connection was already closed by an earlier fault.
    #[error("connection closed")]
    Closed,
}

impl InterceptorFault {
    /// Creates a failure from any displayable error.
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self::Failed(error.to_string())
    }
}
