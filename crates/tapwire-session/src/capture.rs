//! Boundary to the traffic capture collaborator.
//!
//! The controller hands a [`CaptureContext`] to a [`CaptureFacade`] when a
//! session goes active. The facade owns the socket or tunnel side and calls
//! back into the context for every accepted flow.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tapwire_ca::LeafIssuer;
use tapwire_chain::{Connection, InterceptorChain};
use tokio::sync::mpsc;

use crate::error::CaptureError;
use crate::workers::{CancelSignal, ConnectionWorkers};

/// Opaque token for a running capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptureHandle {
    id: u64,
    description: String,
}

impl CaptureHandle {
    /// Creates a handle.
    pub fn new(id: u64, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
        }
    }

    /// Facade-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable description, such as a listen address.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl std::fmt::Display for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "capture#{} ({})", self.id, self.description)
    }
}

/// What a running capture may use from the session.
#[derive(Clone)]
pub struct CaptureContext {
    issuer: Arc<dyn LeafIssuer>,
    chain: InterceptorChain,
    workers: ConnectionWorkers,
    terminated: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for CaptureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureContext")
            .field("chain", &self.chain)
            .field("workers", &self.workers)
            .finish()
    }
}

impl CaptureContext {
    /// Creates a context. The receiver yields termination reports.
    pub fn new(
        issuer: Arc<dyn LeafIssuer>,
        chain: InterceptorChain,
        workers: ConnectionWorkers,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (terminated, rx) = mpsc::unbounded_channel();
        (
            Self {
                issuer,
                chain,
                workers,
                terminated,
            },
            rx,
        )
    }

    /// Leaf issuer for TLS handshakes.
    pub fn issuer(&self) -> &Arc<dyn LeafIssuer> {
        &self.issuer
    }

    /// The session's interceptor chain.
    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// The session's worker set.
    pub fn workers(&self) -> &ConnectionWorkers {
        &self.workers
    }

    /// Opens a chain connection for a flow the facade drives inline.
    pub fn connect(&self, host: &str, port: u16, client_addr: Option<SocketAddr>) -> Connection {
        self.chain.connect(host, port, client_addr)
    }

    /// Spawns a cancellable worker owning a fresh chain connection.
    ///
    /// Returns false when the session is already stopping; the connection is
    /// then finished immediately.
    pub fn on_connection<F, Fut>(
        &self,
        host: &str,
        port: u16,
        client_addr: Option<SocketAddr>,
        worker: F,
    ) -> bool
    where
        F: FnOnce(Connection, CancelSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.workers.is_cancelled() {
            tracing::debug!("Rejecting connection to {}:{}, session stopping", host, port);
            return false;
        }

        let connection = self.chain.connect(host, port, client_addr);
        self.workers.spawn(move |cancel| worker(connection, cancel))
    }

    /// Reports that capture ended without a stop request.
    ///
    /// The controller stops the session and tells observers why.
    pub fn report_terminated(&self, reason: impl Into<String>) {
        let _ = self.terminated.send(reason.into());
    }
}

/// The traffic capture collaborator.
#[async_trait]
pub trait CaptureFacade: Send + Sync {
    /// Starts capture. Traffic may flow through `context` once this returns.
    async fn begin(&self, context: CaptureContext) -> Result<CaptureHandle, CaptureError>;

    /// Stops capture, giving in-flight exchanges up to `drain` to complete.
    async fn end(&self, handle: CaptureHandle, drain: Duration);
}
