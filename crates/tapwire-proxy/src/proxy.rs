//! Loopback MITM proxy used as the capture collaborator.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use parking_lot::Mutex;
use tapwire_session::{CaptureContext, CaptureError, CaptureFacade, CaptureHandle};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::authority::LeafAuthority;
use crate::handler::ChainHandler;
use crate::DEFAULT_PROXY_PORT;

struct RunningProxy {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Capture facade that runs a MITM proxy on a loopback address.
///
/// Clients reach the session by using the proxy; only loopback addresses
/// are accepted so nothing outside the device can connect.
pub struct ProxyCapture {
    addr: SocketAddr,
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, RunningProxy>>,
}

impl std::fmt::Debug for ProxyCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running: Vec<SocketAddr> = self.running.lock().values().map(|r| r.addr).collect();
        f.debug_struct("ProxyCapture")
            .field("addr", &self.addr)
            .field("running", &running)
            .finish()
    }
}

impl Default for ProxyCapture {
    fn default() -> Self {
        Self::loopback(DEFAULT_PROXY_PORT)
    }
}

impl ProxyCapture {
    /// Creates a capture listening on `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a capture on 127.0.0.1 with the given port.
    pub fn loopback(port: u16) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Returns the configured listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the bound address of a running capture.
    pub fn local_addr(&self, handle: &CaptureHandle) -> Option<SocketAddr> {
        self.running.lock().get(&handle.id()).map(|r| r.addr)
    }

    /// Returns the number of running proxies.
    pub fn running(&self) -> usize {
        self.running.lock().len()
    }
}

#[async_trait]
impl CaptureFacade for ProxyCapture {
    async fn begin(&self, context: CaptureContext) -> Result<CaptureHandle, CaptureError> {
        if !self.addr.ip().is_loopback() {
            return Err(CaptureError::TunnelUnavailable(format!(
                "{} is not a loopback address",
                self.addr
            )));
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| bind_error(self.addr, e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CaptureError::TunnelUnavailable(e.to_string()))?;

        let authority = LeafAuthority::new(context.issuer().clone(), Arc::new(default_provider()))
            .map_err(|e| CaptureError::TunnelUnavailable(format!("TLS setup failed: {}", e)))?;
        let handler = ChainHandler::new(context.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .build()
            .map_err(|e| CaptureError::TunnelUnavailable(e.to_string()))?;

        let task = tokio::spawn(async move {
            match proxy.start().await {
                Ok(()) => tracing::info!("Capture proxy on {} stopped", addr),
                Err(e) => {
                    tracing::error!("Capture proxy on {} failed: {}", addr, e);
                    context.report_terminated(e.to_string());
                }
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.running.lock().insert(
            id,
            RunningProxy {
                addr,
                shutdown: shutdown_tx,
                task,
            },
        );

        tracing::info!("Capture proxy listening on {}", addr);
        Ok(CaptureHandle::new(id, addr.to_string()))
    }

    async fn end(&self, handle: CaptureHandle, drain: Duration) {
        let Some(running) = self.running.lock().remove(&handle.id()) else {
            tracing::debug!("{} already ended", handle);
            return;
        };

        let _ = running.shutdown.send(());
        let mut task = running.task;
        if tokio::time::timeout(drain, &mut task).await.is_err() {
            tracing::warn!(
                "Capture proxy on {} did not drain within {:?}, aborting",
                running.addr,
                drain
            );
            task.abort();
            let _ = task.await;
        }
    }
}

fn bind_error(addr: SocketAddr, e: std::io::Error) -> CaptureError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            CaptureError::PermissionDenied(format!("cannot bind {}: {}", addr, e))
        }
        _ => CaptureError::TunnelUnavailable(format!("cannot bind {}: {}", addr, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};
    use tapwire_ca::{CaConfig, CertificateAuthority};
    use tapwire_chain::InterceptorChain;
    use tapwire_session::ConnectionWorkers;

    fn context() -> CaptureContext {
        let ca = CertificateAuthority::initialize(&CaConfig::default()).unwrap();
        let (context, _rx) = CaptureContext::new(
            Arc::new(ca),
            InterceptorChain::new(Vec::new()),
            ConnectionWorkers::new(),
        );
        context
    }

    #[test]
    fn bind_errors_map_to_capture_errors() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 80));
        assert!(matches!(
            bind_error(addr, Error::from(ErrorKind::PermissionDenied)),
            CaptureError::PermissionDenied(_)
        ));
        assert!(matches!(
            bind_error(addr, Error::from(ErrorKind::AddrInUse)),
            CaptureError::TunnelUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn non_loopback_addresses_are_refused() {
        let capture = ProxyCapture::new(SocketAddr::from(([0, 0, 0, 0], 0)));
        let err = capture.begin(context()).await.unwrap_err();
        assert!(matches!(err, CaptureError::TunnelUnavailable(_)));
        assert_eq!(capture.running(), 0);
    }

    #[tokio::test]
    async fn begin_and_end_release_the_port() {
        let capture = ProxyCapture::loopback(0);
        let handle = capture.begin(context()).await.unwrap();
        let addr = capture.local_addr(&handle).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(handle.description(), addr.to_string());

        capture.end(handle.clone(), Duration::from_secs(2)).await;
        assert_eq!(capture.running(), 0);
        assert!(capture.local_addr(&handle).is_none());

        // Ending twice is harmless.
        capture.end(handle, Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn busy_port_is_tunnel_unavailable() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let capture = ProxyCapture::new(taken.local_addr().unwrap());

        let err = capture.begin(context()).await.unwrap_err();
        assert!(matches!(err, CaptureError::TunnelUnavailable(_)));
    }
}
