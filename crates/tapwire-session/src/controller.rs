//! Session lifecycle controller.
//!
//! Owns the single interception session of the process and gates capture on
//! the root certificate being trusted.
//!
//! ## States
//!
//! - **Idle**: nothing running (initial)
//! - **Preparing**: building the CA, checking trust, starting capture
//! - **Active**: capture running through the interceptor chain
//! - **Stopping**: ending capture and draining workers
//!
//! Every transition happens under one async lifecycle lock, so concurrent
//! start and stop requests are applied one at a time in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tapwire_ca::{CaConfig, CertEncoding, CertificateAuthority, LeafIssuer, RootSource};
use tapwire_chain::{FaultCallback, FaultReport, InterceptorChain};
use tapwire_trust::{InstallError, TrustAnchor, TrustInstaller, TrustState};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::capture::{CaptureContext, CaptureFacade, CaptureHandle};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::observer::{in_callback, ObserverId, ObserverRegistry, SessionObserver};
use crate::state::{IdleReason, SessionState, StartOutcome};
use crate::workers::ConnectionWorkers;

/// Snapshot of the running session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// When the session went active.
    pub started_at: DateTime<Utc>,
    /// SHA-256 fingerprint of the session root.
    pub root_fingerprint: String,
    /// Capture description, such as the listen address.
    pub capture: String,
    /// Interceptor names in chain order.
    pub interceptors: Vec<String>,
    /// Number of TLS bypass patterns.
    pub bypass_hosts: usize,
    /// Connection-level faults so far.
    pub faults: u64,
    /// Chain connections currently open.
    pub open_connections: usize,
    /// Leaf certificates issued this session.
    pub cached_leaves: usize,
}

struct ActiveSession {
    generation: u64,
    ca: Arc<CertificateAuthority>,
    chain: InterceptorChain,
    capture: CaptureHandle,
    workers: ConnectionWorkers,
    drain_timeout: Duration,
    started_at: DateTime<Utc>,
    faults: Arc<AtomicU64>,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    active: Option<ActiveSession>,
    // Generated roots are kept across sessions so a root installed after a
    // pending start is the one the next start uses.
    authority: Option<(CaConfig, Arc<CertificateAuthority>)>,
}

struct Inner {
    state: RwLock<SessionState>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    trust: TrustInstaller,
    capture: Arc<dyn CaptureFacade>,
    observers: ObserverRegistry,
    on_fault: RwLock<Option<FaultCallback>>,
    generation: AtomicU64,
}

impl Inner {
    fn set_state(&self, to: SessionState) {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from != to {
            tracing::debug!("Session state {} -> {}", from, to);
        }
    }
}

/// Drives the interception session.
///
/// Clones share the same session; construct one per process.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.current_state())
            .field("trust", &self.inner.trust)
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}

/// Resets Preparing to Idle if a start attempt is abandoned.
struct PreparingGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for PreparingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.write();
        if *state == SessionState::Preparing {
            *state = SessionState::Idle;
            tracing::debug!("Session state preparing -> idle");
        }
    }
}

enum TrustProbe {
    Trusted,
    Install(std::result::Result<TrustState, InstallError>),
}

impl SessionController {
    /// Creates a controller in the Idle state.
    pub fn new(trust: TrustInstaller, capture: Arc<dyn CaptureFacade>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(SessionState::Idle),
                lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
                trust,
                capture,
                observers: ObserverRegistry::default(),
                on_fault: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Sets a callback for connection faults in every future session.
    pub fn on_fault<F>(self, callback: F) -> Self
    where
        F: Fn(&FaultReport) + Send + Sync + 'static,
    {
        *self.inner.on_fault.write() = Some(Arc::new(callback));
        self
    }

    /// Returns the current state.
    pub fn current_state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Returns the trust state of the most recently used root.
    pub fn trust_state(&self) -> TrustState {
        self.inner.trust.state()
    }

    /// Returns the trust installer.
    pub fn trust(&self) -> &TrustInstaller {
        &self.inner.trust
    }

    /// Registers a lifecycle observer.
    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        self.inner.observers.register(observer)
    }

    /// Removes an observer. Returns false if it was not registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.inner.observers.unregister(id)
    }

    /// Returns a snapshot of the running session, if any.
    pub async fn session_info(&self) -> Option<SessionInfo> {
        let lifecycle = self.inner.lifecycle.lock().await;
        let session = lifecycle.active.as_ref()?;

        Some(SessionInfo {
            started_at: session.started_at,
            root_fingerprint: session.ca.identity().fingerprint(),
            capture: session.capture.description().to_string(),
            interceptors: session.chain.names(),
            bypass_hosts: session.chain.bypass().len(),
            faults: session.faults.load(Ordering::Relaxed),
            open_connections: session.chain.open_connections(),
            cached_leaves: session.ca.cached_leaves(),
        })
    }

    /// Returns the root certificate of the running session.
    pub async fn root_certificate(&self, encoding: CertEncoding) -> Option<Vec<u8>> {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle
            .active
            .as_ref()
            .map(|session| session.ca.export_root_certificate(encoding))
    }

    /// Starts a session.
    ///
    /// Only valid from Idle. When the root is not yet trusted an install is
    /// launched and the session returns to Idle with
    /// [`StartOutcome::PendingTrustInstall`]; start again once the platform
    /// confirms. If this future is dropped part way the state returns to Idle.
    pub async fn request_start(&self, config: SessionConfig) -> Result<StartOutcome> {
        if in_callback() {
            return Err(SessionError::Reentrant);
        }
        config.validate()?;

        let mut lifecycle = self.inner.lifecycle.lock().await;

        let state = self.current_state();
        if !state.can_start() {
            return Err(SessionError::InvalidState { op: "start", state });
        }

        self.inner.set_state(SessionState::Preparing);
        let mut guard = PreparingGuard {
            inner: &self.inner,
            armed: true,
        };

        let ca = self.authority(&mut lifecycle, &config.ca).await?;
        let anchor = trust_anchor(&config.ca, &ca);

        let trust = self.inner.trust.clone();
        let probe_anchor = anchor.clone();
        let probe = tokio::task::spawn_blocking(move || {
            if trust.is_trusted(&probe_anchor) {
                trust.confirm(&probe_anchor);
                TrustProbe::Trusted
            } else {
                TrustProbe::Install(trust.begin_install(&probe_anchor))
            }
        })
        .await?;

        if let TrustProbe::Install(result) = probe {
            let trust_state = result?;
            tracing::info!(
                "Root CA {} not trusted yet ({}), start again after install",
                anchor.fingerprint(),
                trust_state
            );
            return Ok(StartOutcome::PendingTrustInstall(trust_state));
        }

        let faults = Arc::new(AtomicU64::new(0));
        let mut chain = InterceptorChain::new(config.interceptors.clone())
            .with_bypass(config.bypass_hosts.clone());
        {
            let faults = faults.clone();
            let forward = self.inner.on_fault.read().clone();
            chain = chain.on_fault(move |report| {
                faults.fetch_add(1, Ordering::Relaxed);
                if let Some(callback) = &forward {
                    callback(report);
                }
            });
        }

        let workers = ConnectionWorkers::new();
        let issuer: Arc<dyn LeafIssuer> = ca.clone();
        let (context, terminated) = CaptureContext::new(issuer, chain.clone(), workers.clone());

        let capture = match self.inner.capture.begin(context).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Capture failed to start: {}", e);
                workers.shutdown(Duration::ZERO).await;
                return Err(e.into());
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let watcher = tokio::spawn(watch_termination(
            Arc::downgrade(&self.inner),
            generation,
            terminated,
        ));

        tracing::info!(
            "Session {} active via {} with {} interceptor(s)",
            generation,
            capture,
            chain.len()
        );

        lifecycle.active = Some(ActiveSession {
            generation,
            ca,
            chain,
            capture,
            workers,
            drain_timeout: config.drain_timeout,
            started_at: Utc::now(),
            faults,
            watcher,
        });
        guard.armed = false;
        self.inner.set_state(SessionState::Active);
        self.inner.observers.notify_active();

        Ok(StartOutcome::Active)
    }

    /// Stops the running session. A no-op when Idle.
    ///
    /// Capture ends first, then connection workers get the drain timeout to
    /// finish before they are aborted. Leaf certificates are discarded.
    pub async fn request_stop(&self) -> Result<()> {
        if in_callback() {
            return Err(SessionError::Reentrant);
        }

        let mut lifecycle = self.inner.lifecycle.clone().lock_owned().await;
        let Some(session) = lifecycle.active.take() else {
            return Ok(());
        };

        // Teardown owns the lifecycle lock, so a dropped stop request neither
        // leaves capture half ended nor lets a start in before Idle.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            teardown(inner, session, IdleReason::Stopped).await;
            drop(lifecycle);
        })
        .await?;
        Ok(())
    }

    async fn authority(
        &self,
        lifecycle: &mut Lifecycle,
        config: &CaConfig,
    ) -> Result<Arc<CertificateAuthority>> {
        if let Some((cached_config, ca)) = &lifecycle.authority {
            if cached_config == config {
                return Ok(ca.clone());
            }
        }

        let ca_config = config.clone();
        let ca = tokio::task::spawn_blocking(move || CertificateAuthority::initialize(&ca_config))
            .await??;
        let ca = Arc::new(ca);
        tracing::info!("Root CA ready: {}", ca.identity().fingerprint());

        lifecycle.authority = match config.source {
            RootSource::Generate(_) => Some((config.clone(), ca.clone())),
            RootSource::External(_) => None,
        };
        Ok(ca)
    }

    async fn stop_generation(&self, generation: u64, reason: IdleReason) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let current = lifecycle.active.as_ref().map(|s| s.generation);
        if current != Some(generation) {
            return;
        }
        if let Some(session) = lifecycle.active.take() {
            teardown(self.inner.clone(), session, reason).await;
        }
    }
}

async fn teardown(inner: Arc<Inner>, session: ActiveSession, reason: IdleReason) {
    inner.set_state(SessionState::Stopping);
    session.watcher.abort();

    inner
        .capture
        .end(session.capture.clone(), session.drain_timeout)
        .await;
    let report = session.workers.shutdown(session.drain_timeout).await;
    let leaves = session.ca.clear_leaves();
    drop(session.chain);

    tracing::info!(
        "Session {} stopped ({}): {} worker(s) drained, {} aborted, {} leaf certificate(s) dropped",
        session.generation,
        reason,
        report.finished,
        report.aborted,
        leaves
    );

    inner.set_state(SessionState::Idle);
    inner.observers.notify_idle(&reason);
}

async fn watch_termination(
    inner: Weak<Inner>,
    generation: u64,
    mut terminated: mpsc::UnboundedReceiver<String>,
) {
    let Some(reason) = terminated.recv().await else {
        return;
    };
    let Some(inner) = inner.upgrade() else {
        return;
    };

    tracing::warn!("Capture ended unexpectedly: {}", reason);
    let controller = SessionController { inner };
    // Stop on a fresh task; teardown aborts this watcher.
    tokio::spawn(async move {
        controller
            .stop_generation(generation, IdleReason::CaptureLost(reason))
            .await;
    });
}

fn trust_anchor(config: &CaConfig, ca: &CertificateAuthority) -> TrustAnchor {
    let alias = file_safe_alias(&config.alias());
    let common_name = &ca.identity().subject().common_name;
    let display_name = if common_name.trim().is_empty() {
        alias.clone()
    } else {
        common_name.clone()
    };
    TrustAnchor::new(
        ca.export_root_certificate(CertEncoding::Der),
        alias,
        display_name,
    )
}

fn file_safe_alias(alias: &str) -> String {
    let cleaned: String = alias
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "tapwire".to_string()
    } else {
        cleaned
    }
}
