//! Tapwire - local TLS interception.
//!
//! This crate wires the session engine into a runnable application:
//!
//! - Config file loading ([`config`])
//! - Controller assembly over the chosen trust store and the loopback proxy
//! - Log output for session and trust transitions
//!
//! # Usage
//!
//! ```ignore
//! use tapwire_app::{build_controller, AppConfig};
//!
//! let config = AppConfig::default();
//! let controller = build_controller(&config);
//! let outcome = controller.request_start(config.session_config()?).await?;
//! ```

pub mod config;

use std::sync::Arc;

use tapwire_chain::FaultReport;
use tapwire_proxy::ProxyCapture;
use tapwire_session::{IdleReason, SessionController, SessionObserver};
use tapwire_trust::{MemoryTrustStore, SystemTrustStore, TrustEvent, TrustInstaller, TrustStore};

pub use config::{default_config_path, AppConfig, TrustStoreKind, PASSPHRASE_ENV};

/// Observer that writes session transitions to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_active(&self) {
        tracing::info!("Interception active");
    }

    fn on_idle(&self, reason: &IdleReason) {
        match reason {
            IdleReason::Stopped => tracing::info!("Interception stopped"),
            IdleReason::CaptureLost(_) => tracing::warn!("Interception ended: {}", reason),
        }
    }
}

/// Builds a session controller for `config`.
pub fn build_controller(config: &AppConfig) -> SessionController {
    let store: Arc<dyn TrustStore> = match config.trust_store {
        TrustStoreKind::System => Arc::new(SystemTrustStore::new()),
        TrustStoreKind::Memory => Arc::new(MemoryTrustStore::new()),
    };

    let trust = TrustInstaller::new(store).on_event(|event| match event {
        TrustEvent::StateChanged { from, to } => {
            tracing::info!("Root trust {} -> {}", from, to);
        }
    });

    let capture = Arc::new(ProxyCapture::loopback(config.listen_port));
    SessionController::new(trust, capture).on_fault(log_fault)
}

fn log_fault(report: &FaultReport) {
    tracing::warn!(
        "Interceptor {} (stage {}) closed connection {} to {}:{} on {}: {}",
        report.interceptor,
        report.stage,
        report.connection.id,
        report.connection.host,
        report.connection.port,
        report.direction,
        report.fault
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapwire_ca::CertEncoding;
    use tapwire_session::{SessionState, StartOutcome};
    use tapwire_trust::TrustState;

    fn memory_config() -> AppConfig {
        AppConfig {
            listen_port: 0,
            trust_store: TrustStoreKind::Memory,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_start_installs_then_second_start_activates() {
        let config = memory_config();
        let controller = build_controller(&config);
        controller.register_observer(Arc::new(LogObserver));

        let outcome = controller
            .request_start(config.session_config().unwrap())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StartOutcome::PendingTrustInstall(TrustState::Trusted)
        );
        assert_eq!(controller.current_state(), SessionState::Idle);

        let outcome = controller
            .request_start(config.session_config().unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::Active);
        assert_eq!(controller.current_state(), SessionState::Active);

        let pem = controller.root_certificate(CertEncoding::Pem).await.unwrap();
        assert!(String::from_utf8(pem)
            .unwrap()
            .starts_with("-----BEGIN CERTIFICATE-----"));

        let info = controller.session_info().await.unwrap();
        assert_eq!(info.interceptors, vec!["request-logger".to_string()]);

        controller.request_stop().await.unwrap();
        assert_eq!(controller.current_state(), SessionState::Idle);
        assert!(controller.session_info().await.is_none());
    }

    #[test]
    fn log_observer_handles_both_reasons() {
        let observer = LogObserver;
        observer.on_active();
        observer.on_idle(&IdleReason::Stopped);
        observer.on_idle(&IdleReason::CaptureLost("listener closed".into()));
    }
}
