//! Trust installation flow.
//!
//! ## States
//!
//! - **Untrusted**: the platform does not trust the root (default)
//! - **InstallPending**: an install was launched and awaits confirmation
//! - **Trusted**: the platform reports the root as trusted
//!
//! State is tracked for one root at a time, keyed by fingerprint. Asking
//! about a different root always starts from Untrusted.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::InstallError;
use crate::state::{TrustAnchor, TrustState};
use crate::store::TrustStore;

/// Events emitted when the trust state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustEvent {
    /// Trust state changed.
    StateChanged {
        /// Previous state.
        from: TrustState,
        /// New state.
        to: TrustState,
    },
}

/// Callback invoked on trust events.
pub type TrustEventCallback = Arc<dyn Fn(&TrustEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct TrustRecord {
    state: TrustState,
    fingerprint: Option<String>,
}

impl TrustRecord {
    fn state_for(&self, fingerprint: &str) -> TrustState {
        if self.fingerprint.as_deref() == Some(fingerprint) {
            self.state
        } else {
            TrustState::Untrusted
        }
    }
}

/// Drives the platform trust flow for the session root.
///
/// Clones share state.
#[derive(Clone)]
pub struct TrustInstaller {
    store: Arc<dyn TrustStore>,
    record: Arc<RwLock<TrustRecord>>,
    on_event: Option<TrustEventCallback>,
}

impl std::fmt::Debug for TrustInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustInstaller")
            .field("record", &*self.record.read())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

impl TrustInstaller {
    /// Creates an installer over the given store.
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self {
            store,
            record: Arc::new(RwLock::new(TrustRecord::default())),
            on_event: None,
        }
    }

    /// Sets a callback for trust state changes.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TrustEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    /// Returns the state of the most recently seen root.
    pub fn state(&self) -> TrustState {
        self.record.read().state
    }

    /// Returns the state recorded for `anchor`.
    pub fn state_for(&self, anchor: &TrustAnchor) -> TrustState {
        self.record.read().state_for(&anchor.fingerprint())
    }

    /// Asks the platform whether `anchor` is trusted.
    ///
    /// Never changes state. A store that cannot be read counts as untrusted.
    pub fn is_trusted(&self, anchor: &TrustAnchor) -> bool {
        match self.store.is_ca_trusted(anchor) {
            Ok(trusted) => trusted,
            Err(e) => {
                tracing::warn!("Trust store query failed, treating root as untrusted: {}", e);
                false
            }
        }
    }

    /// Starts installing `anchor` into the platform store.
    ///
    /// Returns `Trusted` without touching the store when the root is already
    /// trusted, `InstallPending` when the platform still needs the user to
    /// finish. Failures return to Untrusted and are not retried.
    pub fn begin_install(&self, anchor: &TrustAnchor) -> Result<TrustState, InstallError> {
        let fingerprint = anchor.fingerprint();

        if self.record.read().state_for(&fingerprint) == TrustState::Trusted
            && self.is_trusted(anchor)
        {
            return Ok(TrustState::Trusted);
        }

        self.transition(&fingerprint, TrustState::InstallPending);

        if let Err(e) = self.store.install_ca(anchor) {
            tracing::warn!("Root CA install failed: {}", e);
            self.transition(&fingerprint, TrustState::Untrusted);
            return Err(e);
        }

        if self.is_trusted(anchor) {
            self.transition(&fingerprint, TrustState::Trusted);
            Ok(TrustState::Trusted)
        } else {
            tracing::info!("Root CA install launched, awaiting platform confirmation");
            Ok(TrustState::InstallPending)
        }
    }

    /// Re-checks the platform and settles the state for `anchor`.
    pub fn confirm(&self, anchor: &TrustAnchor) -> TrustState {
        let state = if self.is_trusted(anchor) {
            TrustState::Trusted
        } else {
            TrustState::Untrusted
        };
        self.transition(&anchor.fingerprint(), state);
        state
    }

    /// Abandons a pending install.
    pub fn cancel(&self) {
        let fingerprint = {
            let record = self.record.read();
            if record.state != TrustState::InstallPending {
                return;
            }
            record.fingerprint.clone()
        };
        if let Some(fingerprint) = fingerprint {
            self.transition(&fingerprint, TrustState::Untrusted);
        }
    }

    /// Removes `anchor` from the platform store.
    pub fn uninstall(&self, anchor: &TrustAnchor) -> Result<(), InstallError> {
        self.store.uninstall_ca(anchor)?;
        self.transition(&anchor.fingerprint(), TrustState::Untrusted);
        Ok(())
    }

    fn transition(&self, fingerprint: &str, to: TrustState) {
        let from = {
            let mut record = self.record.write();
            let from = record.state_for(fingerprint);
            record.state = to;
            record.fingerprint = Some(fingerprint.to_string());
            from
        };

        if from != to {
            tracing::info!("Trust state {} -> {}", from, to);
            if let Some(callback) = &self.on_event {
                callback(&TrustEvent::StateChanged { from, to });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InstallBehavior, MemoryTrustStore};
    use parking_lot::Mutex;

    fn anchor() -> TrustAnchor {
        TrustAnchor::new(vec![1, 2, 3], "tapwire", "Tapwire Root CA")
    }

    fn installer(store: &MemoryTrustStore) -> TrustInstaller {
        TrustInstaller::new(Arc::new(store.clone()))
    }

    #[test]
    fn initial_state_is_untrusted() {
        let store = MemoryTrustStore::new();
        let installer = installer(&store);
        assert_eq!(installer.state(), TrustState::Untrusted);
        assert!(!installer.is_trusted(&anchor()));
    }

    #[test]
    fn accepted_install_becomes_trusted() {
        let store = MemoryTrustStore::new();
        let installer = installer(&store);

        let state = installer.begin_install(&anchor()).unwrap();
        assert_eq!(state, TrustState::Trusted);
        assert_eq!(installer.state_for(&anchor()), TrustState::Trusted);
    }

    #[test]
    fn deferred_install_stays_pending_until_confirmed() {
        let store = MemoryTrustStore::with_behavior(InstallBehavior::Deferred);
        let installer = installer(&store);

        assert_eq!(
            installer.begin_install(&anchor()).unwrap(),
            TrustState::InstallPending
        );
        assert_eq!(installer.state(), TrustState::InstallPending);

        store.approve_pending();
        assert_eq!(installer.confirm(&anchor()), TrustState::Trusted);
    }

    #[test]
    fn declined_install_returns_to_untrusted() {
        let store = MemoryTrustStore::with_behavior(InstallBehavior::Decline);
        let installer = installer(&store);

        let err = installer.begin_install(&anchor()).unwrap_err();
        assert_eq!(err, InstallError::UserDeclined);
        assert_eq!(installer.state(), TrustState::Untrusted);
        assert_eq!(store.install_calls(), 1);
    }

    #[test]
    fn rejected_install_returns_to_untrusted() {
        let store = MemoryTrustStore::with_behavior(InstallBehavior::Reject("bad cert".into()));
        let installer = installer(&store);

        let err = installer.begin_install(&anchor()).unwrap_err();
        assert!(matches!(err, InstallError::PlatformRejected(_)));
        assert_eq!(installer.state(), TrustState::Untrusted);
    }

    #[test]
    fn already_trusted_skips_store_install() {
        let store = MemoryTrustStore::new();
        let installer = installer(&store);
        installer.begin_install(&anchor()).unwrap();

        assert_eq!(
            installer.begin_install(&anchor()).unwrap(),
            TrustState::Trusted
        );
        assert_eq!(store.install_calls(), 1);
    }

    #[test]
    fn unreadable_store_is_untrusted() {
        let store = MemoryTrustStore::new();
        store.trust(anchor().der());
        store.set_unreadable(true);
        assert!(!installer(&store).is_trusted(&anchor()));
    }

    #[test]
    fn is_trusted_does_not_change_state() {
        let store = MemoryTrustStore::new();
        store.trust(anchor().der());
        let installer = installer(&store);

        assert!(installer.is_trusted(&anchor()));
        assert_eq!(installer.state(), TrustState::Untrusted);
    }

    #[test]
    fn different_root_starts_untrusted() {
        let store = MemoryTrustStore::new();
        let installer = installer(&store);
        installer.begin_install(&anchor()).unwrap();

        let other = TrustAnchor::new(vec![4, 5, 6], "other", "Other Root");
        assert_eq!(installer.state_for(&other), TrustState::Untrusted);
    }

    #[test]
    fn cancel_clears_pending() {
        let store = MemoryTrustStore::with_behavior(InstallBehavior::Deferred);
        let installer = installer(&store);
        installer.begin_install(&anchor()).unwrap();

        installer.cancel();
        assert_eq!(installer.state(), TrustState::Untrusted);
    }

    #[test]
    fn events_follow_transitions() {
        let store = MemoryTrustStore::with_behavior(InstallBehavior::Deferred);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let installer = TrustInstaller::new(Arc::new(store.clone()))
            .on_event(move |event| sink.lock().push(event.clone()));

        installer.begin_install(&anchor()).unwrap();
        store.approve_pending();
        installer.confirm(&anchor());

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                TrustEvent::StateChanged {
                    from: TrustState::Untrusted,
                    to: TrustState::InstallPending,
                },
                TrustEvent::StateChanged {
                    from: TrustState::InstallPending,
                    to: TrustState::Trusted,
                },
            ]
        );
    }

    #[test]
    fn uninstall_resets_state() {
        let store = MemoryTrustStore::new();
        let installer = installer(&store);
        installer.begin_install(&anchor()).unwrap();

        installer.uninstall(&anchor()).unwrap();
        assert_eq!(installer.state(), TrustState::Untrusted);
        assert!(!installer.is_trusted(&anchor()));
    }
}
