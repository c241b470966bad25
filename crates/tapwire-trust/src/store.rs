//! Platform trust store boundary and an in-memory implementation.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{InstallError, TrustStoreError};
use crate::state::TrustAnchor;

/// Platform trust store.
///
/// Calls may block on subprocesses or user prompts; async callers should run
/// them on a blocking worker.
pub trait TrustStore: Send + Sync {
    /// Returns whether the platform currently trusts `anchor`.
    fn is_ca_trusted(&self, anchor: &TrustAnchor) -> Result<bool, TrustStoreError>;

    /// Starts the platform install flow for `anchor`.
    ///
    /// `Ok` means the flow was launched; the platform may still need the user
    /// to finish it before the anchor is trusted.
    fn install_ca(&self, anchor: &TrustAnchor) -> Result<(), InstallError>;

    /// Removes `anchor` from the platform store.
    fn uninstall_ca(&self, anchor: &TrustAnchor) -> Result<(), InstallError>;
}

/// How [`MemoryTrustStore`] answers install requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstallBehavior {
    /// The anchor becomes trusted immediately.
    #[default]
    Accept,
    /// The install launches but the anchor stays untrusted until
    /// [`MemoryTrustStore::approve_pending`] is called.
    Deferred,
    /// The user declines.
    Decline,
    /// The platform rejects the certificate.
    Reject(String),
}

#[derive(Debug, Default)]
struct MemoryData {
    trusted: HashSet<Vec<u8>>,
    pending: HashSet<Vec<u8>>,
    behavior: InstallBehavior,
    unreadable: bool,
    install_calls: usize,
}

/// In-process trust store for tests and simulated platforms.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrustStore {
    data: Arc<Mutex<MemoryData>>,
}

impl MemoryTrustStore {
    /// Creates an empty store that accepts installs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store with the given install behavior.
    pub fn with_behavior(behavior: InstallBehavior) -> Self {
        let store = Self::new();
        store.set_behavior(behavior);
        store
    }

    /// Changes how future installs are answered.
    pub fn set_behavior(&self, behavior: InstallBehavior) {
        self.data.lock().behavior = behavior;
    }

    /// Makes trust queries fail.
    pub fn set_unreadable(&self, unreadable: bool) {
        self.data.lock().unreadable = unreadable;
    }

    /// Trusts a certificate out of band.
    pub fn trust(&self, der: &[u8]) {
        self.data.lock().trusted.insert(der.to_vec());
    }

    /// Completes every deferred install.
    pub fn approve_pending(&self) -> usize {
        let mut data = self.data.lock();
        let pending: Vec<_> = data.pending.drain().collect();
        let count = pending.len();
        data.trusted.extend(pending);
        count
    }

    /// Number of install requests received.
    pub fn install_calls(&self) -> usize {
        self.data.lock().install_calls
    }

    /// Number of trusted certificates.
    pub fn trusted_count(&self) -> usize {
        self.data.lock().trusted.len()
    }
}

impl TrustStore for MemoryTrustStore {
    fn is_ca_trusted(&self, anchor: &TrustAnchor) -> Result<bool, TrustStoreError> {
        let data = self.data.lock();
        if data.unreadable {
            return Err(TrustStoreError::Unavailable("store is unreadable".into()));
        }
        Ok(data.trusted.contains(anchor.der()))
    }

    fn install_ca(&self, anchor: &TrustAnchor) -> Result<(), InstallError> {
        let mut data = self.data.lock();
        data.install_calls += 1;
        match data.behavior.clone() {
            InstallBehavior::Accept => {
                data.trusted.insert(anchor.der().to_vec());
                Ok(())
            }
            InstallBehavior::Deferred => {
                data.pending.insert(anchor.der().to_vec());
                Ok(())
            }
            InstallBehavior::Decline => Err(InstallError::UserDeclined),
            InstallBehavior::Reject(reason) => Err(InstallError::PlatformRejected(reason)),
        }
    }

    fn uninstall_ca(&self, anchor: &TrustAnchor) -> Result<(), InstallError> {
        let mut data = self.data.lock();
        data.trusted.remove(anchor.der());
        data.pending.remove(anchor.der());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> TrustAnchor {
        TrustAnchor::new(vec![0xde, 0xad], "test", "Test Root")
    }

    #[test]
    fn accept_trusts_immediately() {
        let store = MemoryTrustStore::new();
        assert!(!store.is_ca_trusted(&anchor()).unwrap());

        store.install_ca(&anchor()).unwrap();
        assert!(store.is_ca_trusted(&anchor()).unwrap());
        assert_eq!(store.install_calls(), 1);
    }

    #[test]
    fn deferred_waits_for_approval() {
        let store = MemoryTrustStore::with_behavior(InstallBehavior::Deferred);
        store.install_ca(&anchor()).unwrap();
        assert!(!store.is_ca_trusted(&anchor()).unwrap());

        assert_eq!(store.approve_pending(), 1);
        assert!(store.is_ca_trusted(&anchor()).unwrap());
    }

    #[test]
    fn decline_and_reject() {
        let store = MemoryTrustStore::with_behavior(InstallBehavior::Decline);
        assert_eq!(
            store.install_ca(&anchor()).unwrap_err(),
            InstallError::UserDeclined
        );

        store.set_behavior(InstallBehavior::Reject("policy".into()));
        assert_eq!(
            store.install_ca(&anchor()).unwrap_err(),
            InstallError::PlatformRejected("policy".into())
        );
        assert_eq!(store.trusted_count(), 0);
    }

    #[test]
    fn unreadable_store_errors() {
        let store = MemoryTrustStore::new();
        store.set_unreadable(true);
        assert!(store.is_ca_trusted(&anchor()).is_err());
    }

    #[test]
    fn uninstall_removes_trust() {
        let store = MemoryTrustStore::new();
        store.trust(anchor().der());
        store.uninstall_ca(&anchor()).unwrap();
        assert!(!store.is_ca_trusted(&anchor()).unwrap());
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryTrustStore::new();
        let clone = store.clone();
        clone.trust(anchor().der());
        assert!(store.is_ca_trusted(&anchor()).unwrap());
    }
}
