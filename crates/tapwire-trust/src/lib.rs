//! Tapwire trust installation.
//!
//! Tracks whether the platform trusts the session root and drives the
//! install flow when it does not.

pub mod error;
pub mod installer;
pub mod state;
pub mod store;
pub mod system;

pub use error::{InstallError, TrustStoreError};
pub use installer::{TrustEvent, TrustEventCallback, TrustInstaller};
pub use state::{TrustAnchor, TrustState};
pub use store::{InstallBehavior, MemoryTrustStore, TrustStore};
pub use system::SystemTrustStore;
