//! Tapwire session lifecycle.
//!
//! [`SessionController`] owns the interception session: it builds the
//! certificate authority, makes sure the platform trusts its root, then hands
//! a [`CaptureContext`] to the [`CaptureFacade`] so captured traffic flows
//! through the interceptor chain.

pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod observer;
pub mod state;
pub mod workers;

pub use capture::{CaptureContext, CaptureFacade, CaptureHandle};
pub use config::{SessionConfig, DEFAULT_DRAIN_TIMEOUT};
pub use controller::{SessionController, SessionInfo};
pub use error::{CaptureError, ConfigError, Result, SessionError};
pub use observer::{ObserverId, SessionObserver};
pub use state::{IdleReason, SessionState, StartOutcome};
pub use workers::{CancelSignal, ConnectionWorkers, DrainReport};
