//! Session lifecycle states and start outcomes.

use serde::{Deserialize, Serialize};
use tapwire_trust::TrustState;

/// Session lifecycle state.
///
/// Cycles Idle, Preparing, Active, Stopping and back to Idle. A start that
/// ends in a pending trust install or an error goes from Preparing straight
/// back to Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No capture running.
    #[default]
    Idle,

    /// Building the CA and checking trust.
    Preparing,

    /// Capture running; traffic flows through the chain.
    Active,

    /// Tearing down capture and draining connections.
    Stopping,
}

impl SessionState {
    /// Returns true if traffic is being captured.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true if a start request would be accepted.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Active => "active",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a successful start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Capture is running.
    Active,

    /// The root is not trusted yet. An install was launched; start again
    /// once the platform confirms it.
    PendingTrustInstall(TrustState),
}

/// Why the session went back to Idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleReason {
    /// A stop was requested.
    Stopped,

    /// The capture collaborator ended capture on its own.
    CaptureLost(String),
}

impl std::fmt::Display for IdleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::CaptureLost(reason) => write!(f, "capture lost: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings() {
        assert_eq!(SessionState::default(), SessionState::Idle);
        assert_eq!(SessionState::Stopping.to_string(), "stopping");
        assert!(SessionState::Idle.can_start());
        assert!(!SessionState::Active.can_start());
        assert!(SessionState::Active.is_active());
    }

    #[test]
    fn idle_reason_display() {
        assert_eq!(IdleReason::Stopped.to_string(), "stopped");
        assert_eq!(
            IdleReason::CaptureLost("revoked".into()).to_string(),
            "capture lost: revoked"
        );
    }
}
