//! Trust state of the session root.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Whether the platform trusts the current root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// The platform does not trust the root.
    #[default]
    Untrusted,

    /// An install was initiated and awaits platform confirmation.
    InstallPending,

    /// The platform trusts the root.
    Trusted,
}

impl TrustState {
    /// Returns true if the root is trusted.
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted)
    }

    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::InstallPending => "install_pending",
            Self::Trusted => "trusted",
        }
    }

    /// Returns a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Untrusted => "Root certificate is not trusted",
            Self::InstallPending => "Root certificate install is awaiting confirmation",
            Self::Trusted => "Root certificate is trusted",
        }
    }
}

impl std::fmt::Display for TrustState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A root certificate as presented to the trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    der: Vec<u8>,
    alias: String,
    display_name: String,
}

impl TrustAnchor {
    /// Creates an anchor from a DER certificate.
    pub fn new(
        der: impl Into<Vec<u8>>,
        alias: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            der: der.into(),
            alias: alias.into(),
            display_name: display_name.into(),
        }
    }

    /// DER certificate bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// File-safe alias the certificate is installed under.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Name shown in platform trust dialogs.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// PEM encoding of the certificate.
    pub fn pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// SHA-256 fingerprint as lowercase hex.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(&self.der)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
