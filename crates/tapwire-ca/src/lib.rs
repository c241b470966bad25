//! Tapwire certificate authority.
//!
//! Owns the root identity used to terminate intercepted TLS and mints
//! per-host leaf certificates on demand.
//!
//! ## Root sources
//!
//! - **Generate**: a fresh EC or Ed25519 root, optionally persisted in an
//!   encrypted keystore and reloaded on the next start
//! - **External**: a caller supplied PEM certificate and PEM private key
//!
//! ## Usage
//!
//! ```no_run
//! use tapwire_ca::{CaConfig, CertEncoding, CertificateAuthority};
//!
//! let ca = CertificateAuthority::initialize(&CaConfig::default()).unwrap();
//! let leaf = ca.issue_leaf("example.com").unwrap();
//! let root = ca.export_root_certificate(CertEncoding::Der);
//! leaf.verify_signed_by(&root).unwrap();
//! ```

pub mod authority;
pub mod config;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod leaf;

pub use authority::{CertEncoding, CertificateAuthority, LeafIssuer};
pub use config::{
    CaConfig, ExternalMaterial, GenerateOptions, KeyAlgorithm, KeystoreConfig, RootSource,
    RootSubject, MAX_VALIDITY_DAYS,
};
pub use error::{CryptoError, KeystoreError, Result};
pub use identity::{fingerprint, RootIdentity};
pub use keystore::{Keystore, StoredRoot};
pub use leaf::{normalize_host, LeafCertificate};
