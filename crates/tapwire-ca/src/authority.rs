//! The certificate authority: root identity plus memoized leaf issuance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{CaConfig, GenerateOptions, KeyAlgorithm, RootSource};
use crate::error::{CryptoError, Result};
use crate::identity::RootIdentity;
use crate::keystore::Keystore;
use crate::leaf::{self, normalize_host, LeafCertificate};

/// Encoding for an exported root certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertEncoding {
    /// Raw DER bytes.
    Der,
    /// PEM text.
    Pem,
}

/// Capability to mint per-host certificates under the session root.
///
/// This is what the capture side receives; it never sees the root key.
pub trait LeafIssuer: Send + Sync {
    /// Returns the leaf for `host`, issuing it on first use.
    fn issue_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>>;

    /// Returns the root certificate in DER form.
    fn root_certificate_der(&self) -> Vec<u8>;
}

/// On-device certificate authority.
pub struct CertificateAuthority {
    identity: Arc<RootIdentity>,
    algorithm: KeyAlgorithm,
    leaf_validity_days: u32,
    leaves: RwLock<HashMap<String, Arc<LeafCertificate>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("identity", &self.identity)
            .field("algorithm", &self.algorithm)
            .field("leaf_validity_days", &self.leaf_validity_days)
            .field("cached_leaves", &self.leaves.read().len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Builds the authority from configuration.
    ///
    /// Generated roots are reloaded from the configured keystore when it
    /// opens; an unreadable keystore is replaced with a fresh root.
    pub fn initialize(config: &CaConfig) -> Result<Self> {
        let (identity, algorithm) = match &config.source {
            RootSource::Generate(options) => load_or_generate(options)?,
            RootSource::External(material) => {
                let (cert_path, key_path) = material.paths().ok_or_else(|| {
                    CryptoError::InvalidMaterial(format!(
                        "missing {}",
                        material.missing().join(" and ")
                    ))
                })?;
                let identity = RootIdentity::load_external(cert_path, key_path, &config.alias())?;
                (identity, KeyAlgorithm::default())
            }
        };

        Ok(Self::from_identity(
            identity,
            algorithm,
            config.leaf_validity_days,
        ))
    }

    /// Wraps an existing identity.
    pub fn from_identity(
        identity: RootIdentity,
        algorithm: KeyAlgorithm,
        leaf_validity_days: u32,
    ) -> Self {
        Self {
            identity: Arc::new(identity),
            algorithm,
            leaf_validity_days,
            leaves: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the root identity.
    pub fn identity(&self) -> &RootIdentity {
        &self.identity
    }

    /// Returns the key algorithm used for leaves.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Returns the leaf for `host`, issuing and caching it on first use.
    ///
    /// Concurrent first calls for the same host may both sign, but only the
    /// first insert is kept and every caller receives that one.
    pub fn issue_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let host = normalize_host(host)?;

        if let Some(existing) = self.leaves.read().get(&host) {
            return Ok(Arc::clone(existing));
        }

        let issued = Arc::new(leaf::issue(
            &host,
            self.identity.issuer(),
            self.algorithm,
            self.leaf_validity_days,
        )?);

        let mut leaves = self.leaves.write();
        let entry = leaves.entry(host).or_insert_with(|| {
            tracing::debug!("Issued leaf certificate for {}", issued.host());
            issued
        });
        Ok(Arc::clone(entry))
    }

    /// Exports the public root certificate.
    pub fn export_root_certificate(&self, encoding: CertEncoding) -> Vec<u8> {
        match encoding {
            CertEncoding::Der => self.identity.certificate_der().to_vec(),
            CertEncoding::Pem => self.identity.certificate_pem().as_bytes().to_vec(),
        }
    }

    /// Drops every cached leaf, returning how many were held.
    pub fn clear_leaves(&self) -> usize {
        let mut leaves = self.leaves.write();
        let count = leaves.len();
        leaves.clear();
        count
    }

    /// Returns the number of cached leaves.
    pub fn cached_leaves(&self) -> usize {
        self.leaves.read().len()
    }
}

impl LeafIssuer for CertificateAuthority {
    fn issue_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        CertificateAuthority::issue_leaf(self, host)
    }

    fn root_certificate_der(&self) -> Vec<u8> {
        self.export_root_certificate(CertEncoding::Der)
    }
}

fn load_or_generate(options: &GenerateOptions) -> Result<(RootIdentity, KeyAlgorithm)> {
    let Some(keystore_config) = &options.keystore else {
        let identity = RootIdentity::generate(&options.subject, options.algorithm)?;
        return Ok((identity, options.algorithm));
    };

    let keystore = Keystore::new(
        &keystore_config.path,
        options.subject.alias.as_str(),
        keystore_config.passphrase.as_str(),
    );

    match keystore.load() {
        Ok(Some(stored)) => {
            tracing::info!(
                "Loaded root CA from keystore {:?} (created {})",
                keystore.path(),
                stored.created_at
            );
            return Ok((stored.identity, stored.algorithm));
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(
                "Keystore {:?} is unusable ({}), generating a new root CA",
                keystore.path(),
                e
            );
        }
    }

    let identity = RootIdentity::generate(&options.subject, options.algorithm)?;
    if let Err(e) = keystore.save(&identity, options.algorithm) {
        tracing::warn!("Failed to persist root CA to {:?}: {}", keystore.path(), e);
    }
    Ok((identity, options.algorithm))
}
