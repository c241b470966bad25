//! Per-host leaf certificates signed by the root.

use std::net::IpAddr;

use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use time::OffsetDateTime;
use x509_parser::prelude::parse_x509_certificate;

use crate::config::KeyAlgorithm;
use crate::error::{CryptoError, Result};
use crate::identity::validity_window;

/// A leaf certificate for one host, with its private key.
#[derive(Clone)]
pub struct LeafCertificate {
    host: String,
    cert_pem: String,
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl LeafCertificate {
    /// Host name the certificate was issued for.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Certificate in DER form.
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Certificate in PEM form.
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PKCS#8 DER private key.
    pub fn private_key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Checks that this certificate carries a valid signature from `root_der`.
    pub fn verify_signed_by(&self, root_der: &[u8]) -> Result<()> {
        let (_, root) = parse_x509_certificate(root_der)
            .map_err(|e| CryptoError::InvalidMaterial(format!("root certificate: {}", e)))?;
        let (_, leaf) = parse_x509_certificate(&self.cert_der)
            .map_err(|e| CryptoError::InvalidMaterial(format!("leaf certificate: {}", e)))?;

        leaf.verify_signature(Some(root.public_key()))
            .map_err(|e| CryptoError::InvalidMaterial(format!("signature: {}", e)))
    }
}

/// Normalizes a host for issuance and memoization.
///
/// Trims whitespace, lowercases, drops a trailing dot and IPv6 brackets.
pub fn normalize_host(host: &str) -> Result<String> {
    let trimmed = host.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(trimmed);
    let normalized = unbracketed.trim_end_matches('.').to_ascii_lowercase();

    if normalized.is_empty() {
        return Err(CryptoError::InvalidHost(host.to_string()));
    }

    if normalized.parse::<IpAddr>().is_ok() {
        return Ok(normalized);
    }

    let valid = normalized.len() <= 253
        && normalized.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '*')
        });

    if valid {
        Ok(normalized)
    } else {
        Err(CryptoError::InvalidHost(host.to_string()))
    }
}

/// Issues a leaf certificate for an already normalized host.
pub(crate) fn issue(
    host: &str,
    issuer: &Issuer<'static, KeyPair>,
    algorithm: KeyAlgorithm,
    validity_days: u32,
) -> Result<LeafCertificate> {
    let issue_err = |e: rcgen::Error| CryptoError::Issue {
        host: host.to_string(),
        reason: e.to_string(),
    };

    let mut params = CertificateParams::new(vec![host.to_string()]).map_err(issue_err)?;
    params
        .distinguished_name
        .push(DnType::CommonName, host.to_string());
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let (not_before, not_after) =
        validity_window(validity_days).ok_or_else(|| CryptoError::Issue {
            host: host.to_string(),
            reason: format!("validity of {} days is out of range", validity_days),
        })?;
    params.not_before = not_before;
    params.not_after = not_after;

    let leaf_key = KeyPair::generate_for(algorithm.signature_algorithm()).map_err(issue_err)?;
    let cert = params.signed_by(&leaf_key, issuer).map_err(issue_err)?;

    Ok(LeafCertificate {
        host: host.to_string(),
        cert_pem: cert.pem(),
        cert_der: cert.der().to_vec(),
        key_der: leaf_key.serialize_der(),
        not_before,
        not_after,
    })
}
