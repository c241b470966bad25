//! Root identity: the CA key pair and its self-signed certificate.

use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

use crate::config::{KeyAlgorithm, RootSubject};
use crate::error::{CryptoError, Result};

/// A root CA: private key plus self-signed certificate, always together.
pub struct RootIdentity {
    subject: RootSubject,
    cert_pem: String,
    cert_der: Vec<u8>,
    key_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl std::fmt::Debug for RootIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootIdentity")
            .field("subject", &self.subject)
            .field("fingerprint", &self.fingerprint())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl RootIdentity {
    /// Generates a new key pair and self-signed CA certificate.
    pub fn generate(subject: &RootSubject, algorithm: KeyAlgorithm) -> Result<Self> {
        let key_pair = KeyPair::generate_for(algorithm.signature_algorithm())
            .map_err(|e| CryptoError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.common_name.clone());
        dn.push(DnType::OrganizationName, subject.organization.clone());
        if let Some(unit) = &subject.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, unit.clone());
        }
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

        let (not_before, not_after) = validity_window(subject.validity_days).ok_or_else(|| {
            CryptoError::Generation(format!(
                "validity of {} days is out of range",
                subject.validity_days
            ))
        })?;
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CryptoError::Generation(e.to_string()))?;

        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CryptoError::Generation(e.to_string()))?;

        tracing::info!(
            "Generated root CA {:?} ({})",
            subject.common_name,
            algorithm
        );

        Ok(Self {
            subject: subject.clone(),
            cert_der: cert.der().to_vec(),
            cert_pem,
            key_pem,
            issuer,
        })
    }

    /// Loads a caller supplied PEM certificate and PEM private key from disk.
    pub fn load_external(cert_path: &Path, key_path: &Path, alias: &str) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let identity = Self::from_pem(&cert_pem, &key_pem, alias)?;
        tracing::info!("Loaded external root CA from {:?}", cert_path);
        Ok(identity)
    }

    /// Builds an identity from PEM text.
    ///
    /// The certificate must be a CA certificate whose public key matches the
    /// private key. Encrypted private keys are rejected.
    pub fn from_pem(cert_pem: &str, key_pem: &str, alias: &str) -> Result<Self> {
        if key_pem.contains("ENCRYPTED") {
            return Err(CryptoError::InvalidMaterial(
                "encrypted private keys are not supported".into(),
            ));
        }

        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| CryptoError::InvalidMaterial(format!("private key: {}", e)))?;

        let (_, pem_block) = parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| CryptoError::InvalidMaterial(format!("certificate PEM: {}", e)))?;
        if pem_block.label != "CERTIFICATE" {
            return Err(CryptoError::InvalidMaterial(format!(
                "expected CERTIFICATE block, got {}",
                pem_block.label
            )));
        }

        let (_, certificate) = parse_x509_certificate(&pem_block.contents)
            .map_err(|e| CryptoError::InvalidMaterial(format!("certificate DER: {}", e)))?;

        if !certificate.is_ca() {
            return Err(CryptoError::InvalidMaterial(
                "certificate is not a CA certificate".into(),
            ));
        }

        let cert_public_key = certificate
            .tbs_certificate
            .subject_pki
            .subject_public_key
            .data
            .as_ref();
        if cert_public_key != key_pair.public_key_raw() {
            return Err(CryptoError::InvalidMaterial(
                "certificate and private key do not match".into(),
            ));
        }

        if !certificate.validity().is_valid() {
            tracing::warn!("Root CA certificate is outside its validity window");
        }

        let subject = subject_of(&certificate, alias);
        let cert_der = pem_block.contents.clone();
        let normalized_key_pem = key_pair.serialize_pem();
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CryptoError::InvalidMaterial(format!("issuer: {}", e)))?;

        Ok(Self {
            subject,
            cert_pem: pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.clone())),
            cert_der,
            key_pem: normalized_key_pem,
            issuer,
        })
    }

    /// Returns the subject fields.
    pub fn subject(&self) -> &RootSubject {
        &self.subject
    }

    /// Returns the certificate in DER form.
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Returns the certificate in PEM form.
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the SHA-256 fingerprint of the certificate as lowercase hex.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert_der)
    }

    pub(crate) fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

/// Returns `(now - 1 day, now + days)`, or `None` past the representable range.
pub(crate) fn validity_window(days: u32) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let now = OffsetDateTime::now_utc();
    let not_before = now.checked_sub(Duration::days(1))?;
    let not_after = now.checked_add(Duration::days(i64::from(days)))?;
    Some((not_before, not_after))
}

/// SHA-256 fingerprint of DER bytes as lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn subject_of(certificate: &X509Certificate<'_>, alias: &str) -> RootSubject {
    let name = certificate.subject();
    let common_name = name
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let organization = name
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let organizational_unit = name
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);

    let validity = certificate.validity();
    let days = (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400;

    RootSubject {
        common_name,
        organization,
        organizational_unit,
        alias: alias.to_string(),
        validity_days: u32::try_from(days.max(0)).unwrap_or(u32::MAX),
    }
}
