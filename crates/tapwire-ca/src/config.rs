//! Certificate authority configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default root certificate lifetime.
pub const DEFAULT_ROOT_VALIDITY_DAYS: u32 = 3650;

/// Default leaf certificate lifetime.
pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 365;

/// Longest lifetime accepted for root or leaf certificates.
pub const MAX_VALIDITY_DAYS: u32 = 36_500;

/// Key algorithm used for generated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// ECDSA over P-256 with SHA-256.
    #[default]
    EcdsaP256,
    /// ECDSA over P-384 with SHA-384.
    EcdsaP384,
    /// Ed25519.
    Ed25519,
}

impl KeyAlgorithm {
    /// Returns the algorithm as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EcdsaP256 => "ecdsa-p256",
            Self::EcdsaP384 => "ecdsa-p384",
            Self::Ed25519 => "ed25519",
        }
    }

    pub(crate) fn signature_algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subject fields of the root certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSubject {
    /// Common name shown in trust store listings.
    pub common_name: String,
    /// Organization name.
    pub organization: String,
    /// Optional organizational unit.
    #[serde(default)]
    pub organizational_unit: Option<String>,
    /// Alias the root is stored and installed under.
    pub alias: String,
    /// Root certificate lifetime in days.
    #[serde(default = "default_root_validity_days")]
    pub validity_days: u32,
}

fn default_root_validity_days() -> u32 {
    DEFAULT_ROOT_VALIDITY_DAYS
}

impl Default for RootSubject {
    fn default() -> Self {
        Self {
            common_name: "Tapwire Root CA".to_string(),
            organization: "Tapwire".to_string(),
            organizational_unit: None,
            alias: "tapwire".to_string(),
            validity_days: DEFAULT_ROOT_VALIDITY_DAYS,
        }
    }
}

impl RootSubject {
    /// Returns the names of required fields that are blank.
    pub fn blank_fields(&self) -> Vec<&'static str> {
        let mut blank = Vec::new();
        if self.common_name.trim().is_empty() {
            blank.push("common_name");
        }
        if self.organization.trim().is_empty() {
            blank.push("organization");
        }
        if self.alias.trim().is_empty() {
            blank.push("alias");
        }
        if self.validity_days == 0 {
            blank.push("validity_days");
        }
        blank
    }
}

/// Location and passphrase of the persisted root identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreConfig {
    /// Keystore file path.
    pub path: PathBuf,
    /// Passphrase protecting the private key.
    pub passphrase: String,
}

impl std::fmt::Debug for KeystoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreConfig")
            .field("path", &self.path)
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

impl KeystoreConfig {
    /// Creates a keystore configuration.
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: passphrase.into(),
        }
    }
}

/// Options for a generated root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Root subject.
    #[serde(default)]
    pub subject: RootSubject,
    /// Key algorithm for the root and its leaves.
    #[serde(default)]
    pub algorithm: KeyAlgorithm,
    /// Where to persist the generated root, if anywhere.
    #[serde(default)]
    pub keystore: Option<KeystoreConfig>,
}

/// Caller supplied PEM certificate and private key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalMaterial {
    /// Path to the PEM certificate.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// Path to the PEM private key.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl ExternalMaterial {
    /// Creates external material from a certificate and key path.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
        }
    }

    /// Returns the names of the paths that are absent or empty.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if usable_path(self.cert_path.as_deref()).is_none() {
            missing.push("cert_path");
        }
        if usable_path(self.key_path.as_deref()).is_none() {
            missing.push("key_path");
        }
        missing
    }

    /// Returns both paths when both are present and non-empty.
    pub fn paths(&self) -> Option<(&Path, &Path)> {
        Some((
            usable_path(self.cert_path.as_deref())?,
            usable_path(self.key_path.as_deref())?,
        ))
    }
}

fn usable_path(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// Where the root identity comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RootSource {
    /// Generate (or reload from a keystore) an on-device root.
    Generate(GenerateOptions),
    /// Load a caller supplied root.
    External(ExternalMaterial),
}

impl Default for RootSource {
    fn default() -> Self {
        Self::Generate(GenerateOptions::default())
    }
}

/// Certificate authority configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaConfig {
    /// Root identity source.
    #[serde(default)]
    pub source: RootSource,
    /// Leaf certificate lifetime in days.
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
}

fn default_leaf_validity_days() -> u32 {
    DEFAULT_LEAF_VALIDITY_DAYS
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            source: RootSource::default(),
            leaf_validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
        }
    }
}

impl CaConfig {
    /// Creates a configuration that generates a root with the given subject.
    pub fn generated(subject: RootSubject) -> Self {
        Self {
            source: RootSource::Generate(GenerateOptions {
                subject,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Creates a configuration that loads a caller supplied root.
    pub fn external(material: ExternalMaterial) -> Self {
        Self {
            source: RootSource::External(material),
            ..Default::default()
        }
    }

    /// Persists the generated root in a keystore.
    ///
    /// Has no effect for external material.
    pub fn with_keystore(mut self, keystore: KeystoreConfig) -> Self {
        if let RootSource::Generate(options) = &mut self.source {
            options.keystore = Some(keystore);
        }
        self
    }

    /// Sets the key algorithm used for generated keys.
    pub fn with_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        if let RootSource::Generate(options) = &mut self.source {
            options.algorithm = algorithm;
        }
        self
    }

    /// Sets the leaf certificate lifetime.
    pub fn with_leaf_validity_days(mut self, days: u32) -> Self {
        self.leaf_validity_days = days;
        self
    }

    /// Returns the alias the root is installed under.
    ///
    /// External roots use their file stem.
    pub fn alias(&self) -> String {
        match &self.source {
            RootSource::Generate(options) => options.subject.alias.clone(),
            RootSource::External(material) => material
                .cert_path
                .as_deref()
                .and_then(Path::file_stem)
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| RootSubject::default().alias),
        }
    }
}
