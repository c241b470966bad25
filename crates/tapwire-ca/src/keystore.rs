//! Encrypted on-disk storage for the generated root.
//!
//! The keystore is a JSON document holding the root certificate in clear and
//! the private key sealed with AES-256-GCM. The AES key is derived from the
//! passphrase with Argon2id, and the alias is bound in as associated data, so
//! a blob only opens under the alias and passphrase it was written with.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::KeyAlgorithm;
use crate::error::KeystoreError;
use crate::identity::RootIdentity;

const FORMAT_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Serialized keystore document.
#[derive(Debug, Serialize, Deserialize)]
struct KeystoreDocument {
    version: u32,
    alias: String,
    created_at: DateTime<Utc>,
    algorithm: KeyAlgorithm,
    root_cert_pem: String,
    salt: String,
    nonce: String,
    encrypted_key: String,
}

/// A root identity read back from a keystore.
#[derive(Debug)]
pub struct StoredRoot {
    /// The decrypted identity.
    pub identity: RootIdentity,
    /// Algorithm the root was generated with.
    pub algorithm: KeyAlgorithm,
    /// When the keystore was written.
    pub created_at: DateTime<Utc>,
}

/// Handle to a keystore file.
#[derive(Clone)]
pub struct Keystore {
    path: PathBuf,
    alias: String,
    passphrase: String,
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore")
            .field("path", &self.path)
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

impl Keystore {
    /// Creates a keystore handle.
    pub fn new(
        path: impl AsRef<Path>,
        alias: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            alias: alias.into(),
            passphrase: passphrase.into(),
        }
    }

    /// Returns the keystore path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checks if the keystore file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the stored root.
    ///
    /// Returns `Ok(None)` when no keystore has been written yet.
    pub fn load(&self) -> Result<Option<StoredRoot>, KeystoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let doc: KeystoreDocument = serde_json::from_str(&contents)?;
        if doc.version != FORMAT_VERSION {
            return Err(KeystoreError::Corrupt(format!(
                "unsupported version {}",
                doc.version
            )));
        }
        if doc.alias != self.alias {
            return Err(KeystoreError::AliasMismatch {
                expected: self.alias.clone(),
                found: doc.alias,
            });
        }

        let salt = decode_field("salt", &doc.salt)?;
        let nonce = decode_field("nonce", &doc.nonce)?;
        let ciphertext = decode_field("encrypted_key", &doc.encrypted_key)?;
        if nonce.len() != NONCE_LEN {
            return Err(KeystoreError::Corrupt("nonce length".into()));
        }

        let cipher = self.cipher(&salt)?;
        let key_pem = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: self.alias.as_bytes(),
                },
            )
            .map_err(|_| KeystoreError::Decrypt)?;
        let key_pem = String::from_utf8(key_pem)
            .map_err(|_| KeystoreError::Corrupt("private key is not UTF-8".into()))?;

        let identity = RootIdentity::from_pem(&doc.root_cert_pem, &key_pem, &self.alias)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;

        Ok(Some(StoredRoot {
            identity,
            algorithm: doc.algorithm,
            created_at: doc.created_at,
        }))
    }

    /// Writes the identity, replacing any previous keystore atomically.
    pub fn save(
        &self,
        identity: &RootIdentity,
        algorithm: KeyAlgorithm,
    ) -> Result<(), KeystoreError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = self.cipher(&salt)?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: identity.key_pem().as_bytes(),
                    aad: self.alias.as_bytes(),
                },
            )
            .map_err(|_| KeystoreError::Corrupt("encryption failed".into()))?;

        let doc = KeystoreDocument {
            version: FORMAT_VERSION,
            alias: self.alias.clone(),
            created_at: Utc::now(),
            algorithm,
            root_cert_pem: identity.certificate_pem().to_string(),
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            encrypted_key: BASE64.encode(ciphertext),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| KeystoreError::Io(e.error))?;

        tracing::info!("Saved root CA keystore to {:?}", self.path);
        Ok(())
    }

    fn cipher(&self, salt: &[u8]) -> Result<Aes256Gcm, KeystoreError> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| KeystoreError::Corrupt(format!("key derivation: {}", e)))?;
        Aes256Gcm::new_from_slice(&key)
            .map_err(|_| KeystoreError::Corrupt("key length".into()))
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, KeystoreError> {
    BASE64
        .decode(value)
        .map_err(|e| KeystoreError::Corrupt(format!("{}: {}", name, e)))
}
