//! TLS server configs for intercepted hosts.
//!
//! Bridges the session's [`LeafIssuer`] to hudsucker's certificate
//! authority hook. Hosts that cannot get a leaf are answered with a config
//! that refuses the handshake.

use std::collections::HashMap;
use std::sync::Arc;

use hudsucker::certificate_authority::CertificateAuthority as HandshakeAuthority;
use hyper::http::uri::Authority;
use parking_lot::RwLock;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tapwire_ca::{LeafCertificate, LeafIssuer};

#[derive(Debug)]
struct RefuseHandshake;

impl ResolvesServerCert for RefuseHandshake {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// Hands out per-host server configs signed by the session root.
pub struct LeafAuthority {
    issuer: Arc<dyn LeafIssuer>,
    provider: Arc<CryptoProvider>,
    configs: RwLock<HashMap<String, Arc<ServerConfig>>>,
    refuse: Arc<ServerConfig>,
}

impl std::fmt::Debug for LeafAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafAuthority")
            .field("cached_configs", &self.configs.read().len())
            .finish()
    }
}

impl LeafAuthority {
    /// Creates the authority.
    pub fn new(
        issuer: Arc<dyn LeafIssuer>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, rustls::Error> {
        let refuse = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(RefuseHandshake));

        Ok(Self {
            issuer,
            provider,
            configs: RwLock::new(HashMap::new()),
            refuse: Arc::new(refuse),
        })
    }

    /// Returns the server config for `host`.
    pub fn server_config(&self, host: &str) -> Arc<ServerConfig> {
        let key = host.to_ascii_lowercase();
        if let Some(config) = self.configs.read().get(&key) {
            return Arc::clone(config);
        }

        let leaf = match self.issuer.issue_leaf(host) {
            Ok(leaf) => leaf,
            Err(e) => {
                tracing::warn!("No certificate for {}, refusing handshake: {}", host, e);
                return Arc::clone(&self.refuse);
            }
        };

        match build_config(&self.provider, &leaf) {
            Ok(config) => {
                let config = Arc::new(config);
                self.configs
                    .write()
                    .entry(key)
                    .or_insert_with(|| Arc::clone(&config))
                    .clone()
            }
            Err(e) => {
                tracing::warn!("Bad TLS config for {}, refusing handshake: {}", host, e);
                Arc::clone(&self.refuse)
            }
        }
    }
}

impl HandshakeAuthority for LeafAuthority {
    async fn gen_server_config(&self, authority: &Authority) -> Arc<ServerConfig> {
        self.server_config(authority.host())
    }
}

fn build_config(
    provider: &Arc<CryptoProvider>,
    leaf: &LeafCertificate,
) -> Result<ServerConfig, rustls::Error> {
    let certs = vec![CertificateDer::from(leaf.certificate_der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.private_key_der().to_vec()));

    let mut config = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
    use tapwire_ca::{CaConfig, CertificateAuthority};

    fn authority() -> LeafAuthority {
        let ca = CertificateAuthority::initialize(&CaConfig::default()).unwrap();
        LeafAuthority::new(Arc::new(ca), Arc::new(default_provider())).unwrap()
    }

    #[test]
    fn configs_are_cached_per_host() {
        let authority = authority();
        let first = authority.server_config("example.com");
        let second = authority.server_config("EXAMPLE.com");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            first.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn bad_hosts_get_the_refusing_config() {
        let authority = authority();
        let config = authority.server_config("not a host");
        assert!(Arc::ptr_eq(&config, &authority.refuse));
        assert!(config.alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn handshake_hook_strips_port() {
        let authority = authority();
        let parsed: Authority = "api.example.com:8443".parse().unwrap();
        let config = authority.gen_server_config(&parsed).await;
        assert!(Arc::ptr_eq(
            &config,
            &authority.server_config("api.example.com")
        ));
    }
}
