//! Application configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tapwire_ca::{CaConfig, RootSource};
use tapwire_chain::{BlockingInjector, HostPatterns, InterceptorFactory, RequestLogger};
use tapwire_proxy::DEFAULT_PROXY_PORT;
use tapwire_session::SessionConfig;

/// Environment variable holding the keystore passphrase.
pub const PASSPHRASE_ENV: &str = "TAPWIRE_KEYSTORE_PASSPHRASE";

/// Config file name inside the config directory.
const CONFIG_FILENAME: &str = "tapwire.json";

/// Which trust store the app installs the root into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStoreKind {
    /// The operating system store.
    #[default]
    System,
    /// An in-process store that accepts every install.
    Memory,
}

/// Settings read from `tapwire.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Loopback port for the capture proxy.
    pub listen_port: u16,
    /// Certificate authority settings.
    pub ca: CaConfig,
    /// Hosts tunnelled without decryption.
    pub bypass_hosts: HostPatterns,
    /// Hosts answered with a block page.
    pub blocked_hosts: HostPatterns,
    /// Log every intercepted exchange.
    pub log_requests: bool,
    /// How long stop waits for in-flight exchanges.
    pub drain_timeout_ms: u64,
    /// Trust store to install the root into.
    pub trust_store: TrustStoreKind,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PROXY_PORT,
            ca: CaConfig::default(),
            bypass_hosts: HostPatterns::new(),
            blocked_hosts: HostPatterns::new(),
            log_requests: true,
            drain_timeout_ms: 5_000,
            trust_store: TrustStoreKind::default(),
        }
    }
}

/// Returns the default config file path.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "tapwire", "Tapwire").map(|dirs| dirs.config_dir().join(CONFIG_FILENAME))
}

impl AppConfig {
    /// Loads the config, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
        };

        serde_json::from_str(&contents).with_context(|| format!("parsing {:?}", path))
    }

    /// Writes the config as pretty JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {:?}", path))?;
        Ok(())
    }

    /// Fills the keystore passphrase from the environment when set.
    pub fn apply_passphrase(&mut self, passphrase: Option<String>) {
        let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) else {
            return;
        };
        if let RootSource::Generate(options) = &mut self.ca.source {
            if let Some(keystore) = &mut options.keystore {
                keystore.passphrase = passphrase;
            }
        }
    }

    /// Returns the drain timeout.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Builds the session configuration.
    ///
    /// The request logger runs first so it also sees blocked requests.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        if let RootSource::Generate(options) = &self.ca.source {
            if let Some(keystore) = &options.keystore {
                if keystore.passphrase.is_empty() {
                    bail!(
                        "keystore {:?} needs a passphrase; set {}",
                        keystore.path,
                        PASSPHRASE_ENV
                    );
                }
            }
        }

        let mut config =
            SessionConfig::new(self.ca.clone()).with_drain_timeout(self.drain_timeout());
        config.bypass_hosts = self.bypass_hosts.clone();

        if self.log_requests {
            let logger: Arc<dyn InterceptorFactory> = Arc::new(RequestLogger::new());
            config = config.with_interceptor(logger);
        }
        if !self.blocked_hosts.is_empty() {
            let injector: Arc<dyn InterceptorFactory> =
                Arc::new(BlockingInjector::new(self.blocked_hosts.clone()));
            config = config.with_interceptor(injector);
        }

        config.validate()?;
        Ok(config)
    }
}
