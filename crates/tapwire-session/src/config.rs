//! Session configuration.

use std::sync::Arc;
use std::time::Duration;

use tapwire_ca::{CaConfig, RootSource, MAX_VALIDITY_DAYS};
use tapwire_chain::{HostPatterns, InterceptorFactory};

use crate::error::ConfigError;

/// Default time connection workers get to finish after a stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one start attempt needs.
///
/// Rebuilt for every start; the running session keeps its own copy.
#[derive(Clone)]
pub struct SessionConfig {
    /// Certificate authority settings.
    pub ca: CaConfig,
    /// Interceptor factories in chain order.
    pub interceptors: Vec<Arc<dyn InterceptorFactory>>,
    /// Hosts whose TLS is passed through untouched.
    pub bypass_hosts: HostPatterns,
    /// How long stop waits for connection workers.
    pub drain_timeout: Duration,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.interceptors.iter().map(|i| i.name()).collect();
        f.debug_struct("SessionConfig")
            .field("ca", &self.ca)
            .field("interceptors", &names)
            .field("bypass_hosts", &self.bypass_hosts)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(CaConfig::default())
    }
}

impl SessionConfig {
    /// Creates a configuration with no interceptors.
    pub fn new(ca: CaConfig) -> Self {
        Self {
            ca,
            interceptors: Vec::new(),
            bypass_hosts: HostPatterns::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Appends an interceptor factory to the chain.
    pub fn with_interceptor(mut self, factory: Arc<dyn InterceptorFactory>) -> Self {
        self.interceptors.push(factory);
        self
    }

    /// Adds a TLS bypass pattern.
    pub fn with_bypass_host(mut self, pattern: impl AsRef<str>) -> Self {
        self.bypass_hosts.add(pattern);
        self
    }

    /// Sets the drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Checks the configuration before anything is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.ca.source {
            RootSource::External(material) => {
                let missing = material.missing();
                if !missing.is_empty() {
                    return Err(ConfigError::IncompletePair {
                        missing: missing.join(" and "),
                    });
                }
            }
            RootSource::Generate(options) => {
                let blank = options.subject.blank_fields();
                if !blank.is_empty() {
                    return Err(ConfigError::InvalidSubject(format!(
                        "blank {}",
                        blank.join(", ")
                    )));
                }
                if options.subject.validity_days == 0 {
                    return Err(ConfigError::InvalidSubject(
                        "validity_days must be positive".to_string(),
                    ));
                }
                if options.subject.validity_days > MAX_VALIDITY_DAYS {
                    return Err(ConfigError::InvalidSubject(format!(
                        "validity_days must be at most {}",
                        MAX_VALIDITY_DAYS
                    )));
                }
            }
        }

        if self.ca.leaf_validity_days == 0 {
            return Err(ConfigError::Invalid(
                "leaf_validity_days must be positive".to_string(),
            ));
        }
        if self.ca.leaf_validity_days > MAX_VALIDITY_DAYS {
            return Err(ConfigError::Invalid(format!(
                "leaf_validity_days must be at most {}",
                MAX_VALIDITY_DAYS
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tapwire_ca::{ExternalMaterial, RootSubject};
    use tapwire_chain::{Interceptor, RequestLogger};

    struct Passthrough;

    #[async_trait]
    impl Interceptor for Passthrough {}

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn external_material_needs_both_paths() {
        let config = SessionConfig::new(CaConfig::external(ExternalMaterial {
            cert_path: Some("/tmp/ca.pem".into()),
            key_path: None,
        }));
        assert_eq!(
            config.validate(),
            Err(ConfigError::IncompletePair {
                missing: "key_path".to_string()
            })
        );

        let config = SessionConfig::new(CaConfig::external(ExternalMaterial {
            cert_path: Some("".into()),
            key_path: Some("/tmp/ca.key".into()),
        }));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompletePair { missing }) if missing == "cert_path"
        ));

        let config = SessionConfig::new(CaConfig::external(ExternalMaterial::default()));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompletePair { missing }) if missing == "cert_path and key_path"
        ));
    }

    #[test]
    fn blank_subject_is_rejected() {
        let subject = RootSubject {
            common_name: "  ".to_string(),
            ..Default::default()
        };
        let config = SessionConfig::new(CaConfig::generated(subject));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSubject(_))
        ));
    }

    #[test]
    fn zero_leaf_validity_is_rejected() {
        let config = SessionConfig::new(CaConfig::default().with_leaf_validity_days(0));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn oversized_validity_is_rejected() {
        let subject = RootSubject {
            validity_days: 3_000_000,
            ..Default::default()
        };
        let config = SessionConfig::new(CaConfig::generated(subject));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSubject(_))
        ));

        let config = SessionConfig::new(CaConfig::default().with_leaf_validity_days(3_000_000));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config =
            SessionConfig::new(CaConfig::default().with_leaf_validity_days(MAX_VALIDITY_DAYS));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builders_preserve_order() {
        let config = SessionConfig::default()
            .with_interceptor(Arc::new(RequestLogger::new()))
            .with_interceptor(tapwire_chain::from_fn("second", |_| Box::new(Passthrough)))
            .with_bypass_host("*.bank.example")
            .with_drain_timeout(Duration::from_millis(250));

        let names: Vec<&str> = config.interceptors.iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["request-logger", "second"]);
        assert!(config.bypass_hosts.matches("login.bank.example"));
        assert_eq!(config.drain_timeout, Duration::from_millis(250));
    }
}
