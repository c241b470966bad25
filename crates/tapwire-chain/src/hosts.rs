//! Host pattern lists.
//!
//! Supports:
//! - Exact hosts (`example.com`, `10.0.0.1`)
//! - Wildcard patterns (`*.example.com`, `**.example.com`)

use serde::{Deserialize, Serialize};

/// A single host pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPattern {
    pattern: String,
}

impl HostPattern {
    /// Creates a pattern, lowercasing it.
    pub fn new(pattern: impl AsRef<str>) -> Self {
        Self {
            pattern: pattern.as_ref().trim().to_lowercase(),
        }
    }

    /// Returns the pattern text.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    fn base_domain(&self) -> &str {
        self.pattern
            .strip_prefix("**.")
            .or_else(|| self.pattern.strip_prefix("*."))
            .unwrap_or(&self.pattern)
    }

    /// Checks if an already normalized host matches.
    ///
    /// `*.domain` matches the domain and one subdomain level, `**.domain`
    /// matches any depth.
    pub fn matches(&self, host: &str) -> bool {
        if self.pattern.starts_with("**.") {
            let base = self.base_domain();
            host == base || host.ends_with(&format!(".{}", base))
        } else if self.pattern.starts_with("*.") {
            let base = self.base_domain();
            if host == base {
                return true;
            }
            host.strip_suffix(&format!(".{}", base))
                .is_some_and(|prefix| !prefix.contains('.'))
        } else {
            host == self.pattern
        }
    }
}

/// An ordered set of host patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPatterns {
    patterns: Vec<HostPattern>,
}

impl HostPatterns {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pattern, ignoring blanks and duplicates.
    pub fn add(&mut self, pattern: impl AsRef<str>) {
        let pattern = HostPattern::new(pattern);
        if !pattern.as_str().is_empty() && !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    /// Returns the number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Iterates over the patterns.
    pub fn iter(&self) -> impl Iterator<Item = &HostPattern> {
        self.patterns.iter()
    }

    /// Checks if `host` matches any pattern.
    ///
    /// Ports, IPv6 brackets and a trailing dot are ignored.
    pub fn matches(&self, host: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let host = normalize(host);
        self.patterns.iter().any(|pattern| pattern.matches(&host))
    }
}

impl<S: AsRef<str>> FromIterator<S> for HostPatterns {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut patterns = Self::new();
        for pattern in iter {
            patterns.add(pattern);
        }
        patterns
    }
}

fn normalize(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    host.trim_end_matches('.').to_lowercase()
}
