//! Builder and verifier configuration, loadable from TOML.

use crate::{Error, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default upper bound on chain length, root and leaf included.
pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 10;

/// Default tolerance applied to time comparisons.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: u64 = 300;

/// Top-level configuration file.
///
/// ```toml
/// [verifier]
/// max_chain_length = 5
/// max_clock_skew_secs = 60
/// expected_root_capabilities = ["urn:zcap:root:https%3A%2F%2Fsvc%2Fres"]
///
/// [builder]
/// max_delegation_ttl_secs = 86400
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub verifier: VerifierConfig,

    #[serde(default)]
    pub builder: BuilderConfig,
}

/// Chain and invocation verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Maximum number of capabilities in a chain, root and leaf included.
    pub max_chain_length: usize,

    /// Tolerance for expiration and proof-creation checks.
    pub max_clock_skew_secs: u64,

    /// Accept invocations on suffix-extensions of the capability's target.
    pub allow_target_attenuation: bool,

    /// Reject invocation proofs older than this.
    pub max_invocation_age_secs: Option<u64>,

    /// When non-empty, only chains rooted at one of these ids are accepted.
    pub expected_root_capabilities: Vec<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            max_clock_skew_secs: DEFAULT_MAX_CLOCK_SKEW_SECS,
            allow_target_attenuation: true,
            max_invocation_age_secs: None,
            expected_root_capabilities: Vec::new(),
        }
    }
}

impl VerifierConfig {
    pub fn max_clock_skew(&self) -> TimeDelta {
        seconds(self.max_clock_skew_secs)
    }

    pub fn max_invocation_age(&self) -> Option<TimeDelta> {
        self.max_invocation_age_secs.map(seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chain_length == 0 {
            return Err(Error::Config("max_chain_length must be at least 1".into()));
        }
        Ok(())
    }
}

/// Delegation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Longest lifetime a newly delegated capability may have.
    pub max_delegation_ttl_secs: Option<u64>,
}

impl BuilderConfig {
    pub fn max_delegation_ttl(&self) -> Option<TimeDelta> {
        self.max_delegation_ttl_secs.map(seconds)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml).map_err(|e| Error::Config(e.to_string()))?;
        config.verifier.validate()?;
        Ok(config)
    }
}

fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.verifier, VerifierConfig::default());
        assert_eq!(config.verifier.max_chain_length, 10);
        assert_eq!(config.verifier.max_clock_skew(), TimeDelta::seconds(300));
        assert!(config.verifier.allow_target_attenuation);
        assert_eq!(config.builder.max_delegation_ttl(), None);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[verifier]
max_chain_length = 4
max_clock_skew_secs = 0
allow_target_attenuation = false
max_invocation_age_secs = 600
expected_root_capabilities = ["urn:zcap:root:https%3A%2F%2Fsvc%2Fres"]

[builder]
max_delegation_ttl_secs = 3600
"#;
        let config = Config::parse(toml).unwrap();

        assert_eq!(config.verifier.max_chain_length, 4);
        assert_eq!(config.verifier.max_clock_skew(), TimeDelta::zero());
        assert!(!config.verifier.allow_target_attenuation);
        assert_eq!(
            config.verifier.max_invocation_age(),
            Some(TimeDelta::minutes(10))
        );
        assert_eq!(config.verifier.expected_root_capabilities.len(), 1);
        assert_eq!(
            config.builder.max_delegation_ttl(),
            Some(TimeDelta::hours(1))
        );
    }

    #[test]
    fn test_rejects_zero_chain_length() {
        let err = Config::parse("[verifier]\nmax_chain_length = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_unparseable_toml() {
        assert!(matches!(
            Config::parse("[verifier"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[verifier]\nmax_chain_length = 3").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.verifier.max_chain_length, 3);
    }

    #[test]
    fn test_huge_durations_saturate() {
        assert_eq!(seconds(u64::MAX), TimeDelta::MAX);
    }
}
