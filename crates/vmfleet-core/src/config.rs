//! fleet.toml configuration parser.
//!
//! Every section is optional; omitted values fall back to the
//! production defaults below.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{RegionConfig, VmTemplate, default_regions, default_templates};
use crate::duration::{format_duration, serde_str};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub provisioning: ProvisioningConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub backend: BackendConfig,
    pub regions: Vec<RegionConfig>,
    pub templates: Vec<VmTemplate>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            provisioning: ProvisioningConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
            backend: BackendConfig::default(),
            regions: default_regions(),
            templates: default_templates(),
        }
    }
}

/// Simulated provisioning timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    #[serde(with = "serde_str")]
    pub provision_delay: Duration,
    #[serde(with = "serde_str")]
    pub boot_delay: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            provision_delay: Duration::from_secs(10),
            boot_delay: Duration::from_secs(5),
        }
    }
}

/// Backoff parameters for transient provisioning/boot failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "serde_str")]
    pub initial_delay: Duration,
    #[serde(with = "serde_str")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Idle retry contexts are evicted after this long.
    #[serde(with = "serde_str")]
    pub context_ttl: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            context_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    #[serde(with = "serde_str")]
    pub heartbeat_timeout: Duration,
    /// How long a VM that never sent a heartbeat is given before it is
    /// considered unresponsive.
    #[serde(with = "serde_str")]
    pub never_seen_grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            never_seen_grace: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Regions with fewer available VMs than this raise `VMPoolLowCapacity`.
    pub low_capacity_threshold: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            low_capacity_threshold: 1,
        }
    }
}

/// Which compute/session control-plane implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Simulated,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
}

impl FleetConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML content.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML, durations in their human form.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Look up a configured region by code.
    pub fn region(&self, code: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.code == code)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.retry.multiplier < 1.0 {
            return invalid(format!("retry.multiplier must be >= 1, got {}", self.retry.multiplier));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return invalid("retry.max_delay must be >= retry.initial_delay".to_string());
        }
        // A context must outlive the longest gap between two failures of
        // the same VM, or its attempt count restarts and never exhausts.
        let longest_gap = self
            .retry
            .max_delay
            .saturating_add(self.provisioning.provision_delay)
            .saturating_add(self.provisioning.boot_delay);
        if self.retry.context_ttl <= longest_gap {
            return invalid(format!(
                "retry.context_ttl must exceed retry.max_delay + provisioning delays ({})",
                format_duration(longest_gap)
            ));
        }
        if self.health.interval.is_zero() || self.metrics.interval.is_zero() {
            return invalid("health.interval and metrics.interval must be non-zero".to_string());
        }
        if self.health.heartbeat_timeout.is_zero() {
            return invalid("health.heartbeat_timeout must be non-zero".to_string());
        }

        let mut seen = HashSet::new();
        for region in &self.regions {
            if region.code.trim().is_empty() {
                return invalid("region with empty code".to_string());
            }
            if !seen.insert(region.code.as_str()) {
                return invalid(format!("duplicate region: {}", region.code));
            }
            if region.fallback_regions.iter().any(|f| f == &region.code) {
                return invalid(format!("region {} lists itself as a fallback", region.code));
            }
        }

        let mut seen = HashSet::new();
        for template in &self.templates {
            if template.id.trim().is_empty() {
                return invalid("template with empty id".to_string());
            }
            if !seen.insert(template.id.as_str()) {
                return invalid(format!("duplicate template: {}", template.id));
            }
            if template.max_concurrent_sessions == 0 {
                return invalid(format!("template {} has max_concurrent_sessions = 0", template.id));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(5));
        assert_eq!(config.health.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.backend.kind, BackendKind::Simulated);
        assert!(config.region("us-east-1").is_some());
    }

    #[test]
    fn parse_overrides() {
        let toml_str = r#"
[retry]
max_retries = 5
initial_delay = "500ms"
max_delay = "30s"

[health]
heartbeat_timeout = 90

[backend]
kind = "noop"

[[regions]]
code = "a"
name = "Region A"
fallback_regions = ["b", "c"]

[[regions]]
code = "b"
name = "Region B"
"#;
        let config = FleetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.health.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(config.backend.kind, BackendKind::Noop);
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.region("a").unwrap().fallback_regions, vec!["b", "c"]);
        // Templates untouched.
        assert_eq!(config.templates.len(), 7);
    }

    #[test]
    fn rejects_bad_multiplier() {
        let err = FleetConfig::from_toml_str("[retry]\nmultiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_retry_context_ttl_shorter_than_a_retry_cycle() {
        for ttl in ["0s", "1s", "75s"] {
            let err = FleetConfig::from_toml_str(&format!("[retry]\ncontext_ttl = \"{ttl}\"\n")).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{ttl} accepted");
        }
        let config = FleetConfig::from_toml_str("[retry]\ncontext_ttl = \"76s\"\n").unwrap();
        assert_eq!(config.retry.context_ttl, Duration::from_secs(76));
    }

    #[test]
    fn rejects_overflowing_duration() {
        assert!(FleetConfig::from_toml_str("[retry]\nmax_delay = \"307445734561825861m\"\n").is_err());
    }

    #[test]
    fn rejects_self_fallback() {
        let toml_str = r#"
[[regions]]
code = "a"
name = "A"
fallback_regions = ["a"]
"#;
        assert!(FleetConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn rejects_zero_capacity_template() {
        let mut config = FleetConfig::default();
        config.templates[0].max_concurrent_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_keeps_durations_readable() {
        let rendered = FleetConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("initial_delay = \"5s\""));
        assert!(rendered.contains("never_seen_grace = \"2m\""));
        assert_eq!(FleetConfig::from_toml_str(&rendered).unwrap(), FleetConfig::default());
    }
}
