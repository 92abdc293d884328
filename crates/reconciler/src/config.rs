//! Controller configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AuthFailurePolicy;

/// Tunables for a [`Controller`](crate::controller::Controller).
///
/// Every field has a default, so an empty TOML document is valid.
///
/// ```toml
/// workers = 8
/// backoff_base_ms = 1000
/// backoff_max_secs = 420
/// bucket_qps = 10.0
/// bucket_burst = 100
/// auth_failure_policy = "permanent"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// First retry delay for a failing key.
    pub backoff_base_ms: u64,
    /// Cap on the per-key retry delay.
    pub backoff_max_secs: u64,
    /// Global retry throughput.
    pub bucket_qps: f64,
    /// Retries allowed in a burst before `bucket_qps` applies.
    pub bucket_burst: u32,
    /// Whether provider authentication failures are retried.
    pub auth_failure_policy: AuthFailurePolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff_base_ms: 1000,
            backoff_max_secs: 420,
            bucket_qps: 10.0,
            bucket_burst: 100,
            auth_failure_policy: AuthFailurePolicy::Transient,
        }
    }
}

impl ControllerConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`converge_core::Error::TomlParseFailed`] for malformed input
    /// and [`converge_core::Error::InvalidConfig`] listing every invalid field.
    pub fn from_toml_str(input: &str) -> converge_core::Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, reporting all problems together.
    ///
    /// # Errors
    ///
    /// Returns [`converge_core::Error::InvalidConfig`].
    pub fn validate(&self) -> converge_core::Result<()> {
        let mut reasons = Vec::new();

        if self.workers == 0 {
            reasons.push("workers must be at least 1".to_owned());
        }
        if self.backoff_base_ms == 0 {
            reasons.push("backoff_base_ms must be positive".to_owned());
        }
        if self.backoff_max() < self.backoff_base() {
            reasons.push("backoff_max_secs must not be below backoff_base_ms".to_owned());
        }
        if !self.bucket_qps.is_finite() || self.bucket_qps <= 0.0 {
            reasons.push("bucket_qps must be a positive number".to_owned());
        }
        if self.bucket_burst == 0 {
            reasons.push("bucket_burst must be at least 1".to_owned());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(converge_core::Error::invalid_config(reasons))
        }
    }

    /// Per-key backoff base.
    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Per-key backoff cap.
    #[must_use]
    pub const fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.backoff_base(), Duration::from_secs(1));
        assert_eq!(config.backoff_max(), Duration::from_secs(420));
    }

    #[test]
    fn test_auth_policy_parses() {
        let config = ControllerConfig::from_toml_str(
            r#"
            workers = 2
            auth_failure_policy = "permanent"
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.auth_failure_policy, AuthFailurePolicy::Permanent);
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let result = ControllerConfig::from_toml_str(
            r"
            workers = 0
            bucket_qps = -1.0
            bucket_burst = 0
            ",
        );
        match result {
            Err(converge_core::Error::InvalidConfig { reasons }) => assert_eq!(reasons.len(), 3),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result = ControllerConfig::from_toml_str("wokers = 3");
        assert!(matches!(
            result,
            Err(converge_core::Error::TomlParseFailed { .. })
        ));
    }
}
