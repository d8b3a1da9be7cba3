//! Configuration schema for the manager and its per-resource breakers.
//!
//! Parsing a config file off disk is left to the embedder (see the "Configuration
//! file loading" non-goal); this module only defines the in-memory shape, its
//! defaults, and validation (§6/§7 of the design doc).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_EVENT_BUS_BUFFER: usize = 500;

/// Strategy names recognized by `ResourceConfig::strategy`; anything else falls
/// back to `error_rate`.
pub mod strategy_names {
    /// Trips on the fraction of failed calls in the window.
    pub const ERROR_RATE: &str = "error_rate";
    /// Trips on the fraction of slow calls in the window.
    pub const SLOW_CALL_RATE: &str = "slow_call_rate";
    /// Trips on a run of consecutive failures.
    pub const CONSECUTIVE_FAILURES: &str = "consecutive_failures";
}

/// Top-level configuration for a [`Manager`](crate::manager::Manager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// When `false`, the manager forwards every call directly with no breaker
    /// bookkeeping and creates no breakers.
    pub enabled: bool,
    /// Capacity of the event bus's internal buffer. Non-positive values fall back
    /// to the default of 500.
    pub event_bus_buffer: usize,
    /// Defaults applied to any resource not named in `resources`.
    pub default: ResourceConfig,
    /// Per-resource overrides, merged field-by-field over `default`.
    pub resources: HashMap<String, ResourceConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            event_bus_buffer: DEFAULT_EVENT_BUS_BUFFER,
            default: ResourceConfig::default(),
            resources: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    /// Validates the top-level config and every resource override, and normalizes
    /// `event_bus_buffer`. Returns the first validation failure encountered.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.event_bus_buffer == 0 {
            self.event_bus_buffer = DEFAULT_EVENT_BUS_BUFFER;
        }

        self.default.validate(None)?;
        for name in self.resources.keys() {
            // Validate the merged view, not the raw override: a resource entry is
            // allowed to specify only a handful of fields and inherit the rest.
            self.default.merge(&self.resources[name]).validate(Some(name))?;
        }

        Ok(())
    }

    /// Builds the effective config for `resource`: the per-field merge of
    /// `default` overridden by `resources[resource]`, if present. The merged
    /// result is revalidated.
    pub fn resolve(&self, resource: &str) -> Result<ResourceConfig, ConfigError> {
        let merged = match self.resources.get(resource) {
            Some(overrides) => self.default.merge(overrides),
            None => self.default.clone(),
        };
        merged.validate(Some(resource))?;
        Ok(merged)
    }
}

/// Per-resource breaker configuration (§3, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// One of `strategy_names::{ERROR_RATE, SLOW_CALL_RATE, CONSECUTIVE_FAILURES}`;
    /// anything else resolves to `error_rate`.
    pub strategy: String,
    /// Minimum number of requests in the window before `error_rate`/`slow_call_rate`
    /// may trip the breaker.
    pub min_requests: u64,
    /// Fraction of failures in `[0.0, 1.0]` at or above which `error_rate` trips.
    pub error_rate_threshold: f64,
    /// Latency at or above which a call counts as slow, regardless of outcome.
    #[serde(with = "duration_millis")]
    pub slow_call_threshold: Duration,
    /// Fraction of slow calls in `[0.0, 1.0]` at or above which `slow_call_rate` trips.
    pub slow_rate_threshold: f64,
    /// Consecutive failure count at or above which `consecutive_failures` trips.
    pub consecutive_failures: u32,
    /// How long an `Open` breaker waits before admitting a `HalfOpen` probe.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Number of probe calls admitted while `HalfOpen` before closing or reopening.
    pub half_open_requests: u32,
    /// Total span of time covered by the sliding window.
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
    /// Size of each bucket in the sliding window; `window_size / bucket_size` buckets total.
    #[serde(with = "duration_millis")]
    pub bucket_size: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            strategy: strategy_names::ERROR_RATE.to_owned(),
            min_requests: 20,
            error_rate_threshold: 0.5,
            slow_call_threshold: Duration::from_secs(1),
            slow_rate_threshold: 0.5,
            consecutive_failures: 5,
            timeout: Duration::from_secs(30),
            half_open_requests: 3,
            window_size: Duration::from_secs(10),
            bucket_size: Duration::from_secs(1),
        }
    }
}

impl ResourceConfig {
    /// Number of buckets in the sliding window, `window_size / bucket_size`.
    pub fn bucket_count(&self) -> usize {
        (self.window_size.as_nanos() / self.bucket_size.as_nanos().max(1)) as usize
    }

    /// Resolves `strategy` against the known strategy names, falling back to
    /// `error_rate` for anything unrecognized.
    pub fn strategy_name(&self) -> &str {
        match self.strategy.as_str() {
            strategy_names::SLOW_CALL_RATE => strategy_names::SLOW_CALL_RATE,
            strategy_names::CONSECUTIVE_FAILURES => strategy_names::CONSECUTIVE_FAILURES,
            _ => strategy_names::ERROR_RATE,
        }
    }

    /// Per-field merge: any field on `overrides` that differs from the zero
    /// value of its type wins over `self`'s value. Non-zero-override wins, per
    /// §4.6.
    fn merge(&self, overrides: &ResourceConfig) -> ResourceConfig {
        let zero = ResourceConfig {
            strategy: String::new(),
            min_requests: 0,
            error_rate_threshold: 0.0,
            slow_call_threshold: Duration::ZERO,
            slow_rate_threshold: 0.0,
            consecutive_failures: 0,
            timeout: Duration::ZERO,
            half_open_requests: 0,
            window_size: Duration::ZERO,
            bucket_size: Duration::ZERO,
        };

        ResourceConfig {
            strategy: if overrides.strategy != zero.strategy {
                overrides.strategy.clone()
            } else {
                self.strategy.clone()
            },
            min_requests: if overrides.min_requests != zero.min_requests {
                overrides.min_requests
            } else {
                self.min_requests
            },
            error_rate_threshold: if overrides.error_rate_threshold != zero.error_rate_threshold {
                overrides.error_rate_threshold
            } else {
                self.error_rate_threshold
            },
            slow_call_threshold: if overrides.slow_call_threshold != zero.slow_call_threshold {
                overrides.slow_call_threshold
            } else {
                self.slow_call_threshold
            },
            slow_rate_threshold: if overrides.slow_rate_threshold != zero.slow_rate_threshold {
                overrides.slow_rate_threshold
            } else {
                self.slow_rate_threshold
            },
            consecutive_failures: if overrides.consecutive_failures != zero.consecutive_failures {
                overrides.consecutive_failures
            } else {
                self.consecutive_failures
            },
            timeout: if overrides.timeout != zero.timeout {
                overrides.timeout
            } else {
                self.timeout
            },
            half_open_requests: if overrides.half_open_requests != zero.half_open_requests {
                overrides.half_open_requests
            } else {
                self.half_open_requests
            },
            window_size: if overrides.window_size != zero.window_size {
                overrides.window_size
            } else {
                self.window_size
            },
            bucket_size: if overrides.bucket_size != zero.bucket_size {
                overrides.bucket_size
            } else {
                self.bucket_size
            },
        }
    }

    fn validate(&self, resource: Option<&str>) -> Result<(), ConfigError> {
        let err = |field, reason: &str| Err(ConfigError::new(resource, field, reason.to_owned()));

        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return err("error_rate_threshold", "must be within [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.slow_rate_threshold) {
            return err("slow_rate_threshold", "must be within [0.0, 1.0]");
        }
        if self.slow_call_threshold.is_zero() {
            return err("slow_call_threshold", "must be a positive duration");
        }
        if self.timeout.is_zero() {
            return err("timeout", "must be a positive duration");
        }
        if self.half_open_requests == 0 {
            return err("half_open_requests", "must be greater than zero");
        }
        if self.window_size.is_zero() || self.bucket_size.is_zero() {
            return err("window_size", "window_size and bucket_size must be positive durations");
        }
        if self.window_size < self.bucket_size {
            return err("window_size", "must be greater than or equal to bucket_size");
        }

        Ok(())
    }
}

/// Deserializes a `Duration` from a count of milliseconds, since plain
/// `serde::Deserialize` has no built-in `Duration` support and the embedder may
/// be loading this from JSON/YAML/TOML where a nested `{secs, nanos}` object is
/// awkward to author by hand.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(de)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let mut cfg = ManagerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.event_bus_buffer, DEFAULT_EVENT_BUS_BUFFER);
    }

    #[test]
    fn non_positive_buffer_falls_back_to_default() {
        let mut cfg = ManagerConfig {
            event_bus_buffer: 0,
            ..ManagerConfig::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.event_bus_buffer, DEFAULT_EVENT_BUS_BUFFER);
    }

    #[test]
    fn unknown_strategy_falls_back_to_error_rate() {
        let cfg = ResourceConfig {
            strategy: "made_up".to_owned(),
            ..ResourceConfig::default()
        };
        assert_eq!(cfg.strategy_name(), strategy_names::ERROR_RATE);
    }

    #[test]
    fn rejects_out_of_range_rate_threshold() {
        let cfg = ResourceConfig {
            error_rate_threshold: 1.5,
            ..ResourceConfig::default()
        };
        let err = cfg.validate(Some("svc")).unwrap_err();
        assert_eq!(err.field, "error_rate_threshold");
        assert_eq!(err.resource.as_deref(), Some("svc"));
    }

    #[test]
    fn rejects_window_smaller_than_bucket() {
        let cfg = ResourceConfig {
            window_size: Duration::from_millis(500),
            bucket_size: Duration::from_secs(1),
            ..ResourceConfig::default()
        };
        assert!(cfg.validate(None).is_err());
    }

    #[test]
    fn resource_override_merges_non_zero_fields_only() {
        let mut manager = ManagerConfig::default();
        manager.resources.insert(
            "svc".to_owned(),
            ResourceConfig {
                min_requests: 5,
                strategy: String::new(), // not overridden, keeps default's
                ..zeroed()
            },
        );
        manager.validate().unwrap();

        let resolved = manager.resolve("svc").unwrap();
        assert_eq!(resolved.min_requests, 5);
        assert_eq!(resolved.strategy, strategy_names::ERROR_RATE);
        assert_eq!(resolved.timeout, manager.default.timeout);
    }

    fn zeroed() -> ResourceConfig {
        ResourceConfig {
            strategy: String::new(),
            min_requests: 0,
            error_rate_threshold: 0.0,
            slow_call_threshold: Duration::ZERO,
            slow_rate_threshold: 0.0,
            consecutive_failures: 0,
            timeout: Duration::ZERO,
            half_open_requests: 0,
            window_size: Duration::ZERO,
            bucket_size: Duration::ZERO,
        }
    }

    #[test]
    fn deserializes_from_json_with_millisecond_durations() {
        let json = r#"{
            "enabled": true,
            "default": {
                "strategy": "slow_call_rate",
                "min_requests": 20,
                "timeout": 250,
                "window_size": 60000,
                "bucket_size": 1000
            },
            "resources": {
                "payments": { "min_requests": 50 }
            }
        }"#;

        let mut cfg: ManagerConfig = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();

        assert!(cfg.enabled);
        assert_eq!(cfg.default.strategy, "slow_call_rate");
        assert_eq!(cfg.default.timeout, Duration::from_millis(250));
        assert_eq!(cfg.default.window_size, Duration::from_secs(60));

        let resolved = cfg.resolve("payments").unwrap();
        assert_eq!(resolved.min_requests, 50);
        assert_eq!(resolved.strategy, "slow_call_rate");
    }
}
