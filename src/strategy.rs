//! Trip strategies (§4.3): decide whether a `Closed` breaker should trip to
//! `Open` given the current window snapshot.
//!
//! Modeled as a closed enum rather than a trait object — the strategy set is
//! small, fixed, and known at compile time, and only `consecutive_failures`
//! needs mutable state, so a `dyn Trait` would buy nothing beyond indirection.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::{strategy_names, ResourceConfig};
use crate::window::Snapshot;

/// A trip strategy bound to one resource's breaker.
#[derive(Debug)]
pub enum TripStrategy {
    /// Trips on the fraction of failed calls in the window.
    ErrorRate,
    /// Trips on the fraction of slow calls in the window.
    SlowCallRate,
    /// Holds its own counter; `should_open` never touches the window ring.
    ConsecutiveFailures(AtomicU32),
}

impl TripStrategy {
    /// Resolves a configured strategy name, defaulting unknown names to
    /// `error_rate` (mirrors `ResourceConfig::strategy_name`).
    pub fn from_name(name: &str) -> Self {
        match name {
            strategy_names::SLOW_CALL_RATE => TripStrategy::SlowCallRate,
            strategy_names::CONSECUTIVE_FAILURES => TripStrategy::ConsecutiveFailures(AtomicU32::new(0)),
            _ => TripStrategy::ErrorRate,
        }
    }

    /// The strategy's configured name, as accepted by `strategy_names`.
    pub fn name(&self) -> &'static str {
        match self {
            TripStrategy::ErrorRate => strategy_names::ERROR_RATE,
            TripStrategy::SlowCallRate => strategy_names::SLOW_CALL_RATE,
            TripStrategy::ConsecutiveFailures(_) => strategy_names::CONSECUTIVE_FAILURES,
        }
    }

    /// `error_rate` and `slow_call_rate` read the snapshot directly;
    /// `consecutive_failures` ignores it and reads its own counter.
    pub fn should_open(&self, snapshot: &Snapshot, config: &ResourceConfig) -> bool {
        match self {
            TripStrategy::ErrorRate => {
                snapshot.total_requests >= config.min_requests
                    && snapshot.error_rate >= config.error_rate_threshold
            }
            TripStrategy::SlowCallRate => {
                snapshot.total_requests >= config.min_requests
                    && snapshot.slow_call_rate >= config.slow_rate_threshold
            }
            TripStrategy::ConsecutiveFailures(counter) => {
                counter.load(Ordering::Acquire) >= config.consecutive_failures
            }
        }
    }

    /// Only meaningful for `ConsecutiveFailures`; a no-op for the others.
    pub fn record_success(&self) {
        if let TripStrategy::ConsecutiveFailures(counter) = self {
            counter.store(0, Ordering::Release);
        }
    }

    /// Only meaningful for `ConsecutiveFailures`; a no-op for the others.
    pub fn record_failure(&self) {
        if let TripStrategy::ConsecutiveFailures(counter) = self {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }
}
