//! Event vocabulary published by a breaker and consumed through the manager's
//! event bus (§3, §4.5).

use std::sync::Arc;
use std::time::Instant;

use crate::state_machine::State;
use crate::window::Snapshot;

/// Tag identifying an [`Event`]'s payload, used both for subscription filtering
/// and as a stable string for `tracing` fields (`as_str`, mirroring
/// `State::as_str`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The breaker's state machine transitioned.
    StateChanged,
    /// A call completed successfully.
    CallSuccess,
    /// A call completed with an error.
    CallFailure,
    /// A call exceeded the slow-call threshold.
    CallTimeout,
    /// A call was rejected by the breaker's admission check.
    CallRejected,
    /// A fallback invoked after rejection/failure succeeded.
    FallbackSuccess,
    /// A fallback invoked after rejection/failure itself failed.
    FallbackFailure,
    /// Reserved for a future early-warning signal (e.g. approaching but not yet
    /// past a trip threshold); this crate never publishes it today.
    ThresholdWarning,
    /// Published alongside `StateChanged` when a trip strategy causes a
    /// Closed -> Open transition.
    ThresholdExceeded,
}

impl EventKind {
    /// Stable string form, used as a `tracing` field value.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChanged => "state_changed",
            EventKind::CallSuccess => "call_success",
            EventKind::CallFailure => "call_failure",
            EventKind::CallTimeout => "call_timeout",
            EventKind::CallRejected => "call_rejected",
            EventKind::FallbackSuccess => "fallback_success",
            EventKind::FallbackFailure => "fallback_failure",
            EventKind::ThresholdWarning => "threshold_warning",
            EventKind::ThresholdExceeded => "threshold_exceeded",
        }
    }
}

/// Kind-specific data carried by an [`Event`].
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Payload for [`EventKind::StateChanged`].
    StateChanged {
        /// State transitioned from.
        from: State,
        /// State transitioned to.
        to: State,
        /// Human-readable reason for the transition.
        reason: &'static str,
        /// Window snapshot taken at the moment of transition.
        snapshot: Snapshot,
    },
    /// Payload for [`EventKind::CallSuccess`], [`EventKind::CallFailure`] and
    /// [`EventKind::CallTimeout`].
    CallOutcome {
        /// How long the call took.
        latency: std::time::Duration,
        /// Caller-supplied failure classification, if any.
        classification: Option<String>,
    },
    /// Payload for [`EventKind::CallRejected`].
    Rejected {
        /// State that caused the rejection.
        state: State,
    },
    /// Payload for [`EventKind::FallbackSuccess`] and
    /// [`EventKind::FallbackFailure`].
    Fallback {
        /// Whether the fallback call succeeded.
        succeeded: bool,
    },
}

/// A single published occurrence. Cheap to clone: the only heap data is the
/// resource name (`Arc<str>`), an optional classification string, and a
/// snapshot for `StateChanged`.
#[derive(Debug, Clone)]
pub struct Event {
    /// The kind of occurrence this event represents.
    pub kind: EventKind,
    /// Resource the occurrence is charged against.
    pub resource: Arc<str>,
    /// When the occurrence happened.
    pub at: Instant,
    /// Kind-specific data.
    pub payload: EventPayload,
}

impl Event {
    /// Constructs an event stamped with the current time.
    pub fn new(kind: EventKind, resource: Arc<str>, payload: EventPayload) -> Self {
        Event {
            kind,
            resource,
            at: crate::clock::now(),
            payload,
        }
    }
}
