//! Per-resource Closed/Open/HalfOpen lifecycle (§4.1).
//!
//! A single `parking_lot::RwLock` guards state plus its bookkeeping counters, so a
//! transition and the counter update it implies are always observed together.

use parking_lot::RwLock;

use crate::clock;
use crate::config::ResourceConfig;

/// States of a breaker's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Operating normally; calls are admitted and outcomes are tracked.
    Closed,
    /// Tripped; calls are rejected until `timeout` elapses since the trip.
    Open,
    /// Probing for recovery; a limited number of calls are admitted.
    HalfOpen,
}

impl State {
    /// Stable string identifier, suitable for `tracing` fields or metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }
}

/// Outcome of a state-machine operation: whether it changed the state, and the
/// `from`/`to` pair (equal to each other when `changed` is `false`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Whether the state actually changed.
    pub changed: bool,
    /// State before the operation.
    pub from: State,
    /// State after the operation.
    pub to: State,
}

impl Transition {
    fn unchanged(state: State) -> Self {
        Transition {
            changed: false,
            from: state,
            to: state,
        }
    }

    fn to(from: State, to: State) -> Self {
        Transition {
            changed: from != to,
            from,
            to,
        }
    }
}

struct Inner {
    state: State,
    last_state_change: std::time::Instant,
    /// Advisory only in `Closed`; strategies keep their own counters where they
    /// need one (see `strategy::TripStrategy::ConsecutiveFailures`).
    failure_count: u32,
    success_count: u32,
    half_open_attempts: u32,
}

/// The state machine for a single resource. Cheap to clone (an `Arc` internally)
/// so it can be shared between a breaker and anything observing it.
pub struct StateMachine {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StateMachine")
            .field("state", &inner.state.as_str())
            .finish()
    }
}

impl StateMachine {
    /// Creates a new state machine in `Closed`.
    pub fn new() -> Self {
        StateMachine {
            inner: RwLock::new(Inner {
                state: State::Closed,
                last_state_change: clock::now(),
                failure_count: 0,
                success_count: 0,
                half_open_attempts: 0,
            }),
        }
    }

    /// Consistent read of the current state.
    pub fn current_state(&self) -> State {
        self.inner.read().state
    }

    /// Admission decision; may itself drive an Open→HalfOpen transition when the
    /// configured timeout has elapsed. See the transition table in §4.1.
    pub fn can_attempt(&self, config: &ResourceConfig) -> (bool, Transition) {
        let mut inner = self.inner.write();

        match inner.state {
            State::Closed => (true, Transition::unchanged(State::Closed)),

            State::HalfOpen => {
                if inner.half_open_attempts < config.half_open_requests {
                    inner.half_open_attempts += 1;
                    (true, Transition::unchanged(State::HalfOpen))
                } else {
                    (false, Transition::unchanged(State::HalfOpen))
                }
            }

            State::Open => {
                let elapsed = clock::now().saturating_duration_since(inner.last_state_change);
                if elapsed >= config.timeout {
                    inner.state = State::HalfOpen;
                    inner.half_open_attempts = 0;
                    inner.success_count = 0;
                    inner.last_state_change = clock::now();
                    (true, Transition::to(State::Open, State::HalfOpen))
                } else {
                    (false, Transition::unchanged(State::Open))
                }
            }
        }
    }

    /// Records a successful call. In `HalfOpen`, enough successes close the
    /// breaker; in `Closed` it only clears the advisory failure counter.
    pub fn record_success(&self, config: &ResourceConfig) -> Transition {
        let mut inner = self.inner.write();

        match inner.state {
            State::Closed => {
                inner.failure_count = 0;
                Transition::unchanged(State::Closed)
            }
            State::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= config.half_open_requests {
                    inner.state = State::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_attempts = 0;
                    inner.last_state_change = clock::now();
                    Transition::to(State::HalfOpen, State::Closed)
                } else {
                    Transition::unchanged(State::HalfOpen)
                }
            }
            State::Open => Transition::unchanged(State::Open),
        }
    }

    /// Records a failed call. In `HalfOpen` any failure reopens the breaker; in
    /// `Closed` it only bumps the advisory failure counter — tripping to `Open`
    /// is the trip strategy's call, made via `try_open`.
    pub fn record_failure(&self) -> Transition {
        let mut inner = self.inner.write();

        match inner.state {
            State::Closed => {
                inner.failure_count += 1;
                Transition::unchanged(State::Closed)
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.last_state_change = clock::now();
                inner.success_count = 0;
                inner.half_open_attempts = 0;
                Transition::to(State::HalfOpen, State::Open)
            }
            State::Open => Transition::unchanged(State::Open),
        }
    }

    /// Trips `Closed` to `Open` when `should_open` is `true`; a no-op in any
    /// other state or when `should_open` is `false`.
    pub fn try_open(&self, should_open: bool) -> Transition {
        let mut inner = self.inner.write();

        if should_open && inner.state == State::Closed {
            inner.state = State::Open;
            inner.last_state_change = clock::now();
            inner.failure_count = 0;
            Transition::to(State::Closed, State::Open)
        } else {
            Transition::unchanged(inner.state)
        }
    }

    /// Forces `Closed` and clears all counters, regardless of current state.
    pub fn reset(&self) -> Transition {
        let mut inner = self.inner.write();

        let from = inner.state;
        inner.state = State::Closed;
        inner.last_state_change = clock::now();
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_attempts = 0;

        Transition::to(from, State::Closed)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
