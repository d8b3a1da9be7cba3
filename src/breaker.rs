//! Per-resource breaker (§4.4): ties the state machine, sliding window and
//! trip strategy together behind a single `execute` entry point.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock;
use crate::config::ResourceConfig;
use crate::error::Error;
use crate::event::{Event, EventKind, EventPayload};
use crate::state_machine::{State, StateMachine, Transition};
use crate::strategy::TripStrategy;
use crate::window::{Snapshot, SlidingWindow};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of work submitted to a breaker: the resource it's charged against,
/// the call itself, an optional fallback, and advisory deadline/cancellation.
///
/// `call` and `fallback` are boxed so `Request` doesn't need a generic
/// parameter per closure type, only per `T`/`E` — the manager keeps breakers in
/// a single non-generic map and `execute` is the only place these generics
/// need to line up.
pub struct Request<'a, T, E> {
    /// Name of the resource this call is charged against.
    pub resource: Arc<str>,
    /// Advisory deadline; not enforced by the breaker itself.
    pub deadline: Option<Instant>,
    /// Advisory cancellation token; not enforced by the breaker itself.
    pub cancellation: Option<CancellationToken>,
    call: Box<dyn FnOnce() -> BoxFuture<'a, Result<T, E>> + Send + 'a>,
    fallback: Option<Box<dyn FnOnce(&Error<E>) -> BoxFuture<'a, Result<T, E>> + Send + 'a>>,
}

impl<'a, T, E> Request<'a, T, E> {
    /// Creates a new request for `resource` wrapping the async `call`.
    pub fn new<F, Fut>(resource: impl Into<Arc<str>>, call: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        Request {
            resource: resource.into(),
            deadline: None,
            cancellation: None,
            call: Box::new(move || Box::pin(call())),
            fallback: None,
        }
    }

    /// Attaches an advisory deadline to the request.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attaches an advisory cancellation token to the request.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Attaches a fallback invoked with the breaker's error when the call is
    /// rejected or fails.
    pub fn with_fallback<Fb, FbFut>(mut self, fallback: Fb) -> Self
    where
        Fb: FnOnce(&Error<E>) -> FbFut + Send + 'a,
        FbFut: Future<Output = Result<T, E>> + Send + 'a,
    {
        self.fallback = Some(Box::new(move |err| Box::pin(fallback(err))));
        self
    }

    /// Used by a disabled manager's bypass path, which runs the call directly
    /// with no breaker bookkeeping and so has no use for `resource` or
    /// `fallback`.
    pub(crate) fn into_call(self) -> Box<dyn FnOnce() -> BoxFuture<'a, Result<T, E>> + Send + 'a> {
        self.call
    }
}

impl<'a, T, E> std::fmt::Debug for Request<'a, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("resource", &self.resource)
            .field("deadline", &self.deadline)
            .field("has_fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

enum Outcome<E> {
    Failure(E),
    Timeout(E),
}

/// A single resource's breaker: owned by the manager, reached through
/// `Manager::execute`.
pub struct Breaker {
    resource: Arc<str>,
    config: ResourceConfig,
    state_machine: Arc<StateMachine>,
    window: Arc<SlidingWindow>,
    strategy: TripStrategy,
    event_bus: EventBus,
}

impl std::fmt::Debug for Breaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Breaker")
            .field("resource", &self.resource)
            .field("state", &self.state_machine.current_state())
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

impl Breaker {
    /// Constructs a breaker for `resource` from its resolved configuration.
    pub fn new(resource: Arc<str>, config: ResourceConfig, event_bus: EventBus) -> Self {
        let state_machine = Arc::new(StateMachine::new());
        let state_source = {
            let state_machine = state_machine.clone();
            Arc::new(move || state_machine.current_state())
        };
        let window = Arc::new(SlidingWindow::new(
            resource.clone(),
            config.bucket_count(),
            config.bucket_size,
            config.window_size,
            config.slow_call_threshold,
            state_source,
        ));
        let strategy = TripStrategy::from_name(config.strategy_name());

        Breaker {
            resource,
            config,
            state_machine,
            window,
            strategy,
            event_bus,
        }
    }

    /// Name of the resource this breaker guards.
    pub fn resource(&self) -> &Arc<str> {
        &self.resource
    }

    /// Current admission state.
    pub fn state(&self) -> State {
        self.state_machine.current_state()
    }

    /// Snapshot of the sliding window's current metrics.
    pub fn metrics(&self) -> Snapshot {
        self.window.snapshot()
    }

    /// Subscribes `observer` to metrics snapshots, returning a subscription id.
    pub fn subscribe_metrics(&self, observer: Arc<dyn Fn(&Snapshot) + Send + Sync>) -> u64 {
        self.window.subscribe(observer)
    }

    /// Removes a subscription previously returned by `subscribe_metrics`.
    pub fn unsubscribe_metrics(&self, id: u64) {
        self.window.unsubscribe(id)
    }

    /// Clears the window and state machine; publishes `StateChanged` with
    /// reason `"manual reset"` if the state actually moved, so subscribed
    /// dashboards don't keep showing a stale `Open`/`HalfOpen`.
    pub fn reset(&self) {
        let transition = self.state_machine.reset();
        self.window.reset();
        if transition.changed {
            self.publish_state_changed(transition, "manual reset");
        }
    }

    /// Runs `request` through this breaker's admission check, classification
    /// and metrics recording, invoking its fallback (if any) on rejection or
    /// failure.
    pub async fn execute<'a, T, E>(&self, request: Request<'a, T, E>) -> Result<T, Error<E>>
    where
        E: std::fmt::Display,
    {
        let (permitted, admission_transition) = self.state_machine.can_attempt(&self.config);
        if admission_transition.changed {
            self.publish_state_changed(admission_transition, "half-open probe window opened");
        }

        if !permitted {
            self.window.record_rejection();
            let state = self.state_machine.current_state();
            self.event_bus.publish(Event::new(
                EventKind::CallRejected,
                self.resource.clone(),
                EventPayload::Rejected { state },
            ));
            let err = if state == State::HalfOpen {
                Error::TooManyRequests
            } else {
                Error::Rejected
            };
            return self.run_fallback(err, request.fallback).await;
        }

        let start = clock::now();
        let result = (request.call)().await;
        let latency = clock::now().saturating_duration_since(start);

        let outcome = match result {
            Ok(value) => {
                self.record_success(latency);
                return Ok(value);
            }
            Err(err) => {
                let cancelled = request
                    .cancellation
                    .as_ref()
                    .map(|token| token.is_cancelled())
                    .unwrap_or(false);
                let deadline_passed = request
                    .deadline
                    .map(|deadline| clock::now() >= deadline)
                    .unwrap_or(false);

                if cancelled || deadline_passed {
                    Outcome::Timeout(err)
                } else {
                    Outcome::Failure(err)
                }
            }
        };

        let err = self.record_failure_outcome(outcome, latency);
        self.run_fallback(Error::Inner(err), request.fallback).await
    }

    fn record_success(&self, latency: std::time::Duration) {
        self.window.record_success(latency);
        self.event_bus.publish(Event::new(
            EventKind::CallSuccess,
            self.resource.clone(),
            EventPayload::CallOutcome {
                latency,
                classification: None,
            },
        ));
        self.strategy.record_success();
        let transition = self.state_machine.record_success(&self.config);
        if transition.changed {
            self.publish_state_changed(transition, "half-open probes succeeded");
        }
    }

    /// Returns the original error so the caller can wrap and surface it.
    fn record_failure_outcome<E: std::fmt::Display>(
        &self,
        outcome: Outcome<E>,
        latency: std::time::Duration,
    ) -> E {
        let (err, kind, classification) = match outcome {
            Outcome::Failure(err) => {
                let classification = err.to_string();
                (err, EventKind::CallFailure, Some(classification))
            }
            Outcome::Timeout(err) => (err, EventKind::CallTimeout, None),
        };

        match kind {
            EventKind::CallTimeout => self.window.record_timeout(latency),
            _ => self
                .window
                .record_failure(latency, classification.as_deref().unwrap_or("unknown")),
        }

        self.event_bus.publish(Event::new(
            kind,
            self.resource.clone(),
            EventPayload::CallOutcome {
                latency,
                classification: classification.clone(),
            },
        ));

        self.strategy.record_failure();
        let transition = self.state_machine.record_failure();
        if transition.changed {
            self.publish_state_changed(transition, "half-open probe failed");
        } else {
            let snapshot = self.window.snapshot();
            if self.strategy.should_open(&snapshot, &self.config) {
                let trip = self.state_machine.try_open(true);
                if trip.changed {
                    self.publish_state_changed(trip, "error threshold exceeded");
                    self.event_bus.publish(Event::new(
                        EventKind::ThresholdExceeded,
                        self.resource.clone(),
                        EventPayload::StateChanged {
                            from: trip.from,
                            to: trip.to,
                            reason: "error threshold exceeded",
                            snapshot,
                        },
                    ));
                }
            }
        }

        err
    }

    async fn run_fallback<'a, T, E>(
        &self,
        err: Error<E>,
        fallback: Option<Box<dyn FnOnce(&Error<E>) -> BoxFuture<'a, Result<T, E>> + Send + 'a>>,
    ) -> Result<T, Error<E>> {
        match fallback {
            None => Err(err),
            Some(fallback) => match fallback(&err).await {
                Ok(value) => {
                    self.event_bus.publish(Event::new(
                        EventKind::FallbackSuccess,
                        self.resource.clone(),
                        EventPayload::Fallback { succeeded: true },
                    ));
                    Ok(value)
                }
                Err(fallback_err) => {
                    self.event_bus.publish(Event::new(
                        EventKind::FallbackFailure,
                        self.resource.clone(),
                        EventPayload::Fallback { succeeded: false },
                    ));
                    Err(Error::Inner(fallback_err))
                }
            },
        }
    }

    fn publish_state_changed(&self, transition: Transition, reason: &'static str) {
        let snapshot = self.window.snapshot();
        self.event_bus.publish(Event::new(
            EventKind::StateChanged,
            self.resource.clone(),
            EventPayload::StateChanged {
                from: transition.from,
                to: transition.to,
                reason,
                snapshot,
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn breaker(config: ResourceConfig) -> Breaker {
        Breaker::new(Arc::from("svc"), config, EventBus::new(64))
    }

    fn fast_trip_config() -> ResourceConfig {
        ResourceConfig {
            min_requests: 2,
            error_rate_threshold: 0.5,
            timeout: Duration::from_millis(10),
            half_open_requests: 1,
            window_size: Duration::from_secs(10),
            bucket_size: Duration::from_secs(1),
            ..ResourceConfig::default()
        }
    }

    #[tokio::test]
    async fn successful_calls_keep_breaker_closed() {
        let b = breaker(ResourceConfig::default());
        let req: Request<'_, u32, &str> = Request::new("svc", || async { Ok(42) });
        let result = b.execute(req).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(b.state(), State::Closed);
    }

    #[tokio::test]
    async fn enough_failures_trip_the_breaker() {
        let b = breaker(fast_trip_config());

        for _ in 0..2 {
            let req: Request<'_, u32, &str> = Request::new("svc", || async { Err("boom") });
            let _ = b.execute(req).await;
        }

        assert_eq!(b.state(), State::Open);
    }

    #[tokio::test]
    async fn open_breaker_rejects_and_runs_fallback() {
        let b = breaker(fast_trip_config());
        for _ in 0..2 {
            let req: Request<'_, u32, &str> = Request::new("svc", || async { Err("boom") });
            let _ = b.execute(req).await;
        }
        assert_eq!(b.state(), State::Open);

        let req: Request<'_, u32, &str> = Request::new("svc", || async { Ok(1) })
            .with_fallback(|_err| async { Ok::<u32, &str>(99) });
        let result = b.execute(req).await;
        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn rejection_without_fallback_is_distinguishable_from_inner_error() {
        let b = breaker(fast_trip_config());
        for _ in 0..2 {
            let req: Request<'_, u32, &str> = Request::new("svc", || async { Err("boom") });
            let _ = b.execute(req).await;
        }

        let req: Request<'_, u32, &str> = Request::new("svc", || async { Ok(1) });
        let err = b.execute(req).await.unwrap_err();
        assert!(err.is_rejected());
        assert!(matches!(err, Error::Rejected));
    }

    #[tokio::test]
    async fn cancellation_token_fired_during_call_classifies_as_timeout() {
        let b = breaker(fast_trip_config());
        let token = CancellationToken::new();
        token.cancel();

        let req: Request<'_, u32, &str> = Request::new("svc", || async { Err("deadline exceeded") })
            .with_cancellation(token);
        let _ = b.execute(req).await;

        let snapshot = b.metrics();
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.failures, 0);
    }

    #[tokio::test]
    async fn reset_clears_metrics_and_state() {
        let b = breaker(fast_trip_config());
        for _ in 0..2 {
            let req: Request<'_, u32, &str> = Request::new("svc", || async { Err("boom") });
            let _ = b.execute(req).await;
        }
        assert_eq!(b.state(), State::Open);

        b.reset();
        assert_eq!(b.state(), State::Closed);
        assert_eq!(b.metrics().total_requests, 0);
    }
}
