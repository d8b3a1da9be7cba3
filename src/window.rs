//! Bucketed sliding-window metrics collector (§4.2).
//!
//! The ring holds `bucket_count` buckets of `bucket_size` each; a rotation lock
//! guards the cursor/`last_rotate` pair (advanced by every recording call and by
//! `snapshot`), and each bucket has its own lock so concurrent writers touching
//! different buckets never contend. The rotate/expire arithmetic (buckets
//! overwritten one at a time as the cursor advances, or all at once past a full
//! window) is the same protocol as a single ring of sums, generalized here into
//! a ring of richer per-slice records that also carry latency samples and an
//! error-type histogram.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::clock;
use crate::state_machine::State;

/// Immutable aggregate view of a window at the moment `snapshot()` was taken.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Resource this snapshot belongs to.
    pub resource: Arc<str>,
    /// Breaker state at the moment the snapshot was taken.
    pub state: State,
    /// Start of the time range covered by this snapshot.
    pub window_start: Instant,
    /// End of the time range covered by this snapshot.
    pub window_end: Instant,

    /// Total calls recorded in the window.
    pub total_requests: u64,
    /// Calls that succeeded.
    pub successes: u64,
    /// Calls that failed.
    pub failures: u64,
    /// Calls that timed out.
    pub timeouts: u64,
    /// Calls rejected by the breaker.
    pub rejections: u64,

    /// Fraction of recorded calls that succeeded.
    pub success_rate: f64,
    /// Fraction of recorded calls that failed.
    pub error_rate: f64,
    /// Fraction of recorded calls that timed out.
    pub timeout_rate: f64,

    /// Mean latency across recorded calls.
    pub avg_latency: Duration,
    /// Median latency.
    pub p50: Duration,
    /// 95th-percentile latency.
    pub p95: Duration,
    /// 99th-percentile latency.
    pub p99: Duration,
    /// Highest recorded latency.
    pub max_latency: Duration,

    /// Calls at or above the slow-call threshold.
    pub slow_calls: u64,
    /// Fraction of recorded calls that were slow.
    pub slow_call_rate: f64,

    /// Failure counts grouped by caller-supplied classification.
    pub error_types: HashMap<String, u64>,
}

impl Snapshot {
    /// A snapshot with no observations, used for the `enabled=false` manager path
    /// and freshly-reset breakers.
    pub fn empty(resource: Arc<str>, state: State, now: Instant, window_size: Duration) -> Self {
        Snapshot {
            resource,
            state,
            window_start: now.checked_sub(window_size).unwrap_or(now),
            window_end: now,
            total_requests: 0,
            successes: 0,
            failures: 0,
            timeouts: 0,
            rejections: 0,
            success_rate: 0.0,
            error_rate: 0.0,
            timeout_rate: 0.0,
            avg_latency: Duration::ZERO,
            p50: Duration::ZERO,
            p95: Duration::ZERO,
            p99: Duration::ZERO,
            max_latency: Duration::ZERO,
            slow_calls: 0,
            slow_call_rate: 0.0,
            error_types: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct BucketData {
    start_time: Instant,
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejections: u64,
    latencies: Vec<Duration>,
    error_types: HashMap<String, u64>,
}

impl BucketData {
    fn new(start_time: Instant) -> Self {
        BucketData {
            start_time,
            successes: 0,
            failures: 0,
            timeouts: 0,
            rejections: 0,
            latencies: Vec::new(),
            error_types: HashMap::new(),
        }
    }
}

struct Cursor {
    index: usize,
    last_rotate: Instant,
}

type Observer = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// A resource's sliding-window metrics collector.
pub struct SlidingWindow {
    resource: Arc<str>,
    state_source: Arc<dyn Fn() -> State + Send + Sync>,
    buckets: Vec<Mutex<BucketData>>,
    cursor: RwLock<Cursor>,
    bucket_size: Duration,
    window_size: Duration,
    slow_call_threshold: Duration,
    observers: RwLock<Vec<(u64, Observer)>>,
    next_observer_id: AtomicU64,
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("resource", &self.resource)
            .field("bucket_count", &self.buckets.len())
            .finish()
    }
}

impl SlidingWindow {
    /// `state_source` lets the window fill in `Snapshot::state` without owning
    /// the state machine — the breaker passes a closure over the `Arc` it already
    /// holds, so there's no ownership cycle between window and state machine.
    pub fn new(
        resource: Arc<str>,
        bucket_count: usize,
        bucket_size: Duration,
        window_size: Duration,
        slow_call_threshold: Duration,
        state_source: Arc<dyn Fn() -> State + Send + Sync>,
    ) -> Self {
        let bucket_count = bucket_count.max(1);
        let now = clock::now();
        let buckets = (0..bucket_count)
            .map(|_| Mutex::new(BucketData::new(now)))
            .collect();

        SlidingWindow {
            resource,
            state_source,
            buckets,
            cursor: RwLock::new(Cursor {
                index: 0,
                last_rotate: now,
            }),
            bucket_size,
            window_size,
            slow_call_threshold,
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.rotate();
        let idx = self.cursor.read().index;
        {
            let mut bucket = self.buckets[idx].lock();
            bucket.successes += 1;
            bucket.latencies.push(latency);
        }
        self.notify();
    }

    pub fn record_failure(&self, latency: Duration, classification: &str) {
        self.rotate();
        let idx = self.cursor.read().index;
        {
            let mut bucket = self.buckets[idx].lock();
            bucket.failures += 1;
            bucket.latencies.push(latency);
            *bucket.error_types.entry(classification.to_owned()).or_insert(0) += 1;
        }
        self.notify();
    }

    pub fn record_timeout(&self, latency: Duration) {
        self.rotate();
        let idx = self.cursor.read().index;
        {
            let mut bucket = self.buckets[idx].lock();
            bucket.timeouts += 1;
            bucket.latencies.push(latency);
        }
        self.notify();
    }

    /// Rejections are bucketed but excluded from `total_requests` (§4.2): they
    /// describe traffic the breaker itself refused, not the downstream's
    /// behavior, and must not feed the trip strategy.
    pub fn record_rejection(&self) {
        self.rotate();
        let idx = self.cursor.read().index;
        {
            let mut bucket = self.buckets[idx].lock();
            bucket.rejections += 1;
        }
        self.notify();
    }

    /// Rotates, then aggregates every live bucket into a `Snapshot`.
    pub fn snapshot(&self) -> Snapshot {
        self.rotate();

        let now = clock::now();
        let mut successes = 0u64;
        let mut failures = 0u64;
        let mut timeouts = 0u64;
        let mut rejections = 0u64;
        let mut latencies: Vec<Duration> = Vec::new();
        let mut error_types: HashMap<String, u64> = HashMap::new();

        for bucket in &self.buckets {
            let bucket = bucket.lock();
            successes += bucket.successes;
            failures += bucket.failures;
            timeouts += bucket.timeouts;
            rejections += bucket.rejections;
            latencies.extend_from_slice(&bucket.latencies);
            for (kind, count) in &bucket.error_types {
                *error_types.entry(kind.clone()).or_insert(0) += count;
            }
        }

        latencies.sort_unstable();

        let total_requests = successes + failures + timeouts;
        let rate = |n: u64| {
            if total_requests > 0 {
                n as f64 / total_requests as f64
            } else {
                0.0
            }
        };

        let n = latencies.len();
        let percentile = |p: f64| -> Duration {
            if n == 0 {
                Duration::ZERO
            } else {
                let idx = ((n as f64) * p).floor() as usize;
                latencies[idx.min(n - 1)]
            }
        };
        let avg_latency = if n == 0 {
            Duration::ZERO
        } else {
            latencies.iter().sum::<Duration>() / n as u32
        };
        let max_latency = latencies.last().copied().unwrap_or(Duration::ZERO);
        let slow_calls = latencies.iter().filter(|d| **d >= self.slow_call_threshold).count() as u64;

        Snapshot {
            resource: self.resource.clone(),
            state: (self.state_source)(),
            window_start: now.checked_sub(self.window_size).unwrap_or(now),
            window_end: now,
            total_requests,
            successes,
            failures,
            timeouts,
            rejections,
            success_rate: rate(successes),
            error_rate: rate(failures),
            timeout_rate: rate(timeouts),
            avg_latency,
            p50: percentile(0.50),
            p95: percentile(0.95),
            p99: percentile(0.99),
            max_latency,
            slow_calls,
            slow_call_rate: rate(slow_calls),
            error_types,
        }
    }

    /// Clears every bucket and resets the cursor; used by `Breaker::reset`.
    pub fn reset(&self) {
        let now = clock::now();
        let mut cursor = self.cursor.write();
        for bucket in &self.buckets {
            *bucket.lock() = BucketData::new(now);
        }
        cursor.index = 0;
        cursor.last_rotate = now;
    }

    /// Registers an observer notified (best-effort, asynchronously where a tokio
    /// runtime is available) after every recording call. Returns a stable id
    /// derived from a monotonic counter, never from wall-clock time.
    pub fn subscribe(&self, observer: Observer) -> u64 {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.observers.write().retain(|(existing, _)| *existing != id);
    }

    fn rotate(&self) {
        let now = clock::now();
        let bucket_count = self.buckets.len();
        let mut cursor = self.cursor.write();

        let elapsed = now.saturating_duration_since(cursor.last_rotate);
        let bucket_nanos = self.bucket_size.as_nanos().max(1);
        let rotations = (elapsed.as_nanos() / bucket_nanos) as u64;

        if rotations == 0 {
            return;
        }

        if rotations as usize >= bucket_count {
            for bucket in &self.buckets {
                *bucket.lock() = BucketData::new(now);
            }
            cursor.index = 0;
        } else {
            for step in 1..=rotations as usize {
                let idx = (cursor.index + step) % bucket_count;
                *self.buckets[idx].lock() = BucketData::new(now);
            }
            cursor.index = (cursor.index + rotations as usize) % bucket_count;
        }

        cursor.last_rotate = now;
    }

    fn notify(&self) {
        // Copy the listener list under lock, then deliver outside of it, so an
        // observer that calls `unsubscribe` (synchronously, when no tokio runtime
        // is driving delivery) doesn't deadlock against this same lock.
        let observers: Vec<Observer> = {
            let guard = self.observers.read();
            if guard.is_empty() {
                return;
            }
            guard.iter().map(|(_, observer)| observer.clone()).collect()
        };

        // `notify` is always called right after a recording call already rotated
        // the ring, so this second `rotate()` inside `snapshot` is a no-op.
        let snapshot = self.snapshot();
        for observer in observers {
            let snapshot = snapshot.clone();
            crate::rt::spawn_or_run(move || {
                observer(&snapshot);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(bucket_count: usize, bucket_size: Duration, window_size: Duration) -> SlidingWindow {
        SlidingWindow::new(
            Arc::from("svc"),
            bucket_count,
            bucket_size,
            window_size,
            Duration::from_millis(100),
            Arc::new(|| State::Closed),
        )
    }

    #[test]
    fn aggregates_successes_and_failures() {
        let w = window(5, Duration::from_secs(1), Duration::from_secs(5));
        w.record_success(Duration::from_millis(10));
        w.record_success(Duration::from_millis(20));
        w.record_failure(Duration::from_millis(30), "boom");

        let snap = w.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successes, 2);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.rejections, 0);
        assert_eq!(snap.error_types.get("boom"), Some(&1));
    }

    #[test]
    fn rejections_excluded_from_total_requests() {
        let w = window(5, Duration::from_secs(1), Duration::from_secs(5));
        w.record_rejection();
        w.record_rejection();
        w.record_success(Duration::from_millis(1));

        let snap = w.snapshot();
        assert_eq!(snap.rejections, 2);
        assert_eq!(snap.total_requests, 1);
    }

    #[test]
    fn percentiles_are_ordered() {
        let w = window(5, Duration::from_secs(1), Duration::from_secs(5));
        for ms in [5, 10, 15, 20, 1000] {
            w.record_success(Duration::from_millis(ms));
        }
        let snap = w.snapshot();
        assert!(snap.p50 <= snap.p95);
        assert!(snap.p95 <= snap.p99);
        assert!(snap.p99 <= snap.max_latency);
        assert_eq!(snap.max_latency, Duration::from_millis(1000));
    }

    #[test]
    fn slow_calls_counted_by_latency_regardless_of_outcome() {
        let w = window(5, Duration::from_secs(1), Duration::from_secs(5));
        w.record_success(Duration::from_millis(200));
        w.record_timeout(Duration::from_millis(150));
        w.record_failure(Duration::from_millis(5), "fast failure");

        let snap = w.snapshot();
        assert_eq!(snap.slow_calls, 2);
        assert_eq!(snap.total_requests, 3);
    }

    #[test]
    fn rotation_drops_old_buckets_out_of_window() {
        clock::freeze(|time| {
            let w = window(3, Duration::from_secs(1), Duration::from_secs(3));
            w.record_success(Duration::from_millis(1));
            assert_eq!(w.snapshot().total_requests, 1);

            time.advance(Duration::from_secs(1));
            w.record_success(Duration::from_millis(1));
            assert_eq!(w.snapshot().total_requests, 2);

            // Advancing past the whole window clears every bucket.
            time.advance(Duration::from_secs(10));
            assert_eq!(w.snapshot().total_requests, 0);
        });
    }

    #[test]
    fn reset_clears_all_counters() {
        let w = window(3, Duration::from_secs(1), Duration::from_secs(3));
        w.record_success(Duration::from_millis(1));
        w.record_failure(Duration::from_millis(1), "x");
        w.reset();
        assert_eq!(w.snapshot().total_requests, 0);
    }

    #[test]
    fn unsubscribe_stops_future_notifications() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let w = window(3, Duration::from_secs(1), Duration::from_secs(3));
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = w.subscribe(Arc::new(move |_snap: &Snapshot| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        w.record_success(Duration::from_millis(1));
        w.unsubscribe(id);
        w.record_success(Duration::from_millis(1));

        // No tokio runtime in this test, so delivery is synchronous; exactly one
        // notification should have landed before unsubscribe took effect.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
