//! Fire-and-forget dispatch helper shared by the sliding window's metric
//! observers and the event bus's per-listener delivery.
//!
//! Both call sites want the same thing: run a closure without letting a panic
//! inside it propagate to the caller, and prefer a tokio task over blocking the
//! caller's thread when a runtime happens to be available. Unit tests for
//! `window` and `bus` run outside any runtime, so the no-runtime branch is not
//! just a fallback, it's exercised constantly.

use std::panic::{self, AssertUnwindSafe};

pub fn spawn_or_run<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || run_catching(f));
        }
        Err(_) => run_catching(f),
    }
}

fn run_catching<F: FnOnce()>(f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        tracing::warn!(message = %message, "observer panicked during notification");
    }
}
