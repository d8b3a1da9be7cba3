//! Top-level entry point (§4.6): owns the event bus and lazily creates one
//! breaker per resource name the first time it's used.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::breaker::{Breaker, Request};
use crate::bus::EventBus;
use crate::config::ManagerConfig;
use crate::error::{ConfigError, Error};
use crate::state_machine::State;
use crate::window::Snapshot;

/// Owns the event bus and the per-resource breaker map. Not cloneable itself —
/// an embedder sharing one across tasks wraps it in `Arc` explicitly rather
/// than relying on an internal one.
pub struct Manager {
    config: ManagerConfig,
    event_bus: Option<EventBus>,
    breakers: RwLock<HashMap<Arc<str>, Arc<Breaker>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("enabled", &self.config.enabled)
            .field("resources", &self.breakers.read().len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Validates `config` and constructs a manager. When `config.enabled` is
    /// `false` no event bus is created; `execute` then forwards calls directly
    /// with no breaker bookkeeping.
    pub fn new(mut config: ManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let event_bus = if config.enabled {
            Some(EventBus::new(config.event_bus_buffer))
        } else {
            None
        };

        Ok(Manager {
            config,
            event_bus,
            breakers: RwLock::new(HashMap::new()),
        })
    }

    /// Whether this manager is performing breaker bookkeeping, per its config.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The manager's event bus, or `None` when disabled.
    pub fn event_bus(&self) -> Option<&EventBus> {
        self.event_bus.as_ref()
    }

    /// Runs `request` through the named resource's breaker, creating it on
    /// first use. When the manager is disabled, calls the request's function
    /// directly and never classifies, records, or publishes anything.
    pub async fn execute<'a, T, E>(&self, request: Request<'a, T, E>) -> Result<T, Error<E>>
    where
        E: std::fmt::Display,
    {
        if !self.config.enabled {
            return direct_call(request).await;
        }

        let resource = request.resource.clone();
        let breaker = self.get_or_create_breaker(&resource)?;
        breaker.execute(request).await
    }

    /// Current state of `resource`'s breaker, or `None` if it hasn't been
    /// created yet.
    pub fn state(&self, resource: &str) -> Option<State> {
        self.breakers.read().get(resource).map(|b| b.state())
    }

    /// Returns an empty snapshot for a disabled manager or an unknown
    /// resource, never `None` — callers querying metrics for a resource they
    /// haven't called yet get a well-formed zero-valued view rather than an
    /// `Option` to unwrap.
    pub fn metrics(&self, resource: &str) -> Snapshot {
        match self.breakers.read().get(resource) {
            Some(breaker) => breaker.metrics(),
            None => Snapshot::empty(
                Arc::from(resource),
                State::Closed,
                crate::clock::now(),
                self.config.default.window_size,
            ),
        }
    }

    /// Subscribes to a resource's metrics snapshots, creating its breaker if it
    /// doesn't exist yet (consistent with `execute`'s lazy-creation contract).
    /// Returns `None` when the manager is disabled: there is no breaker, and
    /// will never be one, for the observer to attach to.
    pub fn subscribe_metrics(
        &self,
        resource: &str,
        observer: Arc<dyn Fn(&Snapshot) + Send + Sync>,
    ) -> Result<Option<u64>, ConfigError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let breaker = self.get_or_create_breaker(resource)?;
        Ok(Some(breaker.subscribe_metrics(observer)))
    }

    /// Resets `resource`'s breaker, if it has been created. A no-op for an
    /// unknown resource.
    pub fn reset(&self, resource: &str) {
        if let Some(breaker) = self.breakers.read().get(resource) {
            breaker.reset();
        }
    }

    /// Closes the event bus. Breakers themselves hold no reclaimable resources
    /// beyond observer subscriptions, so nothing else needs tearing down.
    pub fn close(&self) {
        if let Some(bus) = &self.event_bus {
            bus.close();
        }
    }

    fn get_or_create_breaker(&self, resource: &str) -> Result<Arc<Breaker>, ConfigError> {
        if let Some(breaker) = self.breakers.read().get(resource) {
            return Ok(breaker.clone());
        }

        let mut breakers = self.breakers.write();
        // Re-check: another writer may have created it between the read-lock
        // release above and acquiring the write lock here.
        if let Some(breaker) = breakers.get(resource) {
            return Ok(breaker.clone());
        }

        let resolved = self.config.resolve(resource)?;
        let resource_name: Arc<str> = Arc::from(resource);
        let event_bus = self
            .event_bus
            .clone()
            .expect("breakers are only created while enabled");
        let breaker = Arc::new(Breaker::new(resource_name.clone(), resolved, event_bus));
        breakers.insert(resource_name, breaker.clone());
        Ok(breaker)
    }
}

async fn direct_call<'a, T, E>(request: Request<'a, T, E>) -> Result<T, Error<E>> {
    request.into_call()().await.map_err(Error::Inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ResourceConfig;

    fn enabled_config() -> ManagerConfig {
        ManagerConfig {
            enabled: true,
            default: ResourceConfig {
                min_requests: 2,
                error_rate_threshold: 0.5,
                timeout: Duration::from_millis(10),
                half_open_requests: 1,
                window_size: Duration::from_secs(10),
                bucket_size: Duration::from_secs(1),
                ..ResourceConfig::default()
            },
            ..ManagerConfig::default()
        }
    }

    #[tokio::test]
    async fn disabled_manager_bypasses_breaker_bookkeeping() {
        let manager = Manager::new(ManagerConfig::default()).unwrap();
        let req: Request<'_, u32, &str> = Request::new("svc", || async { Ok(7) });
        assert_eq!(manager.execute(req).await.unwrap(), 7);
        assert_eq!(manager.metrics("svc").total_requests, 0);
    }

    #[tokio::test]
    async fn enabled_manager_creates_breaker_lazily_and_isolates_resources() {
        let manager = Manager::new(enabled_config()).unwrap();

        for _ in 0..2 {
            let req: Request<'_, u32, &str> = Request::new("a", || async { Err("boom") });
            let _ = manager.execute(req).await;
        }
        assert_eq!(manager.state("a"), Some(State::Open));

        let req: Request<'_, u32, &str> = Request::new("b", || async { Ok(1) });
        assert!(manager.execute(req).await.is_ok());
        assert_eq!(manager.state("b"), Some(State::Closed));
    }

    #[tokio::test]
    async fn unknown_resource_reports_zero_snapshot_without_creating_a_breaker() {
        let manager = Manager::new(enabled_config()).unwrap();
        let snapshot = manager.metrics("never-called");
        assert_eq!(snapshot.total_requests, 0);
        assert!(manager.state("never-called").is_none());
    }

    #[tokio::test]
    async fn invalid_config_fails_construction() {
        let mut cfg = ManagerConfig::default();
        cfg.default.error_rate_threshold = 5.0;
        assert!(Manager::new(cfg).is_err());
    }
}
