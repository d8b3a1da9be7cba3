//! Per-resource circuit breakers with a sliding-window metrics collector and an
//! async event bus, for isolating failures in one downstream dependency from
//! the rest of a service.
//!
//! # Links
//!
//! * The state machine driving admission decisions: [state_machine::StateMachine].
//! * More about circuit breakers: <https://martinfowler.com/bliki/CircuitBreaker.html>
//!
//! # Example
//!
//! ```no_run
//! use circuitry::{Manager, ManagerConfig, Request};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::new(ManagerConfig {
//!     enabled: true,
//!     ..ManagerConfig::default()
//! })?;
//!
//! let request: Request<'_, String, reqwest::Error> =
//!     Request::new("payments-api", || async { Ok("ok".to_owned()) });
//!
//! match manager.execute(request).await {
//!     Ok(value) => println!("got {value}"),
//!     Err(err) if err.is_rejected() => eprintln!("circuit open, skipping call"),
//!     Err(err) => eprintln!("call failed: {err}"),
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]
#![cfg_attr(test, deny(warnings))]

mod breaker;
mod bus;
mod config;
mod error;
mod event;
mod manager;
mod rt;
mod state_machine;
mod strategy;
mod window;

#[cfg(feature = "http")]
pub mod http;

#[doc(hidden)]
pub mod clock;

pub use self::breaker::{Breaker, Request};
pub use self::bus::EventBus;
pub use self::config::{strategy_names, ManagerConfig, ResourceConfig};
pub use self::error::{ConfigError, Error};
pub use self::event::{Event, EventKind, EventPayload};
pub use self::manager::Manager;
pub use self::state_machine::{State, StateMachine, Transition};
pub use self::strategy::TripStrategy;
pub use self::window::{Snapshot, SlidingWindow};
