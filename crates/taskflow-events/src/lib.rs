//! Asynchronous publish/subscribe event bus for taskflow.
//!
//! Publishers never block: events go into a bounded buffer consumed by a
//! single loop that fans each event out to the handlers subscribed to its
//! type. A bounded history of handled events is kept for inspection.
//!
//! # Main types
//!
//! - [`EventBus`]: Bounded queue, consumption loop, subscriptions, history.
//! - [`Event`]: A typed message with priority and optional correlation id.
//! - [`EventHandler`]: Async trait implemented by subscribers.
//! - [`EventType`]: Names of the events emitted by the orchestration pipeline.

/// Bus, handler trait, and statistics.
pub mod bus;
/// Event payload, priority, and well-known event types.
pub mod event;

pub use bus::{handler_fn, EventBus, EventBusStatistics, EventHandler, SubscriptionId};
pub use event::{Event, EventPriority, EventType};
