//! Event bus for execution lifecycle notifications.
//!
//! Provides an `EventBus` that distributes `MitigationEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
