//! Run event distribution.
//!
//! Provides an `EventBus` that distributes `FlowEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel, and the
//! `NotificationEmitter` port the orchestrator publishes through.

pub mod bus;

pub use bus::{EventBus, NotificationEmitter};
