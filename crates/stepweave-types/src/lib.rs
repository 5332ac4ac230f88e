//! Shared domain types for Stepweave.
//!
//! This crate contains the data model used across the engine: the flow tree,
//! scoring history, state access log, run metrics, suspended snapshots,
//! lifecycle events and the engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod metrics;
pub mod scoring;
pub mod snapshot;
pub mod state;
