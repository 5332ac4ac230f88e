//! Observability setup for Stepweave binaries.
//!
//! Library crates only emit `tracing` events and spans; installing a
//! subscriber is the binary's job and happens here.

pub mod tracing_setup;

pub use tracing_setup::{effective_level, init_tracing};
