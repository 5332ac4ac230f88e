//! Flow execution engine and port traits for Stepweave.
//!
//! This crate owns the orchestrator, the control-flow interpreter, the
//! quality gate, the shared state manager and suspend/resume, and defines
//! the ports (`SnapshotStore`, `MetricsSink`, `NotificationEmitter`,
//! `OutputResolver`, `StepRunner`) that adapters implement. It depends only
//! on `stepweave-types` -- never on `stepweave-infra` or any IO crate.

pub mod event;
pub mod flow;
pub mod metrics;
pub mod repository;
