//! Flow engine: orchestration, control flow, quality gates, shared state and
//! suspend/resume.
//!
//! - `orchestrator` -- run driver and leaf step execution
//! - `graph` -- interpreter for parallel/branch/foreach/try/switch/while/map_reduce
//! - `scoring` -- quality-gated retry and the run scoring ledger
//! - `state` -- contract-checked shared state with an access audit log
//! - `suspend` -- snapshot capture and resume preparation
//! - `context` -- execution context and the expression context view
//! - `expression` -- `${...}` templates over JEXL
//! - `runner` -- the `StepRunner` trait, built-ins and the registry
//! - `validate` -- pre-run flow validation
//! - `cache` -- step output cache
//! - `output` -- declarative output shaping

pub mod cache;
pub mod context;
pub mod error;
pub mod expression;
pub mod graph;
pub mod orchestrator;
pub mod output;
pub mod runner;
pub mod scoring;
pub mod state;
pub mod suspend;
pub mod validate;

pub use context::{ContextEntry, ExecutionContext, ResultMap};
pub use error::{EngineError, RunFailure};
pub use expression::{ExpressionError, ExpressionResolver, JexlResolver};
pub use orchestrator::{Orchestrator, RunOptions, RunOutcome, RunResult};
pub use output::{OutputResolver, TemplateOutputResolver};
pub use runner::{RegistryError, RunnerContext, RunnerRegistry, StepError, StepRunner, runner_fn};
pub use state::StateError;
pub use validate::validate_flow;
