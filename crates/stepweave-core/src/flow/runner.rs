//! Step runners and the per-orchestrator runner registry.
//!
//! A runner is the opaque unit of work behind an agent step. Built-in
//! runners form a closed set matched exhaustively; everything else is
//! registered by the caller on the registry owned by one orchestrator.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::ScopedState;

/// Boxed future returned by [`StepRunner::execute`].
pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failure reported by a runner.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    /// Pause the run after this step; the reason is surfaced to the caller.
    #[error("suspension requested: {reason}")]
    SuspendRequested { reason: String },

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

// ---------------------------------------------------------------------------
// RunnerContext
// ---------------------------------------------------------------------------

/// Everything a runner receives for one attempt.
#[derive(Debug, Clone)]
pub struct RunnerContext {
    pub execution_id: Uuid,
    /// Result key of the step.
    pub step: String,
    pub input: Value,
    pub config: Value,
    /// Read-only expression context at the time the step started.
    pub context: Arc<Value>,
    /// Present when the step declares `stateAccess`.
    pub state: Option<Arc<ScopedState>>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Evaluator feedback from the previous scored attempt.
    pub feedback: Option<String>,
    /// Cancelled when the engine abandons the attempt (timeout).
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

pub trait StepRunner: Send + Sync {
    fn execute(&self, ctx: RunnerContext) -> RunnerFuture<'_>;
}

/// Adapter turning an async closure into a [`StepRunner`].
pub struct FnRunner<F>(F);

impl<F, Fut> StepRunner for FnRunner<F>
where
    F: Fn(RunnerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    fn execute(&self, ctx: RunnerContext) -> RunnerFuture<'_> {
        Box::pin((self.0)(ctx))
    }
}

/// Wrap an async closure as a shareable runner.
pub fn runner_fn<F, Fut>(f: F) -> Arc<dyn StepRunner>
where
    F: Fn(RunnerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    Arc::new(FnRunner(f))
}

// ---------------------------------------------------------------------------
// Built-in runners
// ---------------------------------------------------------------------------

/// Runners shipped with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinRunner {
    /// Returns its input.
    Passthrough,
    /// Sleeps `config.ms` then returns its input.
    Delay,
    /// Always fails with `config.message`.
    Fail,
    /// Requests suspension with `config.prompt` as the reason.
    Approval,
    /// Writes each field of its input object through the scoped state view.
    StateSet,
    /// Returns the declared `use` keys from the scoped state view.
    StateGet,
}

impl BuiltinRunner {
    pub const ALL: [BuiltinRunner; 6] = [
        BuiltinRunner::Passthrough,
        BuiltinRunner::Delay,
        BuiltinRunner::Fail,
        BuiltinRunner::Approval,
        BuiltinRunner::StateSet,
        BuiltinRunner::StateGet,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "passthrough" => Some(Self::Passthrough),
            "delay" => Some(Self::Delay),
            "fail" => Some(Self::Fail),
            "approval" => Some(Self::Approval),
            "state_set" => Some(Self::StateSet),
            "state_get" => Some(Self::StateGet),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Delay => "delay",
            Self::Fail => "fail",
            Self::Approval => "approval",
            Self::StateSet => "state_set",
            Self::StateGet => "state_get",
        }
    }
}

impl StepRunner for BuiltinRunner {
    fn execute(&self, ctx: RunnerContext) -> RunnerFuture<'_> {
        let kind = *self;
        Box::pin(async move {
            match kind {
                BuiltinRunner::Passthrough => Ok(ctx.input),
                BuiltinRunner::Delay => {
                    let ms = ctx.config.get("ms").and_then(Value::as_u64).unwrap_or(0);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ctx.input),
                        _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
                    }
                }
                BuiltinRunner::Fail => {
                    let message = ctx
                        .config
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("step failed");
                    Err(StepError::failed(message))
                }
                BuiltinRunner::Approval => {
                    let reason = ctx
                        .config
                        .get("prompt")
                        .and_then(Value::as_str)
                        .unwrap_or("awaiting approval")
                        .to_string();
                    Err(StepError::SuspendRequested { reason })
                }
                BuiltinRunner::StateSet => {
                    let state = ctx.state.as_ref().ok_or_else(|| {
                        StepError::failed("state_set requires stateAccess.set")
                    })?;
                    let Value::Object(fields) = &ctx.input else {
                        return Err(StepError::failed("state_set input must be an object"));
                    };
                    for (key, value) in fields {
                        state.set(key, value.clone());
                    }
                    Ok(ctx.input.clone())
                }
                BuiltinRunner::StateGet => {
                    let state = ctx.state.as_ref().ok_or_else(|| {
                        StepError::failed("state_get requires stateAccess.use")
                    })?;
                    let mut out = Map::new();
                    for key in &state.access().use_keys {
                        out.insert(key.clone(), state.get(key).unwrap_or(Value::Null));
                    }
                    Ok(Value::Object(out))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// RunnerRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("runner name `{0}` is reserved by a built-in runner")]
    ReservedName(String),

    #[error("runner name must not be empty")]
    EmptyName,
}

/// Resolved runner for a step.
#[derive(Clone)]
pub enum ResolvedRunner {
    Builtin(BuiltinRunner),
    Custom(Arc<dyn StepRunner>),
}

impl ResolvedRunner {
    pub fn into_runner(self) -> Arc<dyn StepRunner> {
        match self {
            ResolvedRunner::Builtin(b) => Arc::new(b),
            ResolvedRunner::Custom(r) => r,
        }
    }
}

/// Runner lookup owned by one orchestrator instance.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    custom: HashMap<String, Arc<dyn StepRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a caller runner. Built-in names cannot be shadowed.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        runner: Arc<dyn StepRunner>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if BuiltinRunner::from_name(&name).is_some() {
            return Err(RegistryError::ReservedName(name));
        }
        self.custom.insert(name, runner);
        Ok(())
    }

    /// Built-ins first, then caller-registered runners.
    pub fn resolve(&self, name: &str) -> Option<ResolvedRunner> {
        if let Some(builtin) = BuiltinRunner::from_name(name) {
            return Some(ResolvedRunner::Builtin(builtin));
        }
        self.custom.get(name).cloned().map(ResolvedRunner::Custom)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Sorted names of every resolvable runner.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = BuiltinRunner::ALL
            .iter()
            .map(|b| b.name().to_string())
            .chain(self.custom.keys().cloned())
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}
