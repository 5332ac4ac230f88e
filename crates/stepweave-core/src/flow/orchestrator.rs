//! Orchestrator: the top-level run driver.
//!
//! `Orchestrator` walks a flow's top-level steps in declaration order. Flat
//! flows run each agent step directly; flows containing any control-flow
//! construct hand every top-level step to the [`FlowGraphExecutor`], which
//! calls back into the same leaf execution path for nested agent steps.
//!
//! # Leaf execution
//!
//! 1. Evaluate `condition`; a false condition skips the step.
//! 2. Resolve input: `inputMapping`, else the previous output, else the run
//!    input.
//! 3. Resolve the runner (built-ins, then registered runners).
//! 4. Serve from the step cache when enabled.
//! 5. Run through the quality gate when `scoring` is declared, otherwise
//!    with the plain retry policy. Every attempt is raced against the step
//!    timeout and gets a fresh scoped state view.
//! 6. Commit the accepted attempt's state writes.
//! 7. Record a metric, success or not.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use stepweave_types::config::EngineConfig;
use stepweave_types::event::FlowEvent;
use stepweave_types::flow::{AgentStep, CacheConfig, FlowDefinition, FlowStep, OnTimeout, ShapedBody, ShapedOutput};
use stepweave_types::metrics::{RunMetrics, StepMetric};
use stepweave_types::scoring::{ScoringConfig, ScoringState};
use stepweave_types::snapshot::SuspendedExecutionState;
use stepweave_types::state::AccessReport;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::event::NotificationEmitter;
use crate::metrics::{MetricsSink, TracingMetricsSink};
use crate::repository::SnapshotStore;

use super::cache::StepCache;
use super::context::{ContextEntry, ExecutionContext, limit_output};
use super::error::{EngineError, RunFailure};
use super::expression::{ExpressionResolver, JexlResolver, stringify};
use super::graph::{ExecOutcome, FlowGraphExecutor, GraphScope, LeafExecutor, LeafFuture, LeafOutcome};
use super::output::{OutputResolver, TemplateOutputResolver};
use super::runner::{RegistryError, RunnerContext, RunnerRegistry, StepError, StepRunner};
use super::scoring::{AttemptInput, Evaluation, EvaluationRequest, QualityGate, ScoringLedger, ScoringStatus};
use super::state::{ScopedState, StateHandle, StateManager, declared_access};
use super::suspend::{RunCheckpoint, SuspendManager};
use super::validate::validate_flow;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Per-run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Suspend just before this top-level step index.
    pub suspend_before: Option<usize>,
}

/// A completed run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub execution_id: Uuid,
    /// Shaped body when the flow declares `output`, else the last output.
    pub output: Value,
    pub shaped: Option<ShapedOutput>,
    pub metrics: RunMetrics,
    /// Present when the flow declares initial state or any `stateAccess`.
    pub state_report: Option<AccessReport>,
    /// Finalized scoring, present when any step was scored.
    pub scoring: Option<ScoringState>,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunResult),
    Suspended(SuspendedExecutionState),
}

impl RunOutcome {
    pub fn into_completed(self) -> Option<RunResult> {
        match self {
            RunOutcome::Completed(result) => Some(result),
            RunOutcome::Suspended(_) => None,
        }
    }

    pub fn into_suspended(self) -> Option<SuspendedExecutionState> {
        match self {
            RunOutcome::Suspended(snapshot) => Some(snapshot),
            RunOutcome::Completed(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Flow engine. Owns its runner registry and step cache; runs never share
/// any other mutable state.
pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<RunnerRegistry>,
    resolver: Arc<dyn ExpressionResolver>,
    output_resolver: Option<Arc<dyn OutputResolver>>,
    metrics_sink: Arc<dyn MetricsSink>,
    emitter: Option<Arc<dyn NotificationEmitter>>,
    cache: Arc<StepCache>,
    suspender: SuspendManager,
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RunnerRegistry::new()),
            resolver: Arc::new(JexlResolver::new()),
            output_resolver: None,
            metrics_sink: Arc::new(TracingMetricsSink),
            emitter: None,
            cache: Arc::new(StepCache::new()),
            suspender: SuspendManager::new(),
        }
    }

    pub fn with_runner(
        mut self,
        name: impl Into<String>,
        runner: Arc<dyn StepRunner>,
    ) -> Result<Self, RegistryError> {
        self.register_runner(name, runner)?;
        Ok(self)
    }

    pub fn register_runner(
        &mut self,
        name: impl Into<String>,
        runner: Arc<dyn StepRunner>,
    ) -> Result<(), RegistryError> {
        Arc::make_mut(&mut self.registry).register(name, runner)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExpressionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_output_resolver(mut self, resolver: Arc<dyn OutputResolver>) -> Self {
        self.output_resolver = Some(resolver);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn NotificationEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub async fn run(&self, flow: &FlowDefinition, input: Value) -> Result<RunOutcome, RunFailure> {
        self.run_with_options(flow, input, RunOptions::default()).await
    }

    pub async fn run_with_options(
        &self,
        flow: &FlowDefinition,
        input: Value,
        options: RunOptions,
    ) -> Result<RunOutcome, RunFailure> {
        let execution_id = Uuid::now_v7();
        let total = flow.steps.len();
        let early = |e: EngineError| RunFailure::new(e, execution_id, RunMetrics::default(), None, total);

        validate_flow(flow).map_err(early)?;
        let state = StateManager::new(flow.state.clone(), declared_access(flow))
            .map_err(|e| early(e.into()))?;

        self.drive(RunSegment {
            flow: flow.clone(),
            context: ExecutionContext::new(execution_id, flow.name.clone(), input),
            state,
            ledger: ScoringLedger::new(),
            metrics: RunMetrics::default(),
            start_index: 0,
            resumed: false,
            options,
        })
        .await
    }

    /// Continue a suspended run from its saved index. `resume_input` is
    /// exposed to expressions as `resume`.
    pub async fn resume(
        &self,
        snapshot: SuspendedExecutionState,
        resume_input: Option<Value>,
    ) -> Result<RunOutcome, RunFailure> {
        let execution_id = snapshot.execution_id;
        let total = snapshot.flow_definition.steps.len();
        let metrics = snapshot.metrics_snapshot.clone();
        let early = |e: EngineError| RunFailure::new(e, execution_id, metrics.clone(), None, total);

        let point = self
            .suspender
            .prepare_resume(snapshot, resume_input)
            .map_err(&early)?;
        validate_flow(&point.flow).map_err(&early)?;

        self.drive(RunSegment {
            flow: point.flow,
            context: point.context,
            state: point.state,
            ledger: point.ledger,
            metrics: point.metrics,
            start_index: point.start_index,
            resumed: true,
            options: RunOptions::default(),
        })
        .await
    }

    /// Take a snapshot out of `store` and resume it.
    pub async fn resume_from_store<S: SnapshotStore>(
        &self,
        store: &S,
        execution_id: Uuid,
        resume_input: Option<Value>,
    ) -> Result<RunOutcome, RunFailure> {
        let fail = |e: EngineError| RunFailure::new(e, execution_id, RunMetrics::default(), None, 0);
        match store.take(&execution_id).await {
            Ok(Some(snapshot)) => self.resume(snapshot, resume_input).await,
            Ok(None) => Err(fail(EngineError::SnapshotNotFound(execution_id))),
            Err(e) => Err(fail(e.into())),
        }
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    async fn drive(&self, segment: RunSegment) -> Result<RunOutcome, RunFailure> {
        let span = info_span!(
            "flow.run",
            execution_id = %segment.context.execution_id,
            flow = %segment.flow.name,
            resumed = segment.resumed,
        );
        self.drive_inner(segment).instrument(span).await
    }

    async fn drive_inner(&self, segment: RunSegment) -> Result<RunOutcome, RunFailure> {
        let started = Instant::now();
        let RunSegment {
            flow,
            mut context,
            state,
            ledger,
            metrics,
            start_index,
            resumed,
            options,
        } = segment;
        let execution_id = context.execution_id;
        let total = flow.steps.len();

        let engine = Arc::new(RunEngine {
            execution_id,
            config: self.config.clone(),
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            sink: self.metrics_sink.clone(),
            emitter: self.emitter.clone(),
            cache: self.cache.clone(),
            gate: QualityGate::new(self.config.scoring.clone()),
            state: StateHandle::new(state),
            ledger,
            metrics: Mutex::new(metrics),
        });
        let graph = flow.has_control_flow().then(|| {
            FlowGraphExecutor::new(
                self.resolver.clone(),
                Arc::new(engine.clone()),
                engine.state.clone(),
                self.config.default_max_concurrency,
            )
        });

        engine.emit(FlowEvent::RunStarted {
            execution_id,
            flow_name: flow.name.clone(),
            resumed,
        });
        info!(steps = total, start_index, graph = graph.is_some(), "run started");

        for index in start_index..total {
            if options.suspend_before == Some(index) {
                let reason = format!("suspended before step {index}");
                return self.suspend_run(&engine, &flow, &mut context, index, reason, started);
            }

            engine.refresh_views(&mut context);
            let scope = GraphScope::new(context.to_expression_context(), Some(context.default_input()));
            let result = match (&graph, flow.steps[index].clone()) {
                (Some(graph), step) => graph.execute_step(step, scope).await,
                (None, FlowStep::Agent(agent)) => engine.run_leaf(agent, scope).await.map(ExecOutcome::from),
                (None, other) => Err(EngineError::RunValidation(format!(
                    "control step `{}` reached the flat executor",
                    other.kind()
                ))),
            };

            match result {
                Ok(outcome) => {
                    if outcome.last_output.is_some() {
                        context.previous_output = outcome.last_output;
                    }
                    context.merge(outcome.results);
                }
                Err(EngineError::Suspended { step, reason }) => {
                    context.set_entry(
                        &step,
                        ContextEntry::success(json!({ "status": "suspended", "reason": reason })),
                    );
                    return self.suspend_run(&engine, &flow, &mut context, index + 1, reason, started);
                }
                Err(error) => {
                    return Err(self.fail_run(&engine, &flow, error, Some(index), started));
                }
            }
        }

        engine.refresh_views(&mut context);
        let scoring = engine.ledger.finalize();
        if !scoring.is_empty() {
            context.scoring = serde_json::to_value(&scoring).unwrap_or(Value::Null);
        }

        let last_output = context.previous_output.clone().unwrap_or(Value::Null);
        let (output, shaped) = match &flow.output {
            Some(spec) => {
                let shaper = self.output_resolver.clone().unwrap_or_else(|| {
                    Arc::new(TemplateOutputResolver::new(self.resolver.clone()))
                });
                let shaped = shaper
                    .shape(spec, &context.to_expression_context(), &last_output)
                    .map_err(|e| self.fail_run(&engine, &flow, e, None, started))?;
                let body = match &shaped.body {
                    ShapedBody::Json(value) => value.clone(),
                    ShapedBody::Raw(text) => Value::String(text.clone()),
                };
                (body, Some(shaped))
            }
            None => (last_output, None),
        };

        let report = engine.state.current().report();
        let state_report = (flow.state.is_some() || !report.declared.is_empty()).then_some(report);
        let metrics = engine.finish_metrics(started);

        engine.emit(FlowEvent::RunCompleted {
            execution_id,
            flow_name: flow.name.clone(),
            duration_ms: metrics.total_duration_ms,
            steps_completed: metrics.succeeded() as u32,
        });
        info!(summary = %metrics.summary(), "run completed");

        Ok(RunOutcome::Completed(RunResult {
            execution_id,
            output,
            shaped,
            metrics,
            state_report,
            scoring: (!scoring.is_empty()).then_some(scoring),
            context,
        }))
    }

    fn suspend_run(
        &self,
        engine: &RunEngine,
        flow: &FlowDefinition,
        context: &mut ExecutionContext,
        next_index: usize,
        reason: String,
        started: Instant,
    ) -> Result<RunOutcome, RunFailure> {
        engine.refresh_views(context);
        let metrics = engine.finish_metrics(started);
        let snapshot = self
            .suspender
            .suspend(RunCheckpoint {
                flow,
                context,
                state: engine.state.current().report(),
                scoring: engine.ledger.snapshot(),
                metrics: metrics.clone(),
                next_index,
                reason: reason.clone(),
            })
            .map_err(|e| {
                RunFailure::new(e, engine.execution_id, metrics, Some(next_index), flow.steps.len())
            })?;

        engine.emit(FlowEvent::RunSuspended {
            execution_id: engine.execution_id,
            resume_from_step_index: next_index,
            reason: reason.clone(),
        });
        info!(resume_from_step_index = next_index, reason = %reason, "run suspended");
        Ok(RunOutcome::Suspended(snapshot))
    }

    fn fail_run(
        &self,
        engine: &RunEngine,
        flow: &FlowDefinition,
        error: EngineError,
        index: Option<usize>,
        started: Instant,
    ) -> RunFailure {
        let metrics = engine.finish_metrics(started);
        engine.emit(FlowEvent::RunFailed {
            execution_id: engine.execution_id,
            flow_name: flow.name.clone(),
            step: error.step().map(str::to_string),
            error: error.to_string(),
        });
        let failure = RunFailure::new(error, engine.execution_id, metrics, index, flow.steps.len());
        tracing::error!(kind = failure.error.kind(), "{failure}");
        failure
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("cached_outputs", &self.cache.len())
            .finish()
    }
}

struct RunSegment {
    flow: FlowDefinition,
    context: ExecutionContext,
    state: StateManager,
    ledger: ScoringLedger,
    metrics: RunMetrics,
    start_index: usize,
    resumed: bool,
    options: RunOptions,
}

// ---------------------------------------------------------------------------
// RunEngine: per-run leaf execution
// ---------------------------------------------------------------------------

struct RunEngine {
    execution_id: Uuid,
    config: EngineConfig,
    registry: Arc<RunnerRegistry>,
    resolver: Arc<dyn ExpressionResolver>,
    sink: Arc<dyn MetricsSink>,
    emitter: Option<Arc<dyn NotificationEmitter>>,
    cache: Arc<StepCache>,
    gate: QualityGate,
    state: StateHandle,
    ledger: ScoringLedger,
    metrics: Mutex<RunMetrics>,
}

#[derive(Default)]
struct LeafStats {
    attempts: AtomicU32,
    cache_hit: AtomicBool,
    timed_out: AtomicBool,
    /// Accepted despite a failed quality gate.
    flagged: Mutex<Option<String>>,
}

impl LeafExecutor for Arc<RunEngine> {
    fn execute_leaf(&self, step: AgentStep, scope: GraphScope) -> LeafFuture {
        let this = self.clone();
        Box::pin(async move { this.run_leaf(step, scope).await })
    }
}

impl RunEngine {
    fn emit(&self, event: FlowEvent) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(event);
        }
    }

    fn record_metric(&self, metric: StepMetric) {
        self.sink.record_step_execution(&metric);
        self.metrics.lock().record(metric);
    }

    /// Add this segment's wall time and return the metrics so far.
    fn finish_metrics(&self, started: Instant) -> RunMetrics {
        let mut metrics = self.metrics.lock();
        metrics.total_duration_ms += started.elapsed().as_millis() as u64;
        metrics.clone()
    }

    /// Refresh the `state` and `scoring` views of the context.
    fn refresh_views(&self, context: &mut ExecutionContext) {
        context.state = self.state.current().get_state();
        context.scoring = serde_json::to_value(self.ledger.snapshot()).unwrap_or(Value::Null);
    }

    async fn run_leaf(&self, step: AgentStep, scope: GraphScope) -> Result<LeafOutcome, EngineError> {
        let key = step.result_key().to_string();
        let span = info_span!(
            "flow.step",
            execution_id = %self.execution_id,
            step = %key,
            runner = %step.name,
        );
        self.run_leaf_inner(step, key, scope).instrument(span).await
    }

    async fn run_leaf_inner(
        &self,
        step: AgentStep,
        key: String,
        scope: GraphScope,
    ) -> Result<LeafOutcome, EngineError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let stats = LeafStats::default();
        let expr_ctx = Arc::new(scope.expression_context(self.state.current().get_state()));
        let default_input = scope.last_output.clone().unwrap_or_else(|| scope.input());

        let result = self
            .execute_agent(&step, &key, expr_ctx, default_input, &stats)
            .await;

        let metric = |success: bool, skipped: bool, error: Option<String>| StepMetric {
            step: key.clone(),
            runner: step.name.clone(),
            duration_ms: clock.elapsed().as_millis() as u64,
            success,
            cache_hit: stats.cache_hit.load(Ordering::Relaxed),
            attempts: stats.attempts.load(Ordering::Relaxed),
            skipped,
            timed_out: stats.timed_out.load(Ordering::Relaxed),
            error,
            started_at,
        };

        match result {
            Ok(None) => {
                self.record_metric(metric(true, true, None));
                Ok(LeafOutcome::Skipped)
            }
            Ok(Some(output)) => {
                let output = limit_output(&key, output, self.config.max_step_output_bytes);
                let m = metric(true, false, stats.flagged.lock().take());
                debug!(duration_ms = m.duration_ms, attempts = m.attempts, "step completed");
                self.emit(FlowEvent::StepCompleted {
                    execution_id: self.execution_id,
                    step: key.clone(),
                    duration_ms: m.duration_ms,
                    cache_hit: m.cache_hit,
                });
                self.record_metric(m);
                Ok(LeafOutcome::Completed {
                    key,
                    entry: ContextEntry::success(output),
                })
            }
            Err(error) if error.is_suspension() => {
                self.record_metric(metric(true, false, None));
                Err(error)
            }
            Err(error) => {
                let message = error.to_string();
                warn!(kind = error.kind(), error = %message, "step failed");
                self.sink.record_error(&key, error.kind(), &message);
                self.emit(FlowEvent::StepFailed {
                    execution_id: self.execution_id,
                    step: key.clone(),
                    error: message.clone(),
                    will_retry: false,
                });
                self.record_metric(metric(false, false, Some(message)));
                Err(error)
            }
        }
    }

    /// `Ok(None)` when the condition skipped the step.
    async fn execute_agent(
        &self,
        step: &AgentStep,
        key: &str,
        expr_ctx: Arc<Value>,
        default_input: Value,
        stats: &LeafStats,
    ) -> Result<Option<Value>, EngineError> {
        if let Some(condition) = &step.condition {
            let run = self
                .resolver
                .evaluate_bool(condition, &expr_ctx)
                .map_err(|e| EngineError::expression(key, e))?;
            if !run {
                debug!(condition = %condition, "condition is false, skipping step");
                return Ok(None);
            }
        }

        let input = match &step.input_mapping {
            Some(mapping) => self
                .resolver
                .resolve(mapping, &expr_ctx)
                .map_err(|e| EngineError::expression(key, e))?,
            None => default_input,
        };

        let runner = self
            .registry
            .resolve(&step.name)
            .ok_or_else(|| EngineError::StepNotFound {
                step: key.to_string(),
            })?
            .into_runner();

        self.emit(FlowEvent::StepStarted {
            execution_id: self.execution_id,
            step: key.to_string(),
            runner: step.name.clone(),
        });

        // A hit never runs the step, so steps that write state always execute.
        let writes_state = step
            .state_access
            .as_ref()
            .is_some_and(|access| !access.set_keys.is_empty());
        let cache_key = match &step.cache {
            Some(cache) if cache.enabled && writes_state => {
                debug!("step writes shared state, bypassing step cache");
                None
            }
            Some(cache) if cache.enabled => Some(self.cache_key(cache, step, key, &input, &expr_ctx)?),
            _ => None,
        };
        if let Some(cache_key) = &cache_key {
            let hit = self.cache.get(cache_key);
            self.sink.record_cache_performance(key, hit.is_some());
            if let Some(output) = hit {
                debug!("served from step cache");
                stats.cache_hit.store(true, Ordering::Relaxed);
                return Ok(Some(output));
            }
        }

        let output = match &step.scoring {
            Some(scoring) => {
                self.execute_scored(step, key, scoring, &runner, &input, &expr_ctx, stats)
                    .await?
            }
            None => {
                self.execute_with_retry(step, key, &runner, &input, &expr_ctx, stats)
                    .await?
            }
        };

        if let Some(cache_key) = cache_key {
            let ttl = step
                .cache
                .as_ref()
                .and_then(|c| c.ttl_ms)
                .map(Duration::from_millis);
            self.cache.insert(cache_key, output.clone(), ttl);
        }
        Ok(Some(output))
    }

    fn cache_key(
        &self,
        cache: &CacheConfig,
        step: &AgentStep,
        key: &str,
        input: &Value,
        expr_ctx: &Value,
    ) -> Result<String, EngineError> {
        match &cache.key {
            Some(template) => self
                .resolver
                .resolve_str(template, expr_ctx)
                .map(|v| stringify(&v))
                .map_err(|e| EngineError::expression(key, e)),
            None => Ok(StepCache::key_for(&step.name, key, input)),
        }
    }

    /// Plain execution with the step's retry policy.
    async fn execute_with_retry(
        &self,
        step: &AgentStep,
        key: &str,
        runner: &Arc<dyn StepRunner>,
        input: &Value,
        expr_ctx: &Arc<Value>,
        stats: &LeafStats,
    ) -> Result<Value, EngineError> {
        let max_attempts = step.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
        let mut attempt = 1;
        loop {
            match self
                .attempt(step, key, runner, input.clone(), expr_ctx, attempt, None, stats)
                .await
            {
                Ok((output, scoped)) => {
                    if let Some(scoped) = scoped {
                        self.state.commit(&scoped);
                    }
                    return Ok(output);
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = step.retry.as_ref().map_or(0, |r| r.delay_after(attempt));
                    warn!(attempt, max_attempts, delay_ms = delay, error = %error, "step failed, retrying");
                    self.emit(FlowEvent::StepFailed {
                        execution_id: self.execution_id,
                        step: key.to_string(),
                        error: error.to_string(),
                        will_retry: true,
                    });
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Quality-gated execution.
    #[allow(clippy::too_many_arguments)]
    async fn execute_scored(
        &self,
        step: &AgentStep,
        key: &str,
        scoring: &ScoringConfig,
        runner: &Arc<dyn StepRunner>,
        input: &Value,
        expr_ctx: &Arc<Value>,
        stats: &LeafStats,
    ) -> Result<Value, EngineError> {
        let last_scoped: Mutex<Option<Arc<ScopedState>>> = Mutex::new(None);
        let slot = &last_scoped;
        let this = self;

        let outcome = self
            .gate
            .execute_with_scoring(
                key,
                scoring,
                &self.ledger,
                move |next: AttemptInput| {
                    let attempt = this.attempt(
                        step,
                        key,
                        runner,
                        input.clone(),
                        expr_ctx,
                        next.attempt,
                        next.feedback,
                        stats,
                    );
                    async move {
                        let (output, scoped) = attempt.await?;
                        *slot.lock() = scoped;
                        Ok::<_, EngineError>(output)
                    }
                },
                move |request: EvaluationRequest| this.evaluate(key, scoring, expr_ctx, request),
            )
            .await?;

        stats.attempts.store(outcome.attempts, Ordering::Relaxed);
        match outcome.status {
            ScoringStatus::Passed => {}
            ScoringStatus::Continued => {
                warn!(score = outcome.score, "quality gate not met, continuing with last output");
                *stats.flagged.lock() =
                    Some(format!("quality gate not met (score {:.2})", outcome.score));
            }
            ScoringStatus::MaxRetriesExceeded => {
                return Err(EngineError::MaxRetriesExceeded {
                    step: key.to_string(),
                    attempts: outcome.attempts,
                    best_score: outcome.score,
                    best_output: outcome.output,
                });
            }
        }

        if let Some(scoped) = last_scoped.into_inner() {
            self.state.commit(&scoped);
        }
        Ok(outcome.output)
    }

    /// One runner invocation raced against the step timeout.
    ///
    /// The runner runs as its own task; on expiry the task is abandoned and
    /// its cancellation token fired.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        step: &AgentStep,
        key: &str,
        runner: &Arc<dyn StepRunner>,
        input: Value,
        expr_ctx: &Arc<Value>,
        attempt: u32,
        feedback: Option<String>,
        stats: &LeafStats,
    ) -> Result<(Value, Option<Arc<ScopedState>>), EngineError> {
        stats.attempts.store(attempt, Ordering::Relaxed);
        let scoped = step
            .state_access
            .clone()
            .map(|access| Arc::new(self.state.current().scoped(key, access)));
        let cancel = CancellationToken::new();
        let ctx = RunnerContext {
            execution_id: self.execution_id,
            step: key.to_string(),
            input,
            config: step.config.clone().unwrap_or(Value::Null),
            context: expr_ctx.clone(),
            state: scoped.clone(),
            attempt,
            feedback,
            cancel: cancel.clone(),
        };
        let timeout_ms = step.timeout_ms.unwrap_or(self.config.default_step_timeout_ms);

        let runner = runner.clone();
        let task = tokio::spawn(async move { runner.execute(ctx).await });

        match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
            Ok(Ok(Ok(output))) => Ok((output, scoped)),
            Ok(Ok(Err(error))) => Err(step_error(key, error)),
            Ok(Err(join)) => Err(EngineError::StepExecution {
                step: key.to_string(),
                message: format!("runner task failed: {join}"),
            }),
            Err(_) => {
                cancel.cancel();
                stats.timed_out.store(true, Ordering::Relaxed);
                warn!(timeout_ms, attempt, "step timed out, abandoning attempt");
                match &step.on_timeout {
                    Some(OnTimeout::Fallback { output }) => Ok((output.clone(), None)),
                    _ => Err(EngineError::Timeout {
                        step: key.to_string(),
                        timeout_ms,
                    }),
                }
            }
        }
    }

    /// Run the evaluator runner and parse its verdict.
    async fn evaluate(
        &self,
        key: &str,
        scoring: &ScoringConfig,
        expr_ctx: &Arc<Value>,
        request: EvaluationRequest,
    ) -> Result<Evaluation, EngineError> {
        let evaluator_error = |message: String| EngineError::Evaluator {
            step: key.to_string(),
            message,
        };
        let runner = self
            .registry
            .resolve(&scoring.evaluator)
            .ok_or_else(|| evaluator_error(format!("evaluator `{}` is not registered", scoring.evaluator)))?
            .into_runner();

        let ctx = RunnerContext {
            execution_id: self.execution_id,
            step: key.to_string(),
            input: json!({
                "output": request.output,
                "attempt": request.attempt,
                "previousScore": request.previous_score,
                "criteria": scoring.criteria,
                "thresholds": scoring.thresholds,
            }),
            config: scoring.evaluator_config.clone().unwrap_or(Value::Null),
            context: expr_ctx.clone(),
            state: None,
            attempt: request.attempt,
            feedback: None,
            cancel: CancellationToken::new(),
        };

        let timeout = Duration::from_millis(self.config.default_step_timeout_ms);
        let verdict = match tokio::time::timeout(timeout, runner.execute(ctx)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(evaluator_error(e.to_string())),
            Err(_) => return Err(evaluator_error(format!("timed out after {}ms", timeout.as_millis()))),
        };
        Evaluation::from_value(&verdict).map_err(evaluator_error)
    }
}

fn step_error(key: &str, error: StepError) -> EngineError {
    match error {
        StepError::Failed(message) => EngineError::StepExecution {
            step: key.to_string(),
            message,
        },
        StepError::SuspendRequested { reason } => EngineError::Suspended {
            step: key.to_string(),
            reason,
        },
        StepError::Cancelled => EngineError::StepExecution {
            step: key.to_string(),
            message: "cancelled".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::event::EventBus;
    use crate::flow::runner::runner_fn;
    use crate::metrics::CollectingMetricsSink;
    use crate::repository::InMemorySnapshotStore;

    fn flow(value: Value) -> FlowDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn completed(outcome: RunOutcome) -> RunResult {
        outcome.into_completed().expect("run should complete")
    }

    fn number(value: &Value, field: &str) -> f64 {
        value.get(field).and_then(Value::as_f64).unwrap_or(0.0)
    }

    /// Runners used by the arithmetic scenario.
    fn arithmetic() -> Orchestrator {
        Orchestrator::new(EngineConfig::default())
            .with_runner("emit_one", runner_fn(|_ctx| async { Ok(json!({ "out": 1 })) }))
            .unwrap()
            .with_runner(
                "add_one",
                runner_fn(|ctx| async move { Ok(json!({ "out": number(&ctx.input, "in") + 1.0 })) }),
            )
            .unwrap()
            .with_runner(
                "double",
                runner_fn(|ctx| async move { Ok(json!({ "out": number(&ctx.input, "in") * 2.0 })) }),
            )
            .unwrap()
    }

    // -------------------------------------------------------------------
    // Sequential flows
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_three_step_pipeline_produces_four() {
        let f = flow(json!({
            "name": "arith",
            "steps": [
                { "name": "emit_one", "id": "A" },
                { "name": "add_one", "id": "B", "inputMapping": { "in": "${A.out}" } },
                { "name": "double", "id": "C", "inputMapping": { "in": "${B.out}" } }
            ],
            "output": { "body": "${C.out}" }
        }));
        let result = completed(arithmetic().run(&f, json!({})).await.unwrap());
        assert_eq!(result.output.as_f64(), Some(4.0));
        assert_eq!(result.metrics.executed(), 3);
        assert!(result.context.results["B"].success);
    }

    #[tokio::test]
    async fn test_no_look_ahead() {
        let seen: Arc<Mutex<HashMap<String, Value>>> = Arc::default();
        let record = seen.clone();
        let orchestrator = Orchestrator::new(EngineConfig::default())
            .with_runner(
                "peek",
                runner_fn(move |ctx| {
                    let record = record.clone();
                    async move {
                        record.lock().insert(ctx.step.clone(), (*ctx.context).clone());
                        Ok(json!(ctx.step))
                    }
                }),
            )
            .unwrap();
        let f = flow(json!({
            "name": "order",
            "steps": [
                { "name": "peek", "id": "first" },
                { "name": "peek", "id": "second" },
                { "name": "peek", "id": "third" }
            ]
        }));
        completed(orchestrator.run(&f, json!("in")).await.unwrap());

        let seen = seen.lock();
        assert!(seen["first"].get("second").is_none());
        assert!(seen["first"].get("third").is_none());
        assert_eq!(seen["second"]["first"], json!("first"));
        assert!(seen["second"].get("third").is_none());
        assert_eq!(seen["third"]["second"], json!("second"));
    }

    #[tokio::test]
    async fn test_previous_output_feeds_next_step() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "chain",
            "steps": [{ "name": "passthrough" }, { "name": "passthrough", "id": "again" }]
        }));
        let result = completed(orchestrator.run(&f, json!({ "v": 7 })).await.unwrap());
        assert_eq!(result.output, json!({ "v": 7 }));
        assert_eq!(result.context.get_output("again"), Some(&json!({ "v": 7 })));
    }

    #[tokio::test]
    async fn test_condition_skips_step() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "skip",
            "steps": [
                { "name": "passthrough", "id": "maybe", "condition": "input.go" },
                { "name": "passthrough", "id": "always" }
            ]
        }));
        let result = completed(orchestrator.run(&f, json!({ "go": false })).await.unwrap());
        assert!(!result.context.results.contains_key("maybe"));
        assert!(result.metrics.last_for("maybe").is_some_and(|m| m.skipped));
        assert_eq!(result.metrics.executed(), 1);
    }

    // -------------------------------------------------------------------
    // Failures
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_step_not_found_returns_partial_metrics() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "missing",
            "steps": [
                { "name": "passthrough", "id": "a" },
                { "name": "passthrough", "id": "b" },
                { "name": "no_such_runner", "id": "c" }
            ]
        }));
        let failure = orchestrator.run(&f, json!({})).await.unwrap_err();
        assert_eq!(failure.error.kind(), "step_not_found");
        assert_eq!(failure.failed_step.as_deref(), Some("c"));
        assert_eq!(failure.failed_index, Some(2));
        assert_eq!(failure.executed, 2);
        assert!(failure.to_string().starts_with("ran 2 of 3 steps, failed at c"));
    }

    #[tokio::test]
    async fn test_failure_stops_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let orchestrator = Orchestrator::new(EngineConfig::default())
            .with_runner(
                "count",
                runner_fn(move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Value::Null) }
                }),
            )
            .unwrap();
        let f = flow(json!({
            "name": "stop",
            "steps": [
                { "name": "fail", "config": { "message": "boom" } },
                { "name": "count" }
            ]
        }));
        let failure = orchestrator.run(&f, json!({})).await.unwrap_err();
        assert_eq!(failure.error.kind(), "step_execution");
        assert!(failure.error.to_string().contains("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(failure.metrics.failed(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_step() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "slow",
            "steps": [{ "name": "delay", "config": { "ms": 500 }, "timeoutMs": 20 }]
        }));
        let failure = orchestrator.run(&f, json!({})).await.unwrap_err();
        assert_eq!(failure.error.kind(), "timeout");
        assert!(failure.metrics.last_for("delay").is_some_and(|m| m.timed_out && !m.success));
    }

    #[tokio::test]
    async fn test_timeout_fallback_output() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "fallback",
            "steps": [{
                "name": "delay",
                "config": { "ms": 500 },
                "timeoutMs": 20,
                "onTimeout": { "action": "fallback", "output": { "cached": true } }
            }]
        }));
        let result = completed(orchestrator.run(&f, json!({})).await.unwrap());
        assert_eq!(result.output, json!({ "cached": true }));
        assert!(result.metrics.last_for("delay").is_some_and(|m| m.timed_out && m.success));
    }

    #[tokio::test]
    async fn test_retry_policy_recovers_flaky_runner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let orchestrator = Orchestrator::new(EngineConfig::default())
            .with_runner(
                "flaky",
                runner_fn(move |_ctx| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(StepError::failed(format!("attempt {n} failed")))
                        } else {
                            Ok(json!(n))
                        }
                    }
                }),
            )
            .unwrap();
        let f = flow(json!({
            "name": "retry",
            "steps": [{ "name": "flaky", "retry": { "maxAttempts": 3, "delayMs": 1 } }]
        }));
        let result = completed(orchestrator.run(&f, json!({})).await.unwrap());
        assert_eq!(result.output, json!(3));
        assert_eq!(result.metrics.last_for("flaky").map(|m| m.attempts), Some(3));
    }

    #[tokio::test]
    async fn test_validation_error_runs_nothing() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({ "name": "empty", "steps": [] }));
        let failure = orchestrator.run(&f, json!({})).await.unwrap_err();
        assert_eq!(failure.error.kind(), "run_validation");
        assert_eq!(failure.failed_index, None);
        assert!(failure.metrics.steps.is_empty());
    }

    #[test]
    fn test_builtin_names_cannot_be_registered() {
        let result = Orchestrator::new(EngineConfig::default())
            .with_runner("passthrough", runner_fn(|ctx| async move { Ok(ctx.input) }));
        assert!(matches!(result, Err(RegistryError::ReservedName(_))));
    }

    // -------------------------------------------------------------------
    // Quality gate
    // -------------------------------------------------------------------

    fn scored_orchestrator(scores: [f64; 3]) -> Orchestrator {
        let mut config = EngineConfig::default();
        config.scoring.backoff_initial_ms = 1;
        config.scoring.backoff_max_ms = 1;
        Orchestrator::new(config)
            .with_runner("draft", runner_fn(|ctx| async move { Ok(json!(ctx.attempt)) }))
            .unwrap()
            .with_runner(
                "judge",
                runner_fn(move |ctx| async move {
                    let attempt = ctx.input["attempt"].as_u64().unwrap_or(1) as usize;
                    let score = scores[(attempt - 1).min(2)];
                    Ok(json!({ "score": score, "feedback": format!("attempt {attempt}") }))
                }),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_quality_gate_passes_on_third_attempt() {
        let f = flow(json!({
            "name": "scored",
            "steps": [{
                "name": "draft",
                "scoring": {
                    "evaluator": "judge",
                    "thresholds": { "minimum": 0.7 },
                    "retryLimit": 3
                }
            }]
        }));
        let result = completed(scored_orchestrator([0.3, 0.5, 0.8]).run(&f, json!({})).await.unwrap());
        assert_eq!(result.output, json!(3));

        let scoring = result.scoring.unwrap();
        let scores: Vec<f64> = scoring.score_history.iter().map(|e| e.score).collect();
        assert_eq!(scores, vec![0.3, 0.5, 0.8]);
        assert_eq!(scoring.retry_count["draft"], 2);
        assert_eq!(scoring.final_score, Some(0.8));
        assert_eq!(result.metrics.last_for("draft").map(|m| m.attempts), Some(3));
    }

    #[tokio::test]
    async fn test_quality_gate_exhaustion_fails_run() {
        let f = flow(json!({
            "name": "scored",
            "steps": [{
                "name": "draft",
                "scoring": { "evaluator": "judge", "thresholds": { "minimum": 0.9 }, "retryLimit": 3 }
            }]
        }));
        let failure = scored_orchestrator([0.3, 0.6, 0.5]).run(&f, json!({})).await.unwrap_err();
        match failure.error {
            EngineError::MaxRetriesExceeded {
                attempts,
                best_score,
                best_output,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(best_score, 0.6);
                assert_eq!(best_output, json!(2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_quality_gate_exhaustion_reports_best_attempt_output() {
        let f = flow(json!({
            "name": "scored",
            "steps": [{
                "name": "draft",
                "id": "d",
                "scoring": { "evaluator": "judge", "thresholds": { "minimum": 0.9 }, "retryLimit": 3 }
            }]
        }));
        let failure = scored_orchestrator([0.1, 0.6, 0.1]).run(&f, json!({})).await.unwrap_err();
        assert_eq!(failure.error.kind(), "max_retries_exceeded");
        assert_eq!(failure.error.best_output(), Some(&json!(2)));
        assert_eq!(failure.failed_step.as_deref(), Some("d"));
        assert_eq!(failure.metrics.last_for("d").map(|m| m.attempts), Some(3));
    }

    #[tokio::test]
    async fn test_quality_gate_continue_flags_step() {
        let f = flow(json!({
            "name": "scored",
            "steps": [{
                "name": "draft",
                "scoring": {
                    "evaluator": "judge",
                    "thresholds": { "minimum": 0.9 },
                    "onFailure": "continue",
                    "retryLimit": 2
                }
            }]
        }));
        let result = completed(scored_orchestrator([0.3, 0.6, 0.5]).run(&f, json!({})).await.unwrap());
        assert_eq!(result.output, json!(2));
        let metric = result.metrics.last_for("draft").unwrap();
        assert!(metric.success);
        assert!(metric.error.as_deref().is_some_and(|e| e.contains("quality gate")));
    }

    #[tokio::test]
    async fn test_unregistered_evaluator_is_evaluator_error() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "scored",
            "steps": [{
                "name": "passthrough",
                "scoring": { "evaluator": "nobody", "thresholds": { "minimum": 0.5 } }
            }]
        }));
        let failure = orchestrator.run(&f, json!({})).await.unwrap_err();
        assert_eq!(failure.error.kind(), "evaluator");
    }

    // -------------------------------------------------------------------
    // Shared state
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_state_contracts_are_audited() {
        let orchestrator = Orchestrator::new(EngineConfig::default())
            .with_runner(
                "sneaky",
                runner_fn(|ctx| async move {
                    let state = ctx.state.ok_or_else(|| StepError::failed("no state view"))?;
                    let raw = state.raw();
                    Ok(json!({ "raw": raw["count"], "scoped": state.get("count") }))
                }),
            )
            .unwrap();
        let f = flow(json!({
            "name": "state",
            "state": { "count": 0 },
            "steps": [
                {
                    "name": "state_set",
                    "id": "writer",
                    "inputMapping": { "count": 5 },
                    "stateAccess": { "set": ["count"] }
                },
                {
                    "name": "state_get",
                    "id": "reader",
                    "dependsOn": ["writer"],
                    "stateAccess": { "use": ["count"] }
                },
                { "name": "sneaky", "stateAccess": { "use": [] } }
            ]
        }));
        let result = completed(orchestrator.run(&f, json!({})).await.unwrap());

        assert_eq!(result.context.get_output("reader"), Some(&json!({ "count": 5 })));
        assert_eq!(result.output, json!({ "raw": 5, "scoped": null }));

        let report = result.state_report.unwrap();
        assert_eq!(report.final_state, json!({ "count": 5 }));
        assert!(report.writes_by("writer").contains("count"));
        assert!(report.reads_by("reader").contains("count"));
        assert!(report.reads_by("sneaky").is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_discards_state_writes() {
        let orchestrator = Orchestrator::new(EngineConfig::default())
            .with_runner(
                "write_then_fail",
                runner_fn(|ctx| async move {
                    if let Some(state) = &ctx.state {
                        state.set("count", json!(99));
                    }
                    Err(StepError::failed("nope"))
                }),
            )
            .unwrap();
        let f = flow(json!({
            "name": "discard",
            "state": { "count": 1 },
            "steps": [{
                "type": "try",
                "steps": [{ "name": "write_then_fail", "stateAccess": { "set": ["count"] } }],
                "catch": [{ "name": "passthrough", "id": "recovered" }]
            }]
        }));
        let result = completed(orchestrator.run(&f, json!({})).await.unwrap());
        assert_eq!(result.state_report.unwrap().final_state, json!({ "count": 1 }));
        assert!(result.context.results.contains_key("recovered"));
    }

    #[tokio::test]
    async fn test_cached_state_writer_still_writes_on_every_run() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "cached_writer",
            "state": { "count": 0 },
            "steps": [{
                "name": "state_set",
                "inputMapping": { "count": 5 },
                "stateAccess": { "set": ["count"] },
                "cache": { "enabled": true }
            }]
        }));

        for _ in 0..2 {
            let result = completed(orchestrator.run(&f, json!({})).await.unwrap());
            assert_eq!(result.state_report.unwrap().final_state, json!({ "count": 5 }));
            assert!(result.metrics.last_for("state_set").is_some_and(|m| !m.cache_hit));
        }
    }

    #[tokio::test]
    async fn test_parallel_disjoint_state_writes_both_commit() {
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "disjoint",
            "state": { "a": 0, "b": 0 },
            "steps": [{
                "type": "parallel",
                "steps": [
                    {
                        "name": "state_set",
                        "id": "set_a",
                        "inputMapping": { "a": 1 },
                        "stateAccess": { "set": ["a"] }
                    },
                    {
                        "name": "state_set",
                        "id": "set_b",
                        "inputMapping": { "b": 2 },
                        "stateAccess": { "set": ["b"] }
                    }
                ]
            }]
        }));
        let result = completed(orchestrator.run(&f, json!({})).await.unwrap());
        let report = result.state_report.unwrap();
        assert_eq!(report.final_state, json!({ "a": 1, "b": 2 }));
        assert!(report.write_races.is_empty());
        assert!(report.writes_by("set_a").contains("a"));
        assert!(report.writes_by("set_b").contains("b"));
    }

    // -------------------------------------------------------------------
    // Suspend / resume
    // -------------------------------------------------------------------

    fn counting(calls: Arc<Mutex<Vec<String>>>) -> Orchestrator {
        Orchestrator::new(EngineConfig::default())
            .with_runner(
                "count",
                runner_fn(move |ctx| {
                    calls.lock().push(ctx.step.clone());
                    async move { Ok(json!(ctx.step)) }
                }),
            )
            .unwrap()
    }

    fn five_steps() -> FlowDefinition {
        let steps: Vec<Value> = (0..5).map(|i| json!({ "name": "count", "id": format!("s{i}") })).collect();
        flow(json!({ "name": "five", "steps": steps }))
    }

    #[tokio::test]
    async fn test_resume_runs_only_remaining_steps() {
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();
        let orchestrator = counting(calls.clone());
        let f = five_steps();

        let options = RunOptions {
            suspend_before: Some(2),
        };
        let snapshot = orchestrator
            .run_with_options(&f, json!({}), options)
            .await
            .unwrap()
            .into_suspended()
            .unwrap();
        assert_eq!(snapshot.resume_from_step_index, 2);
        assert_eq!(*calls.lock(), vec!["s0", "s1"]);

        let result = completed(orchestrator.resume(snapshot, None).await.unwrap());
        assert_eq!(*calls.lock(), vec!["s0", "s1", "s2", "s3", "s4"]);
        for key in ["s0", "s1", "s2", "s3", "s4"] {
            assert!(result.context.results.contains_key(key), "missing {key}");
        }
        assert_eq!(result.metrics.executed(), 5);
    }

    #[tokio::test]
    async fn test_approval_suspends_and_resume_input_is_visible() {
        let store = InMemorySnapshotStore::new();
        let orchestrator = Orchestrator::new(EngineConfig::default());
        let f = flow(json!({
            "name": "approve",
            "steps": [
                { "name": "passthrough", "id": "prepare" },
                { "name": "approval", "config": { "prompt": "ship it?" } },
                { "name": "passthrough", "id": "ship", "inputMapping": "${resume.approved}" }
            ]
        }));

        let snapshot = orchestrator
            .run(&f, json!({ "order": 1 }))
            .await
            .unwrap()
            .into_suspended()
            .unwrap();
        assert_eq!(snapshot.resume_from_step_index, 2);
        assert_eq!(snapshot.reason, "ship it?");
        let id = snapshot.execution_id;
        store.save(&snapshot).await.unwrap();

        let result = completed(
            orchestrator
                .resume_from_store(&store, id, Some(json!({ "approved": true })))
                .await
                .unwrap(),
        );
        assert_eq!(result.execution_id, id);
        assert_eq!(result.output, json!(true));
        assert_eq!(result.context.get_output("approval").unwrap()["status"], "suspended");
        assert_eq!(result.context.get_output("prepare"), Some(&json!({ "order": 1 })));

        let again = orchestrator.resume_from_store(&store, id, None).await.unwrap_err();
        assert_eq!(again.error.kind(), "snapshot_not_found");
    }

    // -------------------------------------------------------------------
    // Graph mode, cache, events
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_control_flow_results_reach_context() {
        let orchestrator = arithmetic();
        let f = flow(json!({
            "name": "graph",
            "steps": [
                { "name": "emit_one", "id": "A" },
                {
                    "type": "parallel",
                    "steps": [
                        { "name": "add_one", "id": "left", "inputMapping": { "in": "${A.out}" } },
                        { "name": "double", "id": "right", "inputMapping": { "in": "${A.out}" } }
                    ]
                },
                { "name": "add_one", "id": "sum", "inputMapping": { "in": "${left.out + right.out}" } }
            ]
        }));
        let result = completed(orchestrator.run(&f, json!({})).await.unwrap());
        assert_eq!(number(&result.output, "out"), 5.0);
        assert!(result.context.results.contains_key("left"));
        assert!(result.context.results.contains_key("right"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_runner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink = Arc::new(CollectingMetricsSink::new());
        let orchestrator = Orchestrator::new(EngineConfig::default())
            .with_runner(
                "expensive",
                runner_fn(move |ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(ctx.input) }
                }),
            )
            .unwrap()
            .with_metrics_sink(sink.clone());
        let f = flow(json!({
            "name": "cached",
            "steps": [{ "name": "expensive", "cache": { "enabled": true } }]
        }));

        completed(orchestrator.run(&f, json!({ "q": 1 })).await.unwrap());
        let second = completed(orchestrator.run(&f, json!({ "q": 1 })).await.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(second.metrics.last_for("expensive").is_some_and(|m| m.cache_hit));
        assert_eq!(sink.cache_counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_emitted() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let orchestrator = Orchestrator::new(EngineConfig::default()).with_emitter(Arc::new(bus));
        let f = flow(json!({ "name": "events", "steps": [{ "name": "passthrough" }] }));
        completed(orchestrator.run(&f, json!(1)).await.unwrap());

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap_or("").to_string());
        }
        assert_eq!(kinds, vec!["run_started", "step_started", "step_completed", "run_completed"]);
    }
}
