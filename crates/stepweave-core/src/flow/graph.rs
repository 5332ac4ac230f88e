//! Control-flow interpreter.
//!
//! `FlowGraphExecutor` walks a `FlowStep` tree recursively with one
//! dispatcher for every nesting level. Leaf agent steps are handed to a
//! [`LeafExecutor`] so they go through exactly the same execution path as a
//! flat flow.
//!
//! Parallel, Foreach and Map-Reduce children run as tokio tasks. Children
//! still running when a construct resolves early (`waitFor: any|first`, a
//! failing sibling) are detached, not aborted. Child results are merged in
//! declaration (or item) order, so the merged map never depends on finish
//! time.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use stepweave_types::flow::{
    AgentStep, BranchStep, FlowStep, ForeachStep, MapReduceStep, ParallelStep, SwitchStep,
    TryStep, WaitFor, WhileStep,
};
use tokio::task::{JoinError, JoinSet};

use super::context::{ContextEntry, ResultMap, insert_results};
use super::error::EngineError;
use super::expression::{ExpressionResolver, stringify};
use super::state::StateHandle;

pub type GraphFuture = BoxFuture<'static, Result<ExecOutcome, EngineError>>;

pub type LeafFuture = BoxFuture<'static, Result<LeafOutcome, EngineError>>;

// ---------------------------------------------------------------------------
// Scope and outcomes
// ---------------------------------------------------------------------------

/// What a step inside the graph can see.
#[derive(Debug, Clone)]
pub struct GraphScope {
    /// Expression context of the run when the graph segment started.
    pub base: Arc<Value>,
    /// Results produced so far along this path of the tree.
    pub results: ResultMap,
    /// Construct bindings (`item`, `index`, `iteration`, `error`, ...).
    pub vars: Map<String, Value>,
    /// Output of the most recent step on this path.
    pub last_output: Option<Value>,
}

impl GraphScope {
    pub fn new(base: Value, last_output: Option<Value>) -> Self {
        Self {
            base: Arc::new(base),
            results: ResultMap::new(),
            vars: Map::new(),
            last_output,
        }
    }

    pub fn with_var(mut self, key: &str, value: Value) -> Self {
        self.vars.insert(key.to_string(), value);
        self
    }

    /// Expression context: base, then scoped results, then live state, then
    /// construct bindings.
    pub fn expression_context(&self, state: Value) -> Value {
        let mut map = match self.base.as_ref() {
            Value::Object(base) => base.clone(),
            _ => Map::new(),
        };
        insert_results(&mut map, &self.results);
        map.insert("state".into(), state);
        for (key, value) in &self.vars {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// Whether a result key is visible from this scope.
    pub fn has_result(&self, key: &str) -> bool {
        self.results.contains_key(key)
            || self
                .base
                .get("steps")
                .and_then(|steps| steps.get(key))
                .is_some()
    }

    pub fn input(&self) -> Value {
        self.base.get("input").cloned().unwrap_or(Value::Null)
    }

    fn absorb(&mut self, outcome: &ExecOutcome) {
        self.results
            .extend(outcome.results.iter().map(|(k, v)| (k.clone(), v.clone())));
        if outcome.last_output.is_some() {
            self.last_output.clone_from(&outcome.last_output);
        }
    }
}

/// Results of executing a step or a list of steps.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub results: ResultMap,
    pub last_output: Option<Value>,
}

impl ExecOutcome {
    fn leaf(key: String, entry: ContextEntry) -> Self {
        let last_output = Some(entry.output.clone());
        let mut results = ResultMap::new();
        results.insert(key, entry);
        Self {
            results,
            last_output,
        }
    }

    /// Fold a later outcome in; its keys win.
    pub fn merge(&mut self, other: ExecOutcome) {
        self.results.extend(other.results);
        if other.last_output.is_some() {
            self.last_output = other.last_output;
        }
    }
}

/// What the leaf callback produced.
#[derive(Debug, Clone)]
pub enum LeafOutcome {
    Completed { key: String, entry: ContextEntry },
    /// The step's condition was false.
    Skipped,
}

impl From<LeafOutcome> for ExecOutcome {
    fn from(outcome: LeafOutcome) -> Self {
        match outcome {
            LeafOutcome::Completed { key, entry } => ExecOutcome::leaf(key, entry),
            LeafOutcome::Skipped => ExecOutcome::default(),
        }
    }
}

/// Executes one agent step on behalf of the graph.
pub trait LeafExecutor: Send + Sync {
    fn execute_leaf(&self, step: AgentStep, scope: GraphScope) -> LeafFuture;
}

fn join_error(construct: &str, err: JoinError) -> EngineError {
    EngineError::StepExecution {
        step: construct.to_string(),
        message: format!("child task failed: {err}"),
    }
}

// ---------------------------------------------------------------------------
// FlowGraphExecutor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FlowGraphExecutor {
    resolver: Arc<dyn ExpressionResolver>,
    leaf: Arc<dyn LeafExecutor>,
    state: StateHandle,
    default_concurrency: usize,
}

impl FlowGraphExecutor {
    pub fn new(
        resolver: Arc<dyn ExpressionResolver>,
        leaf: Arc<dyn LeafExecutor>,
        state: StateHandle,
        default_concurrency: usize,
    ) -> Self {
        Self {
            resolver,
            leaf,
            state,
            default_concurrency: default_concurrency.max(1),
        }
    }

    /// Execute a list of steps in declaration order.
    pub async fn execute(
        &self,
        steps: Vec<FlowStep>,
        scope: GraphScope,
    ) -> Result<ExecOutcome, EngineError> {
        self.execute_sequence(steps, scope).await
    }

    /// Execute one step of any kind.
    pub fn execute_step(&self, step: FlowStep, scope: GraphScope) -> GraphFuture {
        let this = self.clone();
        Box::pin(async move {
            match step {
                FlowStep::Agent(agent) => this.execute_agent(agent, scope).await,
                FlowStep::Parallel(p) => this.execute_parallel(p, scope).await,
                FlowStep::Branch(b) => this.execute_branch(b, scope).await,
                FlowStep::Foreach(f) => this.execute_foreach(f, scope).await,
                FlowStep::Try(t) => this.execute_try(t, scope).await,
                FlowStep::Switch(s) => this.execute_switch(s, scope).await,
                FlowStep::While(w) => this.execute_while(w, scope).await,
                FlowStep::MapReduce(m) => this.execute_map_reduce(m, scope).await,
            }
        })
    }

    async fn execute_sequence(
        &self,
        steps: Vec<FlowStep>,
        mut scope: GraphScope,
    ) -> Result<ExecOutcome, EngineError> {
        let mut acc = ExecOutcome::default();
        for step in steps {
            let outcome = self.execute_step(step, scope.clone()).await?;
            scope.absorb(&outcome);
            acc.merge(outcome);
        }
        Ok(acc)
    }

    fn evaluate(&self, expr: &str, scope: &GraphScope, construct: &str) -> Result<Value, EngineError> {
        let ctx = scope.expression_context(self.state.current().get_state());
        self.resolver
            .evaluate_expr(expr, &ctx)
            .map_err(|e| EngineError::expression(construct, e))
    }

    fn evaluate_bool(&self, expr: &str, scope: &GraphScope, construct: &str) -> Result<bool, EngineError> {
        let ctx = scope.expression_context(self.state.current().get_state());
        self.resolver
            .evaluate_bool(expr, &ctx)
            .map_err(|e| EngineError::expression(construct, e))
    }

    fn evaluate_items(&self, expr: &str, scope: &GraphScope, construct: &str) -> Result<Vec<Value>, EngineError> {
        match self.evaluate(expr, scope, construct)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(EngineError::StepExecution {
                step: construct.to_string(),
                message: format!("itemsExpr `{expr}` must evaluate to an array, got {other}"),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Leaf
    // -----------------------------------------------------------------------

    async fn execute_agent(&self, step: AgentStep, scope: GraphScope) -> Result<ExecOutcome, EngineError> {
        if let Some(missing) = step.depends_on.iter().find(|dep| !scope.has_result(dep)) {
            return Err(EngineError::StepExecution {
                step: step.result_key().to_string(),
                message: format!("dependency `{missing}` has not produced a result"),
            });
        }
        self.leaf.execute_leaf(step, scope).await.map(ExecOutcome::from)
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    async fn execute_parallel(&self, step: ParallelStep, scope: GraphScope) -> Result<ExecOutcome, EngineError> {
        let mut set = JoinSet::new();
        for (index, child) in step.steps.into_iter().enumerate() {
            let fut = self.execute_step(child, scope.clone());
            set.spawn(async move { (index, fut.await) });
        }

        let mut done: Vec<(usize, ExecOutcome)> = Vec::new();
        let mut failures: Vec<(usize, EngineError)> = Vec::new();

        while let Some(joined) = set.join_next().await {
            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    set.detach_all();
                    return Err(join_error("parallel", e));
                }
            };
            match (step.wait_for, result) {
                (_, Err(e)) if e.is_suspension() => {
                    set.detach_all();
                    return Err(e);
                }
                (WaitFor::All, Ok(outcome)) => done.push((index, outcome)),
                (WaitFor::All, Err(e)) => {
                    set.detach_all();
                    return Err(e);
                }
                (WaitFor::Any, Ok(outcome)) => {
                    done.push((index, outcome));
                    set.detach_all();
                    break;
                }
                (WaitFor::Any, Err(e)) => {
                    tracing::debug!(child = index, error = %e, "parallel child failed, waiting for another");
                    failures.push((index, e));
                }
                (WaitFor::First, result) => {
                    set.detach_all();
                    done.push((index, result?));
                    break;
                }
            }
        }

        if done.is_empty() {
            failures.sort_by_key(|(index, _)| *index);
            if let Some((_, e)) = failures.into_iter().next() {
                return Err(e);
            }
        }

        done.sort_by_key(|(index, _)| *index);
        let mut merged = ExecOutcome::default();
        for (_, outcome) in done {
            merged.merge(outcome);
        }
        Ok(merged)
    }

    // -----------------------------------------------------------------------
    // Branch / Switch
    // -----------------------------------------------------------------------

    async fn execute_branch(&self, step: BranchStep, scope: GraphScope) -> Result<ExecOutcome, EngineError> {
        let taken = if self.evaluate_bool(&step.condition, &scope, "branch")? {
            step.then
        } else {
            step.else_steps
        };
        self.execute_sequence(taken, scope).await
    }

    async fn execute_switch(&self, mut step: SwitchStep, scope: GraphScope) -> Result<ExecOutcome, EngineError> {
        let label = match self.evaluate(&step.value_expr, &scope, "switch")? {
            Value::String(s) => s,
            other => stringify(&other),
        };
        let steps = match step.cases.remove(&label) {
            Some(case) => case,
            None => match step.default {
                Some(default) => default,
                None => {
                    tracing::debug!(label = %label, "switch matched no case and has no default");
                    return Ok(ExecOutcome::default());
                }
            },
        };
        self.execute_sequence(steps, scope).await
    }

    // -----------------------------------------------------------------------
    // Foreach / Map-Reduce
    // -----------------------------------------------------------------------

    /// Run `body` once per item with at most `limit` in flight.
    ///
    /// After each completion `break_when` is evaluated with `results`
    /// (outputs in completion order) and `completed` bound; once true no new
    /// items start, in-flight ones finish.
    async fn run_items(
        &self,
        construct: &str,
        items: Vec<Value>,
        body: &FlowStep,
        scope: &GraphScope,
        limit: usize,
        break_when: Option<&str>,
    ) -> Result<Vec<Option<ExecOutcome>>, EngineError> {
        let mut slots: Vec<Option<ExecOutcome>> = (0..items.len()).map(|_| None).collect();
        let mut completed_outputs: Vec<Value> = Vec::new();
        let mut progress = scope.clone();
        let mut pending = items.into_iter().enumerate();
        let mut set = JoinSet::new();
        let mut stopped = false;

        loop {
            while !stopped && set.len() < limit {
                let Some((index, item)) = pending.next() else {
                    break;
                };
                let mut item_scope = scope
                    .clone()
                    .with_var("item", item.clone())
                    .with_var("index", json!(index));
                item_scope.last_output = Some(item);
                let fut = self.execute_step(body.clone(), item_scope);
                set.spawn(async move { (index, fut.await) });
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let (index, outcome) = match joined {
                Ok((index, Ok(outcome))) => (index, outcome),
                Ok((_, Err(e))) => {
                    set.detach_all();
                    return Err(e);
                }
                Err(e) => {
                    set.detach_all();
                    return Err(join_error(construct, e));
                }
            };

            completed_outputs.push(outcome.last_output.clone().unwrap_or(Value::Null));
            progress.absorb(&outcome);
            slots[index] = Some(outcome);

            if let (false, Some(expr)) = (stopped, break_when) {
                let check = progress
                    .clone()
                    .with_var("results", Value::Array(completed_outputs.clone()))
                    .with_var("completed", json!(completed_outputs.len()));
                match self.evaluate_bool(expr, &check, construct) {
                    Ok(true) => {
                        tracing::debug!(
                            construct,
                            completed = completed_outputs.len(),
                            in_flight = set.len(),
                            "break condition met, not starting remaining items"
                        );
                        stopped = true;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        set.detach_all();
                        return Err(e);
                    }
                }
            }
        }

        Ok(slots)
    }

    async fn execute_foreach(&self, step: ForeachStep, scope: GraphScope) -> Result<ExecOutcome, EngineError> {
        let items = self.evaluate_items(&step.items_expr, &scope, "foreach")?;
        let limit = step.max_concurrency.unwrap_or(self.default_concurrency).max(1);
        let slots = self
            .run_items(
                "foreach",
                items,
                &step.body,
                &scope,
                limit,
                step.break_when_expr.as_deref(),
            )
            .await?;

        let mut merged = ExecOutcome::default();
        for outcome in slots.into_iter().flatten() {
            merged.merge(outcome);
        }
        Ok(merged)
    }

    async fn execute_map_reduce(&self, step: MapReduceStep, scope: GraphScope) -> Result<ExecOutcome, EngineError> {
        let items = self.evaluate_items(&step.items_expr, &scope, "map_reduce")?;
        let limit = step.max_concurrency.unwrap_or(self.default_concurrency).max(1);
        let slots = self
            .run_items("map_reduce", items.clone(), &step.map, &scope, limit, None)
            .await?;

        let mut merged = ExecOutcome::default();
        let mut mapped = Vec::with_capacity(slots.len());
        for outcome in slots.into_iter().flatten() {
            mapped.push(outcome.last_output.clone().unwrap_or(Value::Null));
            merged.merge(outcome);
        }

        let mut reduce_scope = scope
            .with_var("results", Value::Array(mapped.clone()))
            .with_var("items", Value::Array(items));
        reduce_scope.absorb(&merged);
        reduce_scope.last_output = Some(Value::Array(mapped));

        let reduced = self.execute_step(*step.reduce, reduce_scope).await?;
        merged.merge(reduced);
        Ok(merged)
    }

    // -----------------------------------------------------------------------
    // Try
    // -----------------------------------------------------------------------

    async fn execute_try(&self, step: TryStep, scope: GraphScope) -> Result<ExecOutcome, EngineError> {
        let mut acc = ExecOutcome::default();
        let mut scope = scope;
        let mut failure = None;
        let mut suspension = None;

        for child in step.steps {
            match self.execute_step(child, scope.clone()).await {
                Ok(outcome) => {
                    scope.absorb(&outcome);
                    acc.merge(outcome);
                }
                Err(e) if e.is_suspension() => {
                    suspension = Some(e);
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // A suspension skips catch but still runs finally before leaving.
        if let Some(suspended) = suspension {
            if !step.finally.is_empty() {
                self.execute_sequence(step.finally, scope).await?;
            }
            return Err(suspended);
        }

        let mut pending_error = None;
        if let Some(err) = failure {
            tracing::warn!(error = %err, "try block failed");
            if let Some(failed_step) = err.step() {
                let entry = ContextEntry {
                    output: json!({ "error": err.to_string() }),
                    success: false,
                };
                let failed = ExecOutcome::leaf(failed_step.to_string(), entry);
                scope.results.extend(failed.results.clone());
                acc.results.extend(failed.results);
            }

            if step.catch.is_empty() {
                pending_error = Some(err);
            } else {
                let catch_scope = scope.clone().with_var(
                    "error",
                    json!({
                        "message": err.to_string(),
                        "kind": err.kind(),
                        "step": err.step(),
                    }),
                );
                match self.execute_sequence(step.catch, catch_scope).await {
                    Ok(outcome) => {
                        scope.absorb(&outcome);
                        acc.merge(outcome);
                    }
                    Err(e) => pending_error = Some(e),
                }
            }
        }

        if !step.finally.is_empty() {
            let outcome = self.execute_sequence(step.finally, scope).await?;
            acc.merge(outcome);
        }

        match pending_error {
            Some(e) => Err(e),
            None => Ok(acc),
        }
    }

    // -----------------------------------------------------------------------
    // While
    // -----------------------------------------------------------------------

    async fn execute_while(&self, step: WhileStep, scope: GraphScope) -> Result<ExecOutcome, EngineError> {
        let mut acc = ExecOutcome::default();
        let mut scope = scope;
        let mut iterations = 0u32;

        while iterations < step.max_iterations {
            scope.vars.insert("iteration".into(), json!(iterations));
            if !self.evaluate_bool(&step.condition, &scope, "while")? {
                break;
            }
            let outcome = self.execute_sequence(step.steps.clone(), scope.clone()).await?;
            scope.absorb(&outcome);
            acc.merge(outcome);
            iterations += 1;
        }

        if iterations == step.max_iterations {
            tracing::debug!(max_iterations = step.max_iterations, "while loop stopped at maxIterations");
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::flow::expression::JexlResolver;
    use crate::flow::state::StateManager;
    use parking_lot::Mutex;

    /// Leaf executor driven by step config:
    /// `{ "delayMs": n, "fail": true, "value": v }`. Records start order.
    #[derive(Default)]
    struct ScriptedLeaves {
        started: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl LeafExecutor for Arc<ScriptedLeaves> {
        fn execute_leaf(&self, step: AgentStep, scope: GraphScope) -> LeafFuture {
            let this = self.clone();
            Box::pin(async move {
                let key = step.result_key().to_string();
                let config = step.config.clone().unwrap_or(json!({}));
                this.started.lock().push(key.clone());
                let now = this.running.fetch_add(1, Ordering::SeqCst) + 1;
                this.peak.fetch_max(now, Ordering::SeqCst);

                if let Some(ms) = config.get("delayMs").and_then(Value::as_u64) {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                this.running.fetch_sub(1, Ordering::SeqCst);

                if let Some(reason) = config.get("suspend").and_then(Value::as_str) {
                    return Err(EngineError::Suspended {
                        step: key,
                        reason: reason.to_string(),
                    });
                }
                if config.get("fail").and_then(Value::as_bool) == Some(true) {
                    return Err(EngineError::StepExecution {
                        step: key,
                        message: "scripted failure".into(),
                    });
                }
                let output = match config.get("value") {
                    Some(v) => v.clone(),
                    None => json!({
                        "item": scope.vars.get("item").cloned().unwrap_or(Value::Null),
                        "prev": scope.last_output.clone().unwrap_or(Value::Null),
                    }),
                };
                Ok(LeafOutcome::Completed {
                    key,
                    entry: ContextEntry::success(output),
                })
            })
        }
    }

    fn agent(name: &str, config: Value) -> FlowStep {
        FlowStep::Agent(AgentStep {
            config: Some(config),
            ..AgentStep::new(name)
        })
    }

    fn executor(leaves: &Arc<ScriptedLeaves>) -> FlowGraphExecutor {
        let state = StateHandle::new(StateManager::new(None, BTreeMap::new()).unwrap());
        FlowGraphExecutor::new(Arc::new(JexlResolver::new()), Arc::new(leaves.clone()), state, 4)
    }

    fn scope(input: Value) -> GraphScope {
        GraphScope::new(json!({ "input": input.clone(), "steps": {} }), Some(input))
    }

    fn parse(value: Value) -> FlowStep {
        serde_json::from_value(value).unwrap()
    }

    // -------------------------------------------------------------------
    // Parallel
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_parallel_all_merges_every_child() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = FlowStep::Parallel(ParallelStep {
            steps: vec![
                agent("slow", json!({ "delayMs": 30, "value": 1 })),
                agent("fast", json!({ "value": 2 })),
            ],
            wait_for: WaitFor::All,
        });
        let out = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap();
        assert_eq!(out.results["slow"].output, json!(1));
        assert_eq!(out.results["fast"].output, json!(2));
    }

    #[tokio::test]
    async fn test_parallel_all_fails_if_any_child_fails() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = FlowStep::Parallel(ParallelStep {
            steps: vec![
                agent("ok", json!({ "value": 1 })),
                agent("bad", json!({ "fail": true })),
            ],
            wait_for: WaitFor::All,
        });
        let err = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap_err();
        assert_eq!(err.step(), Some("bad"));
    }

    #[tokio::test]
    async fn test_parallel_any_resolves_on_slow_success() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = FlowStep::Parallel(ParallelStep {
            steps: vec![
                agent("fails_fast", json!({ "fail": true })),
                agent("succeeds_slow", json!({ "delayMs": 40, "value": "done" })),
            ],
            wait_for: WaitFor::Any,
        });
        let out = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap();
        // The only success is the slow child, so resolution waits for it and
        // its key is present; the failed child never contributes a key.
        assert_eq!(out.results["succeeds_slow"].output, json!("done"));
        assert!(!out.results.contains_key("fails_fast"));
    }

    #[tokio::test]
    async fn test_parallel_any_all_failed() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = FlowStep::Parallel(ParallelStep {
            steps: vec![
                agent("a", json!({ "fail": true })),
                agent("b", json!({ "fail": true, "delayMs": 5 })),
            ],
            wait_for: WaitFor::Any,
        });
        let err = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap_err();
        assert_eq!(err.step(), Some("a"));
    }

    #[tokio::test]
    async fn test_parallel_first_takes_first_finisher() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = FlowStep::Parallel(ParallelStep {
            steps: vec![
                agent("slow", json!({ "delayMs": 200, "value": 1 })),
                agent("quick", json!({ "value": 2 })),
            ],
            wait_for: WaitFor::First,
        });
        let out = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap();
        assert!(out.results.contains_key("quick"));
        assert!(!out.results.contains_key("slow"));
    }

    #[tokio::test]
    async fn test_parallel_duplicate_key_later_declared_wins() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let dup = |value: i64, delay: u64| {
            FlowStep::Agent(AgentStep {
                id: Some("dup".into()),
                config: Some(json!({ "value": value, "delayMs": delay })),
                ..AgentStep::new("worker")
            })
        };
        let step = FlowStep::Parallel(ParallelStep {
            // The later-declared child finishes first; it still wins.
            steps: vec![dup(1, 30), dup(2, 0)],
            wait_for: WaitFor::All,
        });
        let out = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap();
        assert_eq!(out.results["dup"].output, json!(2));
    }

    // -------------------------------------------------------------------
    // Branch / Switch
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_branch_picks_one_side() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "branch",
            "condition": "input.amount > 100",
            "then": [{ "name": "big", "config": { "value": "big" } }],
            "else": [{ "name": "small", "config": { "value": "small" } }]
        }));
        let out = executor(&leaves)
            .execute_step(step.clone(), scope(json!({ "amount": 500 })))
            .await
            .unwrap();
        assert!(out.results.contains_key("big"));
        assert!(!out.results.contains_key("small"));

        let out = executor(&leaves).execute_step(step, scope(json!({ "amount": 5 }))).await.unwrap();
        assert!(out.results.contains_key("small"));
    }

    #[tokio::test]
    async fn test_branch_without_else_is_noop() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "branch",
            "condition": "false",
            "then": [{ "name": "never" }]
        }));
        let out = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap();
        assert!(out.results.is_empty());
        assert!(leaves.started.lock().is_empty());
    }

    #[tokio::test]
    async fn test_switch_exact_match_and_default() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "switch",
            "valueExpr": "input.kind",
            "cases": {
                "invoice": [{ "name": "bill" }],
                "2": [{ "name": "two" }]
            },
            "default": [{ "name": "fallback" }]
        }));
        let exec = executor(&leaves);
        let out = exec.execute_step(step.clone(), scope(json!({ "kind": "invoice" }))).await.unwrap();
        assert!(out.results.contains_key("bill"));

        let out = exec.execute_step(step.clone(), scope(json!({ "kind": 2 }))).await.unwrap();
        assert!(out.results.contains_key("two"));

        let out = exec.execute_step(step, scope(json!({ "kind": "Invoice" }))).await.unwrap();
        assert!(out.results.contains_key("fallback"));
    }

    // -------------------------------------------------------------------
    // Foreach / Map-Reduce
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_foreach_break_after_second_item() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "foreach",
            "itemsExpr": "input.items",
            "maxConcurrency": 1,
            "breakWhenExpr": "completed >= 2",
            "body": { "name": "process" }
        }));
        let out = executor(&leaves)
            .execute_step(step, scope(json!({ "items": [1, 2, 3, 4, 5] })))
            .await
            .unwrap();
        assert_eq!(leaves.started.lock().len(), 2);
        assert_eq!(out.results["process"].output["item"], json!(2));
    }

    #[tokio::test]
    async fn test_foreach_break_with_default_concurrency_stops_after_first_wave() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "foreach",
            "itemsExpr": "input.items",
            "breakWhenExpr": "completed >= 1",
            "body": { "name": "process" }
        }));
        executor(&leaves)
            .execute_step(step, scope(json!({ "items": [1, 2, 3, 4, 5, 6, 7, 8] })))
            .await
            .unwrap();
        // The executor's default cap is 4: one wave starts, nothing after it.
        assert_eq!(leaves.started.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_foreach_respects_max_concurrency() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "foreach",
            "itemsExpr": "input.items",
            "maxConcurrency": 2,
            "body": { "name": "work", "config": { "delayMs": 15 } }
        }));
        executor(&leaves)
            .execute_step(step, scope(json!({ "items": [1, 2, 3, 4, 5, 6] })))
            .await
            .unwrap();
        assert_eq!(leaves.started.lock().len(), 6);
        assert!(leaves.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_foreach_last_item_wins_key() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "foreach",
            "itemsExpr": "input.items",
            "body": { "name": "each" }
        }));
        let out = executor(&leaves)
            .execute_step(step, scope(json!({ "items": ["a", "b", "c"] })))
            .await
            .unwrap();
        assert_eq!(out.results["each"].output["item"], json!("c"));
    }

    #[tokio::test]
    async fn test_foreach_non_array_items_is_error() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "foreach",
            "itemsExpr": "input.items",
            "body": { "name": "each" }
        }));
        let err = executor(&leaves)
            .execute_step(step, scope(json!({ "items": "nope" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "step_execution");
    }

    #[tokio::test]
    async fn test_map_reduce_collects_in_item_order() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "map_reduce",
            "itemsExpr": "input.items",
            "maxConcurrency": 3,
            "map": { "name": "mapper" },
            "reduce": { "name": "reducer" }
        }));
        let out = executor(&leaves)
            .execute_step(step, scope(json!({ "items": [10, 20, 30] })))
            .await
            .unwrap();
        let reduced = &out.results["reducer"].output;
        let prev = reduced["prev"].as_array().unwrap();
        let items: Vec<&Value> = prev.iter().map(|v| &v["item"]).collect();
        assert_eq!(items, vec![&json!(10), &json!(20), &json!(30)]);
        assert_eq!(leaves.started.lock().iter().filter(|s| *s == "reducer").count(), 1);
    }

    // -------------------------------------------------------------------
    // Try
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_try_catch_swallows_and_finally_runs() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "try",
            "steps": [
                { "name": "ok", "config": { "value": 1 } },
                { "name": "boom", "config": { "fail": true } },
                { "name": "skipped" }
            ],
            "catch": [{ "name": "recover", "config": { "value": "recovered" } }],
            "finally": [{ "name": "cleanup", "config": { "value": "clean" } }]
        }));
        let out = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap();
        assert!(out.results["ok"].success);
        assert!(!out.results["boom"].success);
        assert_eq!(out.results["recover"].output, json!("recovered"));
        assert_eq!(out.results["cleanup"].output, json!("clean"));
        assert!(!leaves.started.lock().contains(&"skipped".to_string()));
    }

    #[tokio::test]
    async fn test_try_finally_failure_overrides() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "try",
            "steps": [{ "name": "ok", "config": { "value": 1 } }],
            "finally": [{ "name": "cleanup", "config": { "fail": true } }]
        }));
        let err = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap_err();
        assert_eq!(err.step(), Some("cleanup"));
    }

    #[tokio::test]
    async fn test_try_without_catch_rethrows_after_finally() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "try",
            "steps": [{ "name": "boom", "config": { "fail": true } }],
            "finally": [{ "name": "cleanup", "config": { "value": 1 } }]
        }));
        let err = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap_err();
        assert_eq!(err.step(), Some("boom"));
        assert!(leaves.started.lock().contains(&"cleanup".to_string()));
    }

    #[tokio::test]
    async fn test_try_suspension_runs_finally_and_skips_catch() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "try",
            "steps": [
                { "name": "wait", "config": { "suspend": "needs approval" } },
                { "name": "after" }
            ],
            "catch": [{ "name": "recover", "config": { "value": 1 } }],
            "finally": [{ "name": "cleanup", "config": { "value": 1 } }]
        }));
        let err = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap_err();
        assert!(err.is_suspension());
        assert_eq!(err.step(), Some("wait"));
        let started = leaves.started.lock();
        assert_eq!(started.iter().filter(|s| *s == "cleanup").count(), 1);
        assert!(!started.contains(&"recover".to_string()));
        assert!(!started.contains(&"after".to_string()));
    }

    // -------------------------------------------------------------------
    // While
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_while_stops_at_max_iterations() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "while",
            "condition": "true",
            "maxIterations": 3,
            "steps": [{ "name": "tick", "config": { "value": 1 } }]
        }));
        executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap();
        assert_eq!(leaves.started.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_while_condition_sees_iteration() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = parse(json!({
            "type": "while",
            "condition": "iteration < 2",
            "maxIterations": 10,
            "steps": [{ "name": "tick", "config": { "value": 1 } }]
        }));
        executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap();
        assert_eq!(leaves.started.lock().len(), 2);
    }

    // -------------------------------------------------------------------
    // Sequencing
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_sequence_passes_previous_output() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let out = executor(&leaves)
            .execute(
                vec![agent("first", json!({ "value": "one" })), agent("second", json!({}))],
                scope(json!("input")),
            )
            .await
            .unwrap();
        assert_eq!(out.results["second"].output["prev"], json!("one"));
    }

    #[tokio::test]
    async fn test_depends_on_unknown_result_fails() {
        let leaves = Arc::new(ScriptedLeaves::default());
        let step = FlowStep::Agent(AgentStep {
            depends_on: vec!["ghost".into()],
            ..AgentStep::new("needs_ghost")
        });
        let err = executor(&leaves).execute_step(step, scope(json!({}))).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
