//! Pre-run flow validation.
//!
//! Runs before any step executes. Every problem maps to
//! `EngineError::RunValidation` so a malformed flow never produces partial
//! results.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use stepweave_types::flow::{AgentStep, FlowDefinition, FlowStep};
use stepweave_types::scoring::Thresholds;

use super::context::RESERVED_KEYS;
use super::error::EngineError;

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::RunValidation(message.into())
}

/// Validate a flow definition.
pub fn validate_flow(flow: &FlowDefinition) -> Result<(), EngineError> {
    if flow.steps.is_empty() {
        return Err(invalid(format!("flow '{}' has no steps", flow.name)));
    }
    if let Some(state) = &flow.state {
        if !(state.is_object() || state.is_null()) {
            return Err(invalid("initial state must be an object"));
        }
    }

    for step in &flow.steps {
        validate_step(step)?;
    }

    validate_dependencies(flow)
}

fn validate_step(step: &FlowStep) -> Result<(), EngineError> {
    match step {
        FlowStep::Agent(agent) => validate_agent(agent)?,
        FlowStep::Parallel(p) if p.steps.is_empty() => {
            return Err(invalid("parallel step needs at least one child"));
        }
        FlowStep::While(w) if w.max_iterations == 0 => {
            return Err(invalid("while step needs maxIterations >= 1"));
        }
        FlowStep::Foreach(f) if f.max_concurrency == Some(0) => {
            return Err(invalid("foreach maxConcurrency must be >= 1"));
        }
        FlowStep::MapReduce(m) if m.max_concurrency == Some(0) => {
            return Err(invalid("map_reduce maxConcurrency must be >= 1"));
        }
        FlowStep::Switch(s) if s.cases.is_empty() && s.default.is_none() => {
            return Err(invalid("switch step needs at least one case or a default"));
        }
        _ => {}
    }
    for child in step.children() {
        validate_step(child)?;
    }
    Ok(())
}

fn validate_agent(agent: &AgentStep) -> Result<(), EngineError> {
    if agent.name.trim().is_empty() {
        return Err(invalid("step name cannot be empty"));
    }
    let key = agent.result_key();
    if key.trim().is_empty() {
        return Err(invalid(format!("step '{}' has an empty id", agent.name)));
    }
    if RESERVED_KEYS.contains(&key) {
        return Err(invalid(format!(
            "step result key '{key}' collides with a reserved context key"
        )));
    }
    if agent.timeout_ms == Some(0) {
        return Err(invalid(format!("step '{key}' has a zero timeoutMs")));
    }
    if agent.retry.as_ref().is_some_and(|r| r.max_attempts == 0) {
        return Err(invalid(format!("step '{key}' retry.maxAttempts must be >= 1")));
    }
    if let Some(scoring) = &agent.scoring {
        if scoring.evaluator.trim().is_empty() {
            return Err(invalid(format!("step '{key}' scoring has no evaluator")));
        }
        validate_thresholds(key, &scoring.thresholds)?;
    }
    Ok(())
}

fn validate_thresholds(key: &str, t: &Thresholds) -> Result<(), EngineError> {
    let in_range = |v: f64| (0.0..=1.0).contains(&v);
    let values = [Some(t.minimum), t.target, t.excellent];
    if values.iter().flatten().any(|v| !in_range(*v)) {
        return Err(invalid(format!("step '{key}' thresholds must lie in [0, 1]")));
    }
    let ordered: Vec<f64> = values.into_iter().flatten().collect();
    if ordered.windows(2).any(|w| w[0] > w[1]) {
        return Err(invalid(format!(
            "step '{key}' thresholds must satisfy minimum <= target <= excellent"
        )));
    }
    Ok(())
}

/// Check `dependsOn` references: known keys, acyclic, and for flat flows
/// declared before the dependent step.
fn validate_dependencies(flow: &FlowDefinition) -> Result<(), EngineError> {
    let agents = flow.agent_steps();

    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for agent in &agents {
        let key = agent.result_key();
        nodes.entry(key).or_insert_with(|| graph.add_node(key));
    }

    for agent in &agents {
        let to = nodes[agent.result_key()];
        for dep in &agent.depends_on {
            let from = nodes.get(dep.as_str()).ok_or_else(|| {
                invalid(format!(
                    "step '{}' depends on unknown step '{}'",
                    agent.result_key(),
                    dep
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        invalid(format!(
            "dependency cycle involving step '{}'",
            graph[cycle.node_id()]
        ))
    })?;

    if !flow.has_control_flow() {
        let mut declared: HashMap<&str, usize> = HashMap::new();
        for (index, agent) in agents.iter().enumerate() {
            for dep in &agent.depends_on {
                if !declared.contains_key(dep.as_str()) {
                    return Err(invalid(format!(
                        "step '{}' depends on '{}', which runs later",
                        agent.result_key(),
                        dep
                    )));
                }
            }
            declared.entry(agent.result_key()).or_insert(index);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow(value: serde_json::Value) -> FlowDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn message(result: Result<(), EngineError>) -> String {
        match result {
            Err(EngineError::RunValidation(m)) => m,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_flow_passes() {
        let f = flow(json!({
            "name": "ok",
            "steps": [
                { "name": "a" },
                { "name": "b", "dependsOn": ["a"] },
                { "type": "parallel", "steps": [{ "name": "c" }] }
            ]
        }));
        assert!(validate_flow(&f).is_ok());
    }

    #[test]
    fn test_rejects_empty_flow() {
        let f = flow(json!({ "name": "empty", "steps": [] }));
        assert!(message(validate_flow(&f)).contains("no steps"));
    }

    #[test]
    fn test_rejects_reserved_key() {
        let f = flow(json!({ "name": "r", "steps": [{ "name": "passthrough", "id": "input" }] }));
        assert!(message(validate_flow(&f)).contains("reserved"));
    }

    #[test]
    fn test_rejects_look_ahead_in_flat_flow() {
        let f = flow(json!({
            "name": "ahead",
            "steps": [
                { "name": "a", "dependsOn": ["b"] },
                { "name": "b" }
            ]
        }));
        assert!(message(validate_flow(&f)).contains("runs later"));
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let f = flow(json!({
            "name": "unknown",
            "steps": [{ "name": "a", "dependsOn": ["ghost"] }]
        }));
        assert!(message(validate_flow(&f)).contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_rejects_cycle() {
        let f = flow(json!({
            "name": "cycle",
            "steps": [{
                "type": "parallel",
                "steps": [
                    { "name": "a", "dependsOn": ["b"] },
                    { "name": "b", "dependsOn": ["a"] }
                ]
            }]
        }));
        assert!(message(validate_flow(&f)).contains("cycle"));
    }

    #[test]
    fn test_rejects_bad_control_steps() {
        let cases = [
            json!({ "type": "parallel", "steps": [] }),
            json!({ "type": "while", "condition": "true", "maxIterations": 0, "steps": [] }),
            json!({ "type": "foreach", "itemsExpr": "input", "maxConcurrency": 0, "body": { "name": "x" } }),
            json!({ "type": "switch", "valueExpr": "input" }),
        ];
        for step in cases {
            let f = flow(json!({ "name": "bad", "steps": [step] }));
            assert!(validate_flow(&f).is_err());
        }
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let f = flow(json!({
            "name": "scores",
            "steps": [{
                "name": "draft",
                "scoring": {
                    "evaluator": "judge",
                    "thresholds": { "minimum": 0.9, "target": 0.5 }
                }
            }]
        }));
        assert!(message(validate_flow(&f)).contains("minimum <= target"));
    }
}
