//! Run execution context.
//!
//! `ExecutionContext` maps every step's result key to `{output, success}`
//! alongside the reserved `input`, `state`, `scoring` and `resume` views.
//! Writes are last-write-wins per key; loop bodies rely on this to expose
//! per-iteration output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Keys a step result may never be stored under.
pub const RESERVED_KEYS: &[&str] = &["input", "state", "scoring", "resume", "steps", "flow"];

/// One stored step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub output: Value,
    pub success: bool,
}

impl ContextEntry {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            success: true,
        }
    }
}

/// Result key to entry. Ordered so serialized snapshots are stable.
pub type ResultMap = BTreeMap<String, ContextEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub flow_name: String,
    /// Original run input.
    pub input: Value,
    #[serde(default)]
    pub results: ResultMap,
    /// Snapshot of shared state as of the last committed step.
    #[serde(default)]
    pub state: Value,
    /// Snapshot of the scoring state as of the last committed step.
    #[serde(default)]
    pub scoring: Value,
    /// Input supplied when the run was resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,
    /// Output of the most recently completed top-level step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_output: Option<Value>,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, flow_name: impl Into<String>, input: Value) -> Self {
        Self {
            execution_id,
            flow_name: flow_name.into(),
            input,
            results: ResultMap::new(),
            state: json!({}),
            scoring: json!({}),
            resume: None,
            previous_output: None,
        }
    }

    pub fn set_entry(&mut self, key: &str, entry: ContextEntry) {
        self.results.insert(key.to_string(), entry);
    }

    pub fn get_output(&self, key: &str) -> Option<&Value> {
        self.results.get(key).map(|e| &e.output)
    }

    /// Merge a result map; entries in `results` win.
    pub fn merge(&mut self, results: ResultMap) {
        self.results.extend(results);
    }

    /// The input handed to a step without an explicit mapping.
    pub fn default_input(&self) -> Value {
        self.previous_output
            .clone()
            .unwrap_or_else(|| self.input.clone())
    }

    /// Build the object expressions are evaluated against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "<key>": <output>, ...,
    ///   "steps": { "<key>": { "output": ..., "success": true } },
    ///   "input": ..., "state": ..., "scoring": ..., "resume": ...,
    ///   "flow": { "name": "...", "executionId": "..." }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut map = Map::new();
        insert_results(&mut map, &self.results);
        map.insert("input".into(), self.input.clone());
        map.insert("state".into(), self.state.clone());
        map.insert("scoring".into(), self.scoring.clone());
        map.insert("resume".into(), self.resume.clone().unwrap_or(Value::Null));
        map.insert(
            "flow".into(),
            json!({ "name": self.flow_name, "executionId": self.execution_id.to_string() }),
        );
        Value::Object(map)
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Add results to an expression context, both flat and under `steps`.
pub(crate) fn insert_results(map: &mut Map<String, Value>, results: &ResultMap) {
    let mut steps = match map.remove("steps") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    for (key, entry) in results {
        map.insert(key.clone(), entry.output.clone());
        steps.insert(key.clone(), json!({ "output": entry.output, "success": entry.success }));
    }
    map.insert("steps".into(), Value::Object(steps));
}

/// Replace oversized outputs with a truncation marker.
pub(crate) fn limit_output(step: &str, output: Value, max_bytes: usize) -> Value {
    let size = serde_json::to_vec(&output).map(|v| v.len()).unwrap_or(0);
    if size <= max_bytes {
        return output;
    }
    tracing::warn!(
        step,
        size,
        max = max_bytes,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_originalSize": size,
        "_message": format!("output exceeded {max_bytes} byte limit and was truncated"),
    })
}
