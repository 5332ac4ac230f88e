//! Flow domain types for Stepweave.
//!
//! A `FlowDefinition` is an ordered list of `FlowStep`s. A step is either a
//! leaf `AgentStep` (executes a named runner) or one of the control-flow
//! constructs, which nest arbitrarily. Control steps carry a `type`
//! discriminator on the wire; agent steps never do.

use std::collections::{BTreeMap, HashMap};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::scoring::ScoringConfig;
use crate::state::StateAccess;

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// A complete, already-parsed flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Human-readable flow name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Top-level steps in declaration order.
    pub steps: Vec<FlowStep>,
    /// Declarative output shaping applied to the final context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
    /// Initial shared state (must be an object when present).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<FlowStep>) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: None,
            steps,
            output: None,
            state: None,
            metadata: HashMap::new(),
        }
    }

    /// Whether any control-flow construct appears anywhere in the tree.
    pub fn has_control_flow(&self) -> bool {
        self.steps.iter().any(|s| !s.is_agent())
    }

    /// Every agent step in the tree, depth-first in declaration order.
    pub fn agent_steps(&self) -> Vec<&AgentStep> {
        let mut out = Vec::new();
        for step in &self.steps {
            step.collect_agents(&mut out);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Flow Step
// ---------------------------------------------------------------------------

/// One node of the flow tree.
#[derive(Debug, Clone)]
pub enum FlowStep {
    Agent(AgentStep),
    Parallel(ParallelStep),
    Branch(BranchStep),
    Foreach(ForeachStep),
    Try(TryStep),
    Switch(SwitchStep),
    While(WhileStep),
    MapReduce(MapReduceStep),
}

impl FlowStep {
    pub fn is_agent(&self) -> bool {
        matches!(self, FlowStep::Agent(_))
    }

    /// Wire tag for control steps, `"agent"` for leaves.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowStep::Agent(_) => "agent",
            FlowStep::Parallel(_) => "parallel",
            FlowStep::Branch(_) => "branch",
            FlowStep::Foreach(_) => "foreach",
            FlowStep::Try(_) => "try",
            FlowStep::Switch(_) => "switch",
            FlowStep::While(_) => "while",
            FlowStep::MapReduce(_) => "map_reduce",
        }
    }

    /// Direct children of this step, in declaration order.
    pub fn children(&self) -> Vec<&FlowStep> {
        match self {
            FlowStep::Agent(_) => Vec::new(),
            FlowStep::Parallel(p) => p.steps.iter().collect(),
            FlowStep::Branch(b) => b.then.iter().chain(b.else_steps.iter()).collect(),
            FlowStep::Foreach(f) => vec![f.body.as_ref()],
            FlowStep::Try(t) => t
                .steps
                .iter()
                .chain(t.catch.iter())
                .chain(t.finally.iter())
                .collect(),
            FlowStep::Switch(s) => s
                .cases
                .values()
                .flatten()
                .chain(s.default.iter().flatten())
                .collect(),
            FlowStep::While(w) => w.steps.iter().collect(),
            FlowStep::MapReduce(m) => vec![m.map.as_ref(), m.reduce.as_ref()],
        }
    }

    fn collect_agents<'a>(&'a self, out: &mut Vec<&'a AgentStep>) {
        if let FlowStep::Agent(agent) = self {
            out.push(agent);
        }
        for child in self.children() {
            child.collect_agents(out);
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedStep {
    Parallel(ParallelStep),
    Branch(BranchStep),
    Foreach(ForeachStep),
    Try(TryStep),
    Switch(SwitchStep),
    While(WhileStep),
    #[serde(alias = "mapReduce")]
    MapReduce(MapReduceStep),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedStepRef<'a> {
    Parallel(&'a ParallelStep),
    Branch(&'a BranchStep),
    Foreach(&'a ForeachStep),
    Try(&'a TryStep),
    Switch(&'a SwitchStep),
    While(&'a WhileStep),
    MapReduce(&'a MapReduceStep),
}

impl Serialize for FlowStep {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tagged = match self {
            FlowStep::Agent(agent) => return agent.serialize(serializer),
            FlowStep::Parallel(s) => TaggedStepRef::Parallel(s),
            FlowStep::Branch(s) => TaggedStepRef::Branch(s),
            FlowStep::Foreach(s) => TaggedStepRef::Foreach(s),
            FlowStep::Try(s) => TaggedStepRef::Try(s),
            FlowStep::Switch(s) => TaggedStepRef::Switch(s),
            FlowStep::While(s) => TaggedStepRef::While(s),
            FlowStep::MapReduce(s) => TaggedStepRef::MapReduce(s),
        };
        tagged.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FlowStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        if raw.get("type").is_none() {
            return serde_json::from_value(raw)
                .map(FlowStep::Agent)
                .map_err(D::Error::custom);
        }
        let tagged: TaggedStep = serde_json::from_value(raw).map_err(D::Error::custom)?;
        Ok(match tagged {
            TaggedStep::Parallel(s) => FlowStep::Parallel(s),
            TaggedStep::Branch(s) => FlowStep::Branch(s),
            TaggedStep::Foreach(s) => FlowStep::Foreach(s),
            TaggedStep::Try(s) => FlowStep::Try(s),
            TaggedStep::Switch(s) => FlowStep::Switch(s),
            TaggedStep::While(s) => FlowStep::While(s),
            TaggedStep::MapReduce(s) => FlowStep::MapReduce(s),
        })
    }
}

// ---------------------------------------------------------------------------
// Agent Step
// ---------------------------------------------------------------------------

/// A leaf step that executes a runner resolved by `name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStep {
    /// Runner name, also the result key when `id` is absent.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Explicit input template; `${...}` expressions are interpolated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<Value>,
    /// Opaque runner configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_access: Option<StateAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringConfig>,
    /// Expression; the step is skipped when it evaluates falsy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<OnTimeout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
}

impl AgentStep {
    /// Create a step running `name` with every option unset.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The key this step's result is stored under.
    pub fn result_key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

/// What to do when a step exceeds its timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OnTimeout {
    #[default]
    Fail,
    /// Accept the given output in place of the abandoned result.
    Fallback { output: Value },
}

/// Result caching for a leaf step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entry lifetime; entries never expire when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Interpolated cache key; derived from runner, key and input when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Plain retry policy for a step without a quality gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts (default 1000 ms).
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub strategy: RetryStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
            strategy: RetryStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> u64 {
        match self.strategy {
            RetryStrategy::Fixed => self.delay_ms,
            RetryStrategy::Exponential => self
                .delay_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    Fixed,
    Exponential,
}

// ---------------------------------------------------------------------------
// Control-flow steps
// ---------------------------------------------------------------------------

/// How a Parallel construct resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitFor {
    #[default]
    All,
    Any,
    First,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelStep {
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub wait_for: WaitFor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchStep {
    pub condition: String,
    #[serde(default)]
    pub then: Vec<FlowStep>,
    #[serde(rename = "else", default, skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<FlowStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeachStep {
    pub items_expr: String,
    /// Items in flight at once. Defaults to the engine's
    /// `default_max_concurrency`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Checked after each item completes; once true, no further items are
    /// started. Items already in flight still finish, so with a concurrency
    /// above 1 up to `max_concurrency` items can start before the first
    /// check. Set `maxConcurrency: 1` for a strict early exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_when_expr: Option<String>,
    pub body: Box<FlowStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TryStep {
    pub steps: Vec<FlowStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<FlowStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finally: Vec<FlowStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchStep {
    pub value_expr: String,
    #[serde(default)]
    pub cases: BTreeMap<String, Vec<FlowStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<FlowStep>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhileStep {
    pub condition: String,
    pub max_iterations: u32,
    pub steps: Vec<FlowStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapReduceStep {
    pub items_expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    pub map: Box<FlowStep>,
    pub reduce: Box<FlowStep>,
}

// ---------------------------------------------------------------------------
// Output shaping
// ---------------------------------------------------------------------------

/// Declarative description of the run's final response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    /// Template resolved to a JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Template resolved to a raw string body; wins over `body`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

fn default_status() -> u16 {
    200
}

/// The resolved response produced from an `OutputSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapedOutput {
    pub body: ShapedBody,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapedBody {
    Json(Value),
    Raw(String),
}
