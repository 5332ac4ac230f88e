//! Shared state manager.
//!
//! State is a versioned JSON object. Every commit produces a new
//! [`StateManager`]; handles already given out keep reading the version they
//! were taken from. Steps see state through a [`ScopedState`] that records
//! declared reads and buffers writes until the step succeeds.
//!
//! Two branches committing the same key are applied in completion order
//! (last applied wins). The overwrite is reported in the access report, not
//! rejected.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use stepweave_types::flow::FlowDefinition;
use stepweave_types::state::{AccessKind, AccessLogEntry, AccessReport, StateAccess, WriteRace};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// One immutable version of the shared state.
#[derive(Debug, Clone)]
pub struct StateManager {
    inner: Arc<StateVersion>,
}

#[derive(Debug, Clone)]
struct StateVersion {
    version: u64,
    state: Map<String, Value>,
    declared: Arc<BTreeMap<String, StateAccess>>,
    log: Vec<AccessLogEntry>,
    /// Key to (version it was written at, step that wrote it).
    writers: HashMap<String, (u64, String)>,
    unrecorded: BTreeMap<String, BTreeSet<String>>,
    races: Vec<WriteRace>,
}

/// Writes buffered by one step, applied together on success.
#[derive(Debug, Clone, Default)]
pub struct PendingUpdates {
    pub step: String,
    /// Version the step's view was taken from.
    pub base_version: u64,
    pub writes: Map<String, Value>,
    /// Written keys that went through the declared `set` contract.
    pub recorded: BTreeSet<String>,
}

impl PendingUpdates {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

impl StateManager {
    /// Create version 0 from an optional initial object and the declared
    /// per-step contracts.
    pub fn new(
        initial: Option<Value>,
        declared: BTreeMap<String, StateAccess>,
    ) -> Result<Self, StateError> {
        let state = match initial {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => return Err(StateError::NotAnObject(json_type(&other))),
        };
        Ok(Self {
            inner: Arc::new(StateVersion {
                version: 0,
                state,
                declared: Arc::new(declared),
                log: Vec::new(),
                writers: HashMap::new(),
                unrecorded: BTreeMap::new(),
                races: Vec::new(),
            }),
        })
    }

    /// Rebuild a manager from a previously captured report.
    pub fn restore(report: AccessReport) -> Result<Self, StateError> {
        let state = match report.final_state {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => return Err(StateError::NotAnObject(json_type(&other))),
        };
        Ok(Self {
            inner: Arc::new(StateVersion {
                version: report.version,
                state,
                declared: Arc::new(report.declared),
                log: report.log,
                writers: HashMap::new(),
                unrecorded: report.unrecorded_writes,
                races: report.write_races,
            }),
        })
    }

    pub fn version(&self) -> u64 {
        self.inner.version
    }

    /// The full state object of this version.
    pub fn get_state(&self) -> Value {
        Value::Object(self.inner.state.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.state.get(key)
    }

    pub fn declared(&self) -> &BTreeMap<String, StateAccess> {
        &self.inner.declared
    }

    pub fn access_log(&self) -> &[AccessLogEntry] {
        &self.inner.log
    }

    /// Produce the next version. `self` is left untouched.
    pub fn apply_pending_updates(
        &self,
        updates: PendingUpdates,
        new_entries: Vec<AccessLogEntry>,
    ) -> StateManager {
        let mut next = (*self.inner).clone();
        next.version += 1;
        next.log.extend(new_entries);

        for (key, value) in updates.writes {
            if let Some((written_at, writer)) = next.writers.get(&key) {
                if *written_at > updates.base_version && *writer != updates.step {
                    tracing::warn!(
                        key = %key,
                        overwritten = %writer,
                        applied = %updates.step,
                        "concurrent write to the same state key, last applied wins"
                    );
                    next.races.push(WriteRace {
                        key: key.clone(),
                        overwritten: writer.clone(),
                        applied: updates.step.clone(),
                        version: next.version,
                    });
                }
            }
            if !updates.recorded.contains(&key) {
                next.unrecorded
                    .entry(updates.step.clone())
                    .or_default()
                    .insert(key.clone());
            }
            next.writers
                .insert(key.clone(), (next.version, updates.step.clone()));
            next.state.insert(key, value);
        }

        StateManager {
            inner: Arc::new(next),
        }
    }

    /// A step-scoped view over this version.
    pub fn scoped(&self, step: impl Into<String>, access: StateAccess) -> ScopedState {
        ScopedState {
            step: step.into(),
            base: self.clone(),
            access,
            pending: Mutex::new(PendingUpdates::default()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn report(&self) -> AccessReport {
        AccessReport {
            version: self.inner.version,
            final_state: self.get_state(),
            declared: (*self.inner.declared).clone(),
            log: self.inner.log.clone(),
            unrecorded_writes: self.inner.unrecorded.clone(),
            write_races: self.inner.races.clone(),
        }
    }
}

/// Declared `stateAccess` contracts of every agent step, by result key.
pub fn declared_access(flow: &FlowDefinition) -> BTreeMap<String, StateAccess> {
    flow.agent_steps()
        .into_iter()
        .filter_map(|agent| {
            agent
                .state_access
                .clone()
                .map(|access| (agent.result_key().to_string(), access))
        })
        .collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// ScopedState
// ---------------------------------------------------------------------------

/// A single step's capability-limited view of state.
///
/// `get` only exposes declared `use` keys and records each read. `set`
/// buffers the write; only declared `set` keys are recorded in the log.
/// `raw` exposes the whole object without recording anything.
#[derive(Debug)]
pub struct ScopedState {
    step: String,
    base: StateManager,
    access: StateAccess,
    pending: Mutex<PendingUpdates>,
    log: Mutex<Vec<AccessLogEntry>>,
}

impl ScopedState {
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn access(&self) -> &StateAccess {
        &self.access
    }

    /// Read a declared key. The step's own pending writes are visible.
    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.access.may_read(key) {
            tracing::debug!(step = %self.step, key, "read of undeclared state key denied");
            return None;
        }
        self.record(key, AccessKind::Read);
        let pending = self.pending.lock();
        pending
            .writes
            .get(key)
            .or_else(|| self.base.get(key))
            .cloned()
    }

    /// Buffer a write, applied only if the step succeeds.
    pub fn set(&self, key: &str, value: Value) {
        let declared = self.access.may_write(key);
        if declared {
            self.record(key, AccessKind::Write);
        } else {
            tracing::warn!(step = %self.step, key, "write to undeclared state key");
        }
        let mut pending = self.pending.lock();
        if declared {
            pending.recorded.insert(key.to_string());
        }
        pending.writes.insert(key.to_string(), value);
    }

    /// The untracked state object this view was taken from.
    pub fn raw(&self) -> Value {
        self.base.get_state()
    }

    fn record(&self, key: &str, kind: AccessKind) {
        self.log.lock().push(AccessLogEntry {
            step: self.step.clone(),
            key: key.to_string(),
            kind,
            timestamp: Utc::now(),
        });
    }

    /// Drain buffered writes and access entries.
    pub fn take_pending(&self) -> (PendingUpdates, Vec<AccessLogEntry>) {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        pending.step = self.step.clone();
        pending.base_version = self.base.version();
        let log = std::mem::take(&mut *self.log.lock());
        (pending, log)
    }
}

// ---------------------------------------------------------------------------
// StateHandle
// ---------------------------------------------------------------------------

/// The run's pointer to the latest committed [`StateManager`].
#[derive(Debug, Clone)]
pub struct StateHandle {
    current: Arc<RwLock<StateManager>>,
}

impl StateHandle {
    pub fn new(manager: StateManager) -> Self {
        Self {
            current: Arc::new(RwLock::new(manager)),
        }
    }

    pub fn current(&self) -> StateManager {
        self.current.read().clone()
    }

    /// Apply a successful step's buffered writes and reads.
    pub fn commit(&self, scoped: &ScopedState) -> u64 {
        let (updates, entries) = scoped.take_pending();
        if updates.is_empty() && entries.is_empty() {
            return self.current.read().version();
        }
        let mut current = self.current.write();
        let next = current.apply_pending_updates(updates, entries);
        let version = next.version();
        *current = next;
        version
    }
}
