//! Shared-state access declarations and the access audit log.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The state keys a step may read (`use`) and write (`set`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAccess {
    #[serde(rename = "use", default)]
    pub use_keys: Vec<String>,
    #[serde(rename = "set", default)]
    pub set_keys: Vec<String>,
}

impl StateAccess {
    pub fn may_read(&self, key: &str) -> bool {
        self.use_keys.iter().any(|k| k == key)
    }

    pub fn may_write(&self, key: &str) -> bool {
        self.set_keys.iter().any(|k| k == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub step: String,
    pub key: String,
    pub kind: AccessKind,
    pub timestamp: DateTime<Utc>,
}

/// Two branches committed the same key from the same base version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRace {
    pub key: String,
    /// Step whose write was overwritten.
    pub overwritten: String,
    /// Step whose write was applied last and is visible.
    pub applied: String,
    pub version: u64,
}

/// Diagnostic artifact of a completed run: declared contracts against
/// observed access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessReport {
    pub version: u64,
    pub final_state: Value,
    /// Declared contracts per step result key.
    pub declared: BTreeMap<String, StateAccess>,
    pub log: Vec<AccessLogEntry>,
    /// Keys changed by a step without a recorded write.
    pub unrecorded_writes: BTreeMap<String, BTreeSet<String>>,
    pub write_races: Vec<WriteRace>,
}

impl AccessReport {
    /// Keys `step` was recorded reading.
    pub fn reads_by(&self, step: &str) -> BTreeSet<&str> {
        self.keys_by(step, AccessKind::Read)
    }

    /// Keys `step` was recorded writing.
    pub fn writes_by(&self, step: &str) -> BTreeSet<&str> {
        self.keys_by(step, AccessKind::Write)
    }

    fn keys_by(&self, step: &str, kind: AccessKind) -> BTreeSet<&str> {
        self.log
            .iter()
            .filter(|e| e.step == step && e.kind == kind)
            .map(|e| e.key.as_str())
            .collect()
    }

    /// True when no step touched state outside its declared contract.
    pub fn is_consistent(&self) -> bool {
        self.unrecorded_writes.is_empty()
    }
}
