//! Per-orchestrator step output cache.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Clone)]
struct CachedOutput {
    output: Value,
    expires_at: Option<Instant>,
}

/// TTL cache of successful step outputs shared by every run of one
/// orchestrator.
#[derive(Debug, Default)]
pub struct StepCache {
    entries: DashMap<String, CachedOutput>,
}

impl StepCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default key: `runner:resultKey:input-json`.
    pub fn key_for(runner: &str, result_key: &str, input: &Value) -> String {
        format!("{runner}:{result_key}:{input}")
    }

    /// Cached output, if present and not expired. Expired entries are evicted.
    pub fn get(&self, key: &str) -> Option<Value> {
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at.is_none_or(|at| at > Instant::now()) {
                return Some(entry.output.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    pub fn insert(&self, key: String, output: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key, CachedOutput { output, expires_at });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hit_and_miss() {
        let cache = StepCache::new();
        let key = StepCache::key_for("passthrough", "a", &json!({ "q": 1 }));
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), json!("out"), None);
        assert_eq!(cache.get(&key), Some(json!("out")));
    }

    #[test]
    fn test_key_depends_on_input() {
        let a = StepCache::key_for("r", "s", &json!(1));
        let b = StepCache::key_for("r", "s", &json!(2));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted() {
        let cache = StepCache::new();
        cache.insert("k".into(), json!(1), Some(Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }
}
