//! On-disk results of completed executions, keyed by task and canonical parameters.

use autobrowse_core::paths::sanitize;
use autobrowse_core::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub task_id: String,
    pub params_hash: String,
    pub execution_id: String,
    pub parameters: Value,
    pub result: Value,
    pub cached_at: DateTime<Utc>,
}

pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, task_id: &str, params: &Value) -> PathBuf {
        self.dir
            .join(sanitize(task_id))
            .join(format!("{}.json", params_hash(params)))
    }

    pub fn get(&self, task_id: &str, params: &Value) -> Option<CachedResult> {
        let content = std::fs::read_to_string(self.path(task_id, params)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn put(
        &self,
        task_id: &str,
        execution_id: &str,
        params: &Value,
        result: &Value,
    ) -> Result<()> {
        let path = self.path(task_id, params);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entry = CachedResult {
            task_id: task_id.to_string(),
            params_hash: params_hash(params),
            execution_id: execution_id.to_string(),
            parameters: params.clone(),
            result: result.clone(),
            cached_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&entry)?)?;
        debug!(task_id, execution_id, path = %path.display(), "Result cached");
        Ok(())
    }

    /// Remove every cached result of a task.
    pub fn remove_task(&self, task_id: &str) -> Result<()> {
        let dir = self.dir.join(sanitize(task_id));
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Key order independent JSON rendering.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(obj) => {
                let ordered: BTreeMap<&String, Value> =
                    obj.iter().map(|(k, v)| (k, sorted(v))).collect();
                let mut out = serde_json::Map::new();
                for (k, v) in ordered {
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

pub fn params_hash(params: &Value) -> String {
    let digest = Sha256::digest(canonical_json(params).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(params_hash(&a), params_hash(&b));
        assert_ne!(params_hash(&a), params_hash(&json!({"b": 2})));
        assert_eq!(params_hash(&a).len(), 64);
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path().to_path_buf());
        let params = json!({"q": "rust"});
        assert!(cache.get("task", &params).is_none());

        cache.put("task", "exec-1", &params, &json!({"hits": 3})).unwrap();
        let cached = cache.get("task", &params).unwrap();
        assert_eq!(cached.result, json!({"hits": 3}));
        assert_eq!(cached.execution_id, "exec-1");

        cache.remove_task("task").unwrap();
        assert!(cache.get("task", &params).is_none());
    }
}
