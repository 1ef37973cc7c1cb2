//! Merge-only result mapping accumulated on a task.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// String-keyed mapping to arbitrary serializable values.
///
/// Results only grow: merging overwrites existing keys and adds new ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskResult(Map<String, Value>);

impl TaskResult {
    /// Create an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `other` into this result, overwriting keys present in both.
    pub fn merge(&mut self, other: TaskResult) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    /// Insert a single value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a single value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no keys have been set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert into a JSON object value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for TaskResult
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl<K, V> FromIterator<(K, V)> for TaskResult
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<Map<String, Value>> for TaskResult {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
