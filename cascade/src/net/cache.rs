//! Per-submission key/value store filled by broadcast collectives.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::SubmissionId;
use crate::value::Value;

#[derive(Debug, Default)]
pub struct SubmissionCache {
    entries: RwLock<HashMap<SubmissionId, HashMap<Value, Value>>>,
}

impl SubmissionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, submission: SubmissionId, key: Value, value: Value) {
        self.entries
            .write()
            .entry(submission)
            .or_default()
            .insert(key, value);
    }

    pub fn put_all(&self, submission: SubmissionId, entries: impl IntoIterator<Item = (Value, Value)>) {
        self.entries
            .write()
            .entry(submission)
            .or_default()
            .extend(entries);
    }

    #[must_use]
    pub fn get(&self, submission: SubmissionId, key: &Value) -> Option<Value> {
        self.entries.read().get(&submission)?.get(key).cloned()
    }

    /// Looks up every key, keeping the order of `keys`.
    #[must_use]
    pub fn get_all(&self, submission: SubmissionId, keys: &[Value]) -> Vec<Option<Value>> {
        let entries = self.entries.read();
        let map = entries.get(&submission);
        keys.iter()
            .map(|k| map.and_then(|m| m.get(k)).cloned())
            .collect()
    }

    /// Drops everything stored for a finished submission.
    pub fn clear_submission(&self, submission: SubmissionId) {
        self.entries.write().remove(&submission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_scoped_by_submission() {
        let cache = SubmissionCache::new();
        let a = SubmissionId::new(1);
        let b = SubmissionId::new(2);
        cache.put_all(a, [(Value::from("k"), Value::Int(1))]);
        cache.put(b, Value::from("k"), Value::Int(2));

        assert_eq!(cache.get(a, &Value::from("k")), Some(Value::Int(1)));
        assert_eq!(
            cache.get_all(b, &[Value::from("k"), Value::from("missing")]),
            vec![Some(Value::Int(2)), None]
        );

        cache.clear_submission(a);
        assert_eq!(cache.get(a, &Value::from("k")), None);
        assert_eq!(cache.get_all(a, &[Value::Null]), vec![None]);
    }
}
