//! In-memory record store backing the reference handlers.
//!
//! Records are JSON objects keyed by `(entity, record_id)` in a [`DashMap`],
//! so concurrent handlers need no external locking.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;

type RecordKey = (String, String);

fn key(entity: &str, record_id: &str) -> RecordKey {
    (entity.to_string(), record_id.to_string())
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<RecordKey, Value>,
    templates: DashMap<String, Value>,
    /// Remaining injected failures per record, consumed one per access.
    transient_failures: DashMap<RecordKey, u32>,
    next_id: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh id of the form `{entity}-{n}`.
    pub fn generate_id(&self, entity: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{entity}-{n}")
    }

    /// Inserts or replaces a record, returning the previous one.
    pub fn put(&self, entity: &str, record_id: &str, record: Value) -> Option<Value> {
        self.records.insert(key(entity, record_id), record)
    }

    /// Inserts only if no record exists under the key. Returns false on conflict.
    pub fn insert_new(&self, entity: &str, record_id: &str, record: Value) -> bool {
        match self.records.entry(key(entity, record_id)) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(record);
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, entity: &str, record_id: &str) -> Option<Value> {
        self.records.get(&key(entity, record_id)).map(|r| r.clone())
    }

    pub fn remove(&self, entity: &str, record_id: &str) -> Option<Value> {
        self.records.remove(&key(entity, record_id)).map(|(_, r)| r)
    }

    /// Applies `f` to the record in place and returns its result, or `None`
    /// if the record does not exist.
    pub fn modify<T>(&self, entity: &str, record_id: &str, f: impl FnOnce(&mut Value) -> T) -> Option<T> {
        self.records
            .get_mut(&key(entity, record_id))
            .map(|mut record| f(record.value_mut()))
    }

    #[must_use]
    pub fn contains(&self, entity: &str, record_id: &str) -> bool {
        self.records.contains_key(&key(entity, record_id))
    }

    /// Number of records in one entity collection.
    #[must_use]
    pub fn count(&self, entity: &str) -> usize {
        self.records.iter().filter(|r| r.key().0 == entity).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn define_template(&self, template_id: impl Into<String>, body: Value) {
        self.templates.insert(template_id.into(), body);
    }

    #[must_use]
    pub fn template(&self, template_id: &str) -> Option<Value> {
        self.templates.get(template_id).map(|t| t.clone())
    }

    /// Makes the next `times` accesses to a record fail with a retryable
    /// error.
    pub fn fail_transiently(&self, entity: &str, record_id: &str, times: u32) {
        if times == 0 {
            self.transient_failures.remove(&key(entity, record_id));
        } else {
            self.transient_failures.insert(key(entity, record_id), times);
        }
    }

    /// Consumes one injected failure for the record, if any remain.
    pub fn take_transient_failure(&self, entity: &str, record_id: &str) -> bool {
        let k = key(entity, record_id);
        let Some(mut remaining) = self.transient_failures.get_mut(&k) else {
            return false;
        };
        *remaining -= 1;
        let exhausted = *remaining == 0;
        drop(remaining);
        if exhausted {
            self.transient_failures.remove(&k);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let store = MemoryStore::new();
        let a = store.generate_id("plans");
        let b = store.generate_id("plans");
        assert_ne!(a, b);
        assert!(a.starts_with("plans-"));
    }

    #[test]
    fn insert_new_refuses_existing_key() {
        let store = MemoryStore::new();
        assert!(store.insert_new("plans", "p1", json!({"n": 1})));
        assert!(!store.insert_new("plans", "p1", json!({"n": 2})));
        assert_eq!(store.get("plans", "p1"), Some(json!({"n": 1})));
        // Same id in another entity is a different record.
        assert!(store.insert_new("sessions", "p1", json!({})));
        assert_eq!(store.count("plans"), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn modify_returns_none_for_missing_record() {
        let store = MemoryStore::new();
        assert!(store.modify("plans", "nope", |_| ()).is_none());
        store.put("plans", "p1", json!({"n": 1}));
        let old = store.modify("plans", "p1", |r| std::mem::replace(r, json!({"n": 2})));
        assert_eq!(old, Some(json!({"n": 1})));
        assert_eq!(store.get("plans", "p1"), Some(json!({"n": 2})));
    }

    #[test]
    fn transient_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_transiently("plans", "p1", 2);
        assert!(store.take_transient_failure("plans", "p1"));
        assert!(store.take_transient_failure("plans", "p1"));
        assert!(!store.take_transient_failure("plans", "p1"));
        assert!(!store.take_transient_failure("plans", "other"));
    }
}
