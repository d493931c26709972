//! Deduplicated failure records.
//!
//! Failures with the same message and stack summary collapse into one
//! [`ExceptionRecord`] whose count grows and whose origin set remembers every
//! node that produced it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Content hash of a failure. Identical on every node and build.
pub type ErrorKey = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub hash_key: ErrorKey,
    pub message: String,
    pub stack_summary: String,
    pub count: u64,
    pub origin_node_ids: BTreeSet<String>,
}

/// Derives the dedup key from message and stack summary.
///
/// The first 8 bytes of SHA-256 over the length-prefixed message followed by
/// the stack summary, as 16 hex digits.
pub fn exception_hash_key(message: &str, stack_summary: &str) -> ErrorKey {
    let mut hasher = Sha256::new();
    hasher.update((message.len() as u64).to_le_bytes());
    hasher.update(message.as_bytes());
    hasher.update(stack_summary.as_bytes());
    let digest = hasher.finalize();
    digest[..8]
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

#[derive(Default)]
pub struct ExceptionRegistry {
    records: Mutex<BTreeMap<ErrorKey, ExceptionRecord>>,
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one occurrence of a failure seen on `origin_node_id`.
    pub fn record(&self, message: &str, stack_summary: &str, origin_node_id: &str) {
        let key = exception_hash_key(message, stack_summary);
        let mut records = self.records.lock();
        let record = records
            .entry(key.clone())
            .or_insert_with(|| ExceptionRecord {
                hash_key: key,
                message: message.to_string(),
                stack_summary: stack_summary.to_string(),
                count: 0,
                origin_node_ids: BTreeSet::new(),
            });
        record.count += 1;
        if !record.origin_node_ids.contains(origin_node_id) {
            record.origin_node_ids.insert(origin_node_id.to_string());
        }
    }

    pub fn records(&self) -> BTreeMap<ErrorKey, ExceptionRecord> {
        self.records.lock().clone()
    }

    pub fn get(&self, key: &str) -> Option<ExceptionRecord> {
        self.records.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of occurrence counts across all records.
    pub fn total_count(&self) -> u64 {
        self.records.lock().values().map(|r| r.count).sum()
    }

    pub fn reset(&self) {
        self.records.lock().clear();
    }
}

/// Merges exception records from several nodes into one map.
///
/// Counts add up and origin sets are unioned.
pub fn merge_records<'a, I>(records: I) -> BTreeMap<ErrorKey, ExceptionRecord>
where
    I: IntoIterator<Item = &'a ExceptionRecord>,
{
    let mut merged: BTreeMap<ErrorKey, ExceptionRecord> = BTreeMap::new();
    for record in records {
        match merged.get_mut(&record.hash_key) {
            Some(existing) => {
                existing.count += record.count;
                existing
                    .origin_node_ids
                    .extend(record.origin_node_ids.iter().cloned());
            }
            None => {
                merged.insert(record.hash_key.clone(), record.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_failures_collapse() {
        let registry = ExceptionRegistry::new();
        registry.record("timeout", "browse -> GET /", "node-a");
        registry.record("timeout", "browse -> GET /", "node-a");
        registry.record("timeout", "browse -> GET /", "node-b");

        assert_eq!(registry.len(), 1);
        let record = registry.records().into_values().next().unwrap();
        assert_eq!(record.count, 3);
        assert_eq!(
            record.origin_node_ids.into_iter().collect::<Vec<_>>(),
            vec!["node-a".to_string(), "node-b".to_string()]
        );
    }

    #[test]
    fn stack_summary_is_part_of_the_key() {
        let registry = ExceptionRegistry::new();
        registry.record("timeout", "browse -> GET /", "n");
        registry.record("timeout", "checkout -> POST /pay", "n");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.total_count(), 2);
    }

    #[test]
    fn hash_key_is_deterministic() {
        assert_eq!(exception_hash_key("a", "b"), exception_hash_key("a", "b"));
        assert_ne!(exception_hash_key("a", "b"), exception_hash_key("ab", ""));
    }

    #[test]
    fn test_hash_key_is_pinned_across_builds() {
        // Workers built separately must agree on this value.
        assert_eq!(exception_hash_key("HTTP 500", "GET /x"), "4ef4736039395d2b");
        assert_eq!(exception_hash_key("", "").len(), 16);

        println!("✅ Exception keys are a fixed digest");
    }

    #[test]
    fn merge_sums_counts_and_unions_origins() {
        let a = ExceptionRegistry::new();
        a.record("boom", "s", "w1");
        a.record("boom", "s", "w1");
        let b = ExceptionRegistry::new();
        b.record("boom", "s", "w2");
        b.record("other", "s", "w2");

        let ra = a.records();
        let rb = b.records();
        let merged = merge_records(ra.values().chain(rb.values()));
        assert_eq!(merged.len(), 2);
        let boom = &merged[&exception_hash_key("boom", "s")];
        assert_eq!(boom.count, 3);
        assert_eq!(boom.origin_node_ids.len(), 2);
    }

    #[test]
    fn reset_clears_records() {
        let registry = ExceptionRegistry::new();
        registry.record("boom", "s", "n");
        registry.reset();
        assert!(registry.is_empty());
    }
}
