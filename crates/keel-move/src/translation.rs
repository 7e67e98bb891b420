//! Source UID to target UID mapping
//!
//! Filled in as objects are created on the target and read while rewriting
//! ownerReferences of later waves. Writers inside a wave run concurrently, so
//! the map is a [`DashMap`].

use dashmap::DashMap;

/// Thread-safe mapping from source UIDs to the UIDs of their target copies
#[derive(Debug, Default)]
pub struct TranslationTable {
    entries: DashMap<String, String>,
}

impl TranslationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source_uid` now exists on the target as `target_uid`.
    ///
    /// Recording the same pair twice is a no-op; a later target UID replaces
    /// an earlier one (the object was recreated).
    pub fn record(&self, source_uid: &str, target_uid: &str) {
        self.entries
            .insert(source_uid.to_string(), target_uid.to_string());
    }

    /// Target UID for a source UID
    pub fn get(&self, source_uid: &str) -> Option<String> {
        self.entries.get(source_uid).map(|e| e.value().clone())
    }

    /// Whether a source UID has a confirmed copy
    pub fn contains(&self, source_uid: &str) -> bool {
        self.entries.contains_key(source_uid)
    }

    /// Number of recorded mappings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from `source_uids` with no mapping, in input order
    pub fn missing<'a>(&self, source_uids: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        source_uids
            .into_iter()
            .filter(|uid| !self.entries.contains_key(*uid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_and_lookup() {
        let table = TranslationTable::new();
        assert!(table.is_empty());

        table.record("src-1", "tgt-1");
        table.record("src-1", "tgt-1");
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("src-1").as_deref(), Some("tgt-1"));
        assert!(table.get("src-2").is_none());
    }

    #[test]
    fn test_missing_preserves_order() {
        let table = TranslationTable::new();
        table.record("b", "b'");
        assert_eq!(table.missing(["c", "b", "a"]), vec!["c", "a"]);
        assert!(table.missing(["b"]).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let table = Arc::new(TranslationTable::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let table = table.clone();
                tokio::spawn(async move {
                    table.record(&format!("src-{i}"), &format!("tgt-{i}"));
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(table.len(), 16);
        assert_eq!(table.get("src-7").as_deref(), Some("tgt-7"));
    }
}
