//! Request de-duplication for the UI.
//!
//! Browsers resubmit forms on reload; identical uploads and questions are
//! answered from the fragment rendered the first time instead of calling
//! the gateway again. Keys are SHA-256 digests of the request kind and
//! content, so the table never holds user text.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

/// Hex SHA-256 of `kind`, a NUL separator and `content`.
pub fn content_key(kind: &str, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Bounded map from content key to rendered fragment, evicting the oldest
/// entry first.
#[derive(Debug)]
pub struct RequestDeduplicator {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl RequestDeduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: String, fragment: String) {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = fragment;
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, fragment);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_depends_on_kind() {
        let a = content_key("upload", b"text");
        let b = content_key("question", b"text");
        assert_ne!(a, b);
        assert_eq!(a, content_key("upload", b"text"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_separator_prevents_ambiguity() {
        assert_ne!(content_key("ab", b"c"), content_key("a", b"bc"));
    }

    #[test]
    fn test_get_and_replace() {
        let mut dedup = RequestDeduplicator::new(4);
        dedup.insert("k".into(), "<p>1</p>".into());
        assert_eq!(dedup.get("k"), Some("<p>1</p>"));
        dedup.insert("k".into(), "<p>2</p>".into());
        assert_eq!(dedup.get("k"), Some("<p>2</p>"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_evicts_oldest() {
        let mut dedup = RequestDeduplicator::new(2);
        dedup.insert("a".into(), "1".into());
        dedup.insert("b".into(), "2".into());
        dedup.insert("c".into(), "3".into());
        assert!(dedup.get("a").is_none());
        assert_eq!(dedup.get("b"), Some("2"));
        assert_eq!(dedup.get("c"), Some("3"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut dedup = RequestDeduplicator::new(0);
        assert_eq!(dedup.capacity(), 1);
        dedup.insert("a".into(), "1".into());
        dedup.insert("b".into(), "2".into());
        assert!(dedup.get("a").is_none());
        assert!(!dedup.is_empty());
    }
}
