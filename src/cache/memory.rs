// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process LRU tier.
//!
//! Entries live in a `HashMap` keyed by cache key; recency is a
//! `BTreeMap<tick, key>` where every touch assigns a fresh, larger tick. The
//! least-recently-used entry is therefore always the first key of the
//! recency index, giving O(1) lookup and O(log n) eviction.
//!
//! Both limits (`max_entries`, `max_bytes`) hold after every insert: victims
//! are evicted before the new entry goes in. An entry that alone exceeds
//! `max_bytes` is rejected rather than truncated.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Fixed per-entry bookkeeping charge added to key and payload length.
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Estimated footprint of an entry.
pub fn estimate_size(key: &str, payload: &[u8]) -> usize {
    key.len() + payload.len() + ENTRY_OVERHEAD_BYTES
}

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub key: String,
    /// Serialized JSON.
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub ttl: Duration,
    pub access_count: u64,
    pub last_accessed_at: i64,
    pub size: usize,
    tick: u64,
}

impl MemoryEntry {
    pub fn is_fresh(&self, now: i64) -> bool {
        now - self.created_at < self.ttl.as_millis() as i64
    }
}

/// What an insert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { evicted: Vec<String> },
    /// The entry is larger than the whole tier.
    Rejected { size: usize },
}

/// Per-entry view for stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub size: usize,
    pub access_count: u64,
    pub age_ms: i64,
}

/// Size-and-count bounded LRU map.
#[derive(Debug)]
pub struct MemoryTier {
    entries: HashMap<String, MemoryEntry>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    max_entries: usize,
    max_bytes: usize,
    total_bytes: usize,
    evictions: u64,
}

impl MemoryTier {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            max_entries: max_entries.max(1),
            max_bytes,
            total_bytes: 0,
            evictions: 0,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Fresh entry for `key`, updating access bookkeeping.
    ///
    /// Expired entries are left in place (they may still serve as a stale
    /// fallback) but are not returned and not touched.
    pub fn get_fresh(&mut self, key: &str, now: i64) -> Option<MemoryEntry> {
        let fresh = self.entries.get(key).is_some_and(|e| e.is_fresh(now));
        if !fresh {
            return None;
        }
        self.touch(key, now)
    }

    /// Entry regardless of age, without touching recency.
    pub fn peek(&self, key: &str) -> Option<&MemoryEntry> {
        self.entries.get(key)
    }

    fn touch(&mut self, key: &str, now: i64) -> Option<MemoryEntry> {
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        entry.access_count += 1;
        entry.last_accessed_at = now;
        self.recency.insert(tick, key.to_string());
        Some(entry.clone())
    }

    /// Insert or replace, evicting LRU entries until both limits hold.
    pub fn insert(&mut self, key: &str, payload: Vec<u8>, created_at: i64, ttl: Duration, now: i64) -> InsertOutcome {
        let size = estimate_size(key, &payload);
        // A rejected replacement must not leave the previous value visible.
        self.remove(key);
        if size > self.max_bytes {
            return InsertOutcome::Rejected { size };
        }

        let mut evicted = Vec::new();
        while self.entries.len() + 1 > self.max_entries || self.total_bytes + size > self.max_bytes {
            match self.evict_lru() {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }

        let tick = self.bump();
        self.recency.insert(tick, key.to_string());
        self.total_bytes += size;
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                key: key.to_string(),
                payload,
                created_at,
                ttl,
                access_count: 0,
                last_accessed_at: now,
                size,
                tick,
            },
        );
        InsertOutcome::Inserted { evicted }
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes -= entry.size;
        }
        self.evictions += 1;
        Some(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.tick);
                self.total_bytes -= entry.size;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.recency.values().cloned().collect()
    }

    pub fn entry_infos(&self, now: i64) -> Vec<EntryInfo> {
        self.recency
            .values()
            .filter_map(|k| self.entries.get(k))
            .map(|e| EntryInfo {
                key: e.key.clone(),
                size: e.size,
                access_count: e.access_count,
                age_ms: now - e.created_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn put(tier: &mut MemoryTier, key: &str, now: i64) -> InsertOutcome {
        tier.insert(key, b"{}".to_vec(), now, TTL, now)
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let mut tier = MemoryTier::new(2, 1_000_000);
        put(&mut tier, "A", 0);
        put(&mut tier, "B", 1);
        assert!(tier.get_fresh("A", 2).is_some());
        let outcome = put(&mut tier, "C", 3);

        assert_eq!(outcome, InsertOutcome::Inserted { evicted: vec!["B".to_string()] });
        assert!(tier.peek("A").is_some());
        assert!(tier.peek("B").is_none());
        assert!(tier.peek("C").is_some());
    }

    #[test]
    fn test_byte_limit_evicts_until_it_fits() {
        let per_entry = estimate_size("k1", &[0u8; 100]);
        let mut tier = MemoryTier::new(100, per_entry * 2);
        tier.insert("k1", vec![0u8; 100], 0, TTL, 0);
        tier.insert("k2", vec![0u8; 100], 0, TTL, 0);
        let outcome = tier.insert("k3", vec![0u8; 100], 0, TTL, 0);

        assert_eq!(outcome, InsertOutcome::Inserted { evicted: vec!["k1".to_string()] });
        assert!(tier.total_bytes() <= tier.max_bytes());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let mut tier = MemoryTier::new(10, 200);
        put(&mut tier, "small", 0);
        let outcome = tier.insert("huge", vec![0u8; 500], 0, TTL, 0);
        assert!(matches!(outcome, InsertOutcome::Rejected { .. }));
        assert!(tier.peek("small").is_some());
        assert!(tier.peek("huge").is_none());
    }

    #[test]
    fn test_oversized_replacement_removes_previous_value() {
        let mut tier = MemoryTier::new(10, 200);
        put(&mut tier, "m1", 0);
        let outcome = tier.insert("m1", vec![0u8; 500], 1, TTL, 1);
        assert!(matches!(outcome, InsertOutcome::Rejected { .. }));
        assert!(tier.get_fresh("m1", 1).is_none());
        assert_eq!(tier.total_bytes(), 0);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_replace_keeps_accounting_consistent() {
        let mut tier = MemoryTier::new(10, 10_000);
        tier.insert("a", vec![0u8; 10], 0, TTL, 0);
        tier.insert("a", vec![0u8; 50], 0, TTL, 0);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.total_bytes(), estimate_size("a", &[0u8; 50]));
        assert_eq!(tier.keys_by_recency(), vec!["a".to_string()]);
    }

    #[test]
    fn test_expired_entry_not_returned_but_peekable() {
        let mut tier = MemoryTier::new(10, 10_000);
        tier.insert("a", b"1".to_vec(), 0, Duration::from_millis(100), 0);
        assert!(tier.get_fresh("a", 99).is_some());
        assert!(tier.get_fresh("a", 100).is_none());
        assert!(tier.peek("a").is_some());
    }

    #[test]
    fn test_access_bookkeeping() {
        let mut tier = MemoryTier::new(10, 10_000);
        put(&mut tier, "a", 0);
        tier.get_fresh("a", 5);
        let entry = tier.get_fresh("a", 9).unwrap();
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed_at, 9);

        let infos = tier.entry_infos(10);
        assert_eq!(infos[0].age_ms, 10);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut tier = MemoryTier::new(10, 10_000);
        put(&mut tier, "a", 0);
        put(&mut tier, "b", 0);
        assert!(tier.remove("a"));
        assert!(!tier.remove("a"));
        tier.clear();
        assert!(tier.is_empty());
        assert_eq!(tier.total_bytes(), 0);
    }
}
