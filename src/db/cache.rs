//! Per-connection prepared statement cache bookkeeping.
//!
//! The driver keeps the prepared statements themselves, in an LRU sized from
//! the same capacity. [`StatementCache`] mirrors which expanded SQL texts that
//! LRU holds, so the adapter knows when a statement has to be prepared and can
//! report hits, misses and evictions. Statements are keyed by their *expanded*
//! SQL text, so `IN (?*)` bound with two and with three elements occupy two
//! entries.
//!
//! A capacity of zero disables caching: nothing is kept and every lookup
//! misses.

use std::collections::{HashSet, VecDeque};

/// Hit/miss counters for a single cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct StatementCache {
    capacity: usize,
    entries: HashSet<String>,
    /// Front is least recently used.
    order: VecDeque<String>,
    stats: CacheStats,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains(sql)
    }

    /// Record a lookup for `sql`, promoting it to most recently used on a hit.
    pub fn touch(&mut self, sql: &str) -> bool {
        if self.entries.contains(sql) {
            if let Some(pos) = self.order.iter().position(|k| k == sql) {
                if let Some(key) = self.order.remove(pos) {
                    self.order.push_back(key);
                }
            }
            self.stats.hits += 1;
            true
        } else {
            self.stats.misses += 1;
            false
        }
    }

    /// Record a freshly prepared statement, returning the key evicted to make
    /// room, if any.
    pub fn insert(&mut self, sql: &str) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        if self.entries.contains(sql) {
            self.order.retain(|k| k != sql);
            self.order.push_back(sql.to_string());
            return None;
        }

        let mut evicted = None;
        if self.entries.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
                evicted = Some(oldest);
            }
        }
        self.entries.insert(sql.to_string());
        self.order.push_back(sql.to_string());
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
