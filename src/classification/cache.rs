use std::collections::{HashMap, VecDeque};

use super::pattern::Scope;

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Ограниченный LRU-кэш результатов сопоставления `класс окна -> область`.
///
/// Отрицательные результаты (`None`) тоже кэшируются. Порядок использования
/// хранится в очереди с ленивым удалением устаревших записей, поэтому и
/// попадание, и вытеснение работают за амортизированное O(1).
#[derive(Debug)]
pub struct MatchCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<(String, u64)>,
    clock: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: Option<Scope>,
    stamp: u64,
}

impl MatchCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity * 2),
            clock: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Option<Scope>> {
        self.clock += 1;
        let stamp = self.clock;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.stamp = stamp;
                let value = entry.value;
                self.order.push_back((key.to_string(), stamp));
                self.hits += 1;
                self.compact_if_needed();
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: &str, value: Option<Scope>) {
        self.clock += 1;
        let stamp = self.clock;

        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
            entry.stamp = stamp;
            self.order.push_back((key.to_string(), stamp));
            self.compact_if_needed();
            return;
        }

        while self.entries.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }

        self.entries.insert(key.to_string(), CacheEntry { value, stamp });
        self.order.push_back((key.to_string(), stamp));
        self.compact_if_needed();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, stamp)) = self.order.pop_front() {
            let live = self
                .entries
                .get(&key)
                .map(|entry| entry.stamp == stamp)
                .unwrap_or(false);
            if live {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn compact_if_needed(&mut self) {
        if self.order.len() <= self.capacity * 4 {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(key, stamp)| entries.get(key).map(|e| e.stamp == *stamp).unwrap_or(false));
    }
}
