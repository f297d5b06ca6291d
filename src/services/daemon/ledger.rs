use crate::classification::Scope;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub class: Option<String>,
    pub instance: Option<String>,
    pub scope: Scope,
    pub mark: String,
}

/// Окна, которые демон уже обработал в этом сеансе
#[derive(Debug, Default)]
pub struct WindowLedger {
    entries: HashMap<u64, LedgerEntry>,
}

impl WindowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, window_id: u64, entry: LedgerEntry) {
        self.entries.insert(window_id, entry);
    }

    pub fn get(&self, window_id: u64) -> Option<&LedgerEntry> {
        self.entries.get(&window_id)
    }

    pub fn remove(&mut self, window_id: u64) -> Option<LedgerEntry> {
        self.entries.remove(&window_id)
    }

    /// Удаляет записи окон, которых больше нет; возвращает их число
    pub fn retain_present(&mut self, present: &HashSet<u64>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| present.contains(id));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
