//! Per-lookup result frequency counts.

use std::collections::HashMap;

/// Occurrence count per annotation value for one lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateCounters {
    counts: HashMap<String, u64>,
}

impl AggregateCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: &str) {
        match self.counts.get_mut(value) {
            Some(count) => *count += 1,
            None => {
                self.counts.insert(value.to_string(), 1);
            }
        }
    }

    pub fn get(&self, value: &str) -> u64 {
        self.counts.get(value).copied().unwrap_or(0)
    }

    /// Number of distinct values.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Entries by descending count, ties by ascending value.
    pub fn sorted(&self) -> Vec<(&str, u64)> {
        let mut entries: Vec<(&str, u64)> = self
            .counts
            .iter()
            .map(|(value, count)| (value.as_str(), *count))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }
}
