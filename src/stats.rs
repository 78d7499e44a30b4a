//! Named statistics counters.
//!
//! Both the tree statistics walk and the cache accountant publish their
//! figures into a [`StatsSink`]; [`StatsMap`] is the in-memory sink.

use serde::Serialize;
use std::collections::BTreeMap;

/// Destination for named integer counters.
pub trait StatsSink {
    fn set(&mut self, name: &'static str, value: u64);
}

/// Ordered map of counter names to values.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatsMap {
    values: BTreeMap<&'static str, u64>,
}

impl StatsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

impl StatsSink for StatsMap {
    fn set(&mut self, name: &'static str, value: u64) {
        self.values.insert(name, value);
    }
}
