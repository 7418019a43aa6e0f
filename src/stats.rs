//! Metric emission. Components only produce names and tag values; where the
//! numbers end up is decided by the `Stats` implementation handed to them.
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

pub type Tags = BTreeMap<String, String>;

pub fn tags<const N: usize>(pairs: [(&str, &str); N]) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub trait Stats: Send + Sync {
    fn count(&self, name: &str, tags: &Tags, value: u64);

    fn timing(&self, name: &str, tags: &Tags, elapsed: Duration);

    fn increment(&self, name: &str, tags: &Tags) {
        self.count(name, tags, 1);
    }
}

/// Forwards to whatever recorder is installed for the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsStats;

fn labels(tags: &Tags) -> Vec<metrics::Label> {
    tags.iter()
        .map(|(k, v)| metrics::Label::new(k.clone(), v.clone()))
        .collect()
}

impl Stats for MetricsStats {
    fn count(&self, name: &str, tags: &Tags, value: u64) {
        metrics::counter!(name.to_string(), labels(tags)).increment(value);
    }

    fn timing(&self, name: &str, tags: &Tags, elapsed: Duration) {
        metrics::histogram!(name.to_string(), labels(tags)).record(elapsed.as_secs_f64());
    }
}

/// In-memory sink; counters with the same name and tags are summed.
#[derive(Debug, Default)]
pub struct MemStats {
    counters: Mutex<HashMap<(String, Tags), u64>>,
    timings: Mutex<HashMap<(String, Tags), Vec<Duration>>>,
}

impl MemStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if it was never touched.
    pub fn get(&self, name: &str, tags: &Tags) -> u64 {
        self.counters
            .lock()
            .get(&(name.to_string(), tags.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across every tag combination.
    pub fn total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Every tag set a counter was recorded with.
    pub fn tag_sets(&self, name: &str) -> Vec<Tags> {
        self.counters
            .lock()
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn timings(&self, name: &str) -> usize {
        self.timings
            .lock()
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| v.len())
            .sum()
    }
}

impl Stats for MemStats {
    fn count(&self, name: &str, tags: &Tags, value: u64) {
        *self
            .counters
            .lock()
            .entry((name.to_string(), tags.clone()))
            .or_insert(0) += value;
    }

    fn timing(&self, name: &str, tags: &Tags, elapsed: Duration) {
        self.timings
            .lock()
            .entry((name.to_string(), tags.clone()))
            .or_default()
            .push(elapsed);
    }
}
