//! Process-local named counters. Real deployments scrape these off the HTTP
//! surface; the tests use them to assert on pipeline behaviour.

use std::collections::BTreeMap;

use parking_lot::RwLock;

#[derive(Default)]
pub struct Metrics {
    counters: RwLock<BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str) {
        *self.counters.write().entry(name.to_owned()).or_insert(0) += 1;
    }

    /// Counter with one label dimension, e.g. `scheduler_runs{ok}`.
    pub fn inc_with(&self, name: &str, label: &str) {
        self.inc(&format!("{}{{{}}}", name, label));
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.inc("a");
        metrics.inc("a");
        metrics.inc_with("runs", "ok");
        assert_eq!(metrics.get("a"), 2);
        assert_eq!(metrics.get("runs{ok}"), 1);
        assert_eq!(metrics.get("missing"), 0);
        assert_eq!(metrics.snapshot().len(), 2);
    }

    #[test]
    fn snapshot_serialises_for_the_http_surface() {
        let metrics = Metrics::new();
        metrics.inc_with("scheduler_runs", "ok");
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert_eq!(json, r#"{"scheduler_runs{ok}":1}"#);
    }
}
