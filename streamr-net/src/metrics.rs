// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recorded counters, queryable as a point-in-time snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Named monotone counters plus the occasional gauge.
///
/// Cheap to clone; all clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    inner: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str) {
        self.record_by(name, 1);
    }

    pub fn record_by(&self, name: &str, amount: u64) {
        if let Ok(mut counters) = self.inner.lock() {
            *counters.entry(name.to_string()).or_default() += amount;
        }
    }

    /// Overwrite a value; used for gauges like ongoing-resend counts.
    pub fn set(&self, name: &str, value: u64) {
        if let Ok(mut counters) = self.inner.lock() {
            counters.insert(name.to_string(), value);
        }
    }

    pub fn report(&self) -> BTreeMap<String, u64> {
        self.inner
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn counters_accumulate_and_gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.record("onDataReceived");
        metrics.record("onDataReceived");
        metrics.record_by("sendToNode", 3);
        metrics.set("ongoingResends", 7);
        metrics.set("ongoingResends", 2);

        let report = metrics.report();
        assert_eq!(report["onDataReceived"], 2);
        assert_eq!(report["sendToNode"], 3);
        assert_eq!(report["ongoingResends"], 2);
    }
}
