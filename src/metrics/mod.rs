//! Metrics for the compliance ledger
//!
//! In-process counters, gauges and latency histograms. Labelled series are
//! keyed by their full `name{label="value"}` string. The service logs a JSON
//! snapshot when it stops.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

/// Upper bounds of the latency buckets, in milliseconds
const LATENCY_BUCKETS_MS: [f64; 12] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

/// Series key for a metric with one label.
pub fn labeled(name: &str, label: &str, value: &str) -> String {
    format!("{name}{{{label}=\"{value}\"}}")
}

#[derive(Debug, Default, Serialize)]
struct Series {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, u64>,
    histograms: BTreeMap<String, Histogram>,
}

/// Process-wide metrics registry
pub struct MetricsRegistry {
    series: RwLock<Series>,
    started: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(Series::default()),
            started: Instant::now(),
        }
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        let mut series = self.series.write().await;
        *series.counters.entry(name.to_owned()).or_default() += value;
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        self.series
            .write()
            .await
            .gauges
            .insert(name.to_owned(), value);
    }

    /// Record a latency in milliseconds.
    pub async fn observe_histogram(&self, name: &str, millis: f64) {
        let mut series = self.series.write().await;
        series
            .histograms
            .entry(name.to_owned())
            .or_insert_with(Histogram::latency)
            .observe(millis);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        self.series
            .read()
            .await
            .counters
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    pub async fn histogram_count(&self, name: &str) -> u64 {
        self.series
            .read()
            .await
            .histograms
            .get(name)
            .map_or(0, |h| h.count)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let series = self.series.read().await;
        let mut snapshot = serde_json::to_value(&*series).unwrap_or_default();
        if let Some(map) = snapshot.as_object_mut() {
            map.insert("uptime_seconds".into(), self.uptime_seconds().into());
        }
        snapshot
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram; `counts[i]` holds observations at or
/// below `buckets[i]` and above the previous bound.
#[derive(Debug, Clone, Serialize)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn latency() -> Self {
        Self {
            buckets: LATENCY_BUCKETS_MS.to_vec(),
            counts: vec![0; LATENCY_BUCKETS_MS.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        let value = value.max(0.0);
        self.sum += value;
        self.count += 1;
        if let Some(slot) = self.buckets.iter().position(|bound| value <= *bound) {
            self.counts[slot] += 1;
        }
    }
}

/// Metric names
pub mod metric_names {
    /// Labelled by `status` (`accepted`, `rejected`, `error`)
    pub const DELIVERIES_TOTAL: &str = "ledger_deliveries_total";
    pub const DELIVERY_DURATION_MS: &str = "ledger_delivery_duration_ms";
    pub const NOT_ELIGIBLE_TOTAL: &str = "ledger_not_eligible_total";

    pub const RETRIES_TOTAL: &str = "ledger_retries_total";
    pub const ESCALATIONS_TOTAL: &str = "ledger_escalations_total";
    pub const STALE_RECOVERED_TOTAL: &str = "ledger_stale_recovered_total";
    pub const RECOVERY_BATCH_SIZE: &str = "ledger_recovery_batch_size";

    pub const CHAIN_INTEGRITY_FAILURES_TOTAL: &str = "ledger_chain_integrity_failures_total";
    pub const CHAIN_HEAD_CONFLICTS_TOTAL: &str = "ledger_chain_head_conflicts_total";

    pub const AUTHORITY_TIMEOUTS_TOTAL: &str = "ledger_authority_timeouts_total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn labelled_counters_are_separate_series() {
        let registry = MetricsRegistry::new();
        let accepted = labeled(metric_names::DELIVERIES_TOTAL, "status", "accepted");
        let rejected = labeled(metric_names::DELIVERIES_TOTAL, "status", "rejected");

        registry.inc_counter(&accepted).await;
        registry.inc_counter(&accepted).await;
        registry.add_counter(&rejected, 3).await;

        assert_eq!(accepted, "ledger_deliveries_total{status=\"accepted\"}");
        assert_eq!(registry.get_counter(&accepted).await, 2);
        assert_eq!(registry.get_counter(&rejected).await, 3);
        assert_eq!(registry.get_counter(metric_names::RETRIES_TOTAL).await, 0);
    }

    #[tokio::test]
    async fn latencies_land_in_millisecond_buckets() {
        let registry = MetricsRegistry::new();
        registry.observe_histogram(metric_names::DELIVERY_DURATION_MS, 7.0).await;
        registry.observe_histogram(metric_names::DELIVERY_DURATION_MS, 400.0).await;
        registry.observe_histogram(metric_names::DELIVERY_DURATION_MS, 60_000.0).await;

        assert_eq!(registry.histogram_count(metric_names::DELIVERY_DURATION_MS).await, 3);
        let json = registry.to_json().await;
        let histogram = &json["histograms"][metric_names::DELIVERY_DURATION_MS];
        assert_eq!(histogram["counts"][1].as_u64(), Some(1));
        assert_eq!(histogram["counts"][6].as_u64(), Some(1));
        assert_eq!(histogram["sum"].as_f64(), Some(60_407.0));
    }

    #[tokio::test]
    async fn snapshot_includes_gauges_and_uptime() {
        let registry = MetricsRegistry::new();
        registry.set_gauge(metric_names::RECOVERY_BATCH_SIZE, 42).await;
        registry.set_gauge(metric_names::RECOVERY_BATCH_SIZE, 7).await;

        let json = registry.to_json().await;
        assert_eq!(json["gauges"][metric_names::RECOVERY_BATCH_SIZE].as_u64(), Some(7));
        assert!(json["uptime_seconds"].is_u64());
    }
}
