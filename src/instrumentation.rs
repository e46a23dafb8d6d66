//! Internal counters and timing stats.
//!
//! Components increment named counters and append timing samples as they
//! work. A periodic task snapshots (and resets) the registry and feeds the
//! values back into the pipeline as ordinary datapoints, so the daemon's
//! own health rides the same path as user metrics. Every write is also
//! mirrored through the `metrics` macros for external exporters.

use std::collections::HashMap;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;

use crate::point::{unix_now, Datapoint};

/// Counter and stat names used by the core.
pub mod names {
    pub const METRICS_RECEIVED: &str = "metricsReceived";
    pub const DROPPED_CREATES: &str = "droppedCreates";
    pub const CREATES: &str = "creates";
    /// Datapoints committed to the database (`datapoints_written`).
    pub const COMMITTED_POINTS: &str = "committedPoints";
    pub const WRITE_OPERATIONS: &str = "write_operations";
    /// Failed `update_many` calls (`write_errors`).
    pub const ERRORS: &str = "errors";
    pub const METRIC_CREATE_ERRORS: &str = "metric_create_errors";
    pub const CREATE_RATELIMIT_EXCEEDED: &str = "create_ratelimit_exceeded";
    pub const WRITE_RATELIMIT_EXCEEDED: &str = "write_ratelimit_exceeded";
    pub const AGGREGATION_DATAPOINTS_GENERATED: &str = "aggregation.datapoints_generated";
    /// Per-tick aggregation latency (`aggregation.compute_value_microseconds`).
    pub const AGGREGATION_COMPUTE_MICROS: &str = "aggregation.compute_value_microseconds";
    /// Seconds spent per `update_many` call (`write_microseconds` source).
    pub const UPDATE_TIMES: &str = "updateTimes";
    /// Batch size per committed write (`datapoints_per_write`).
    pub const POINTS_PER_UPDATE: &str = "pointsPerUpdate";
    pub const CACHE_SIZE: &str = "cache.size";
    pub const CACHE_QUEUES: &str = "cache.queues";
    pub const AGGREGATION_ALLOCATED_BUFFERS: &str = "aggregation.allocated_buffers";
    pub const AGGREGATION_BUFFERED_DATAPOINTS: &str = "aggregation.buffered_datapoints";
}

type GaugeFn = Box<dyn Fn() -> f64 + Send + Sync>;

/// Registry of named counters, value series, and pull-style gauges.
#[derive(Default)]
pub struct Instrumentation {
    counters: Mutex<HashMap<&'static str, u64>>,
    stats: Mutex<HashMap<&'static str, Vec<f64>>>,
    gauges: Mutex<Vec<(&'static str, GaugeFn)>>,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &'static str, amount: u64) {
        *self.counters.lock().entry(name).or_insert(0) += amount;
        counter!(name).increment(amount);
    }

    /// Record one observation of a value series; the snapshot derives
    /// total/min/max/avg from the accumulated observations.
    pub fn append(&self, name: &'static str, value: f64) {
        self.stats.lock().entry(name).or_default().push(value);
        histogram!(name).record(value);
    }

    /// Register a gauge evaluated at snapshot time.
    pub fn register_gauge<F>(&self, name: &'static str, f: F)
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.gauges.lock().push((name, Box::new(f)));
    }

    /// Current value of a counter. Mostly useful to tests and the snapshot.
    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Drain the registry into `(name, value)` pairs for self-reporting.
    ///
    /// Counters reset to zero, value series produce `total`/`min`/`max`/`avg`
    /// derivatives and clear, gauges are sampled in place.
    pub fn snapshot_and_reset(&self) -> Vec<(String, f64)> {
        let mut report = Vec::new();

        let counters = std::mem::take(&mut *self.counters.lock());
        for (name, value) in counters {
            report.push((name.to_string(), value as f64));
        }

        let stats = std::mem::take(&mut *self.stats.lock());
        for (name, values) in stats {
            if values.is_empty() {
                continue;
            }
            let total: f64 = values.iter().sum();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            report.push((format!("{name}.total"), total));
            report.push((format!("{name}.min"), min));
            report.push((format!("{name}.max"), max));
            report.push((format!("{name}.avg"), total / values.len() as f64));
        }

        for (name, f) in self.gauges.lock().iter() {
            let value = f();
            gauge!(*name).set(value);
            report.push((name.to_string(), value));
        }

        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Turn a snapshot into self-describing datapoints under `prefix`,
    /// stamped with the current wall clock.
    pub fn report_datapoints(&self, prefix: &str) -> Vec<(String, Datapoint)> {
        let now = unix_now();
        self.snapshot_and_reset()
            .into_iter()
            .map(|(name, value)| (format!("{prefix}.{name}"), Datapoint::new(now, value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset_on_snapshot() {
        let instr = Instrumentation::new();
        instr.increment(names::CREATES);
        instr.increment(names::CREATES);
        instr.add(names::COMMITTED_POINTS, 40);
        assert_eq!(instr.counter(names::CREATES), 2);

        let report = instr.snapshot_and_reset();
        assert!(report.contains(&("creates".to_string(), 2.0)));
        assert!(report.contains(&("committedPoints".to_string(), 40.0)));
        assert_eq!(instr.counter(names::CREATES), 0);
    }

    #[test]
    fn stats_derive_min_max_avg_total() {
        let instr = Instrumentation::new();
        for v in [2.0, 6.0, 4.0] {
            instr.append(names::UPDATE_TIMES, v);
        }

        let report: HashMap<String, f64> = instr.snapshot_and_reset().into_iter().collect();
        assert_eq!(report["updateTimes.total"], 12.0);
        assert_eq!(report["updateTimes.min"], 2.0);
        assert_eq!(report["updateTimes.max"], 6.0);
        assert_eq!(report["updateTimes.avg"], 4.0);
    }

    #[test]
    fn gauges_are_sampled_every_snapshot() {
        let instr = Instrumentation::new();
        instr.register_gauge(names::CACHE_SIZE, || 7.0);

        let first: HashMap<String, f64> = instr.snapshot_and_reset().into_iter().collect();
        let second: HashMap<String, f64> = instr.snapshot_and_reset().into_iter().collect();
        assert_eq!(first["cache.size"], 7.0);
        assert_eq!(second["cache.size"], 7.0);
    }

    #[test]
    fn report_datapoints_prefixes_names() {
        let instr = Instrumentation::new();
        instr.increment(names::METRICS_RECEIVED);

        let report = instr.report_datapoints("carbon.agents.a");
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].0, "carbon.agents.a.metricsReceived");
        assert_eq!(report[0].1.value, 1.0);
    }
}
