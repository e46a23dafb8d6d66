//! Immutable runtime settings.
//!
//! A `Settings` value is built once before the topology starts and shared
//! read-only from there on. The schema reload path swaps schema snapshots,
//! never the settings themselves.

use serde::Deserialize;

use crate::cache::WriteStrategy;

/// Process-wide configuration snapshot.
///
/// Field names deserialize from the traditional SCREAMING_SNAKE_CASE keys
/// so existing daemon configs map over unchanged. A value of `f64::INFINITY`
/// disables the corresponding rate limit.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Settings {
    /// Soft upper bound on pending datapoints held in the cache. Crossing
    /// it publishes `CacheFull` and stops admitting brand-new metrics.
    pub max_cache_size: f64,
    /// How the writer picks the next metric to commit.
    pub cache_write_strategy: WriteStrategy,
    /// Capacity of the create-admission bucket, in creates per minute.
    pub max_creates_per_minute: f64,
    /// Capacity of the update bucket, in update operations per second.
    pub max_updates_per_second: f64,
    /// Update rate applied while draining the cache at shutdown.
    pub max_updates_per_second_on_shutdown: f64,
    /// Aging horizon, in bins, past which interval buffers are evicted
    /// without emitting.
    pub max_aggregation_intervals: u32,
    /// Override for the aggregation compute-tick period, in seconds.
    /// Defaults to each buffer's own frequency.
    pub aggregation_write_back_frequency: Option<u64>,
    /// Pass-through to the database: create sparse archive files.
    pub whisper_sparse_create: bool,
    /// Pass-through to the database: preallocate archive files.
    pub whisper_fallocate_create: bool,
    /// Distinct destinations returned per metric by consistent-hash routing.
    pub replication_factor: usize,
    /// Emit a log line for every committed batch.
    pub log_updates: bool,
    /// Number of writer workers. Above one, the metric keyspace is
    /// hash-sharded so each metric belongs to exactly one worker.
    pub max_writer_threads: usize,
    /// How long a writer sleeps when its shard of the cache is empty.
    pub writer_idle_interval_ms: u64,
    /// Cadence of the schema reload task, in seconds.
    pub schema_reload_interval: u64,
    /// Cadence of the instrumentation self-report task, in seconds.
    pub carbon_metric_interval: u64,
    /// Prefix for self-reported instrumentation metrics.
    pub carbon_metric_prefix: String,
    /// Instance tag appended to the self-report prefix.
    pub instance: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_cache_size: f64::INFINITY,
            cache_write_strategy: WriteStrategy::Max,
            max_creates_per_minute: 50.0,
            max_updates_per_second: 500.0,
            max_updates_per_second_on_shutdown: 1000.0,
            max_aggregation_intervals: 5,
            aggregation_write_back_frequency: None,
            whisper_sparse_create: false,
            whisper_fallocate_create: false,
            replication_factor: 1,
            log_updates: true,
            max_writer_threads: 1,
            writer_idle_interval_ms: 100,
            schema_reload_interval: 60,
            carbon_metric_interval: 60,
            carbon_metric_prefix: "carbon".into(),
            instance: "a".into(),
        }
    }
}

impl Settings {
    /// Metric prefix for the periodic self-report, e.g. `carbon.agents.a`.
    pub fn self_report_prefix(&self) -> String {
        format!("{}.agents.{}", self.carbon_metric_prefix, self.instance)
    }
}
