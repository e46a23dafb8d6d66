//! The aggregation stage.
//!
//! Bins incoming samples by time interval per metric and emits one reduced
//! datapoint per bin on a schedule. Metrics that match no rule bypass this
//! stage entirely.

mod buffers;
mod rules;

use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use snafu::Snafu;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use buffers::{BufferManager, IntervalBuffer, MetricBuffer};
pub use rules::{AggregationRules, RuleError};

use crate::point::{unix_now, Datapoint};

/// The reduction applied to a bin's worth of raw values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationMethod {
    Sum,
    Avg,
    Min,
    Max,
    Last,
    Count,
}

/// Unrecognized aggregation method token.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(display("unknown aggregation method '{token}'"))]
pub struct UnknownMethod {
    pub token: String,
}

impl FromStr for AggregationMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(AggregationMethod::Sum),
            "avg" | "average" => Ok(AggregationMethod::Avg),
            "min" => Ok(AggregationMethod::Min),
            "max" => Ok(AggregationMethod::Max),
            "last" => Ok(AggregationMethod::Last),
            "count" => Ok(AggregationMethod::Count),
            _ => Err(UnknownMethod { token: s.into() }),
        }
    }
}

impl AggregationMethod {
    /// Reduce a bin. Callers never pass an empty slice; reduction is
    /// skipped while a bin is inactive.
    pub fn apply(&self, values: &[f64]) -> f64 {
        debug_assert!(!values.is_empty());
        match self {
            AggregationMethod::Sum => values.iter().sum(),
            AggregationMethod::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationMethod::Last => values.last().copied().unwrap_or(f64::NAN),
            AggregationMethod::Count => values.len() as f64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::Sum => "sum",
            AggregationMethod::Avg => "avg",
            AggregationMethod::Min => "min",
            AggregationMethod::Max => "max",
            AggregationMethod::Last => "last",
            AggregationMethod::Count => "count",
        }
    }
}

impl std::fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timer wiring for per-buffer compute tasks. Absent in unit tests, which
/// drive `compute_value` by hand.
pub struct ComputeTimers {
    pub handle: Handle,
    pub shutdown: CancellationToken,
}

/// The aggregation service: rule matching plus buffer lifecycle.
pub struct Aggregator {
    rules: ArcSwap<AggregationRules>,
    manager: Arc<BufferManager>,
    write_back_frequency: Option<u64>,
    timers: Option<ComputeTimers>,
    tasks: TaskTracker,
}

impl Aggregator {
    pub fn new(
        rules: AggregationRules,
        manager: Arc<BufferManager>,
        write_back_frequency: Option<u64>,
        timers: Option<ComputeTimers>,
    ) -> Self {
        Aggregator {
            rules: ArcSwap::from_pointee(rules),
            manager,
            write_back_frequency,
            timers,
            tasks: TaskTracker::new(),
        }
    }

    /// Feed one sample through the rules. Returns `true` when the sample was
    /// absorbed into a buffer, `false` when it should flow on unchanged.
    pub fn process(&self, metric: &str, datapoint: Datapoint) -> bool {
        let rules = self.rules.load();
        let Some((output, rule)) = rules.first_match(metric) else {
            return false;
        };

        let (buffer, created) =
            self.manager
                .get_or_create(&output, rule.frequency() as i64, rule.method());
        buffer.input(datapoint);
        if created {
            self.spawn_compute(buffer);
        }
        true
    }

    /// Swap in freshly parsed rules; buffers already configured keep their
    /// existing frequency and method.
    pub fn reload_rules(&self, rules: AggregationRules) {
        self.rules.store(Arc::new(rules));
    }

    pub fn manager(&self) -> &Arc<BufferManager> {
        &self.manager
    }

    fn spawn_compute(&self, buffer: Arc<MetricBuffer>) {
        let Some(timers) = &self.timers else {
            return;
        };

        let period = Duration::from_secs(
            self.write_back_frequency
                .unwrap_or(buffer.frequency() as u64)
                .max(1),
        );
        let token = timers.shutdown.child_token();
        let manager = Arc::clone(&self.manager);

        self.tasks.spawn_on(
            async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            // One final flush of every non-current bin.
                            buffer.compute_value(unix_now());
                            manager.remove(buffer.metric());
                            break;
                        }
                        _ = ticks.tick() => {
                            if buffer.compute_value(unix_now()) {
                                manager.remove(buffer.metric());
                                break;
                            }
                        }
                    }
                }
            },
            &timers.handle,
        );
    }

    /// Wait for every compute task to finish. Call after cancelling the
    /// shutdown token handed to [`ComputeTimers`].
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("buffers", &self.manager.len())
            .finish_non_exhaustive()
    }
}
