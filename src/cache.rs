//! The in-memory metric cache.
//!
//! Absorbs bursty writes from many producers and surfaces them to the
//! writer in an order that maximizes disk efficiency. The bound is soft:
//! crossing `MAX_CACHE_SIZE` publishes [`Event::CacheFull`] and stops
//! admitting brand-new metrics, but datapoints for metrics already present
//! keep accumulating — the pipeline has no better place to put them.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Deserialize;
use snafu::Snafu;
use tracing::debug;

use crate::events::{Event, EventBus};
use crate::instrumentation::{names, Instrumentation};
use crate::point::Datapoint;

/// Fraction of the soft bound below which `CacheSpaceAvailable` fires.
const LOW_WATERMARK_RATIO: f64 = 0.95;

/// How the writer picks the next metric to commit.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    /// Largest queue first; ties go to the queue that has waited longest.
    #[default]
    Max,
    /// Deterministic cycle through present metrics in name order.
    Sorted,
    /// Whatever is cheapest to reach.
    Naive,
}

/// Errors from cache lookups.
#[derive(Debug, Snafu, PartialEq)]
pub enum CacheError {
    /// The metric has no pending datapoints.
    #[snafu(display("no cached datapoints for metric '{metric}'"))]
    NotFound { metric: String },
}

/// A writer worker's slice of the metric keyspace.
///
/// With a single writer this is `Shard::all()`. With more, each metric name
/// hashes to exactly one shard so per-metric commit order is preserved.
#[derive(Clone, Copy, Debug)]
pub struct Shard {
    pub index: u64,
    pub of: u64,
}

impl Shard {
    pub const fn all() -> Self {
        Shard { index: 0, of: 1 }
    }

    pub fn owns(&self, metric: &str) -> bool {
        if self.of <= 1 {
            return true;
        }
        let mut hasher = DefaultHasher::new();
        metric.hash(&mut hasher);
        hasher.finish() % self.of == self.index
    }
}

struct Entry {
    points: Vec<Datapoint>,
    /// Creation stamp, used to break drain ties toward the longest waiter.
    born: u64,
}

#[derive(Default)]
struct Inner {
    entries: IndexMap<String, Entry>,
    size: usize,
    too_full: bool,
    seq: u64,
    /// Per-shard cursor for the `sorted` strategy's name-order cycle.
    cursors: HashMap<u64, String>,
}

/// Bounded multi-queue of pending datapoints, keyed by metric.
pub struct MetricCache {
    inner: Mutex<Inner>,
    strategy: WriteStrategy,
    max_size: f64,
    low_watermark: f64,
    events: EventBus,
    instrumentation: Arc<Instrumentation>,
}

impl MetricCache {
    pub fn new(
        strategy: WriteStrategy,
        max_size: f64,
        events: EventBus,
        instrumentation: Arc<Instrumentation>,
    ) -> Self {
        MetricCache {
            inner: Mutex::new(Inner::default()),
            strategy,
            max_size,
            low_watermark: max_size * LOW_WATERMARK_RATIO,
            events,
            instrumentation,
        }
    }

    /// Append a datapoint to the metric's queue, creating the queue if the
    /// metric is new. Returns `false` when the datapoint was dropped, either
    /// because the value is NaN (the cache never stores those) or because
    /// the cache is too full to admit new metrics.
    pub fn store(&self, metric: &str, datapoint: Datapoint) -> bool {
        if datapoint.value.is_nan() {
            debug!(message = "Dropping NaN datapoint.", %metric);
            return false;
        }

        let mut fire = None;
        let accepted = {
            let mut inner = self.inner.lock();
            if inner.too_full && !inner.entries.contains_key(metric) {
                false
            } else {
                let seq = {
                    inner.seq += 1;
                    inner.seq
                };
                inner
                    .entries
                    .entry(metric.to_string())
                    .or_insert_with(|| Entry {
                        points: Vec::new(),
                        born: seq,
                    })
                    .points
                    .push(datapoint);
                inner.size += 1;
                if !inner.too_full && inner.size as f64 >= self.max_size {
                    inner.too_full = true;
                    fire = Some(Event::CacheFull);
                }
                true
            }
        };

        if !accepted {
            self.instrumentation.increment(names::DROPPED_CREATES);
        }
        if let Some(event) = fire {
            self.events.publish(event);
        }
        accepted
    }

    /// Remove and return the full ordered queue for `metric`.
    pub fn pop(&self, metric: &str) -> Result<Vec<Datapoint>, CacheError> {
        let (points, fire) = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .shift_remove(metric)
                .ok_or_else(|| CacheError::NotFound {
                    metric: metric.to_string(),
                })?;
            inner.size -= entry.points.len();
            (entry.points, self.check_watermark(&mut inner))
        };
        if let Some(event) = fire {
            self.events.publish(event);
        }
        Ok(points)
    }

    /// Select the next metric to commit and remove its queue, honoring the
    /// configured write strategy. `None` when the shard has nothing pending.
    pub fn drain_metric(&self, shard: Shard) -> Option<(String, Vec<Datapoint>)> {
        let (drained, fire) = {
            let mut inner = self.inner.lock();
            let metric = self.select(&inner, shard)?;
            let entry = inner
                .entries
                .shift_remove(&metric)
                .expect("selected metric is present");
            inner.size -= entry.points.len();
            if self.strategy == WriteStrategy::Sorted {
                inner.cursors.insert(shard.index, metric.clone());
            }
            ((metric, entry.points), self.check_watermark(&mut inner))
        };
        if let Some(event) = fire {
            self.events.publish(event);
        }
        Some(drained)
    }

    fn select(&self, inner: &Inner, shard: Shard) -> Option<String> {
        let mut candidates = inner
            .entries
            .iter()
            .filter(|(metric, _)| shard.owns(metric))
            .peekable();
        candidates.peek()?;

        match self.strategy {
            WriteStrategy::Naive => candidates.next().map(|(metric, _)| metric.clone()),
            WriteStrategy::Max => candidates
                .max_by(|(_, a), (_, b)| {
                    a.points
                        .len()
                        .cmp(&b.points.len())
                        // Older entry (smaller stamp) wins the tie.
                        .then(b.born.cmp(&a.born))
                })
                .map(|(metric, _)| metric.clone()),
            WriteStrategy::Sorted => {
                let mut names: Vec<&String> = candidates.map(|(metric, _)| metric).collect();
                names.sort();
                let next = inner
                    .cursors
                    .get(&shard.index)
                    .and_then(|cursor| names.iter().find(|name| name.as_str() > cursor.as_str()));
                Some(next.unwrap_or(&names[0]).to_string())
            }
        }
    }

    /// Clears the sticky full flag once the cache dips below the low
    /// watermark; the returned event must be published outside the lock.
    fn check_watermark(&self, inner: &mut Inner) -> Option<Event> {
        if inner.too_full && (inner.size as f64) < self.low_watermark {
            inner.too_full = false;
            Some(Event::CacheSpaceAvailable)
        } else {
            None
        }
    }

    /// Snapshot of `(metric, queue length)` for every present metric.
    pub fn counts(&self) -> Vec<(String, usize)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(metric, entry)| (metric.clone(), entry.points.len()))
            .collect()
    }

    /// Total pending datapoints across all metrics.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Number of distinct metric queues.
    pub fn queues(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether the shard has any pending datapoints.
    pub fn shard_is_empty(&self, shard: Shard) -> bool {
        let inner = self.inner.lock();
        if shard.of <= 1 {
            inner.entries.is_empty()
        } else {
            !inner.entries.keys().any(|metric| shard.owns(metric))
        }
    }

    pub fn is_too_full(&self) -> bool {
        self.inner.lock().too_full
    }
}
