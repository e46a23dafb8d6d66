use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use super::AggregationMethod;
use crate::events::{Event, EventBus};
use crate::instrumentation::{names, Instrumentation};
use crate::point::Datapoint;

/// Raw values accumulated for one time bin, in arrival order. Timestamps
/// are not retained; they were collapsed to the bin on input.
#[derive(Debug)]
pub struct IntervalBuffer {
    pub interval: i64,
    values: Vec<f64>,
    active: bool,
}

impl IntervalBuffer {
    fn new(interval: i64) -> Self {
        IntervalBuffer {
            interval,
            values: Vec::new(),
            active: true,
        }
    }

    fn input(&mut self, value: f64) {
        self.values.push(value);
        self.active = true;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Aggregation state for one output metric: a map of aligned bins to their
/// accumulated raw values.
pub struct MetricBuffer {
    metric: String,
    frequency: i64,
    method: AggregationMethod,
    max_intervals: i64,
    intervals: Mutex<BTreeMap<i64, IntervalBuffer>>,
    events: EventBus,
    instrumentation: Arc<Instrumentation>,
}

impl MetricBuffer {
    fn new(
        metric: String,
        frequency: i64,
        method: AggregationMethod,
        max_intervals: i64,
        events: EventBus,
        instrumentation: Arc<Instrumentation>,
    ) -> Self {
        MetricBuffer {
            metric,
            frequency,
            method,
            max_intervals,
            intervals: Mutex::new(BTreeMap::new()),
            events,
            instrumentation,
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn frequency(&self) -> i64 {
        self.frequency
    }

    /// Fold one sample into its bin, creating the bin if absent.
    pub fn input(&self, datapoint: Datapoint) {
        let bin = datapoint.timestamp - datapoint.timestamp.rem_euclid(self.frequency);
        self.intervals
            .lock()
            .entry(bin)
            .or_insert_with(|| IntervalBuffer::new(bin))
            .input(datapoint.value);
    }

    /// One compute tick at wall-clock `now`.
    ///
    /// The current bin is skipped (still accumulating), bins older than the
    /// aging horizon are evicted without emitting, and every other active
    /// bin is reduced and published as `MetricGenerated`, then marked
    /// inactive so it re-emits only if fresh samples arrive.
    ///
    /// Returns `true` when eviction emptied the buffer; the caller destroys
    /// it.
    pub fn compute_value(&self, now: i64) -> bool {
        let started = Instant::now();
        let current = now - now.rem_euclid(self.frequency);
        let age_threshold = current - self.max_intervals * self.frequency;

        let mut emissions = Vec::new();
        let expired = {
            let mut intervals = self.intervals.lock();
            intervals.retain(|&interval, buffer| {
                if interval == current {
                    return true;
                }
                if interval < age_threshold {
                    return false;
                }
                if buffer.active {
                    emissions.push(Datapoint::new(interval, self.method.apply(&buffer.values)));
                    buffer.active = false;
                }
                true
            });
            intervals.is_empty()
        };

        for datapoint in emissions {
            self.instrumentation
                .increment(names::AGGREGATION_DATAPOINTS_GENERATED);
            self.events.publish(Event::MetricGenerated {
                metric: self.metric.clone(),
                datapoint,
            });
        }

        self.instrumentation.append(
            names::AGGREGATION_COMPUTE_MICROS,
            started.elapsed().as_secs_f64() * 1_000_000.0,
        );
        expired
    }

    /// Total raw values currently buffered across bins.
    pub fn size(&self) -> usize {
        self.intervals.lock().values().map(IntervalBuffer::len).sum()
    }

    /// Bin starts currently held, in ascending order. Test visibility.
    pub fn bins(&self) -> Vec<i64> {
        self.intervals.lock().keys().copied().collect()
    }
}

/// Process-wide mapping from output metric name to its aggregation buffer.
/// Buffers are allocated lazily on first sample and removed once aging
/// eviction empties them.
pub struct BufferManager {
    buffers: Mutex<HashMap<String, Arc<MetricBuffer>>>,
    max_intervals: i64,
    events: EventBus,
    instrumentation: Arc<Instrumentation>,
}

impl BufferManager {
    pub fn new(
        max_intervals: i64,
        events: EventBus,
        instrumentation: Arc<Instrumentation>,
    ) -> Self {
        BufferManager {
            buffers: Mutex::new(HashMap::new()),
            max_intervals,
            events,
            instrumentation,
        }
    }

    /// Look up the buffer for `metric`, allocating and configuring it on
    /// first sight. The boolean is `true` when the buffer was just created.
    pub fn get_or_create(
        &self,
        metric: &str,
        frequency: i64,
        method: AggregationMethod,
    ) -> (Arc<MetricBuffer>, bool) {
        let mut buffers = self.buffers.lock();
        if let Some(buffer) = buffers.get(metric) {
            return (Arc::clone(buffer), false);
        }

        debug!(message = "Allocating new metric buffer.", %metric);
        let buffer = Arc::new(MetricBuffer::new(
            metric.to_string(),
            frequency,
            method,
            self.max_intervals,
            self.events.clone(),
            Arc::clone(&self.instrumentation),
        ));
        buffers.insert(metric.to_string(), Arc::clone(&buffer));
        (buffer, true)
    }

    /// Drop the slot for `metric`. No empty buffers are ever retained.
    pub fn remove(&self, metric: &str) {
        self.buffers.lock().remove(metric);
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }

    /// Total buffered raw values across all buffers.
    pub fn buffered_datapoints(&self) -> usize {
        let buffers: Vec<Arc<MetricBuffer>> = self.buffers.lock().values().cloned().collect();
        buffers.iter().map(|b| b.size()).sum()
    }
}
