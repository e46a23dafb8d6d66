//! Pipeline assembly.
//!
//! Builds every service explicitly at startup and hands each component only
//! the collaborators it needs; nothing in the crate reaches for a global.
//! The running topology owns all long-lived tasks and tears them down in
//! dependency order: aggregation flushes first so its final emissions land
//! in the cache, then the writers drain the cache under the shutdown rate.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use snafu::{ResultExt, Snafu};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::aggregator::{
    Aggregator, AggregationRules, BufferManager, ComputeTimers, RuleError,
};
use crate::cache::{MetricCache, Shard};
use crate::config::Settings;
use crate::database::Database;
use crate::events::{Event, EventBus};
use crate::instrumentation::{names, Instrumentation};
use crate::point::Datapoint;
use crate::routers::{Destination, Router};
use crate::schemas::{
    AggregationSchemas, SchemaError, SchemaFiles, SchemaStore, StorageSchemas,
};
use crate::writer::{RateAdmission, WriteScheduler, WriterOptions};

/// Fatal startup failures. Anything here means exit code 1.
#[derive(Debug, Snafu)]
pub enum StartupError {
    #[snafu(display("failed to load schemas: {source}"))]
    Schemas { source: SchemaError },
    #[snafu(display("failed to load aggregation rules: {source}"))]
    Rules { source: RuleError },
}

/// Where schema snapshots come from.
pub enum SchemaSource {
    /// Parse from files and re-parse on the reload cadence.
    Files(SchemaFiles),
    /// Already-parsed snapshots; reload is a no-op.
    Fixed {
        storage: StorageSchemas,
        aggregation: AggregationSchemas,
    },
}

/// Where aggregation rules come from.
pub enum RuleSource {
    /// No aggregation stage; every sample flows straight to the cache.
    None,
    /// Parse from a file and re-parse on the reload cadence.
    File(PathBuf),
    /// Already-parsed rules.
    Fixed(AggregationRules),
}

/// Downstream peer transport, fed by the routing stage. Implementations
/// adapt the wire protocol; the core only picks destinations.
pub trait PeerSink: Send + Sync {
    fn send(&self, destination: &Destination, metric: &str, datapoint: Datapoint);
}

/// The optional fan-out stage.
pub struct RelayConfig {
    pub router: Arc<dyn Router>,
    pub sink: Arc<dyn PeerSink>,
}

/// Everything `Topology::start` needs.
pub struct TopologyConfig {
    pub settings: Settings,
    pub database: Arc<dyn Database>,
    pub schemas: SchemaSource,
    pub aggregation_rules: RuleSource,
    pub relay: Option<RelayConfig>,
}

/// A running pipeline: the ingress capability plus the service handles.
pub struct Topology {
    settings: Settings,
    events: EventBus,
    cache: Arc<MetricCache>,
    aggregator: Arc<Aggregator>,
    admission: Arc<RateAdmission>,
    instrumentation: Arc<Instrumentation>,
    schemas: Arc<SchemaStore>,
    aggregator_shutdown: CancellationToken,
    service_shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Topology {
    /// Build and start the pipeline. Must be called from within a tokio
    /// runtime; all tasks are spawned onto it.
    pub fn start(config: TopologyConfig) -> Result<Self, StartupError> {
        let handle = Handle::current();
        let settings = config.settings;

        let events = EventBus::new();
        let instrumentation = Arc::new(Instrumentation::new());

        let schemas = Arc::new(match config.schemas {
            SchemaSource::Files(files) => SchemaStore::from_files(files).context(SchemasSnafu)?,
            SchemaSource::Fixed {
                storage,
                aggregation,
            } => SchemaStore::fixed(storage, aggregation),
        });

        let cache = Arc::new(MetricCache::new(
            settings.cache_write_strategy,
            settings.max_cache_size,
            events.clone(),
            Arc::clone(&instrumentation),
        ));

        let manager = Arc::new(BufferManager::new(
            i64::from(settings.max_aggregation_intervals),
            events.clone(),
            Arc::clone(&instrumentation),
        ));
        let (rules, rules_path) = match config.aggregation_rules {
            RuleSource::None => (AggregationRules::default(), None),
            RuleSource::File(path) => {
                (AggregationRules::load(&path).context(RulesSnafu)?, Some(path))
            }
            RuleSource::Fixed(rules) => (rules, None),
        };
        let aggregator_shutdown = CancellationToken::new();
        let aggregator = Arc::new(Aggregator::new(
            rules,
            Arc::clone(&manager),
            settings.aggregation_write_back_frequency,
            Some(ComputeTimers {
                handle: handle.clone(),
                shutdown: aggregator_shutdown.clone(),
            }),
        ));

        let admission = Arc::new(RateAdmission::from_settings(
            &settings,
            Arc::clone(&instrumentation),
        ));

        Self::register_gauges(&instrumentation, &cache, &manager);
        Self::wire_events(&events, &aggregator, &cache, config.relay);

        let service_shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let writers = settings.max_writer_threads.max(1);
        for index in 0..writers {
            let scheduler = Arc::new(WriteScheduler::new(
                Arc::clone(&cache),
                Arc::clone(&config.database),
                Arc::clone(&schemas),
                Arc::clone(&admission),
                Arc::clone(&instrumentation),
                WriterOptions::from_settings(&settings),
                service_shutdown.clone(),
            ));
            tasks.push(handle.spawn(scheduler.run(Shard {
                index: index as u64,
                of: writers as u64,
            })));
        }

        tasks.push(handle.spawn(Self::reload_loop(
            Arc::clone(&schemas),
            Arc::clone(&aggregator),
            rules_path,
            Duration::from_secs(settings.schema_reload_interval.max(1)),
            service_shutdown.clone(),
        )));

        tasks.push(handle.spawn(Self::self_report_loop(
            Arc::clone(&instrumentation),
            events.clone(),
            settings.self_report_prefix(),
            Duration::from_secs(settings.carbon_metric_interval.max(1)),
            service_shutdown.clone(),
        )));

        Ok(Topology {
            settings,
            events,
            cache,
            aggregator,
            admission,
            instrumentation,
            schemas,
            aggregator_shutdown,
            service_shutdown,
            tasks,
        })
    }

    /// The ingress capability: submit one parsed sample.
    pub fn submit(&self, metric: &str, datapoint: Datapoint) {
        self.instrumentation.increment(names::METRICS_RECEIVED);
        self.events.publish(Event::MetricReceived {
            metric: metric.to_string(),
            datapoint,
        });
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cache(&self) -> &Arc<MetricCache> {
        &self.cache
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    pub fn schemas(&self) -> &Arc<SchemaStore> {
        &self.schemas
    }

    /// Graceful shutdown: flush aggregation, boost the update rate, drain
    /// the cache, join every task.
    pub async fn stop(self) {
        // Aggregation first so its final emissions land in the cache while
        // the writers are still running.
        self.aggregator_shutdown.cancel();
        self.aggregator.join().await;

        self.admission
            .enter_shutdown(self.settings.max_updates_per_second_on_shutdown);
        self.service_shutdown.cancel();
        join_all(self.tasks).await;
    }

    fn register_gauges(
        instrumentation: &Arc<Instrumentation>,
        cache: &Arc<MetricCache>,
        manager: &Arc<BufferManager>,
    ) {
        {
            let cache = Arc::clone(cache);
            instrumentation.register_gauge(names::CACHE_SIZE, move || cache.size() as f64);
        }
        {
            let cache = Arc::clone(cache);
            instrumentation.register_gauge(names::CACHE_QUEUES, move || cache.queues() as f64);
        }
        {
            let manager = Arc::clone(manager);
            instrumentation
                .register_gauge(names::AGGREGATION_ALLOCATED_BUFFERS, move || {
                    manager.len() as f64
                });
        }
        {
            let manager = Arc::clone(manager);
            instrumentation.register_gauge(names::AGGREGATION_BUFFERED_DATAPOINTS, move || {
                manager.buffered_datapoints() as f64
            });
        }
    }

    fn wire_events(
        events: &EventBus,
        aggregator: &Arc<Aggregator>,
        cache: &Arc<MetricCache>,
        relay: Option<RelayConfig>,
    ) {
        // Fan-out to peers sees the raw stream before any local stage.
        if let Some(relay) = relay {
            events.subscribe(move |event| {
                if let Event::MetricReceived { metric, datapoint } = event {
                    for destination in relay.router.get_destinations(metric) {
                        relay.sink.send(&destination, metric, *datapoint);
                    }
                }
            });
        }

        // Received samples aggregate or go straight to the cache; generated
        // samples always go to the cache.
        {
            let aggregator = Arc::clone(aggregator);
            let cache = Arc::clone(cache);
            events.subscribe(move |event| match event {
                Event::MetricReceived { metric, datapoint } => {
                    if !aggregator.process(metric, *datapoint) {
                        cache.store(metric, *datapoint);
                    }
                }
                Event::MetricGenerated { metric, datapoint } => {
                    cache.store(metric, *datapoint);
                }
                _ => {}
            });
        }

        // Cache pressure translates into ingress flow control.
        {
            let bus = events.clone();
            events.subscribe(move |event| match event {
                Event::CacheFull => bus.publish(Event::PauseReceiving),
                Event::CacheSpaceAvailable => bus.publish(Event::ResumeReceiving),
                _ => {}
            });
        }
    }

    async fn reload_loop(
        schemas: Arc<SchemaStore>,
        aggregator: Arc<Aggregator>,
        rules_path: Option<PathBuf>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticks = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    schemas.reload();
                    if let Some(path) = &rules_path {
                        match AggregationRules::load(path) {
                            Ok(rules) => aggregator.reload_rules(rules),
                            Err(reload_error) => error!(
                                message = "Failed to reload aggregation rules, keeping previous.",
                                %reload_error,
                            ),
                        }
                    }
                }
            }
        }
    }

    async fn self_report_loop(
        instrumentation: Arc<Instrumentation>,
        events: EventBus,
        prefix: String,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticks = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    for (metric, datapoint) in instrumentation.report_datapoints(&prefix) {
                        events.publish(Event::MetricGenerated { metric, datapoint });
                    }
                }
            }
        }
    }
}
