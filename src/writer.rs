//! The writer loop.
//!
//! Drains the cache one metric at a time under dual rate limits, lazily
//! provisions archives for metrics it has never seen, and commits each
//! batch with `update_many`. Failed batches are dropped, never re-queued;
//! durability beyond the in-memory cache is explicitly not promised.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::AggregationMethod;
use crate::cache::{MetricCache, Shard};
use crate::config::Settings;
use crate::database::Database;
use crate::instrumentation::{names, Instrumentation};
use crate::point::Datapoint;
use crate::schemas::SchemaStore;
use crate::util::TokenBucket;

/// Whisper's own defaults, applied when no aggregation schema matches.
const DEFAULT_X_FILES_FACTOR: f64 = 0.5;
const DEFAULT_AGGREGATION_METHOD: AggregationMethod = AggregationMethod::Avg;

/// Length of the soft create-admission window.
const CREATE_WINDOW: Duration = Duration::from_secs(60);

struct CreateWindow {
    started: tokio::time::Instant,
    count: u64,
}

/// Per-metric admission decisions: the create and update token buckets plus
/// the sliding one-minute window that fails new metrics closed during
/// naming storms.
pub struct RateAdmission {
    create_bucket: Option<TokenBucket>,
    update_bucket: Option<TokenBucket>,
    window: parking_lot::Mutex<CreateWindow>,
    max_creates_per_minute: f64,
    instrumentation: Arc<Instrumentation>,
}

impl RateAdmission {
    pub fn from_settings(settings: &Settings, instrumentation: Arc<Instrumentation>) -> Self {
        let create_bucket = settings.max_creates_per_minute.is_finite().then(|| {
            TokenBucket::new(
                settings.max_creates_per_minute,
                settings.max_creates_per_minute / 60.0,
            )
        });
        let update_bucket = settings.max_updates_per_second.is_finite().then(|| {
            TokenBucket::new(
                settings.max_updates_per_second,
                settings.max_updates_per_second,
            )
        });
        RateAdmission {
            create_bucket,
            update_bucket,
            window: parking_lot::Mutex::new(CreateWindow {
                started: tokio::time::Instant::now(),
                count: 0,
            }),
            max_creates_per_minute: settings.max_creates_per_minute,
            instrumentation,
        }
    }

    /// Record one new-metric encounter against the sliding window. `false`
    /// means the window budget is spent and the caller should drop without
    /// contacting the database.
    pub fn admit_new_metric(&self) -> bool {
        if self.max_creates_per_minute.is_infinite() {
            return true;
        }
        let now = tokio::time::Instant::now();
        let mut window = self.window.lock();
        if now.duration_since(window.started) >= CREATE_WINDOW {
            window.started = now;
            window.count = 1;
            true
        } else {
            window.count += 1;
            window.count as f64 <= self.max_creates_per_minute
        }
    }

    /// Take one token from the create bucket, if one is configured.
    pub fn try_create(&self) -> bool {
        match &self.create_bucket {
            Some(bucket) => bucket.drain(1.0),
            None => true,
        }
    }

    /// Take one update token, blocking (and counting) when the bucket is
    /// momentarily empty.
    pub async fn throttle_update(&self) {
        let Some(bucket) = &self.update_bucket else {
            return;
        };
        if !bucket.drain(1.0) {
            self.instrumentation
                .increment(names::WRITE_RATELIMIT_EXCEEDED);
            bucket.wait_for(1.0).await;
        }
    }

    /// Shutdown hook: rebuild the update budget at the (typically higher)
    /// drain rate so the cache empties faster before exit.
    pub fn enter_shutdown(&self, updates_per_second: f64) {
        if let Some(bucket) = &self.update_bucket {
            bucket.reconfigure(updates_per_second, updates_per_second);
        }
    }
}

/// Knobs the scheduler needs beyond its collaborators.
#[derive(Clone, Copy, Debug)]
pub struct WriterOptions {
    pub log_updates: bool,
    pub idle_interval: Duration,
}

impl WriterOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        WriterOptions {
            log_updates: settings.log_updates,
            idle_interval: Duration::from_millis(settings.writer_idle_interval_ms),
        }
    }
}

/// One long-lived writer worker. With several workers, each runs against
/// its own [`Shard`] of the metric keyspace.
pub struct WriteScheduler {
    cache: Arc<MetricCache>,
    database: Arc<dyn Database>,
    schemas: Arc<SchemaStore>,
    admission: Arc<RateAdmission>,
    instrumentation: Arc<Instrumentation>,
    options: WriterOptions,
    shutdown: CancellationToken,
}

impl WriteScheduler {
    pub fn new(
        cache: Arc<MetricCache>,
        database: Arc<dyn Database>,
        schemas: Arc<SchemaStore>,
        admission: Arc<RateAdmission>,
        instrumentation: Arc<Instrumentation>,
        options: WriterOptions,
        shutdown: CancellationToken,
    ) -> Self {
        WriteScheduler {
            cache,
            database,
            schemas,
            admission,
            instrumentation,
            options,
            shutdown,
        }
    }

    /// Drain-and-commit until shutdown, then keep draining until the shard
    /// is empty and exit.
    pub async fn run(self: Arc<Self>, shard: Shard) {
        loop {
            match self.cache.drain_metric(shard) {
                Some((metric, datapoints)) => self.commit(&metric, datapoints).await,
                None => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    // Nothing pending; poll again shortly, or sooner if
                    // shutdown begins.
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = sleep(self.options.idle_interval) => {}
                    }
                }
            }
        }
    }

    async fn commit(&self, metric: &str, datapoints: Vec<Datapoint>) {
        self.admission.throttle_update().await;

        if !self.database.exists(metric).await && !self.provision(metric, &datapoints).await {
            return;
        }

        let started = Instant::now();
        match self.database.update_many(metric, &datapoints).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.instrumentation
                    .add(names::COMMITTED_POINTS, datapoints.len() as u64);
                self.instrumentation.increment(names::WRITE_OPERATIONS);
                self.instrumentation
                    .append(names::UPDATE_TIMES, elapsed.as_secs_f64());
                self.instrumentation
                    .append(names::POINTS_PER_UPDATE, datapoints.len() as f64);
                if self.options.log_updates {
                    debug!(
                        message = "Wrote datapoints.",
                        %metric,
                        count = datapoints.len(),
                        seconds = elapsed.as_secs_f64(),
                    );
                }
            }
            Err(write_error) => {
                error!(message = "Error writing datapoints.", %metric, %write_error);
                self.instrumentation.increment(names::ERRORS);
            }
        }
    }

    /// Create the archive for a never-seen metric. `false` means the batch
    /// must be dropped this round; the metric retries implicitly the next
    /// time it surfaces in the cache.
    async fn provision(&self, metric: &str, datapoints: &[Datapoint]) -> bool {
        if !self.admission.admit_new_metric() {
            // Naming storm: fail closed without touching the database.
            self.instrumentation.increment(names::DROPPED_CREATES);
            debug!(
                message = "Create window exhausted, dropping datapoints for new metric.",
                %metric,
                count = datapoints.len(),
            );
            return false;
        }

        if !self.admission.try_create() {
            self.instrumentation
                .increment(names::CREATE_RATELIMIT_EXCEEDED);
            debug!(
                message = "Create rate limit exceeded, dropping datapoints for new metric.",
                %metric,
                count = datapoints.len(),
            );
            return false;
        }

        let storage = self.schemas.storage();
        let Some(schema) = storage.matching(metric) else {
            // A well-formed configuration ends with a terminal default, so
            // this is a configuration hole worth shouting about.
            error!(message = "No storage schema matched metric.", %metric);
            self.instrumentation.increment(names::METRIC_CREATE_ERRORS);
            return false;
        };

        let aggregation = self.schemas.aggregation();
        let (x_files_factor, method, aggregation_name) = match aggregation.matching(metric) {
            Some(agg) => (
                agg.x_files_factor,
                agg.aggregation_method,
                agg.name.as_str(),
            ),
            None => (DEFAULT_X_FILES_FACTOR, DEFAULT_AGGREGATION_METHOD, "<none>"),
        };

        info!(
            message = "Creating new archive.",
            %metric,
            schema = %schema.name,
            aggregation = %aggregation_name,
        );
        match self
            .database
            .create(metric, &schema.archives, x_files_factor, method)
            .await
        {
            Ok(()) => {
                self.instrumentation.increment(names::CREATES);
                true
            }
            Err(create_error) => {
                error!(message = "Archive creation failed.", %metric, %create_error);
                self.instrumentation.increment(names::METRIC_CREATE_ERRORS);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WriteStrategy;
    use crate::database::MemoryDatabase;
    use crate::events::EventBus;
    use crate::schemas::{AggregationSchemas, StorageSchemas};

    struct Fixture {
        cache: Arc<MetricCache>,
        database: Arc<MemoryDatabase>,
        instrumentation: Arc<Instrumentation>,
        admission: Arc<RateAdmission>,
        scheduler: Arc<WriteScheduler>,
        shutdown: CancellationToken,
    }

    fn fixture(settings: Settings) -> Fixture {
        let instrumentation = Arc::new(Instrumentation::new());
        let cache = Arc::new(MetricCache::new(
            WriteStrategy::Sorted,
            settings.max_cache_size,
            EventBus::new(),
            Arc::clone(&instrumentation),
        ));
        let database = Arc::new(MemoryDatabase::default());
        let schemas = Arc::new(SchemaStore::fixed(
            StorageSchemas::parse("[default]\npattern = .*\nretentions = 60:1440\n").unwrap(),
            AggregationSchemas::default(),
        ));
        let admission = Arc::new(RateAdmission::from_settings(
            &settings,
            Arc::clone(&instrumentation),
        ));
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(WriteScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&database) as Arc<dyn Database>,
            schemas,
            Arc::clone(&admission),
            Arc::clone(&instrumentation),
            WriterOptions::from_settings(&settings),
            shutdown.clone(),
        ));
        Fixture {
            cache,
            database,
            instrumentation,
            admission,
            scheduler,
            shutdown,
        }
    }

    /// Drive the scheduler until the cache is empty, then stop it.
    async fn drain(fixture: &Fixture) {
        let worker = tokio::spawn(Arc::clone(&fixture.scheduler).run(Shard::all()));
        while !fixture.cache.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fixture.shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn commits_batches_and_provisions_archives() {
        let fixture = fixture(Settings::default());
        fixture.cache.store("a.b", Datapoint::new(10, 1.0));
        fixture.cache.store("a.b", Datapoint::new(20, 2.0));

        drain(&fixture).await;

        assert_eq!(fixture.database.creates(), 1);
        let file = fixture.database.file("a.b").unwrap();
        assert_eq!(
            file.points,
            vec![Datapoint::new(10, 1.0), Datapoint::new(20, 2.0)]
        );
        assert_eq!(fixture.instrumentation.counter(names::CREATES), 1);
        assert_eq!(fixture.instrumentation.counter(names::COMMITTED_POINTS), 2);
        assert_eq!(fixture.instrumentation.counter(names::WRITE_OPERATIONS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_limit_admits_exactly_the_window_budget() {
        let settings = Settings {
            max_creates_per_minute: 2.0,
            ..Settings::default()
        };
        let fixture = fixture(settings);
        for metric in ["a", "b", "c", "d"] {
            fixture.cache.store(metric, Datapoint::new(1, 1.0));
        }

        drain(&fixture).await;

        // Exactly two creates reach the database; the other two batches are
        // dropped and counted, and nothing lingers in the cache.
        assert_eq!(fixture.database.creates(), 2);
        assert_eq!(
            fixture.instrumentation.counter(names::DROPPED_CREATES),
            2
        );
        assert!(fixture.cache.is_empty());
        assert!(fixture.database.file("a").is_some());
        assert!(fixture.database.file("b").is_some());
        assert!(fixture.database.file("c").is_none());
        assert!(fixture.database.file("d").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn update_failures_drop_the_batch_and_continue() {
        let fixture = fixture(Settings::default());
        fixture.cache.store("a", Datapoint::new(1, 1.0));
        fixture.database.fail_updates(true);

        drain(&fixture).await;

        assert_eq!(fixture.instrumentation.counter(names::ERRORS), 1);
        assert_eq!(fixture.instrumentation.counter(names::COMMITTED_POINTS), 0);
        assert!(fixture.cache.is_empty());

        // The archive exists now, so a later batch commits cleanly.
        fixture.database.fail_updates(false);
        fixture.cache.store("a", Datapoint::new(2, 2.0));
        drain_again(&fixture).await;
        assert_eq!(fixture.instrumentation.counter(names::COMMITTED_POINTS), 1);
    }

    async fn drain_again(fixture: &Fixture) {
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(WriteScheduler::new(
            Arc::clone(&fixture.cache),
            Arc::clone(&fixture.database) as Arc<dyn Database>,
            Arc::new(SchemaStore::fixed(
                StorageSchemas::parse("[default]\npattern = .*\nretentions = 60:1440\n").unwrap(),
                AggregationSchemas::default(),
            )),
            Arc::clone(&fixture.admission),
            Arc::clone(&fixture.instrumentation),
            WriterOptions {
                log_updates: false,
                idle_interval: Duration::from_millis(100),
            },
            shutdown.clone(),
        ));
        let worker = tokio::spawn(scheduler.run(Shard::all()));
        while !fixture.cache.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn create_failures_count_and_drop() {
        let fixture = fixture(Settings::default());
        fixture.database.fail_creates(true);
        fixture.cache.store("a", Datapoint::new(1, 1.0));

        drain(&fixture).await;

        assert_eq!(
            fixture.instrumentation.counter(names::METRIC_CREATE_ERRORS),
            1
        );
        assert_eq!(fixture.database.creates(), 0);
        assert!(fixture.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn schema_miss_is_fatal_for_that_metric_only() {
        let settings = Settings::default();
        let instrumentation = Arc::new(Instrumentation::new());
        let cache = Arc::new(MetricCache::new(
            WriteStrategy::Sorted,
            f64::INFINITY,
            EventBus::new(),
            Arc::clone(&instrumentation),
        ));
        let database = Arc::new(MemoryDatabase::default());
        // No terminal default: only ^servers\. metrics match anything.
        let schemas = Arc::new(SchemaStore::fixed(
            StorageSchemas::parse("[servers]\npattern = ^servers\\.\nretentions = 60:1440\n")
                .unwrap(),
            AggregationSchemas::default(),
        ));
        let admission = Arc::new(RateAdmission::from_settings(
            &settings,
            Arc::clone(&instrumentation),
        ));
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(WriteScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&database) as Arc<dyn Database>,
            schemas,
            admission,
            Arc::clone(&instrumentation),
            WriterOptions::from_settings(&settings),
            shutdown.clone(),
        ));

        cache.store("servers.web1.load", Datapoint::new(1, 1.0));
        cache.store("orphan.metric", Datapoint::new(1, 1.0));

        let worker = tokio::spawn(Arc::clone(&scheduler).run(Shard::all()));
        while !cache.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        worker.await.unwrap();

        assert!(database.file("servers.web1.load").is_some());
        assert!(database.file("orphan.metric").is_none());
        assert_eq!(instrumentation.counter(names::METRIC_CREATE_ERRORS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_switches_the_update_refill_rate() {
        let settings = Settings {
            max_updates_per_second: 1.0,
            max_updates_per_second_on_shutdown: 1000.0,
            ..Settings::default()
        };
        let fixture = fixture(settings);
        for i in 0..20 {
            fixture.cache.store(&format!("m.{i}"), Datapoint::new(1, 1.0));
        }

        // Start the worker, then immediately begin shutdown: the drain must
        // finish quickly under the boosted refill rate (20 updates at 1/s
        // would otherwise need ~19 virtual seconds).
        let worker = tokio::spawn(Arc::clone(&fixture.scheduler).run(Shard::all()));
        fixture.admission.enter_shutdown(1000.0);
        fixture.shutdown.cancel();
        let started = tokio::time::Instant::now();
        worker.await.unwrap();

        assert!(fixture.cache.is_empty());
        assert_eq!(fixture.database.file_count(), 20);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_a_minute() {
        let settings = Settings {
            max_creates_per_minute: 1.0,
            ..Settings::default()
        };
        let instrumentation = Arc::new(Instrumentation::new());
        let admission = RateAdmission::from_settings(&settings, instrumentation);

        assert!(admission.admit_new_metric());
        assert!(!admission.admit_new_metric());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(admission.admit_new_metric());
    }
}
