//! The persistence capability.
//!
//! The on-disk round-robin format is somebody else's problem; the core only
//! needs `exists` / `create` / `update_many`. The in-memory implementation
//! here backs the test suite and doubles as the reference for adapter
//! authors: `create` owns everything below the storage root, including
//! parent directories, and `update_many` deduplicates identical timestamps
//! keeping the latest write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::Snafu;

use crate::aggregator::AggregationMethod;
use crate::point::Datapoint;
use crate::schemas::Archive;

#[derive(Debug, Snafu)]
pub enum DatabaseError {
    #[snafu(display("I/O failure on {metric}: {source}"))]
    Io {
        metric: String,
        source: std::io::Error,
    },
    #[snafu(display("archive for {metric} already exists"))]
    AlreadyExists { metric: String },
    #[snafu(display("archive for {metric} does not exist"))]
    DoesNotExist { metric: String },
    #[snafu(display("database failure on {metric}: {reason}"))]
    Failed { metric: String, reason: String },
}

/// Creation flags passed through from configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateOptions {
    pub sparse: bool,
    pub fallocate: bool,
}

impl CreateOptions {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        CreateOptions {
            sparse: settings.whisper_sparse_create,
            fallocate: settings.whisper_fallocate_create,
        }
    }
}

/// What the core requires of the archive store.
#[async_trait]
pub trait Database: Send + Sync {
    /// Whether an archive exists for `metric`. Idempotent.
    async fn exists(&self, metric: &str) -> bool;

    /// Create the archive for `metric`. Called at most once per metric
    /// lifetime; the implementation owns directory provisioning.
    async fn create(
        &self,
        metric: &str,
        archives: &[Archive],
        x_files_factor: f64,
        aggregation_method: AggregationMethod,
    ) -> Result<(), DatabaseError>;

    /// Commit a batch of datapoints in arrival order.
    async fn update_many(&self, metric: &str, datapoints: &[Datapoint])
        -> Result<(), DatabaseError>;
}

/// Map a dotted metric name onto the filesystem: one directory per name
/// component, `.wsp` leaf.
pub fn metric_path(root: &Path, metric: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    let mut components = metric.split('.').peekable();
    while let Some(component) = components.next() {
        if components.peek().is_some() {
            path.push(component);
        } else {
            path.push(format!("{component}.wsp"));
        }
    }
    path
}

#[derive(Clone, Debug)]
pub struct MemoryArchive {
    pub archives: Vec<Archive>,
    pub x_files_factor: f64,
    pub aggregation_method: AggregationMethod,
    pub points: Vec<Datapoint>,
}

/// In-memory [`Database`] with failure injection, used by the test suite.
#[derive(Default)]
pub struct MemoryDatabase {
    files: Mutex<HashMap<String, MemoryArchive>>,
    options: CreateOptions,
    creates: AtomicU64,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
}

impl MemoryDatabase {
    pub fn new(options: CreateOptions) -> Self {
        MemoryDatabase {
            options,
            ..Default::default()
        }
    }

    /// Total successful `create` calls.
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn file(&self, metric: &str) -> Option<MemoryArchive> {
        self.files.lock().get(metric).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    pub fn options(&self) -> CreateOptions {
        self.options
    }

    /// Make subsequent `create` calls fail.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `update_many` calls fail.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn exists(&self, metric: &str) -> bool {
        self.files.lock().contains_key(metric)
    }

    async fn create(
        &self,
        metric: &str,
        archives: &[Archive],
        x_files_factor: f64,
        aggregation_method: AggregationMethod,
    ) -> Result<(), DatabaseError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(DatabaseError::Failed {
                metric: metric.to_string(),
                reason: "injected create failure".into(),
            });
        }

        let mut files = self.files.lock();
        if files.contains_key(metric) {
            return Err(DatabaseError::AlreadyExists {
                metric: metric.to_string(),
            });
        }
        files.insert(
            metric.to_string(),
            MemoryArchive {
                archives: archives.to_vec(),
                x_files_factor,
                aggregation_method,
                points: Vec::new(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_many(
        &self,
        metric: &str,
        datapoints: &[Datapoint],
    ) -> Result<(), DatabaseError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(DatabaseError::Failed {
                metric: metric.to_string(),
                reason: "injected update failure".into(),
            });
        }

        let mut files = self.files.lock();
        let file = files
            .get_mut(metric)
            .ok_or_else(|| DatabaseError::DoesNotExist {
                metric: metric.to_string(),
            })?;
        for datapoint in datapoints {
            // Same-timestamp writes collapse to the latest value.
            match file.points.iter_mut().find(|p| p.timestamp == datapoint.timestamp) {
                Some(existing) => existing.value = datapoint.value,
                None => file.points.push(*datapoint),
            }
        }
        Ok(())
    }
}
