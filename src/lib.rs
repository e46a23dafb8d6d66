//! metricd — the ingestion and persistence tier of a graphite-style
//! time-series metrics platform.
//!
//! A firehose of named numeric samples flows in from many concurrent
//! producers, optionally through an aggregation stage that reduces each
//! time bin to one datapoint, into a bounded in-memory cache, and out
//! through a rate-limited writer that commits batches per metric to a
//! fixed-size round-robin database.
//!
//! ```text
//! producers -> submit -> { aggregator? -> cache -> writer -> database }
//!                        \ router? -> peer sinks /
//! ```
//!
//! Listeners, the on-disk archive format, and process supervision live
//! outside this crate; see [`topology::Topology`] for the seams they plug
//! into.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod database;
pub mod events;
pub mod instrumentation;
pub mod point;
pub mod routers;
pub mod schemas;
pub mod topology;
pub mod util;
pub mod writer;

pub use config::Settings;
pub use point::Datapoint;
pub use topology::{Topology, TopologyConfig};
