//! Process-wide event fan-out.
//!
//! A tiny synchronous publish/subscribe bus. Subscribers run in
//! registration order on the publisher's own call stack, so publishing is
//! cheap and ordering is deterministic. The bus knows nothing about the
//! components that publish into it.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::point::Datapoint;

/// The events the pipeline components exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A raw sample arrived from a producer.
    MetricReceived { metric: String, datapoint: Datapoint },
    /// The aggregator (or self-instrumentation) emitted a reduced sample.
    MetricGenerated { metric: String, datapoint: Datapoint },
    /// The cache crossed its soft size bound.
    CacheFull,
    /// The cache fell back below its low watermark.
    CacheSpaceAvailable,
    /// Ingress listeners should stop accepting work.
    PauseReceiving,
    /// Ingress listeners may accept work again.
    ResumeReceiving,
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous fan-out bus for [`Event`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Arc<Vec<Subscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Subscribers are invoked in registration order
    /// for every published event and filter on the variants they care about.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut guard = self.subscribers.write();
        let mut list: Vec<Subscriber> = guard.as_ref().clone();
        list.push(Arc::new(subscriber));
        *guard = Arc::new(list);
    }

    /// Deliver `event` to every subscriber, synchronously, in registration
    /// order. Safe to call re-entrantly from within a subscriber.
    pub fn publish(&self, event: Event) {
        // Snapshot the list so delivery holds no lock; a subscriber may
        // publish again or subscribe without deadlocking.
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
    }
}
