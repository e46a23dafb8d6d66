//! Routing of metric names to downstream destinations.
//!
//! Three interchangeable strategies: ordered relay rules, a consistent-hash
//! ring, and a rule-aware wrapper around the ring that routes by aggregate
//! output names. All of them answer `get_destinations` deterministically so
//! a restarted relay reproduces the same placement.

use std::str::FromStr;
use std::sync::Arc;

use md5::{Digest, Md5};
use parking_lot::RwLock;
use regex::Regex;
use snafu::Snafu;

use crate::aggregator::AggregationRules;

/// Virtual nodes placed on the ring per destination.
const RING_REPLICAS: usize = 100;

/// A downstream sink endpoint. Equality is structural on all three fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub instance: String,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, instance: impl Into<String>) -> Self {
        Destination {
            host: host.into(),
            port,
            instance: instance.into(),
        }
    }

    /// The stable label the ring hashes: `host:port:instance`.
    pub fn label(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.instance)
    }
}

#[derive(Debug, Snafu, PartialEq)]
#[snafu(display("malformed destination '{spec}', expected host:port:instance"))]
pub struct BadDestination {
    pub spec: String,
}

impl FromStr for Destination {
    type Err = BadDestination;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [host, port, instance] = parts.as_slice() else {
            return Err(BadDestination { spec: s.into() });
        };
        let port: u16 = port.parse().map_err(|_| BadDestination { spec: s.into() })?;
        Ok(Destination::new(*host, port, *instance))
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Deterministic mapping from a metric name to downstream destinations.
pub trait Router: Send + Sync {
    /// Distinct destinations for `metric`, at most the configured fan-out.
    fn get_destinations(&self, metric: &str) -> Vec<Destination>;
    fn add_destination(&self, destination: Destination);
    fn remove_destination(&self, destination: &Destination);
}

/// 16-bit ring position: the first two bytes of the md5 digest, big-endian.
fn ring_position(key: &str) -> u16 {
    let digest = Md5::digest(key.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]])
}

/// The hash ring itself: sorted `(position, destination)` entries with
/// [`RING_REPLICAS`] virtual nodes per destination.
#[derive(Clone, Debug, Default)]
struct HashRing {
    entries: Vec<(u16, Destination)>,
}

impl HashRing {
    fn add_node(&mut self, destination: &Destination) {
        let label = destination.label();
        for replica in 0..RING_REPLICAS {
            let position = ring_position(&format!("{label}:{replica}"));
            self.entries.push((position, destination.clone()));
        }
        // Position ties across destinations are broken by the destination
        // itself so placement is total and restart-stable.
        self.entries.sort();
    }

    fn remove_node(&mut self, destination: &Destination) {
        self.entries.retain(|(_, d)| d != destination);
    }

    /// Walk clockwise from the metric's position, yielding the first
    /// `wanted` distinct destinations.
    fn get_nodes(&self, metric: &str, wanted: usize) -> Vec<Destination> {
        if self.entries.is_empty() || wanted == 0 {
            return Vec::new();
        }
        let position = ring_position(metric);
        let start = self.entries.partition_point(|(p, _)| *p < position);

        let mut found = Vec::new();
        for offset in 0..self.entries.len() {
            let (_, destination) = &self.entries[(start + offset) % self.entries.len()];
            if !found.contains(destination) {
                found.push(destination.clone());
                if found.len() == wanted {
                    break;
                }
            }
        }
        found
    }
}

/// Consistent-hash routing with a configurable number of distinct
/// destinations per metric.
pub struct ConsistentHashingRouter {
    ring: RwLock<HashRing>,
    replication_factor: usize,
}

impl ConsistentHashingRouter {
    pub fn new(replication_factor: usize) -> Self {
        ConsistentHashingRouter {
            ring: RwLock::new(HashRing::default()),
            replication_factor: replication_factor.max(1),
        }
    }
}

impl Router for ConsistentHashingRouter {
    fn get_destinations(&self, metric: &str) -> Vec<Destination> {
        self.ring.read().get_nodes(metric, self.replication_factor)
    }

    fn add_destination(&self, destination: Destination) {
        self.ring.write().add_node(&destination);
    }

    fn remove_destination(&self, destination: &Destination) {
        self.ring.write().remove_node(destination);
    }
}

/// One relay rule: a pattern (or the default) and its target destinations.
#[derive(Clone, Debug)]
pub struct RelayRule {
    pub pattern: Option<Regex>,
    pub destinations: Vec<Destination>,
    pub is_default: bool,
}

impl RelayRule {
    fn matches(&self, metric: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(metric),
            None => self.is_default,
        }
    }
}

/// Ordered-rule routing: the first rule whose pattern matches wins; the
/// default rule catches everything else. A rule only routes to destinations
/// currently registered with the router, so a departed peer silently drops
/// out of its rules.
pub struct RelayRulesRouter {
    rules: Vec<RelayRule>,
    live: RwLock<Vec<Destination>>,
}

impl RelayRulesRouter {
    pub fn new(rules: Vec<RelayRule>) -> Self {
        RelayRulesRouter {
            rules,
            live: RwLock::new(Vec::new()),
        }
    }
}

impl Router for RelayRulesRouter {
    fn get_destinations(&self, metric: &str) -> Vec<Destination> {
        let live = self.live.read();
        for rule in &self.rules {
            if rule.matches(metric) {
                return rule
                    .destinations
                    .iter()
                    .filter(|d| live.contains(d))
                    .cloned()
                    .collect();
            }
        }
        Vec::new()
    }

    fn add_destination(&self, destination: Destination) {
        let mut live = self.live.write();
        if !live.contains(&destination) {
            live.push(destination);
        }
    }

    fn remove_destination(&self, destination: &Destination) {
        self.live.write().retain(|d| d != destination);
    }
}

/// Consistent-hash routing that also follows aggregation: a metric routes
/// by its own name and, additionally, by every rule-derived aggregate name,
/// so the peer that will hold an aggregate also sees its inputs.
pub struct AggregatedConsistentHashingRouter {
    inner: ConsistentHashingRouter,
    rules: Arc<AggregationRules>,
}

impl AggregatedConsistentHashingRouter {
    pub fn new(replication_factor: usize, rules: Arc<AggregationRules>) -> Self {
        AggregatedConsistentHashingRouter {
            inner: ConsistentHashingRouter::new(replication_factor),
            rules,
        }
    }
}

impl Router for AggregatedConsistentHashingRouter {
    fn get_destinations(&self, metric: &str) -> Vec<Destination> {
        let mut keys = vec![metric.to_string()];
        keys.extend(self.rules.all_matches(metric));

        let mut destinations = Vec::new();
        for key in keys {
            for destination in self.inner.get_destinations(&key) {
                if !destinations.contains(&destination) {
                    destinations.push(destination);
                }
            }
        }
        destinations
    }

    fn add_destination(&self, destination: Destination) {
        self.inner.add_destination(destination);
    }

    fn remove_destination(&self, destination: &Destination) {
        self.inner.remove_destination(destination);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn dest(instance: &str) -> Destination {
        Destination::new("127.0.0.1", 2004, instance)
    }

    #[test]
    fn destination_parses_from_spec_string() {
        let parsed: Destination = "10.0.0.1:2004:a".parse().unwrap();
        assert_eq!(parsed, Destination::new("10.0.0.1", 2004, "a"));
        assert!("10.0.0.1:2004".parse::<Destination>().is_err());
        assert!("10.0.0.1:notaport:a".parse::<Destination>().is_err());
    }

    // The md5 fixture: with destinations {a, b} both on 127.0.0.1:2004 and
    // a replication factor of 1, "a.b.c" lands on b and "foo.bar.baz" on a.
    // The exact binding is arbitrary but must never move between restarts.
    #[test]
    fn hash_placement_is_stable() {
        let build = || {
            let router = ConsistentHashingRouter::new(1);
            router.add_destination(dest("a"));
            router.add_destination(dest("b"));
            router
        };

        let router = build();
        assert_eq!(router.get_destinations("a.b.c"), vec![dest("b")]);
        assert_eq!(router.get_destinations("foo.bar.baz"), vec![dest("a")]);

        // A freshly built ring reproduces the identical placement.
        let rebuilt = build();
        for metric in ["a.b.c", "foo.bar.baz", "x.y.z", "one.two"] {
            assert_eq!(
                router.get_destinations(metric),
                rebuilt.get_destinations(metric)
            );
        }
    }

    #[test]
    fn replication_factor_returns_distinct_destinations() {
        let router = ConsistentHashingRouter::new(2);
        router.add_destination(dest("a"));
        router.add_destination(dest("b"));

        let destinations = router.get_destinations("a.b.c");
        assert_eq!(destinations.len(), 2);
        assert_ne!(destinations[0], destinations[1]);
    }

    #[test]
    fn add_then_remove_restores_prior_routes() {
        let router = ConsistentHashingRouter::new(1);
        router.add_destination(dest("a"));
        router.add_destination(dest("b"));

        let metrics = ["a.b.c", "c.b.a", "foo.bar.baz", "servers.web1.load"];
        let before: Vec<_> = metrics
            .iter()
            .map(|m| router.get_destinations(m))
            .collect();

        router.add_destination(dest("c"));
        router.remove_destination(&dest("c"));

        let after: Vec<_> = metrics
            .iter()
            .map(|m| router.get_destinations(m))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn empty_ring_routes_nowhere() {
        let router = ConsistentHashingRouter::new(1);
        assert!(router.get_destinations("a.b.c").is_empty());
    }

    #[test]
    fn relay_rules_first_match_wins_with_default_fallback() {
        let router = RelayRulesRouter::new(vec![
            RelayRule {
                pattern: Some(Regex::new("^foo").unwrap()),
                destinations: vec![dest("b")],
                is_default: false,
            },
            RelayRule {
                pattern: None,
                destinations: vec![dest("a"), dest("b")],
                is_default: true,
            },
        ]);
        router.add_destination(dest("a"));
        router.add_destination(dest("b"));

        assert_eq!(router.get_destinations("foo.x"), vec![dest("b")]);
        assert_eq!(router.get_destinations("bar.x"), vec![dest("a"), dest("b")]);
    }

    #[test]
    fn relay_rules_only_route_to_live_destinations() {
        let router = RelayRulesRouter::new(vec![RelayRule {
            pattern: None,
            destinations: vec![dest("a"), dest("b")],
            is_default: true,
        }]);

        assert!(router.get_destinations("a.b.c").is_empty());

        router.add_destination(dest("a"));
        assert_eq!(router.get_destinations("a.b.c"), vec![dest("a")]);

        router.add_destination(dest("b"));
        assert_eq!(router.get_destinations("a.b.c"), vec![dest("a"), dest("b")]);

        router.remove_destination(&dest("b"));
        assert_eq!(router.get_destinations("a.b.c"), vec![dest("a")]);
    }

    #[test]
    fn aggregated_router_adds_rule_derived_routes() {
        let rules = Arc::new(
            AggregationRules::parse("agg.<n>.sum (10) = sum metrics.<n>.count").unwrap(),
        );
        let aggregated = AggregatedConsistentHashingRouter::new(1, Arc::clone(&rules));
        let plain = ConsistentHashingRouter::new(1);
        for router in [&aggregated as &dyn Router, &plain as &dyn Router] {
            router.add_destination(dest("a"));
            router.add_destination(dest("b"));
        }

        // A matching metric routes by its own name and by its aggregate.
        let mut expected = plain.get_destinations("metrics.web.count");
        for destination in plain.get_destinations("agg.web.sum") {
            if !expected.contains(&destination) {
                expected.push(destination);
            }
        }
        assert_eq!(aggregated.get_destinations("metrics.web.count"), expected);

        // A non-matching metric routes by its own name alone.
        assert_eq!(
            aggregated.get_destinations("other.metric"),
            plain.get_destinations("other.metric")
        );
    }
}
