use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// A gauge reads a live value on demand.
pub type Gauge = Box<dyn Fn() -> u64 + Send + Sync>;

/// A named collection of gauges, registered and unregistered as one unit.
#[derive(Default)]
pub struct GaugeSet {
    gauges: Vec<(&'static str, Gauge)>,
}

impl GaugeSet {
    pub fn new() -> Self {
        GaugeSet::default()
    }

    pub fn put(&mut self, name: &'static str, gauge: Gauge) {
        self.gauges.push((name, gauge));
    }
}

/// Registry shared by all replicators of a node. Gauge sets are registered
/// under a per-replicator name; histograms are created on first use and keyed
/// globally by metric name.
#[derive(Default)]
pub struct MetricsRegistry {
    gauge_sets: Mutex<HashMap<String, GaugeSet>>,
    histograms: Mutex<HashMap<&'static str, Arc<Histogram>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// Registers a gauge set. A duplicate name is ignored and returns false.
    pub fn register(&self, name: &str, set: GaugeSet) -> bool {
        let mut sets = self.gauge_sets.lock().expect("MetricsRegistry.register() mutex guard poison");
        if sets.contains_key(name) {
            return false;
        }
        sets.insert(name.to_string(), set);
        true
    }

    pub fn unregister(&self, name: &str) {
        self.gauge_sets
            .lock()
            .expect("MetricsRegistry.unregister() mutex guard poison")
            .remove(name);
    }

    /// Reads a single gauge, or None when the set or gauge doesn't exist.
    pub fn gauge(&self, set_name: &str, gauge_name: &str) -> Option<u64> {
        let sets = self.gauge_sets.lock().expect("MetricsRegistry.gauge() mutex guard poison");
        let set = sets.get(set_name)?;
        set.gauges
            .iter()
            .find(|(name, _)| *name == gauge_name)
            .map(|(_, gauge)| gauge())
    }

    pub fn record_latency(&self, name: &'static str, elapsed: Duration) {
        self.histogram(name).record(elapsed.as_millis() as u64);
    }

    pub fn record_size(&self, name: &'static str, value: u64) {
        self.histogram(name).record(value);
    }

    pub fn histogram_snapshot(&self, name: &'static str) -> Option<HistogramSnapshot> {
        self.histograms
            .lock()
            .expect("MetricsRegistry.histogram_snapshot() mutex guard poison")
            .get(name)
            .map(|h| h.snapshot())
    }

    fn histogram(&self, name: &'static str) -> Arc<Histogram> {
        let mut histograms = self
            .histograms
            .lock()
            .expect("MetricsRegistry.histogram() mutex guard poison");
        Arc::clone(histograms.entry(name).or_default())
    }
}

/// Count/sum/max recorder on atomics. Writers never block each other.
#[derive(Default)]
struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: u64,
    pub max: u64,
}
