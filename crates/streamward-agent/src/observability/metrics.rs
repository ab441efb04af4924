//! Internal supervisor metrics
//!
//! Counters, gauges and latency histograms over atomics, held in a global
//! registry and served as a JSON snapshot at `GET /metrics`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

/// Monotonically increasing value
#[derive(Debug)]
pub struct Counter {
    name: String,
    description: String,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Value that can go up and down; never below zero
#[derive(Debug)]
pub struct Gauge {
    name: String,
    value: AtomicU64,
}

impl Gauge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Latency buckets in milliseconds
const LATENCY_BUCKETS_MS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Distribution of observed values
#[derive(Debug)]
pub struct Histogram {
    name: String,
    bounds: Vec<f64>,
    /// One slot per bound plus overflow
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum in thousandths of the observed unit
    sum_milli: AtomicU64,
}

impl Histogram {
    pub fn new(name: impl Into<String>, bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            name: name.into(),
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum_milli: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn latency(name: impl Into<String>) -> Self {
        Self::new(name, LATENCY_BUCKETS_MS.to_vec())
    }

    pub fn observe(&self, value: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_milli
            .fetch_add((value.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn average(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() / n as f64,
        }
    }

    /// Start timing; the duration is recorded when the timer drops
    pub fn start_timer(self: &Arc<Self>) -> Timer {
        Timer {
            start: Instant::now(),
            histogram: Arc::clone(self),
        }
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets = BTreeMap::new();
        for (bound, count) in self.bounds.iter().zip(&self.buckets) {
            buckets.insert(format!("le_{bound}"), count.load(Ordering::Relaxed));
        }
        if let Some(overflow) = self.buckets.last() {
            buckets.insert("le_inf".to_string(), overflow.load(Ordering::Relaxed));
        }
        HistogramSnapshot {
            count: self.count(),
            sum: self.sum(),
            average: self.average(),
            buckets,
        }
    }
}

/// Records elapsed time into a histogram on drop
pub struct Timer {
    start: Instant,
    histogram: Arc<Histogram>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.histogram.observe_duration(self.start.elapsed());
    }
}

fn get_or_insert<V>(
    map: &RwLock<HashMap<String, Arc<V>>>,
    name: &str,
    make: impl FnOnce() -> V,
) -> Arc<V> {
    if let Some(existing) = map.read().get(name) {
        return Arc::clone(existing);
    }
    let mut guard = map.write();
    Arc::clone(
        guard
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(make())),
    )
}

/// Registry of named metrics
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    gauges: RwLock<HashMap<String, Arc<Gauge>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, description: &str) -> Arc<Counter> {
        get_or_insert(&self.counters, name, || Counter::new(name, description))
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        get_or_insert(&self.gauges, name, || Gauge::new(name))
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        get_or_insert(&self.histograms, name, || Histogram::latency(name))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(name, c)| (name.clone(), c.get()))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(name, g)| (name.clone(), g.get()))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(name, h)| (name.clone(), h.snapshot()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub average: f64,
    pub buckets: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

static METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Global metrics registry
pub fn metrics() -> &'static MetricsRegistry {
    METRICS.get_or_init(MetricsRegistry::new)
}

// Supervisor metrics

pub fn pipelines_launched() -> Arc<Counter> {
    metrics().counter("streamward_pipelines_launched_total", "Capture pipelines launched")
}

pub fn launch_failures() -> Arc<Counter> {
    metrics().counter("streamward_launch_failures_total", "Pipeline launches that failed")
}

pub fn restarts() -> Arc<Counter> {
    metrics().counter("streamward_restarts_total", "Pipelines restarted by the watchdog")
}

pub fn pauses() -> Arc<Counter> {
    metrics().counter("streamward_pauses_total", "Monitors paused because upstream went offline")
}

pub fn orphans_killed() -> Arc<Counter> {
    metrics().counter("streamward_orphans_killed_total", "Unreferenced pipelines terminated")
}

pub fn strays_killed() -> Arc<Counter> {
    metrics().counter("streamward_strays_killed_total", "Segmenters terminated after their pipeline died")
}

pub fn duplicates_removed() -> Arc<Counter> {
    metrics().counter("streamward_duplicates_removed_total", "Duplicate monitor records deleted")
}

pub fn pipelines_adopted() -> Arc<Counter> {
    metrics().counter("streamward_pipelines_adopted_total", "Running pipelines re-attached to their record")
}

pub fn records_marked_dead() -> Arc<Counter> {
    metrics().counter("streamward_records_marked_dead_total", "Records deleted after their pipeline died")
}

pub fn watchdog_ticks() -> Arc<Counter> {
    metrics().counter("streamward_watchdog_ticks_total", "Watchdog evaluations completed")
}

pub fn errors_total() -> Arc<Counter> {
    metrics().counter("streamward_errors_total", "Per-record failures logged and skipped")
}

pub fn active_monitors() -> Arc<Gauge> {
    metrics().gauge("streamward_active_monitors")
}

pub fn watchdog_latency() -> Arc<Histogram> {
    metrics().histogram("streamward_watchdog_tick_ms")
}

pub fn reconciler_latency() -> Arc<Histogram> {
    metrics().histogram("streamward_reconciler_sweep_ms")
}
