use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

pub const UNIT_ATTEMPTS_TOTAL: &str = "unit_attempts_total";
pub const UNITS_TOTAL: &str = "units_total";
pub const UNIT_DURATION_SECONDS: &str = "unit_duration_seconds";
pub const EXECUTIONS_TOTAL: &str = "executions_total";
pub const SERVICES_DEPLOYED_TOTAL: &str = "services_deployed_total";
pub const SERVICES_RUNNING: &str = "services_running";

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Tracks the distribution of observed values across buckets.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    pub sum: AtomicU64,
    pub count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum stored as bits
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Unit attempts run from sub-second stubs to minutes of tool use.
fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing counter families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// `{key="value",key2="value2"}` for Prometheus output.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type CounterMap = AHashMap<(String, Labels), AtomicU64>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| {
        tracing::warn!("metrics lock was poisoned, recovering");
        e.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| {
        tracing::warn!("metrics lock was poisoned, recovering");
        e.into_inner()
    })
}

/// Counters, gauges and histograms behind interior mutability.
///
/// Owned by the engine context and shared by `Arc`.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<CounterMap>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// A collector with the engine histograms pre-registered.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        write(&collector.histograms).insert(
            UNIT_DURATION_SECONDS.to_string(),
            Histogram::new(default_duration_buckets()),
        );
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = write(&self.counters);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with default buckets if needed.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        read(&self.histograms)
            .get(name)
            .map(|h| h.get_count())
            .unwrap_or(0)
    }

    // -- Engine helpers -----------------------------------------------------

    pub fn record_attempt(&self, strategy: &str) {
        self.increment_counter(UNIT_ATTEMPTS_TOTAL, &[("strategy", strategy)]);
    }

    pub fn record_unit(&self, outcome: &str, duration_secs: f64) {
        self.increment_counter(UNITS_TOTAL, &[("outcome", outcome)]);
        self.record_histogram(UNIT_DURATION_SECONDS, duration_secs);
    }

    pub fn record_execution(&self, status: &str) {
        self.increment_counter(EXECUTIONS_TOTAL, &[("status", status)]);
    }

    pub fn record_deploy(&self, kind: &str, running: usize) {
        self.increment_counter(SERVICES_DEPLOYED_TOTAL, &[("kind", kind)]);
        self.set_gauge(SERVICES_RUNNING, running as i64);
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&&str> = grouped.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                for (labels, value) in &grouped[name] {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = read(&self.gauges);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} gauge\n", name));
                out.push_str(&format!("{} {}\n", name, map[name].load(Ordering::Relaxed)));
            }
        }

        {
            let map = read(&self.histograms);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                // per-bucket counts are already cumulative (value <= boundary)
                for (i, boundary) in h.buckets.iter().enumerate() {
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name,
                        boundary,
                        h.counts[i].load(Ordering::Relaxed)
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.get_count()));
                out.push_str(&format!("{}_sum {}\n", name, h.get_sum()));
                out.push_str(&format!("{}_count {}\n", name, h.get_count()));
            }
        }

        out
    }

    /// All metrics as a JSON value.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters_json = serde_json::Map::new();
        for ((name, labels), val) in read(&self.counters).iter() {
            let key = if labels.0.is_empty() {
                name.clone()
            } else {
                format!("{}{}", name, labels.prometheus_str())
            };
            counters_json.insert(key, serde_json::json!(val.load(Ordering::Relaxed)));
        }

        let mut gauges_json = serde_json::Map::new();
        for (name, val) in read(&self.gauges).iter() {
            gauges_json.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
        }

        let mut histograms_json = serde_json::Map::new();
        for (name, h) in read(&self.histograms).iter() {
            histograms_json.insert(
                name.clone(),
                serde_json::json!({
                    "sum": h.get_sum(),
                    "count": h.get_count(),
                }),
            );
        }

        serde_json::json!({
            "counters": counters_json,
            "gauges": gauges_json,
            "histograms": histograms_json,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
