//! Process-wide server metrics.
//!
//! Atomic counters/gauges plus bucketed timing histograms for the
//! connect and query paths, with Prometheus text exposition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Duration;

/// Thread-safe counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram tracking a duration distribution in seconds.
#[derive(Debug)]
pub struct Histogram {
    boundaries: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }

    pub fn with_buckets(boundaries: Vec<f64>) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            boundaries,
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let value = duration.as_secs_f64();
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn buckets(&self) -> Vec<(f64, u64)> {
        self.boundaries
            .iter()
            .zip(self.buckets.iter())
            .map(|(&boundary, count)| (boundary, count.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// The listener's metric surface.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Live client connections.
    pub connection_count: Gauge,
    /// Connections accepted since process start.
    pub connection_accepted: Counter,
    /// Connections whose handshake exceeded the slow-connect
    /// threshold.
    pub connection_slow: Counter,
    /// Time from accept to authenticated.
    pub connect_timing: Histogram,
    /// Time spent serving one query command.
    pub query_timing: Histogram,
}

impl ServerMetrics {
    /// Export metrics in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        write_gauge(
            &mut out,
            "mysql_server_connection_count",
            "Active MySQL server connections",
            self.connection_count.get(),
        );
        write_counter(
            &mut out,
            "mysql_server_connection_accepted_total",
            "Connections accepted by the MySQL server",
            self.connection_accepted.get(),
        );
        write_counter(
            &mut out,
            "mysql_server_connection_slow_total",
            "Connections that took longer than the slow-connect threshold to establish",
            self.connection_slow.get(),
        );
        write_histogram(
            &mut out,
            "mysql_server_connect_seconds",
            "Time to establish a connection",
            &self.connect_timing,
        );
        write_histogram(
            &mut out,
            "mysql_server_query_seconds",
            "Time to serve one query",
            &self.query_timing,
        );

        out
    }
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {} {}\n# TYPE {} counter\n{} {}\n\n",
        name, help, name, name, value
    ));
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {} {}\n# TYPE {} gauge\n{} {}\n\n",
        name, help, name, name, value
    ));
}

fn write_histogram(out: &mut String, name: &str, help: &str, hist: &Histogram) {
    out.push_str(&format!(
        "# HELP {} {}\n# TYPE {} histogram\n",
        name, help, name
    ));
    let mut cumulative = 0u64;
    for (boundary, count) in hist.buckets() {
        cumulative += count;
        out.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, boundary, cumulative));
    }
    out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, hist.count()));
    out.push_str(&format!("{}_sum {}\n", name, hist.sum()));
    out.push_str(&format!("{}_count {}\n\n", name, hist.count()));
}

static METRICS: LazyLock<ServerMetrics> = LazyLock::new(ServerMetrics::default);

/// The process-wide metrics instance shared by all listeners.
pub fn metrics() -> &'static ServerMetrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::default();
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);

        let gauge = Gauge::default();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_histogram_observe() {
        let hist = Histogram::new();
        hist.observe(Duration::from_millis(50));
        hist.observe(Duration::from_millis(100));
        hist.observe(Duration::from_millis(500));

        assert_eq!(hist.count(), 3);
        assert!((hist.sum() - 0.65).abs() < 0.001);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = ServerMetrics::default();
        metrics.connection_accepted.inc();
        metrics.connect_timing.observe(Duration::from_millis(3));

        let out = metrics.export_prometheus();
        assert!(out.contains("mysql_server_connection_accepted_total 1"));
        assert!(out.contains("# TYPE mysql_server_connect_seconds histogram"));
        assert!(out.contains("mysql_server_connect_seconds_count 1"));
    }
}
