//! Query metrics collection
//!
//! Pure bookkeeping: counters are atomic so recording never contends with
//! the query path, and snapshots are consistent enough for dashboards and
//! tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::router::OperationKind;

/// Configuration for query observation
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Queries slower than this are counted as slow
    pub slow_query_threshold: Duration,

    /// Whether the router logs slow queries
    pub enable_slow_query_log: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_secs(1),
            enable_slow_query_log: true,
        }
    }
}

/// Process-wide query counters
pub struct QueryMetrics {
    config: MetricsConfig,

    total_queries: AtomicU64,
    read_queries: AtomicU64,
    write_queries: AtomicU64,
    transactional_queries: AtomicU64,
    slow_queries: AtomicU64,
    failed_queries: AtomicU64,

    total_nanos: AtomicU64,
    read_nanos: AtomicU64,
    write_nanos: AtomicU64,
    transactional_nanos: AtomicU64,
}

/// Derived query statistics
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStats {
    pub total: u64,
    pub read: u64,
    pub write: u64,
    pub transactional: u64,
    pub slow: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub slow_query_rate: f64,
}

/// Full counter snapshot with average timings
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub read_queries: u64,
    pub write_queries: u64,
    pub transactional_queries: u64,
    pub slow_queries: u64,
    pub failed_queries: u64,
    pub total_query_time: Duration,
    pub average_response_time: Option<Duration>,
    pub average_read_time: Option<Duration>,
    pub average_write_time: Option<Duration>,
    pub average_transactional_time: Option<Duration>,
}

fn average(nanos: u64, count: u64) -> Option<Duration> {
    if count == 0 {
        None
    } else {
        Some(Duration::from_nanos(nanos / count))
    }
}

impl QueryMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            total_queries: AtomicU64::new(0),
            read_queries: AtomicU64::new(0),
            write_queries: AtomicU64::new(0),
            transactional_queries: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            read_nanos: AtomicU64::new(0),
            write_nanos: AtomicU64::new(0),
            transactional_nanos: AtomicU64::new(0),
        }
    }

    /// Record one query outcome
    pub fn record_query(&self, kind: OperationKind, duration: Duration, failed: bool) {
        let nanos = duration.as_nanos() as u64;

        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);

        match kind {
            OperationKind::Read => {
                self.read_queries.fetch_add(1, Ordering::Relaxed);
                self.read_nanos.fetch_add(nanos, Ordering::Relaxed);
            }
            OperationKind::Write => {
                self.write_queries.fetch_add(1, Ordering::Relaxed);
                self.write_nanos.fetch_add(nanos, Ordering::Relaxed);
            }
            OperationKind::Transactional => {
                self.transactional_queries.fetch_add(1, Ordering::Relaxed);
                self.transactional_nanos.fetch_add(nanos, Ordering::Relaxed);
            }
        }

        if duration > self.config.slow_query_threshold {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
        }

        if failed {
            self.failed_queries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Whether the router should emit a slow-query log for this duration
    pub fn should_log_slow(&self, duration: Duration) -> bool {
        self.config.enable_slow_query_log && duration > self.config.slow_query_threshold
    }

    /// Derived statistics for the recorded queries
    pub fn query_stats(&self) -> QueryStats {
        let total = self.total_queries.load(Ordering::Relaxed);
        let slow = self.slow_queries.load(Ordering::Relaxed);
        let failed = self.failed_queries.load(Ordering::Relaxed);

        let (success_rate, slow_query_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                (total - failed) as f64 / total as f64 * 100.0,
                slow as f64 / total as f64 * 100.0,
            )
        };

        QueryStats {
            total,
            read: self.read_queries.load(Ordering::Relaxed),
            write: self.write_queries.load(Ordering::Relaxed),
            transactional: self.transactional_queries.load(Ordering::Relaxed),
            slow,
            failed,
            success_rate,
            slow_query_rate,
        }
    }

    /// Full counter snapshot with per-kind averages
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_queries.load(Ordering::Relaxed);
        let read = self.read_queries.load(Ordering::Relaxed);
        let write = self.write_queries.load(Ordering::Relaxed);
        let transactional = self.transactional_queries.load(Ordering::Relaxed);
        let total_nanos = self.total_nanos.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_queries: total,
            read_queries: read,
            write_queries: write,
            transactional_queries: transactional,
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            total_query_time: Duration::from_nanos(total_nanos),
            average_response_time: average(total_nanos, total),
            average_read_time: average(self.read_nanos.load(Ordering::Relaxed), read),
            average_write_time: average(self.write_nanos.load(Ordering::Relaxed), write),
            average_transactional_time: average(
                self.transactional_nanos.load(Ordering::Relaxed),
                transactional,
            ),
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.total_queries.store(0, Ordering::Relaxed);
        self.read_queries.store(0, Ordering::Relaxed);
        self.write_queries.store(0, Ordering::Relaxed);
        self.transactional_queries.store(0, Ordering::Relaxed);
        self.slow_queries.store(0, Ordering::Relaxed);
        self.failed_queries.store(0, Ordering::Relaxed);
        self.total_nanos.store(0, Ordering::Relaxed);
        self.read_nanos.store(0, Ordering::Relaxed);
        self.write_nanos.store(0, Ordering::Relaxed);
        self.transactional_nanos.store(0, Ordering::Relaxed);

        info!("Reset query metrics");
    }
}

impl Default for QueryMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}
