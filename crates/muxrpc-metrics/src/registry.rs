use crate::snapshot::{MethodMetrics, MetricsSnapshot};
use muxrpc_common::StatusCode;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Name under which calls are aggregated once `max_methods` is reached.
pub const OVERFLOW_METHOD: &str = "_other";

/// Decades covered by the histogram: 1us up to 10^8us (100s).
const DECADES: usize = 8;
/// Each decade is split by leading digit (1..=9).
const BINS_PER_DECADE: usize = 9;
const NUM_HISTOGRAM_BINS: usize = DECADES * BINS_PER_DECADE;

/// Configuration for the metrics registry.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum number of distinct method names tracked individually.
    ///
    /// Calls to methods beyond this limit are counted under [`OVERFLOW_METHOD`].
    pub max_methods: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_methods: 1000 }
    }
}

/// Log-linear latency histogram for percentile estimation.
///
/// Bins are keyed by decade and leading digit, so a sample of 4_321us lands
/// in the `[4_000, 5_000)` bin. Recording is lock-free and O(1); a
/// percentile query scans the 72 bins once.
///
/// Estimates are within one bin width of the true value, which is at most
/// 50% of the value for leading digit 1 and about 11% for leading digit 9.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency_us: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency_us: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::latency_to_bin(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        let value = latency_us.max(1);
        let decade = value.ilog10() as usize;
        if decade >= DECADES {
            return NUM_HISTOGRAM_BINS - 1;
        }
        let leading = (value / 10u64.pow(decade as u32)) as usize;
        decade * BINS_PER_DECADE + (leading - 1)
    }

    /// Lower and upper bound of a bin, in microseconds.
    fn bin_bounds(bin: usize) -> (u64, u64) {
        let decade = (bin / BINS_PER_DECADE) as u32;
        let leading = (bin % BINS_PER_DECADE) as u64 + 1;
        let scale = 10u64.pow(decade);
        (scale * leading, scale * (leading + 1))
    }

    /// Estimates the latency at `percentile` (0-100), interpolating within the bin.
    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut cumulative = 0;
        for (bin, count) in self.bins.iter().enumerate() {
            let count = count.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if cumulative + count >= target {
                let (lower, upper) = Self::bin_bounds(bin);
                let fraction = (target - cumulative) as f64 / count as f64;
                return lower + ((upper - lower) as f64 * fraction) as u64;
            }
            cumulative += count;
        }

        Self::bin_bounds(NUM_HISTOGRAM_BINS - 1).1
    }

    fn average(&self) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            0
        } else {
            self.total_latency_us.load(Ordering::Relaxed) / total
        }
    }
}

/// Counters for a single method. Lock-free once created.
#[derive(Debug)]
struct MethodStats {
    call_count: AtomicU64,
    status_counts: [AtomicU64; StatusCode::ALL.len()],
    latencies: LatencyHistogram,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            status_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            latencies: LatencyHistogram::new(),
        }
    }

    fn record(&self, latency_us: u64, code: StatusCode) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.status_counts[code.index()].fetch_add(1, Ordering::Relaxed);
        self.latencies.record(latency_us);
    }

    fn snapshot(&self) -> MethodMetrics {
        let status_counts: BTreeMap<StatusCode, u64> = StatusCode::ALL
            .iter()
            .map(|code| (*code, self.status_counts[code.index()].load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        let ok_count = status_counts.get(&StatusCode::Ok).copied().unwrap_or(0);
        let call_count = self.call_count.load(Ordering::Relaxed);

        MethodMetrics {
            call_count,
            ok_count,
            error_count: call_count.saturating_sub(ok_count),
            status_counts,
            avg_latency_us: self.latencies.average(),
            p50_latency_us: self.latencies.estimate_percentile(50),
            p95_latency_us: self.latencies.estimate_percentile(95),
            p99_latency_us: self.latencies.estimate_percentile(99),
        }
    }
}

/// Thread-safe registry of per-method call metrics.
///
/// Counter updates are lock-free atomics; the method table sits behind an
/// `RwLock` that is only write-locked the first time a method is seen.
///
/// # Example
///
/// ```rust
/// use muxrpc_common::StatusCode;
/// use muxrpc_metrics::MetricsRegistry;
/// use std::time::Duration;
///
/// let registry = MetricsRegistry::new();
/// registry.record_call("inventory.Lookup", Duration::from_millis(3), StatusCode::Ok);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_calls, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total_calls: AtomicU64,
    ok_calls: AtomicU64,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
    start_time: Instant,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            ok_calls: AtomicU64::new(0),
            methods: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
            config,
        }
    }

    /// Records one finished call.
    ///
    /// # Arguments
    /// * `method` - Method name the call targeted
    /// * `latency` - Time from call start to final status
    /// * `code` - Final status code
    pub fn record_call(&self, method: &str, latency: Duration, code: StatusCode) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if code == StatusCode::Ok {
            self.ok_calls.fetch_add(1, Ordering::Relaxed);
        }

        let latency_us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.method_stats(method).record(latency_us, code);
    }

    fn method_stats(&self, method: &str) -> Arc<MethodStats> {
        if let Some(stats) = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
        {
            return stats.clone();
        }

        let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(stats) = methods.get(method) {
            return stats.clone();
        }
        let key = if methods.len() >= self.config.max_methods {
            OVERFLOW_METHOD
        } else {
            method
        };
        methods
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(MethodStats::new()))
            .clone()
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn method_count(&self) -> usize {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time view of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let ok_calls = self.ok_calls.load(Ordering::Relaxed);
        let methods = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        MetricsSnapshot {
            total_calls,
            ok_calls,
            failed_calls: total_calls.saturating_sub(ok_calls),
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            methods,
        }
    }

    /// Drops all recorded data.
    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.ok_calls.store(0, Ordering::Relaxed);
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        assert_eq!(MetricsConfig::default().max_methods, 1000);
    }

    #[test]
    fn test_record_counts_by_status() {
        let registry = MetricsRegistry::new();
        registry.record_call("a", Duration::from_micros(100), StatusCode::Ok);
        registry.record_call("a", Duration::from_micros(200), StatusCode::Unavailable);
        registry.record_call("a", Duration::from_micros(300), StatusCode::Unavailable);
        registry.record_call("b", Duration::from_micros(50), StatusCode::Ok);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.ok_calls, 2);
        assert_eq!(snapshot.failed_calls, 2);

        let a = &snapshot.methods["a"];
        assert_eq!(a.call_count, 3);
        assert_eq!(a.ok_count, 1);
        assert_eq!(a.error_count, 2);
        assert_eq!(a.status_counts[&StatusCode::Unavailable], 2);
        assert!(!a.status_counts.contains_key(&StatusCode::Internal));
        assert_eq!(a.avg_latency_us, 200);
    }

    #[test]
    fn test_max_methods_overflow_bucket() {
        let registry = MetricsRegistry::with_config(MetricsConfig { max_methods: 2 });
        registry.record_call("a", Duration::ZERO, StatusCode::Ok);
        registry.record_call("b", Duration::ZERO, StatusCode::Ok);
        registry.record_call("c", Duration::ZERO, StatusCode::Ok);
        registry.record_call("d", Duration::ZERO, StatusCode::Internal);
        registry.record_call("a", Duration::ZERO, StatusCode::Ok);

        let snapshot = registry.snapshot();
        assert_eq!(registry.method_count(), 3);
        assert_eq!(snapshot.methods["a"].call_count, 2);
        assert_eq!(snapshot.methods[OVERFLOW_METHOD].call_count, 2);
        assert!(!snapshot.methods.contains_key("c"));
    }

    #[test]
    fn test_reset() {
        let registry = MetricsRegistry::new();
        registry.record_call("a", Duration::from_millis(1), StatusCode::Ok);
        registry.reset();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert!(snapshot.methods.is_empty());
    }

    #[test]
    fn test_thread_safety() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..1000 {
                        let code = if j % 10 == 0 {
                            StatusCode::Internal
                        } else {
                            StatusCode::Ok
                        };
                        registry.record_call(&format!("m{}", i % 2), Duration::from_micros(j), code);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 8000);
        assert_eq!(snapshot.failed_calls, 800);
        assert_eq!(snapshot.methods["m0"].call_count, 4000);
    }

    #[test]
    fn test_histogram_bin_mapping() {
        assert_eq!(LatencyHistogram::latency_to_bin(0), 0);
        assert_eq!(LatencyHistogram::latency_to_bin(1), 0);
        assert_eq!(LatencyHistogram::latency_to_bin(9), 8);
        assert_eq!(LatencyHistogram::latency_to_bin(10), 9);
        assert_eq!(LatencyHistogram::latency_to_bin(4_321), 3 * 9 + 3);
        assert_eq!(
            LatencyHistogram::latency_to_bin(u64::MAX),
            NUM_HISTOGRAM_BINS - 1
        );

        for bin in 0..NUM_HISTOGRAM_BINS {
            let (lower, upper) = LatencyHistogram::bin_bounds(bin);
            assert_eq!(LatencyHistogram::latency_to_bin(lower), bin);
            assert_eq!(LatencyHistogram::latency_to_bin(upper - 1), bin);
        }
    }

    #[test]
    fn test_histogram_percentiles() {
        let histogram = LatencyHistogram::new();
        for us in 1..=1000u64 {
            histogram.record(us);
        }

        let p50 = histogram.estimate_percentile(50);
        let p99 = histogram.estimate_percentile(99);
        assert!((400..=600).contains(&p50), "p50 was {p50}");
        assert!((900..=1100).contains(&p99), "p99 was {p99}");
        assert!(histogram.estimate_percentile(95) <= p99);
        assert_eq!(histogram.average(), 500);
    }

    #[test]
    fn test_histogram_empty() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.estimate_percentile(50), 0);
        assert_eq!(histogram.average(), 0);
    }
}
