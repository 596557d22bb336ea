//! Index statistics — per-tier counters and a latency histogram.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lookup/get counters for one storage tier.
#[derive(Debug, Default)]
pub struct TierStat {
    /// Scans of this tier.
    pub lookup: AtomicU64,
    /// Statements this tier contributed to histories.
    pub get: AtomicU64,
}

/// Counters and latency accounting for one index.
#[derive(Debug)]
pub struct IndexStat {
    /// Point lookups started.
    pub lookup: AtomicU64,
    /// Lookups that produced a tuple.
    pub get: AtomicU64,
    /// Mem-list invalidation restarts.
    pub restart: AtomicU64,
    /// Upsert deltas folded.
    pub upsert_applied: AtomicU64,
    /// Transaction write-set tier.
    pub txw: TierStat,
    /// Mem tier.
    pub memory: TierStat,
    /// Run tier.
    pub disk: TierStat,
    latency: Mutex<LatencyHistogram>,
}

impl IndexStat {
    pub(crate) fn new() -> Self {
        Self {
            lookup: AtomicU64::new(0),
            get: AtomicU64::new(0),
            restart: AtomicU64::new(0),
            upsert_applied: AtomicU64::new(0),
            txw: TierStat::default(),
            memory: TierStat::default(),
            disk: TierStat::default(),
            latency: Mutex::new(LatencyHistogram::new()),
        }
    }

    /// Record one lookup's wall-clock latency.
    pub fn record_latency(&self, latency: Duration) {
        if let Ok(mut histogram) = self.latency.lock() {
            histogram.record(latency);
        }
    }

    /// Snapshot the latency histogram.
    pub fn latency(&self) -> LatencySummary {
        self.latency
            .lock()
            .map(|h| h.summary())
            .unwrap_or_default()
    }
}

/// Power-of-two bucketed latency histogram.
///
/// Bucket `i` counts samples in `[2^i, 2^(i+1))` nanoseconds.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [u64; 64],
    count: u64,
    total_ns: u64,
    max_ns: u64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: [0; 64],
            count: 0,
            total_ns: 0,
            max_ns: 0,
        }
    }

    fn record(&mut self, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        let bucket = (63 - ns.max(1).leading_zeros()) as usize;
        self.buckets[bucket] += 1;
        self.count += 1;
        self.total_ns = self.total_ns.saturating_add(ns);
        self.max_ns = self.max_ns.max(ns);
    }

    fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count,
            max: Duration::from_nanos(self.max_ns),
            mean: if self.count == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(self.total_ns / self.count)
            },
        }
    }
}

/// Aggregate view of recorded lookup latencies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    /// Samples recorded.
    pub count: u64,
    /// Largest sample.
    pub max: Duration,
    /// Arithmetic mean.
    pub mean: Duration,
}

/// Relaxed load helper for counter assertions in tests and reporting.
pub fn counter(value: &AtomicU64) -> u64 {
    value.load(Ordering::Relaxed)
}
