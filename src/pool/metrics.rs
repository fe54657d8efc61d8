//! Per-second metrics accumulation.
//!
//! Every completion imports its counters and timings into the accumulator;
//! once per second the owning pool calls [`PoolPerf::tick`], which folds the
//! interval into an immutable [`PerfSnapshot`] (averages computed as
//! `sum / max(requests, 1)`), publishes it for the stats surface, latches the
//! interval's raw error count for backoff feedback, and resets.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;

/// Published once-per-second snapshot, consumed by the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerfSnapshot {
    /// Interval counters: requests, errors, bytes, throttles, gauges.
    pub counters: BTreeMap<String, u64>,
    /// Per-key minimum observed timing (ms) in the interval.
    pub minimums: BTreeMap<String, f64>,
    /// Per-key maximum observed timing (ms) in the interval.
    pub maximums: BTreeMap<String, f64>,
    /// Per-key average timing (ms): sum / max(requests, 1).
    pub averages: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct Accumulator {
    counters: BTreeMap<String, u64>,
    timings: BTreeMap<String, f64>,
    minimums: BTreeMap<String, f64>,
    maximums: BTreeMap<String, f64>,
}

impl Accumulator {
    fn count(&mut self, key: &str, amount: u64) {
        *self.counters.entry(key.to_string()).or_insert(0) += amount;
    }

    fn time(&mut self, key: &str, ms: f64) {
        *self.timings.entry(key.to_string()).or_insert(0.0) += ms;

        let min = self.minimums.entry(key.to_string()).or_insert(ms);
        if ms < *min {
            *min = ms;
        }
        let max = self.maximums.entry(key.to_string()).or_insert(ms);
        if ms > *max {
            *max = ms;
        }
    }
}

/// Shared metrics state for one pool.
///
/// The accumulator mutex guards only short read-modify-write sections;
/// cross-boundary readers touch nothing but the published snapshot.
#[derive(Debug)]
pub struct PoolPerf {
    acc: Mutex<Accumulator>,
    last: ArcSwap<PerfSnapshot>,
    last_errors: AtomicU64,
    last_requests: AtomicU64,
}

impl Default for PoolPerf {
    fn default() -> Self {
        Self {
            acc: Mutex::new(Accumulator::default()),
            last: ArcSwap::from_pointee(PerfSnapshot::default()),
            last_errors: AtomicU64::new(0),
            last_requests: AtomicU64::new(0),
        }
    }
}

impl PoolPerf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to an interval counter.
    pub fn count(&self, key: &str, amount: u64) {
        self.lock().count(key, amount);
    }

    /// Add to an interval counter only if it is currently zero.
    /// Returns true when this call performed the increment.
    pub fn count_once(&self, key: &str) -> bool {
        let mut acc = self.lock();
        if acc.counters.get(key).copied().unwrap_or(0) == 0 {
            acc.count(key, 1);
            true
        } else {
            false
        }
    }

    /// Record a timing observation (milliseconds) for a key.
    pub fn time_ms(&self, key: &str, ms: f64) {
        self.lock().time(key, ms);
    }

    /// Current-interval value of a counter.
    pub fn counter(&self, key: &str) -> u64 {
        self.lock().counters.get(key).copied().unwrap_or(0)
    }

    /// Error count of the previous completed second (backoff feedback).
    pub fn last_errors(&self) -> u64 {
        self.last_errors.load(Ordering::Relaxed)
    }

    /// Request count of the previous completed second.
    pub fn last_requests(&self) -> u64 {
        self.last_requests.load(Ordering::Relaxed)
    }

    /// The last published snapshot.
    pub fn snapshot(&self) -> Arc<PerfSnapshot> {
        self.last.load_full()
    }

    /// Close the current interval: fold gauges in, compute averages,
    /// publish, latch raw counters, reset.
    pub fn tick(&self, pending: u64, executing: u64, sockets: u64) {
        let mut acc = self.lock();

        acc.count("cur_pending_reqs", pending);
        acc.count("cur_executing_reqs", executing);
        acc.count("cur_server_conns", sockets);

        let requests = acc.counters.get("requests").copied().unwrap_or(0);
        let errors = acc.counters.get("errors").copied().unwrap_or(0);
        let divisor = requests.max(1) as f64;

        let mut snapshot = PerfSnapshot {
            counters: std::mem::take(&mut acc.counters),
            minimums: std::mem::take(&mut acc.minimums),
            maximums: std::mem::take(&mut acc.maximums),
            averages: BTreeMap::new(),
        };
        for (key, sum) in std::mem::take(&mut acc.timings) {
            snapshot.averages.insert(key, short_float(sum / divisor));
        }
        snapshot.counters.entry("requests".to_string()).or_insert(0);
        snapshot.counters.entry("bytes_sent".to_string()).or_insert(0);
        snapshot
            .counters
            .entry("bytes_received".to_string())
            .or_insert(0);

        self.last.store(Arc::new(snapshot));
        self.last_errors.store(errors, Ordering::Relaxed);
        self.last_requests.store(requests, Ordering::Relaxed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Accumulator> {
        // Counter updates cannot poison: no panics inside the lock.
        self.acc.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn short_float(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
