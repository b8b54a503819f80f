//! Acquisition health tracking.
//!
//! Counters are plain atomics updated from the loop and the processing
//! workers. The status turns [`HealthStatus::Degraded`] once
//! [`OVERRUN_DEGRADED_THRESHOLD`] overruns happen back to back, which on this
//! hardware almost always means the poll cadence is too slow for the scan rate
//! and buffer size.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Consecutive overruns after which acquisition is reported degraded.
pub const OVERRUN_DEGRADED_THRESHOLD: u64 = 3;

/// Minimum spacing of repeated calculation-failure warnings.
pub const CALC_FAILURE_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Overall acquisition health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// Polls are returning data
    Healthy,
    /// Repeated overruns; samples are being lost
    Degraded {
        /// Overruns in a row
        consecutive_overruns: u64,
    },
}

/// Which overrun a poll reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunKind {
    /// The HAT could not sustain the scan rate
    Hardware,
    /// The device buffer was not drained in time
    Buffer,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Device reads
    pub polls: u64,
    /// Reads that returned nothing
    pub empty_polls: u64,
    /// Batches handed to processing
    pub batches: u64,
    /// Hardware overruns
    pub hardware_overruns: u64,
    /// Buffer overruns
    pub buffer_overruns: u64,
    /// Current run of overruns
    pub consecutive_overruns: u64,
    /// Batches dropped as malformed
    pub malformed_batches: u64,
    /// Derived points delivered
    pub points: u64,
    /// Derived points skipped
    pub calc_failures: u64,
}

/// Shared acquisition counters.
#[derive(Debug)]
pub struct AcquisitionHealth {
    polls: AtomicU64,
    empty_polls: AtomicU64,
    batches: AtomicU64,
    hardware_overruns: AtomicU64,
    buffer_overruns: AtomicU64,
    consecutive_overruns: AtomicU64,
    malformed_batches: AtomicU64,
    points: AtomicU64,
    calc_failures: AtomicU64,
    calc_reporter: RateLimitedReporter,
}

impl Default for AcquisitionHealth {
    fn default() -> Self {
        Self::with_report_interval(CALC_FAILURE_REPORT_INTERVAL)
    }
}

impl AcquisitionHealth {
    /// Counters with calculation failures reported at most once per `interval`.
    pub fn with_report_interval(interval: Duration) -> Self {
        Self {
            polls: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            hardware_overruns: AtomicU64::new(0),
            buffer_overruns: AtomicU64::new(0),
            consecutive_overruns: AtomicU64::new(0),
            malformed_batches: AtomicU64::new(0),
            points: AtomicU64::new(0),
            calc_failures: AtomicU64::new(0),
            calc_reporter: RateLimitedReporter::new(interval),
        }
    }

    /// A read returned samples.
    pub fn record_batch(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.consecutive_overruns.store(0, Ordering::Relaxed);
    }

    /// A read returned nothing.
    pub fn record_empty(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
        self.consecutive_overruns.store(0, Ordering::Relaxed);
    }

    /// A read reported an overrun. Returns the length of the current run.
    pub fn record_overrun(&self, kind: OverrunKind) -> u64 {
        self.polls.fetch_add(1, Ordering::Relaxed);
        match kind {
            OverrunKind::Hardware => self.hardware_overruns.fetch_add(1, Ordering::Relaxed),
            OverrunKind::Buffer => self.buffer_overruns.fetch_add(1, Ordering::Relaxed),
        };
        self.consecutive_overruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A batch was dropped as malformed.
    pub fn record_malformed(&self) {
        self.malformed_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Derived points skipped in one batch. Returns `Some(suppressed)` when
    /// the failures should be reported now, with the number of failures
    /// hidden since the previous report.
    pub fn record_calc_failures(&self, failures: usize) -> Option<u64> {
        if failures == 0 {
            return None;
        }
        self.calc_failures
            .fetch_add(failures as u64, Ordering::Relaxed);
        self.calc_reporter.check(failures as u64)
    }

    /// Derived points accepted by the delivery queue.
    pub fn record_delivered(&self, points: usize) {
        self.points.fetch_add(points as u64, Ordering::Relaxed);
    }

    /// Current status.
    pub fn status(&self) -> HealthStatus {
        let run = self.consecutive_overruns.load(Ordering::Relaxed);
        if run >= OVERRUN_DEGRADED_THRESHOLD {
            HealthStatus::Degraded {
                consecutive_overruns: run,
            }
        } else {
            HealthStatus::Healthy
        }
    }

    /// Copy of every counter.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            hardware_overruns: self.hardware_overruns.load(Ordering::Relaxed),
            buffer_overruns: self.buffer_overruns.load(Ordering::Relaxed),
            consecutive_overruns: self.consecutive_overruns.load(Ordering::Relaxed),
            malformed_batches: self.malformed_batches.load(Ordering::Relaxed),
            points: self.points.load(Ordering::Relaxed),
            calc_failures: self.calc_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct ReporterState {
    last_report: Option<Instant>,
    suppressed: u64,
}

/// Lets an event through at most once per interval and counts the rest.
#[derive(Debug)]
pub struct RateLimitedReporter {
    interval: Duration,
    state: Mutex<ReporterState>,
}

impl RateLimitedReporter {
    /// Reporter allowing one report per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(ReporterState {
                last_report: None,
                suppressed: 0,
            }),
        }
    }

    /// Record `events`. Returns `Some(n)` if a report is due now, where `n`
    /// is the number of events suppressed since the previous report.
    pub fn check(&self, events: u64) -> Option<u64> {
        let mut state = self.state.lock();
        let due = state
            .last_report
            .map_or(true, |last| last.elapsed() >= self.interval);
        if due {
            state.last_report = Some(Instant::now());
            Some(std::mem::take(&mut state.suppressed))
        } else {
            state.suppressed += events;
            None
        }
    }
}
