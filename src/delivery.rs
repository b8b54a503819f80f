//! Hand-off from processing to storage.
//!
//! Processing tasks push [`Fragment`]s (one measurement, a run of timestamped
//! values) onto an unbounded queue; pushing never blocks a worker. A single
//! consumer merges fragments into the [`ValueCache`], which the storage flush
//! worker drains periodically. Arrival order across batches is arbitrary, so
//! the cache keys every value by [`Timestamp`] and a flush always comes out in
//! time order.
//!
//! The queue ends with one [`DeliveryEntry::Shutdown`] sentinel. The sentinel
//! is authoritative: the consumer stops at it, and entries that raced in after
//! it are dropped.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{SentinelError, SentinelResult};

/// Capture time in seconds since the Unix epoch, totally ordered.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp(f64);

impl Timestamp {
    /// Timestamp from seconds since the Unix epoch.
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self(now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9)
    }

    /// Seconds since the Unix epoch.
    pub fn as_secs(self) -> f64 {
        self.0
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// Values of one measurement table.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Table name
    pub measurement: String,
    /// Timestamp -> value
    pub values: BTreeMap<Timestamp, f64>,
}

/// One queue entry.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEntry {
    /// Values to merge
    Fragment(Fragment),
    /// End of stream
    Shutdown,
}

/// Create a delivery queue.
pub fn delivery_queue() -> (DeliverySender, DeliveryReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        DeliverySender {
            tx,
            shutdown_sent: Arc::new(AtomicBool::new(false)),
        },
        DeliveryReceiver {
            rx,
            finished: false,
        },
    )
}

/// Producer side; cheap to clone.
#[derive(Debug, Clone)]
pub struct DeliverySender {
    tx: mpsc::UnboundedSender<DeliveryEntry>,
    shutdown_sent: Arc<AtomicBool>,
}

impl DeliverySender {
    /// Enqueue a fragment. Fails once the queue was shut down.
    pub fn push(&self, fragment: Fragment) -> SentinelResult<()> {
        if self.shutdown_sent.load(Ordering::SeqCst) {
            return Err(SentinelError::DeliveryClosed);
        }
        self.tx
            .send(DeliveryEntry::Fragment(fragment))
            .map_err(|_| SentinelError::DeliveryClosed)
    }

    /// Send the shutdown sentinel. Only the first call on any clone sends
    /// it; returns whether this call did.
    pub fn shutdown(&self) -> bool {
        if self.shutdown_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        // A dropped receiver has nothing left to stop.
        let _ = self.tx.send(DeliveryEntry::Shutdown);
        debug!("Delivery queue shutdown sentinel sent");
        true
    }

    /// Whether the sentinel was sent.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown_sent.load(Ordering::SeqCst)
    }
}

/// Consumer side.
#[derive(Debug)]
pub struct DeliveryReceiver {
    rx: mpsc::UnboundedReceiver<DeliveryEntry>,
    finished: bool,
}

impl DeliveryReceiver {
    /// Next fragment, or `None` once the sentinel was reached or every
    /// sender is gone.
    pub async fn recv(&mut self) -> Option<Fragment> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(DeliveryEntry::Fragment(fragment)) => Some(fragment),
            Some(DeliveryEntry::Shutdown) | None => {
                self.finished = true;
                self.rx.close();
                None
            }
        }
    }
}

/// Per-measurement values awaiting the next flush.
#[derive(Debug, Default)]
pub struct ValueCache {
    tables: Mutex<HashMap<String, BTreeMap<Timestamp, f64>>>,
}

impl ValueCache {
    /// Empty cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Merge a fragment. A value at an already cached timestamp replaces it.
    pub fn merge(&self, fragment: Fragment) -> usize {
        let count = fragment.values.len();
        let mut tables = self.tables.lock();
        tables
            .entry(fragment.measurement)
            .or_default()
            .extend(fragment.values);
        count
    }

    /// Take everything cached, leaving the cache empty.
    pub fn take(&self) -> HashMap<String, BTreeMap<Timestamp, f64>> {
        std::mem::take(&mut *self.tables.lock())
    }

    /// Put back values taken by a failed flush. Values merged since the take
    /// are newer and win.
    pub fn restore(&self, taken: HashMap<String, BTreeMap<Timestamp, f64>>) {
        let mut tables = self.tables.lock();
        for (measurement, values) in taken {
            let table = tables.entry(measurement).or_default();
            for (timestamp, value) in values {
                table.entry(timestamp).or_insert(value);
            }
        }
    }

    /// Cached values across all tables.
    pub fn pending_values(&self) -> usize {
        self.tables.lock().values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.pending_values() == 0
    }
}

/// Totals of one consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Fragments merged
    pub fragments: u64,
    /// Values merged
    pub values: u64,
}

/// Merge fragments into `cache` until the sentinel arrives.
pub async fn run_consumer(mut receiver: DeliveryReceiver, cache: Arc<ValueCache>) -> ConsumerReport {
    let mut report = ConsumerReport::default();
    while let Some(fragment) = receiver.recv().await {
        trace!(measurement = %fragment.measurement, values = fragment.values.len(), "Merging fragment");
        report.values += cache.merge(fragment) as u64;
        report.fragments += 1;
    }
    debug!(
        fragments = report.fragments,
        values = report.values,
        "Delivery consumer finished"
    );
    report
}
