//! Persistence of derived measurements.
//!
//! [`StorageService`] runs two tasks:
//!
//! - the **consumer** merges delivery fragments into the shared
//!   [`ValueCache`] until the queue's shutdown sentinel;
//! - the **flush worker** takes the whole cache every write interval and
//!   appends it to the [`TableStore`], timestamp-ascending per table. After
//!   `change_interval` write-backs it rotates to a fresh database.
//!
//! Stopping waits for the consumer to reach the sentinel, then performs a
//! final write-back so nothing accepted into the cache is lost.

pub mod csv_store;
pub mod inspect;
pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SentinelConfig;
use crate::delivery::{run_consumer, ConsumerReport, DeliveryReceiver, DeliverySender, Timestamp, ValueCache};
use crate::error::{SentinelError, SentinelResult};

pub use csv_store::CsvDatabase;
pub use inspect::{inspect, DatabaseSummary, TableSummary};
pub use memory::MemoryStore;

/// A store of `(timestamp, value)` tables.
pub trait TableStore: Send {
    /// Create (or open) the database with these tables.
    fn create_tables(&mut self, tables: &[String]) -> SentinelResult<()>;

    /// Append rows to `table`.
    fn append(&mut self, table: &str, rows: &[(Timestamp, f64)]) -> SentinelResult<()>;

    /// Make appended rows durable.
    fn commit(&mut self) -> SentinelResult<()>;

    /// Close the current database and continue in a new one with the same
    /// tables.
    fn rotate(&mut self) -> SentinelResult<()>;

    /// Commit and close.
    fn close(&mut self) -> SentinelResult<()>;
}

/// Storage service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    /// Period of the write-back
    pub write_interval: Duration,
    /// Write-backs per database (0 = never rotate)
    pub change_interval: u64,
    /// Tables to create
    pub tables: Vec<String>,
}

impl StorageSettings {
    /// Settings for the tables of every configured measurement.
    pub fn from_config(config: &SentinelConfig) -> SentinelResult<Self> {
        Ok(Self {
            write_interval: Duration::from_millis(config.database_config.write_interval_ms),
            change_interval: config.database_config.change_interval,
            tables: config.table_names()?,
        })
    }
}

/// Totals of the flush worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Write-backs that stored something
    pub flushes: u64,
    /// Rows stored
    pub rows: u64,
    /// Databases started after the first
    pub rotations: u64,
    /// Write-backs that failed and were retried later
    pub failed_flushes: u64,
}

/// Totals of a storage service run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageReport {
    /// Consumer totals
    pub consumer: ConsumerReport,
    /// Flush worker totals
    pub flush: FlushReport,
}

type SharedStore = Arc<Mutex<Box<dyn TableStore>>>;

/// Consumer and flush worker over one [`TableStore`].
pub struct StorageService {
    cache: Arc<ValueCache>,
    delivery: DeliverySender,
    consumer: Option<JoinHandle<ConsumerReport>>,
    flusher: Option<JoinHandle<SentinelResult<FlushReport>>>,
    stop_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("pending_values", &self.cache.pending_values())
            .field("running", &self.flusher.is_some())
            .finish()
    }
}

impl StorageService {
    /// Create the tables and start both tasks.
    ///
    /// `delivery` is the producer side of `receiver`'s queue; [`stop`] uses it
    /// to send the shutdown sentinel if nobody has yet. Must be called from
    /// within a Tokio runtime.
    ///
    /// [`stop`]: StorageService::stop
    pub fn start(
        mut store: Box<dyn TableStore>,
        settings: StorageSettings,
        delivery: DeliverySender,
        receiver: DeliveryReceiver,
    ) -> SentinelResult<Self> {
        if settings.write_interval.is_zero() {
            return Err(SentinelError::Storage("write interval must be non-zero".into()));
        }
        store.create_tables(&settings.tables)?;

        let cache = ValueCache::new();
        let consumer = tokio::spawn(run_consumer(receiver, Arc::clone(&cache)));
        let (stop_tx, stop_rx) = watch::channel(false);
        let flusher = tokio::spawn(run_flusher(
            Arc::new(Mutex::new(store)),
            Arc::clone(&cache),
            settings.write_interval,
            settings.change_interval,
            stop_rx,
        ));

        info!(
            tables = settings.tables.len(),
            write_interval = ?settings.write_interval,
            change_interval = settings.change_interval,
            "Storage service started"
        );
        Ok(Self {
            cache,
            delivery,
            consumer: Some(consumer),
            flusher: Some(flusher),
            stop_tx,
        })
    }

    /// The cache the consumer merges into.
    pub fn cache(&self) -> &Arc<ValueCache> {
        &self.cache
    }

    /// Drain the queue, write everything back and close the store.
    pub async fn stop(&mut self) -> SentinelResult<StorageReport> {
        let mut report = StorageReport::default();

        self.delivery.shutdown();
        if let Some(consumer) = self.consumer.take() {
            report.consumer = consumer
                .await
                .map_err(|e| SentinelError::Storage(format!("delivery consumer failed: {e}")))?;
        }

        // Sending fails only if the worker is already gone; the join tells why.
        let _ = self.stop_tx.send(true);
        if let Some(flusher) = self.flusher.take() {
            report.flush = flusher
                .await
                .map_err(|e| SentinelError::Storage(format!("flush worker failed: {e}")))??;
        }

        info!(
            fragments = report.consumer.fragments,
            rows = report.flush.rows,
            rotations = report.flush.rotations,
            "Storage service stopped"
        );
        Ok(report)
    }
}

async fn run_flusher(
    store: SharedStore,
    cache: Arc<ValueCache>,
    write_interval: Duration,
    change_interval: u64,
    mut stop: watch::Receiver<bool>,
) -> SentinelResult<FlushReport> {
    let mut ticker = time::interval(write_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut report = FlushReport::default();
    let mut cycles = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        if let Err(e) = flush(&store, &cache, &mut report).await {
            report.failed_flushes += 1;
            error!(error = %e, "Write-back failed; values kept for the next cycle");
        }

        cycles += 1;
        if change_interval != 0 && cycles >= change_interval {
            cycles = 0;
            let store = Arc::clone(&store);
            match blocking(move || {
                let mut guard = store.lock();
                guard.rotate()
            })
            .await
            {
                Ok(()) => report.rotations += 1,
                Err(e) => warn!(error = %e, "Database rotation failed; continuing in the current one"),
            }
        }
    }

    let flushed = flush(&store, &cache, &mut report).await;
    let closed = blocking(move || {
        let mut guard = store.lock();
        guard.close()
    })
    .await;
    flushed?;
    closed?;
    debug!(flushes = report.flushes, rows = report.rows, "Flush worker stopped");
    Ok(report)
}

/// Write the whole cache back. On failure the taken values are returned to
/// the cache.
async fn flush(store: &SharedStore, cache: &Arc<ValueCache>, report: &mut FlushReport) -> SentinelResult<()> {
    let tables = cache.take();
    if tables.values().all(BTreeMap::is_empty) {
        return Ok(());
    }

    let store = Arc::clone(store);
    let joined = tokio::task::spawn_blocking(move || {
        let mut guard = store.lock();
        let result = write_tables(&mut **guard, &tables);
        drop(guard);
        (tables, result)
    })
    .await
    .map_err(|e| SentinelError::Storage(format!("write-back task failed: {e}")))?;

    match joined {
        (_, Ok(rows)) => {
            report.flushes += 1;
            report.rows += rows as u64;
            debug!(rows, "Write-back complete");
            Ok(())
        }
        (tables, Err(e)) => {
            cache.restore(tables);
            Err(e)
        }
    }
}

fn write_tables(
    store: &mut dyn TableStore,
    tables: &HashMap<String, BTreeMap<Timestamp, f64>>,
) -> SentinelResult<usize> {
    let mut names: Vec<&String> = tables.keys().collect();
    names.sort();

    let mut rows_written = 0;
    for name in names {
        let rows: Vec<(Timestamp, f64)> = tables[name].iter().map(|(t, v)| (*t, *v)).collect();
        if rows.is_empty() {
            continue;
        }
        store.append(name, &rows)?;
        rows_written += rows.len();
    }
    store.commit()?;
    Ok(rows_written)
}

async fn blocking<T, F>(f: F) -> SentinelResult<T>
where
    F: FnOnce() -> SentinelResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SentinelError::Storage(format!("storage task failed: {e}")))?
}
