//! The continuous acquisition loop.
//!
//! One loop generation owns one claimed device for the whole scan:
//!
//! 1. `start` claims the device and starts the scan synchronously, so a busy
//!    or misconfigured device fails the caller instead of a background task.
//! 2. The polling task reads everything buffered once per poll interval and
//!    classifies the read. Batches go to a bounded pool of blocking workers;
//!    when every permit is taken the loop waits, and the device buffer absorbs
//!    the delay (or overruns) instead of memory growing without bound.
//! 3. A cleared run flag is noticed at the next tick. The task then drains
//!    every in-flight worker, stops the scan and releases the device before
//!    it completes.
//!
//! Device calls are synchronous and may block for as long as the hardware
//! takes, so the polling task runs each of them on the blocking pool and
//! never on a runtime worker.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::batch::{AcquisitionBatch, BatchProcessor};
use super::device::{DeviceFactory, PollOutcome, ScanDevice};
use super::{ActiveConfiguration, TerminationPolicy};
use crate::delivery::{DeliverySender, Timestamp};
use crate::error::{SentinelError, SentinelResult};
use crate::health::{AcquisitionHealth, OverrunKind, OVERRUN_DEGRADED_THRESHOLD};

/// Lifecycle of one loop generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, scan not yet polled
    NotStarted,
    /// Polling
    Running,
    /// Stop requested or loop ended; draining workers and releasing the device
    Stopping,
    /// Device released
    Stopped,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::NotStarted,
            1 => TaskState::Running,
            2 => TaskState::Stopping,
            _ => TaskState::Stopped,
        }
    }
}

/// Totals of one loop generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopReport {
    /// Device reads
    pub polls: u64,
    /// Batches dispatched to processing
    pub batches: u64,
    /// Reads discarded because of an overrun
    pub overruns: u64,
}

#[derive(Debug)]
struct LoopShared {
    running: AtomicBool,
    state: AtomicU8,
}

impl LoopShared {
    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Starts acquisition loops.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquisitionLoop;

impl AcquisitionLoop {
    /// Claim the device, start scanning `config` and spawn the polling task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        factory: &dyn DeviceFactory,
        config: Arc<ActiveConfiguration>,
        delivery: DeliverySender,
        health: Arc<AcquisitionHealth>,
        max_in_flight_batches: usize,
    ) -> SentinelResult<AcquisitionTask> {
        let mut device = factory.open()?;
        if let Err(e) = device.start_continuous_scan(
            config.channel_mask(),
            config.buffer_size_per_channel,
            config.scan_rate_hz,
        ) {
            if let Err(cleanup) = device.cleanup() {
                warn!(device = device.name(), error = %cleanup, "Cleanup after failed scan start failed");
            }
            return Err(e);
        }

        info!(
            configuration = %config.name,
            device = device.name(),
            channels = ?config.tags(),
            scan_rate_hz = config.scan_rate_hz,
            poll_interval = ?config.poll_interval,
            "Acquisition loop started"
        );

        let shared = Arc::new(LoopShared {
            running: AtomicBool::new(true),
            state: AtomicU8::new(TaskState::NotStarted as u8),
        });
        let permits = Arc::new(Semaphore::new(max_in_flight_batches.max(1)));
        let handle = tokio::spawn(run_loop(
            device,
            Arc::clone(&config),
            Arc::clone(&shared),
            delivery,
            health,
            permits,
        ));

        Ok(AcquisitionTask {
            config,
            shared,
            handle: Some(handle),
        })
    }
}

/// Handle to one running loop generation.
#[derive(Debug)]
pub struct AcquisitionTask {
    config: Arc<ActiveConfiguration>,
    shared: Arc<LoopShared>,
    handle: Option<JoinHandle<SentinelResult<LoopReport>>>,
}

impl AcquisitionTask {
    /// Configuration this loop is acquiring.
    pub fn config(&self) -> &Arc<ActiveConfiguration> {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Ask the loop to exit at its next iteration. Idempotent.
    pub fn request_stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            debug!(configuration = %self.config.name, "Acquisition loop stop requested");
        }
    }

    /// Whether stop was requested.
    pub fn stop_requested(&self) -> bool {
        !self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the polling task has completed.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Await termination within the bound `policy` sets for this loop.
    ///
    /// On [`SentinelError::LoopTerminationTimeout`] the task is still owned
    /// by this handle and may be awaited again.
    pub async fn wait(&mut self, policy: TerminationPolicy) -> SentinelResult<LoopReport> {
        let handle = self.handle.as_mut().ok_or_else(|| {
            SentinelError::LoopTaskFailed("acquisition loop was already awaited".into())
        })?;

        let joined = match policy.bound_for(&self.config) {
            None => handle.await,
            Some(timeout) => time::timeout(timeout, handle)
                .await
                .map_err(|_| SentinelError::LoopTerminationTimeout { timeout })?,
        };
        self.handle = None;

        match joined {
            Ok(result) => result,
            Err(e) => Err(SentinelError::LoopTaskFailed(e.to_string())),
        }
    }
}

impl Drop for AcquisitionTask {
    fn drop(&mut self) {
        // A dropped handle must not leave an orphan loop holding the device.
        if self.handle.is_some() {
            self.request_stop();
        }
    }
}

/// Run one device call on the blocking pool. The device travels with the
/// call and is put back in `slot` afterwards; a panicking call loses it.
async fn device_call<T, F>(slot: &mut Option<Box<dyn ScanDevice>>, call: F) -> SentinelResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn ScanDevice) -> SentinelResult<T> + Send + 'static,
{
    let mut device = slot
        .take()
        .ok_or_else(|| SentinelError::LoopTaskFailed("device handle lost".into()))?;
    let (device, result) = task::spawn_blocking(move || {
        let result = call(device.as_mut());
        (device, result)
    })
    .await
    .map_err(|e| SentinelError::LoopTaskFailed(format!("device call panicked: {e}")))?;
    *slot = Some(device);
    result
}

async fn run_loop(
    device: Box<dyn ScanDevice>,
    config: Arc<ActiveConfiguration>,
    shared: Arc<LoopShared>,
    delivery: DeliverySender,
    health: Arc<AcquisitionHealth>,
    permits: Arc<Semaphore>,
) -> SentinelResult<LoopReport> {
    let mut interval = time::interval(config.poll_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut report = LoopReport::default();
    let device_name = device.name().to_string();
    let mut device = Some(device);

    shared.set_state(TaskState::Running);

    let outcome = loop {
        interval.tick().await;
        if !shared.running.load(Ordering::SeqCst) {
            break Ok(());
        }

        while let Some(finished) = workers.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Batch processing task panicked");
            }
        }

        let read = match device_call(&mut device, |d| d.read_available(Duration::ZERO)).await {
            Ok(read) => read,
            Err(e) => {
                error!(configuration = %config.name, error = %e, "Device read failed");
                break Err(e);
            }
        };
        let end_timestamp = Timestamp::now().as_secs();
        report.polls += 1;

        match read.classify() {
            PollOutcome::Batch(samples) => {
                health.record_batch();
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        break Err(SentinelError::LoopTaskFailed(
                            "processing pool closed".into(),
                        ))
                    }
                };
                let batch = AcquisitionBatch {
                    samples,
                    end_timestamp,
                    sample_rate: config.scan_rate_hz,
                    sequence: report.batches,
                };
                report.batches += 1;

                let config = Arc::clone(&config);
                let delivery = delivery.clone();
                let health = Arc::clone(&health);
                workers.spawn_blocking(move || {
                    let _permit = permit;
                    process_batch(&batch, &config, &delivery, &health);
                });
            }
            PollOutcome::HardwareOverrun => {
                report.overruns += 1;
                record_overrun(&health, &config, OverrunKind::Hardware);
            }
            PollOutcome::BufferOverrun => {
                report.overruns += 1;
                record_overrun(&health, &config, OverrunKind::Buffer);
            }
            PollOutcome::Empty => {
                health.record_empty();
                trace!(configuration = %config.name, "No samples buffered");
            }
        }
    };

    shared.running.store(false, Ordering::SeqCst);
    shared.set_state(TaskState::Stopping);

    while let Some(finished) = workers.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Batch processing task panicked");
        }
    }

    let stopped = device_call(&mut device, |d| d.stop_scan()).await;
    if let Err(e) = &stopped {
        error!(device = %device_name, error = %e, "Failed to stop scan");
    }
    let released = device_call(&mut device, |d| d.cleanup()).await;
    if let Err(e) = &released {
        error!(device = %device_name, error = %e, "Failed to release device");
    }
    drop(device);
    shared.set_state(TaskState::Stopped);

    info!(
        configuration = %config.name,
        polls = report.polls,
        batches = report.batches,
        overruns = report.overruns,
        "Acquisition loop stopped"
    );

    outcome?;
    stopped?;
    released?;
    Ok(report)
}

fn record_overrun(health: &AcquisitionHealth, config: &ActiveConfiguration, kind: OverrunKind) {
    let run = health.record_overrun(kind);
    warn!(
        configuration = %config.name,
        kind = ?kind,
        consecutive = run,
        "Scan overrun, batch discarded"
    );
    if run == OVERRUN_DEGRADED_THRESHOLD {
        warn!(
            configuration = %config.name,
            poll_interval = ?config.poll_interval,
            buffer_horizon = ?config.buffer_horizon(),
            "Acquisition degraded by repeated overruns; the poll interval is likely too long for this scan rate"
        );
    }
}

fn process_batch(
    batch: &AcquisitionBatch,
    config: &ActiveConfiguration,
    delivery: &DeliverySender,
    health: &AcquisitionHealth,
) {
    let processed = match BatchProcessor::process(batch, config) {
        Ok(processed) => processed,
        Err(e) => {
            health.record_malformed();
            warn!(configuration = %config.name, sequence = batch.sequence, error = %e, "Dropping batch");
            return;
        }
    };

    let failures = processed.failures.len();
    if let Some(suppressed) = health.record_calc_failures(failures) {
        if let Some(first) = processed.failures.first() {
            warn!(
                measurement = %first.measurement,
                error = %first.error,
                failures,
                suppressed,
                "Skipped derived points that could not be computed"
            );
        }
    }

    let mut delivered = 0;
    for fragment in processed.into_fragments() {
        let points = fragment.values.len();
        if let Err(e) = delivery.push(fragment) {
            debug!(sequence = batch.sequence, error = %e, "Batch computed after delivery shut down");
            break;
        }
        delivered += points;
    }
    health.record_delivered(delivered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::device::ScanRead;
    use crate::acquisition::simulated::{DeviceScript, ScriptedFactory};
    use crate::acquisition::test_support::configuration;
    use crate::delivery::{delivery_queue, run_consumer, ValueCache};
    use std::time::Instant;
    use tracing_test::traced_test;

    fn overrun() -> ScanRead {
        ScanRead {
            data: vec![9.0, 9.0],
            hardware_overrun: false,
            buffer_overrun: true,
        }
    }

    #[tokio::test]
    async fn overrun_is_discarded_and_next_batch_processed() {
        let script = DeviceScript::new();
        script.push(overrun());
        script.push(ScanRead::samples(vec![1.0, 2.0, 3.0, 4.0]));
        let factory = ScriptedFactory::new(Arc::clone(&script));
        let config = configuration("cfg", 10.0, &["A", "B"], &[("sum", "A+B")]);
        let (tx, rx) = delivery_queue();
        let health = Arc::new(AcquisitionHealth::default());

        let mut task =
            AcquisitionLoop::start(&factory, config, tx.clone(), Arc::clone(&health), 2).unwrap();
        time::sleep(Duration::from_millis(100)).await;
        task.request_stop();
        let report = task.wait(TerminationPolicy::Unbounded).await.unwrap();

        assert_eq!(report.overruns, 1);
        assert_eq!(report.batches, 1);
        let snapshot = health.snapshot();
        assert_eq!(snapshot.buffer_overruns, 1);
        assert_eq!(snapshot.points, 2);

        tx.shutdown();
        let cache = ValueCache::new();
        run_consumer(rx, Arc::clone(&cache)).await;
        let tables = cache.take();
        let values: Vec<f64> = tables["cfg_sum"].values().copied().collect();
        assert_eq!(values, vec![3.0, 7.0]);
    }

    #[tokio::test]
    async fn stop_during_read_releases_device() {
        let script = DeviceScript::new();
        script.set_read_delay(Duration::from_millis(50));
        let factory = ScriptedFactory::new(Arc::clone(&script));
        let config = configuration("cfg", 10.0, &["A"], &[("a", "A")]);
        let (tx, _rx) = delivery_queue();

        let mut task = AcquisitionLoop::start(
            &factory,
            config,
            tx,
            Arc::new(AcquisitionHealth::default()),
            1,
        )
        .unwrap();
        time::sleep(Duration::from_millis(20)).await;
        task.request_stop();
        assert!(task.stop_requested());
        task.wait(TerminationPolicy::Unbounded).await.unwrap();

        assert_eq!(task.state(), TaskState::Stopped);
        assert!(!script.claims().is_claimed());
        assert!(factory.open().is_ok());
    }

    #[tokio::test]
    async fn second_loop_on_claimed_device_is_busy() {
        let script = DeviceScript::new();
        let factory = ScriptedFactory::new(Arc::clone(&script));
        let config = configuration("cfg", 10.0, &["A"], &[]);
        let (tx, _rx) = delivery_queue();
        let health = Arc::new(AcquisitionHealth::default());

        let mut first = AcquisitionLoop::start(
            &factory,
            Arc::clone(&config),
            tx.clone(),
            Arc::clone(&health),
            1,
        )
        .unwrap();
        let err = AcquisitionLoop::start(
            &factory,
            Arc::clone(&config),
            tx.clone(),
            Arc::clone(&health),
            1,
        )
        .unwrap_err();
        assert!(err.is_busy());

        first.request_stop();
        first.wait(TerminationPolicy::Unbounded).await.unwrap();
        let mut second = AcquisitionLoop::start(&factory, config, tx, health, 1).unwrap();
        second.request_stop();
        second.wait(TerminationPolicy::Unbounded).await.unwrap();
        assert_eq!(script.claims().opens(), 2);
    }

    #[tokio::test]
    async fn read_error_ends_loop_and_releases_device() {
        let script = DeviceScript::new();
        script.fail_reads("bus fault");
        let factory = ScriptedFactory::new(Arc::clone(&script));
        let (tx, _rx) = delivery_queue();

        let mut task = AcquisitionLoop::start(
            &factory,
            configuration("cfg", 10.0, &["A"], &[]),
            tx,
            Arc::new(AcquisitionHealth::default()),
            1,
        )
        .unwrap();
        let err = task.wait(TerminationPolicy::Unbounded).await.unwrap_err();
        assert!(matches!(err, SentinelError::Device(ref msg) if msg == "bus fault"));
        assert!(!script.claims().is_claimed());
    }

    #[tokio::test]
    async fn bounded_wait_times_out_and_keeps_the_handle() {
        let script = DeviceScript::new();
        script.set_read_delay(Duration::from_millis(300));
        let factory = ScriptedFactory::new(Arc::clone(&script));
        let (tx, _rx) = delivery_queue();

        let mut task = AcquisitionLoop::start(
            &factory,
            configuration("cfg", 10.0, &["A"], &[]),
            tx,
            Arc::new(AcquisitionHealth::default()),
            1,
        )
        .unwrap();
        time::sleep(Duration::from_millis(20)).await;
        task.request_stop();

        let started = Instant::now();
        let err = task
            .wait(TerminationPolicy::Fixed(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::LoopTerminationTimeout { .. }));
        // The bound holds while the read is still blocked in the device.
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(script.claims().is_claimed());

        task.wait(TerminationPolicy::Unbounded).await.unwrap();
        assert!(!script.claims().is_claimed());
        assert!(task.wait(TerminationPolicy::Unbounded).await.is_err());
    }

    #[tokio::test]
    async fn malformed_batches_are_dropped() {
        let script = DeviceScript::new();
        script.push(ScanRead::samples(vec![1.0, 2.0, 3.0]));
        let factory = ScriptedFactory::new(Arc::clone(&script));
        let (tx, _rx) = delivery_queue();
        let health = Arc::new(AcquisitionHealth::default());

        let mut task = AcquisitionLoop::start(
            &factory,
            configuration("cfg", 10.0, &["A", "B"], &[("s", "A+B")]),
            tx,
            Arc::clone(&health),
            1,
        )
        .unwrap();
        time::sleep(Duration::from_millis(50)).await;
        task.request_stop();
        task.wait(TerminationPolicy::Unbounded).await.unwrap();

        assert_eq!(health.snapshot().malformed_batches, 1);
        assert_eq!(health.snapshot().points, 0);
    }

    #[tokio::test]
    async fn slow_device_read_leaves_runtime_responsive() {
        let script = DeviceScript::new();
        script.set_read_delay(Duration::from_millis(300));
        let factory = ScriptedFactory::new(Arc::clone(&script));
        let (tx, _rx) = delivery_queue();

        let mut task = AcquisitionLoop::start(
            &factory,
            configuration("cfg", 10.0, &["A"], &[]),
            tx,
            Arc::new(AcquisitionHealth::default()),
            1,
        )
        .unwrap();
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(script.reads_served(), 0);

        let started = Instant::now();
        time::sleep(Duration::from_millis(5)).await;
        assert!(started.elapsed() < Duration::from_millis(150));

        task.request_stop();
        task.wait(TerminationPolicy::Unbounded).await.unwrap();
        assert_eq!(script.reads_served(), 1);
        assert!(!script.claims().is_claimed());
    }

    #[test]
    fn points_count_only_delivered_values() {
        let config = configuration("cfg", 10.0, &["A"], &[("a", "A")]);
        let health = AcquisitionHealth::default();
        let (tx, _rx) = delivery_queue();
        let batch = AcquisitionBatch {
            samples: vec![1.0, 2.0],
            end_timestamp: 100.0,
            sample_rate: 10.0,
            sequence: 0,
        };

        process_batch(&batch, &config, &tx, &health);
        assert_eq!(health.snapshot().points, 2);

        tx.shutdown();
        process_batch(&batch, &config, &tx, &health);
        assert_eq!(health.snapshot().points, 2);
    }

    #[test]
    #[traced_test]
    fn repeated_overruns_warn_about_degradation() {
        let config = configuration("cfg", 10.0, &["A"], &[]);
        let health = AcquisitionHealth::default();
        for _ in 0..OVERRUN_DEGRADED_THRESHOLD {
            record_overrun(&health, &config, OverrunKind::Hardware);
        }

        assert!(logs_contain("Scan overrun, batch discarded"));
        assert!(logs_contain("Acquisition degraded by repeated overruns"));
    }

    #[test]
    #[traced_test]
    fn calculation_failures_are_reported_once_per_interval() {
        let config = configuration("cfg", 10.0, &["A", "B"], &[("ratio", "A/B")]);
        let health = AcquisitionHealth::default();
        let (tx, _rx) = delivery_queue();
        let batch = AcquisitionBatch {
            samples: vec![1.0, 0.0, 2.0, 0.0],
            end_timestamp: 100.0,
            sample_rate: 10.0,
            sequence: 0,
        };

        process_batch(&batch, &config, &tx, &health);
        process_batch(&batch, &config, &tx, &health);

        assert_eq!(health.snapshot().calc_failures, 4);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("Skipped derived points"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one report, found {n}")),
            }
        });
    }
}
