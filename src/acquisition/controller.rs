//! Switching between measurement configurations.
//!
//! The controller owns the active configuration index and the current loop
//! generation behind one async mutex. A switch holds the lock for the whole
//! sequence:
//!
//! ```text
//! Idle -> StopRequested -> AwaitingTermination -> ConfigSwapped -> Restarting -> Idle
//! ```
//!
//! Concurrent requests are serialized and each runs the full sequence. A new
//! loop is only started once the previous generation is confirmed gone, so two
//! loops never hold the device at once. If termination is not confirmed in
//! time the old handle stays in place and the caller gets
//! [`SentinelError::LoopTerminationTimeout`].

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::device::DeviceFactory;
use super::scan_loop::{AcquisitionLoop, AcquisitionTask, LoopReport};
use super::{ActiveConfiguration, TerminationPolicy};
use crate::delivery::DeliverySender;
use crate::error::{SentinelError, SentinelResult};
use crate::health::AcquisitionHealth;
use crate::relay::RelayControl;

/// Step of the reconfiguration sequence currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigPhase {
    /// No reconfiguration in progress
    Idle,
    /// Stop flag cleared on the running loop
    StopRequested,
    /// Waiting for the loop to release the device
    AwaitingTermination,
    /// Active index updated
    ConfigSwapped,
    /// Starting the new loop
    Restarting,
}

impl ReconfigPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReconfigPhase::StopRequested,
            2 => ReconfigPhase::AwaitingTermination,
            3 => ReconfigPhase::ConfigSwapped,
            4 => ReconfigPhase::Restarting,
            _ => ReconfigPhase::Idle,
        }
    }
}

#[derive(Debug)]
struct ControllerState {
    active_index: usize,
    task: Option<AcquisitionTask>,
}

/// Owns the acquisition loop lifecycle.
pub struct ReconfigurationController {
    configurations: Vec<Arc<ActiveConfiguration>>,
    factory: Arc<dyn DeviceFactory>,
    relay: Arc<dyn RelayControl>,
    delivery: DeliverySender,
    health: Arc<AcquisitionHealth>,
    policy: TerminationPolicy,
    max_in_flight_batches: usize,
    state: Mutex<ControllerState>,
    active: AtomicUsize,
    phase: AtomicU8,
}

impl std::fmt::Debug for ReconfigurationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconfigurationController")
            .field("configurations", &self.configurations.len())
            .field("active_index", &self.active_index())
            .field("phase", &self.phase())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ReconfigurationController {
    /// Controller over `configurations`, starting at index 0.
    pub fn new(
        configurations: Vec<Arc<ActiveConfiguration>>,
        factory: Arc<dyn DeviceFactory>,
        relay: Arc<dyn RelayControl>,
        delivery: DeliverySender,
        health: Arc<AcquisitionHealth>,
    ) -> Self {
        Self {
            configurations,
            factory,
            relay,
            delivery,
            health,
            policy: TerminationPolicy::PollMultiple(10),
            max_in_flight_batches: 4,
            state: Mutex::new(ControllerState {
                active_index: 0,
                task: None,
            }),
            active: AtomicUsize::new(0),
            phase: AtomicU8::new(ReconfigPhase::Idle as u8),
        }
    }

    /// Set the configuration `start` acquires.
    pub fn with_initial_index(mut self, index: usize) -> Self {
        self.state.get_mut().active_index = index;
        self.active.store(index, Ordering::SeqCst);
        self
    }

    /// Set how long loop termination is awaited.
    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the processing pool size of each loop.
    pub fn with_max_in_flight_batches(mut self, permits: usize) -> Self {
        self.max_in_flight_batches = permits.max(1);
        self
    }

    /// Index of the active configuration.
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The active configuration.
    pub fn active_configuration(&self) -> Option<Arc<ActiveConfiguration>> {
        self.configurations.get(self.active_index()).cloned()
    }

    /// Number of configurations.
    pub fn configuration_count(&self) -> usize {
        self.configurations.len()
    }

    /// Current reconfiguration step.
    pub fn phase(&self) -> ReconfigPhase {
        ReconfigPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether a loop generation is held (running, stopping or not yet awaited).
    pub async fn has_loop(&self) -> bool {
        self.state.lock().await.task.is_some()
    }

    fn set_phase(&self, phase: ReconfigPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn configuration(&self, index: usize) -> SentinelResult<&Arc<ActiveConfiguration>> {
        self.configurations
            .get(index)
            .ok_or_else(|| SentinelError::UnknownConfiguration {
                index,
                available: self.configurations.len(),
            })
    }

    fn spawn_loop(&self, index: usize) -> SentinelResult<AcquisitionTask> {
        let config = self.configuration(index)?;
        AcquisitionLoop::start(
            self.factory.as_ref(),
            Arc::clone(config),
            self.delivery.clone(),
            Arc::clone(&self.health),
            self.max_in_flight_batches,
        )
    }

    /// Start acquiring the initial configuration.
    pub async fn start(&self) -> SentinelResult<()> {
        let mut state = self.state.lock().await;
        if state.task.is_some() {
            return Err(SentinelError::LoopAlreadyRunning);
        }
        let index = state.active_index;
        state.task = Some(self.spawn_loop(index)?);
        self.relay.apply_configuration(index);
        Ok(())
    }

    /// Stop the current loop and restart acquisition with configuration
    /// `new_index`.
    pub async fn change_configuration(&self, new_index: usize) -> SentinelResult<()> {
        self.configuration(new_index)?;

        let mut state = self.state.lock().await;
        let previous = state.active_index;
        debug!(from = previous, to = new_index, "Reconfiguration started");

        if let Some(task) = state.task.as_mut() {
            self.set_phase(ReconfigPhase::StopRequested);
            task.request_stop();

            self.set_phase(ReconfigPhase::AwaitingTermination);
            match task.wait(self.policy).await {
                Ok(report) => {
                    debug!(polls = report.polls, batches = report.batches, "Previous loop terminated");
                }
                Err(e @ SentinelError::LoopTerminationTimeout { .. }) => {
                    self.set_phase(ReconfigPhase::Idle);
                    warn!(from = previous, to = new_index, error = %e, "Reconfiguration aborted");
                    return Err(e);
                }
                Err(e) => {
                    // Terminated all the same; the device is released.
                    error!(configuration = previous, error = %e, "Previous acquisition loop ended with an error");
                }
            }
            state.task = None;
        }

        self.set_phase(ReconfigPhase::ConfigSwapped);
        state.active_index = new_index;
        self.active.store(new_index, Ordering::SeqCst);

        self.set_phase(ReconfigPhase::Restarting);
        let started = self.spawn_loop(new_index);
        self.set_phase(ReconfigPhase::Idle);
        state.task = Some(started?);
        // The coil only follows a configuration that is actually acquiring.
        self.relay.apply_configuration(new_index);

        info!(from = previous, to = new_index, "Measurement configuration changed");
        Ok(())
    }

    /// Stop the current loop and wait for it. Leaves no loop running.
    ///
    /// On timeout the loop handle is kept, and a later call waits again.
    pub async fn shutdown(&self) -> SentinelResult<Option<LoopReport>> {
        let mut state = self.state.lock().await;
        let Some(task) = state.task.as_mut() else {
            return Ok(None);
        };
        task.request_stop();
        let result = task.wait(self.policy).await;
        if matches!(result, Err(SentinelError::LoopTerminationTimeout { .. })) {
            return result.map(Some);
        }
        state.task = None;
        info!("Acquisition controller shut down");
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::simulated::{DeviceScript, ScriptedFactory};
    use crate::acquisition::test_support::configuration;
    use crate::delivery::delivery_queue;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingRelay {
        applied: parking_lot::Mutex<Vec<usize>>,
    }

    impl RelayControl for RecordingRelay {
        fn apply_configuration(&self, index: usize) {
            self.applied.lock().push(index);
        }
    }

    fn controller(
        script: &Arc<DeviceScript>,
        relay: &Arc<RecordingRelay>,
    ) -> ReconfigurationController {
        let (tx, _rx) = delivery_queue();
        ReconfigurationController::new(
            vec![
                configuration("first", 10.0, &["A"], &[("a", "A")]),
                configuration("second", 20.0, &["A", "B"], &[("s", "A+B")]),
                configuration("third", 30.0, &["A"], &[]),
            ],
            Arc::new(ScriptedFactory::new(Arc::clone(script))),
            Arc::clone(relay) as Arc<dyn RelayControl>,
            tx,
            Arc::new(AcquisitionHealth::default()),
        )
        .with_termination_policy(TerminationPolicy::Unbounded)
    }

    #[tokio::test]
    async fn change_restarts_loop_with_new_configuration() {
        let script = DeviceScript::new();
        let relay = Arc::new(RecordingRelay::default());
        let controller = controller(&script, &relay);

        controller.start().await.unwrap();
        controller.change_configuration(1).await.unwrap();

        assert_eq!(controller.active_index(), 1);
        assert_eq!(controller.phase(), ReconfigPhase::Idle);
        assert_eq!(script.scans_started(), vec![(0b1, 10.0), (0b11, 20.0)]);
        assert_eq!(*relay.applied.lock(), vec![0, 1]);

        controller.shutdown().await.unwrap();
        assert!(!controller.has_loop().await);
        assert!(!script.claims().is_claimed());
    }

    #[tokio::test]
    async fn unknown_index_is_rejected_without_side_effects() {
        let script = DeviceScript::new();
        let relay = Arc::new(RecordingRelay::default());
        let controller = controller(&script, &relay);
        controller.start().await.unwrap();

        let err = controller.change_configuration(7).await.unwrap_err();
        assert!(matches!(
            err,
            SentinelError::UnknownConfiguration {
                index: 7,
                available: 3
            }
        ));
        assert_eq!(controller.active_index(), 0);
        assert_eq!(script.claims().opens(), 1);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let script = DeviceScript::new();
        let relay = Arc::new(RecordingRelay::default());
        let controller = controller(&script, &relay);
        controller.start().await.unwrap();
        assert!(matches!(
            controller.start().await,
            Err(SentinelError::LoopAlreadyRunning)
        ));
        controller.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_changes_are_serialized() {
        let script = DeviceScript::new();
        script.set_read_delay(Duration::from_millis(5));
        let relay = Arc::new(RecordingRelay::default());
        let controller = Arc::new(controller(&script, &relay));
        controller.start().await.unwrap();

        let mut handles = Vec::new();
        for index in [1, 2, 1, 0, 2] {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller.change_configuration(index).await
            }));
        }
        for handle in handles {
            // A DeviceBusy here would mean two loops overlapped.
            handle.await.unwrap().unwrap();
        }

        assert_eq!(script.claims().opens(), 6);
        assert_eq!(relay.applied.lock().len(), 6);
        assert_eq!(
            controller.active_index(),
            *relay.applied.lock().last().unwrap()
        );
        controller.shutdown().await.unwrap();
        assert!(!script.claims().is_claimed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn termination_timeout_keeps_old_loop() {
        let script = DeviceScript::new();
        script.set_read_delay(Duration::from_millis(300));
        let relay = Arc::new(RecordingRelay::default());
        let controller = controller(&script, &relay)
            .with_termination_policy(TerminationPolicy::Fixed(Duration::from_millis(20)));
        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = controller.change_configuration(1).await.unwrap_err();
        assert!(matches!(err, SentinelError::LoopTerminationTimeout { .. }));
        assert_eq!(controller.active_index(), 0);
        assert_eq!(controller.phase(), ReconfigPhase::Idle);
        assert!(controller.has_loop().await);
        assert_eq!(script.claims().opens(), 1);

        // Once the slow read returns, the retained loop exits and a retry succeeds.
        script.set_read_delay(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(400)).await;
        controller.change_configuration(1).await.unwrap();
        assert_eq!(controller.active_index(), 1);
        assert_eq!(script.claims().opens(), 2);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn relay_is_left_alone_when_restart_fails() {
        let script = DeviceScript::new();
        let relay = Arc::new(RecordingRelay::default());
        let controller = controller(&script, &relay);
        controller.start().await.unwrap();
        controller.shutdown().await.unwrap();

        // Someone else holds the device when the new loop tries to claim it.
        let _held = ScriptedFactory::new(Arc::clone(&script)).open().unwrap();
        let err = controller.change_configuration(1).await.unwrap_err();
        assert!(err.is_busy());
        assert_eq!(*relay.applied.lock(), vec![0]);
        assert!(!controller.has_loop().await);
    }

    #[tokio::test]
    async fn failed_previous_loop_does_not_block_switching() {
        let script = DeviceScript::new();
        script.fail_reads("bus fault");
        let relay = Arc::new(RecordingRelay::default());
        let controller = controller(&script, &relay);
        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        controller.change_configuration(2).await.unwrap();
        assert_eq!(controller.active_index(), 2);
        controller.shutdown().await.ok();
        assert!(!script.claims().is_claimed());
    }
}
