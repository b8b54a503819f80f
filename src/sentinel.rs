//! Appliance orchestration.
//!
//! [`Sentinel::start`] brings the pipeline up in dependency order:
//!
//! 1. storage service (tables created, consumer and flush worker running)
//! 2. relay driver (outputs configured low)
//! 3. reconfiguration controller (initial configuration acquiring)
//! 4. automatic switching timer, if enabled
//!
//! If a step fails, everything already started is stopped again before the
//! error is returned. [`Sentinel::shutdown`] stops the components in reverse
//! order: no new switches, no acquisition loop, queue sentinel, final
//! write-back, relay released. Each step runs even if an earlier one failed;
//! failures are collected into [`SentinelError::ShutdownFailed`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::acquisition::simulated::SimulatedHatFactory;
use crate::acquisition::{DeviceFactory, LoopReport, ReconfigurationController};
use crate::config::{DeviceKind, RelayKind, SentinelConfig};
use crate::delivery::{delivery_queue, DeliverySender};
use crate::error::{SentinelError, SentinelResult};
use crate::health::{AcquisitionHealth, HealthSnapshot};
use crate::relay::gpio::{OutputPins, RecordingPins, SysfsPins};
use crate::relay::{HBridgePins, HBridgeRelay, RelayControl, RelayTiming};
use crate::storage::{CsvDatabase, StorageReport, StorageService, StorageSettings, TableStore};

/// Totals collected while shutting down.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Final report of the last acquisition loop, if one was running
    pub acquisition: Option<LoopReport>,
    /// Storage totals
    pub storage: StorageReport,
    /// Relay sequences driven
    pub relay_sequences: u64,
    /// Automatic switches performed
    pub automatic_switches: u64,
    /// Acquisition health at shutdown
    pub health: HealthSnapshot,
}

/// Builder for [`Sentinel`] with replaceable hardware and storage.
pub struct SentinelBuilder {
    config: SentinelConfig,
    factory: Option<Arc<dyn DeviceFactory>>,
    store: Option<Box<dyn TableStore>>,
    pins: Option<Box<dyn OutputPins>>,
}

impl std::fmt::Debug for SentinelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelBuilder")
            .field("database", &self.config.database_config.name)
            .field("custom_factory", &self.factory.is_some())
            .field("custom_store", &self.store.is_some())
            .field("custom_pins", &self.pins.is_some())
            .finish()
    }
}

impl SentinelBuilder {
    /// Use `factory` instead of the configured device.
    pub fn with_device_factory(mut self, factory: Arc<dyn DeviceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use `store` instead of the CSV database.
    pub fn with_store(mut self, store: Box<dyn TableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `pins` instead of the configured GPIO backend.
    pub fn with_output_pins(mut self, pins: Box<dyn OutputPins>) -> Self {
        self.pins = Some(pins);
        self
    }

    /// Validate the configuration and start every component.
    pub async fn start(self) -> SentinelResult<Sentinel> {
        let SentinelBuilder {
            config,
            factory,
            store,
            pins,
        } = self;
        config.validate()?;

        let configurations = config.measurement_configurations()?;
        let settings = StorageSettings::from_config(&config)?;
        let control = &config.measurement_control;

        let factory = factory.unwrap_or_else(|| match config.device.kind {
            DeviceKind::Simulated => Arc::new(SimulatedHatFactory::new(config.device.address)),
        });
        let store = store.unwrap_or_else(|| {
            Box::new(CsvDatabase::new(
                &config.database_config.directory,
                &config.database_config.name,
            ))
        });
        let pins: Box<dyn OutputPins> = pins.unwrap_or_else(|| match control.relay {
            RelayKind::Sysfs => Box::new(SysfsPins::new()),
            RelayKind::Simulated => Box::new(RecordingPins::new()),
        });

        let (delivery, receiver) = delivery_queue();
        let mut storage = StorageService::start(store, settings, delivery.clone(), receiver)?;

        let timing = RelayTiming {
            drive: Duration::from_millis(control.drive_time_ms),
            flyback: Duration::from_millis(control.flyback_time_ms),
        };
        let output_states = configurations.iter().map(|c| c.output_state).collect();
        let relay = match HBridgeRelay::start(
            pins,
            HBridgePins::from(control.meas_conf_output_gpio),
            output_states,
            timing,
        ) {
            Ok(relay) => Arc::new(relay),
            Err(e) => {
                abort_storage(&mut storage).await;
                return Err(e);
            }
        };

        let health = Arc::new(AcquisitionHealth::default());
        let controller = Arc::new(
            ReconfigurationController::new(
                configurations,
                factory,
                Arc::clone(&relay) as Arc<dyn RelayControl>,
                delivery.clone(),
                Arc::clone(&health),
            )
            .with_initial_index(control.initial_configuration)
            .with_termination_policy(config.termination_policy())
            .with_max_in_flight_batches(control.max_in_flight_batches),
        );
        if let Err(e) = controller.start().await {
            error!(error = %e, "Acquisition failed to start; stopping started components");
            abort_storage(&mut storage).await;
            if let Err(relay_err) = relay.stop().await {
                warn!(error = %relay_err, "Relay stop after failed startup failed");
            }
            return Err(e);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (fault_tx, fault_rx) = watch::channel(false);
        let auto_switch = match config.auto_switch_interval() {
            Some(period) if controller.configuration_count() > 1 => Some(tokio::spawn(
                run_auto_switch(Arc::clone(&controller), period, stop_rx, fault_tx),
            )),
            Some(_) => {
                info!("Automatic switching disabled: only one measurement configuration");
                None
            }
            None => None,
        };

        info!(
            database = %config.database_config.name,
            configurations = controller.configuration_count(),
            initial = controller.active_index(),
            auto_switch = auto_switch.is_some(),
            "Sentinel started"
        );

        Ok(Sentinel {
            config,
            controller,
            relay,
            storage,
            delivery,
            health,
            auto_switch,
            stop_tx,
            fault_rx,
        })
    }
}

/// The running appliance.
pub struct Sentinel {
    config: SentinelConfig,
    controller: Arc<ReconfigurationController>,
    relay: Arc<HBridgeRelay>,
    storage: StorageService,
    delivery: DeliverySender,
    health: Arc<AcquisitionHealth>,
    auto_switch: Option<JoinHandle<SentinelResult<u64>>>,
    stop_tx: watch::Sender<bool>,
    fault_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Sentinel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sentinel")
            .field("controller", &self.controller)
            .field("storage", &self.storage)
            .field("auto_switch", &self.auto_switch.is_some())
            .finish_non_exhaustive()
    }
}

impl Sentinel {
    /// Builder over a loaded configuration.
    pub fn builder(config: SentinelConfig) -> SentinelBuilder {
        SentinelBuilder {
            config,
            factory: None,
            store: None,
            pins: None,
        }
    }

    /// Start with the configured device, CSV store and GPIO backend.
    pub async fn start(config: SentinelConfig) -> SentinelResult<Self> {
        Self::builder(config).start().await
    }

    /// The configuration the appliance runs with.
    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    /// The reconfiguration controller.
    pub fn controller(&self) -> &Arc<ReconfigurationController> {
        &self.controller
    }

    /// Acquisition counters.
    pub fn health(&self) -> &Arc<AcquisitionHealth> {
        &self.health
    }

    /// Values accepted but not yet written back.
    pub fn pending_values(&self) -> usize {
        self.storage.cache().pending_values()
    }

    /// Switch to configuration `index`.
    pub async fn switch_to(&self, index: usize) -> SentinelResult<()> {
        self.controller.change_configuration(index).await
    }

    /// Resolves once automatic switching has failed and the appliance should
    /// shut down. Never resolves while switching is healthy or disabled.
    pub async fn faulted(&self) {
        let mut fault = self.fault_rx.clone();
        if fault.wait_for(|failed| *failed).await.is_err() {
            // Timer gone without a fault.
            std::future::pending::<()>().await;
        }
    }

    /// Stop every component in order.
    pub async fn shutdown(mut self) -> SentinelResult<ShutdownReport> {
        info!("Sentinel shutting down");
        let mut errors = Vec::new();
        let mut automatic_switches = 0;

        // Sending fails only if the timer already ended; its join says why.
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.auto_switch.take() {
            match handle.await {
                Ok(Ok(switches)) => automatic_switches = switches,
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(SentinelError::LoopTaskFailed(format!(
                    "automatic switching task failed: {e}"
                ))),
            }
        }

        let acquisition = match self.controller.shutdown().await {
            Ok(report) => report,
            Err(e) => {
                errors.push(e);
                None
            }
        };

        self.delivery.shutdown();
        let storage = match self.storage.stop().await {
            Ok(report) => report,
            Err(e) => {
                errors.push(e);
                StorageReport::default()
            }
        };

        let relay_sequences = match self.relay.stop().await {
            Ok(sequences) => sequences,
            Err(e) => {
                errors.push(e);
                0
            }
        };

        let health = self.health.snapshot();
        info!(
            status = ?self.health.status(),
            polls = health.polls,
            batches = health.batches,
            overruns = health.hardware_overruns + health.buffer_overruns,
            points = health.points,
            calc_failures = health.calc_failures,
            rows = storage.flush.rows,
            "Sentinel stopped"
        );

        if errors.is_empty() {
            Ok(ShutdownReport {
                acquisition,
                storage,
                relay_sequences,
                automatic_switches,
                health,
            })
        } else {
            for e in &errors {
                error!(error = %e, "Shutdown step failed");
            }
            Err(SentinelError::ShutdownFailed(errors))
        }
    }
}

async fn abort_storage(storage: &mut StorageService) {
    if let Err(e) = storage.stop().await {
        warn!(error = %e, "Storage stop after failed startup failed");
    }
}

/// Advance to the next configuration every `period`, wrapping around.
///
/// A failed switch is fatal: the fault flag is raised and the error returned.
async fn run_auto_switch(
    controller: Arc<ReconfigurationController>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    fault: watch::Sender<bool>,
) -> SentinelResult<u64> {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut switches = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
        let next = (controller.active_index() + 1) % controller.configuration_count();
        if let Err(e) = controller.change_configuration(next).await {
            error!(to = next, error = %e, "Automatic configuration switch failed; shutting down");
            let _ = fault.send(true);
            return Err(e);
        }
        switches += 1;
    }
    Ok(switches)
}
