//! Continuous acquisition pipeline.
//!
//! ```text
//!   DeviceFactory ──open──▶ ScanDevice (owned by one loop generation)
//!                              │ read_available() every poll_interval
//!                   ┌──────────▼──────────┐
//!                   │  AcquisitionLoop    │── overruns ──▶ AcquisitionHealth
//!                   └──────────┬──────────┘
//!                              │ AcquisitionBatch + Arc<ActiveConfiguration>
//!                   ┌──────────▼──────────┐
//!                   │  worker pool        │  (bounded, spawn_blocking)
//!                   │  BatchProcessor     │
//!                   └──────────┬──────────┘
//!                              │ DeliveryEntry::Fragment
//!                              ▼
//!                        delivery queue ──▶ storage
//! ```
//!
//! The [`ReconfigurationController`] owns the current loop generation and
//! swaps it for another configuration with a stop / await / swap / restart
//! sequence under a single-holder lock.

pub mod batch;
pub mod controller;
pub mod device;
pub mod scan_loop;
pub mod simulated;

use std::time::Duration;

use crate::calc::BoundExpression;

pub use batch::{
    AcquisitionBatch, BatchProcessor, DerivedMeasurementPoint, PointFailure, ProcessedBatch,
    ReconstructedSample,
};
pub use controller::{ReconfigPhase, ReconfigurationController};
pub use device::{DeviceFactory, PollOutcome, ScanDevice, ScanRead};
pub use scan_loop::{AcquisitionLoop, AcquisitionTask, LoopReport, TaskState};

/// One physical input and the tag expressions refer to it by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Channel number on the HAT
    pub number: u8,
    /// Tag used in expressions
    pub tag: String,
}

/// A derived measurement, ready to evaluate against one scan.
#[derive(Debug, Clone)]
pub struct DerivedMeasurement {
    /// Measurement name as configured
    pub name: String,
    /// Storage table, `<configuration>_<measurement>`
    pub table: String,
    /// Expression bound to the configuration's channel order
    pub expression: BoundExpression,
}

impl DerivedMeasurement {
    /// Build a measurement of configuration `config_name`.
    pub fn new(config_name: &str, name: &str, expression: BoundExpression) -> Self {
        Self {
            name: name.to_string(),
            table: format!("{config_name}_{name}"),
            expression,
        }
    }
}

/// Immutable, normalized measurement configuration.
///
/// Shared by `Arc` between the controller, the loop and every processing task;
/// a loop always works against the snapshot it was started with.
#[derive(Debug, Clone)]
pub struct ActiveConfiguration {
    /// Position in the configured list
    pub index: usize,
    /// Configuration name
    pub name: String,
    /// Samples per second per channel
    pub scan_rate_hz: f64,
    /// Channels in ascending channel-number order (interleaving order)
    pub channels: Vec<ChannelSpec>,
    /// Derived measurements
    pub measurements: Vec<DerivedMeasurement>,
    /// Relay direction while active
    pub output_state: bool,
    /// Device poll cadence
    pub poll_interval: Duration,
    /// Device scan buffer size in samples per channel
    pub buffer_size_per_channel: usize,
}

impl ActiveConfiguration {
    /// Bit mask of the scanned channels.
    pub fn channel_mask(&self) -> u8 {
        self.channels
            .iter()
            .fold(0u8, |mask, channel| mask | (1 << channel.number))
    }

    /// Tags in interleaving order.
    pub fn tags(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.tag.as_str()).collect()
    }

    /// Number of scanned channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Tables this configuration writes to.
    pub fn table_names(&self) -> Vec<String> {
        self.measurements.iter().map(|m| m.table.clone()).collect()
    }

    /// Time the device buffer can hold before it overruns, saturating at
    /// `Duration::MAX`.
    pub fn buffer_horizon(&self) -> Duration {
        Duration::try_from_secs_f64(self.buffer_size_per_channel as f64 / self.scan_rate_hz)
            .unwrap_or(Duration::MAX)
    }
}

/// How long a reconfiguration waits for the previous loop to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Wait until the loop is gone, however long that takes.
    Unbounded,
    /// Wait this many poll intervals of the configuration being stopped.
    PollMultiple(u32),
    /// Wait a fixed duration.
    Fixed(Duration),
}

impl TerminationPolicy {
    /// The bound applied when stopping a loop running `config`, if any.
    pub fn bound_for(&self, config: &ActiveConfiguration) -> Option<Duration> {
        match self {
            TerminationPolicy::Unbounded => None,
            TerminationPolicy::PollMultiple(n) => Some(config.poll_interval * *n),
            TerminationPolicy::Fixed(timeout) => Some(*timeout),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::configuration;
    use super::*;

    #[test]
    fn termination_bound_scales_with_poll_interval() {
        let config = configuration("c", 100.0, &["A"], &[]);
        assert_eq!(
            TerminationPolicy::PollMultiple(5).bound_for(&config),
            Some(Duration::from_millis(50))
        );
        assert_eq!(TerminationPolicy::Unbounded.bound_for(&config), None);
    }

    #[test]
    fn buffer_horizon_follows_scan_rate() {
        let config = configuration("c", 1000.0, &["A", "B"], &[("s", "A+B")]);
        assert_eq!(config.buffer_horizon(), Duration::from_secs(10));
        assert_eq!(config.table_names(), vec!["c_s".to_string()]);
    }
}
