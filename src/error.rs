//! Custom error types for the appliance.
//!
//! This module defines the primary error type, `SentinelError`, shared by every
//! component of the acquisition-to-storage pipeline. Using the `thiserror`
//! crate, it provides a centralized way to report failures, from configuration
//! problems detected at startup to a loop that refuses to terminate during a
//! reconfiguration.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: parsing and semantic validation
//!   failures. Always fatal before any component starts.
//! - **`DeviceBusy`** / **`Device`** / **`InvalidScanRate`**: the DAQ device
//!   could not be claimed or configured. Fatal to starting an acquisition loop.
//! - **`MalformedBatch`**: a read returned a sample count that is not a whole
//!   number of scans. The batch is dropped.
//! - **`Calculation`**: a derived measurement could not be evaluated. Handled
//!   per point (skip and log), never fatal to the pipeline.
//! - **`LoopTerminationTimeout`** / **`LoopTaskFailed`**: a reconfiguration
//!   could not confirm that the previous loop is gone. Raised to the caller.
//! - **`Storage`** / **`Io`** / **`Csv`**: persistence failures.
//! - **`Relay`**: GPIO or relay sequencing failures.

use std::time::Duration;

use thiserror::Error;

use crate::calc::CalcError;

/// Convenience alias for results using the crate error type.
pub type SentinelResult<T> = std::result::Result<T, SentinelError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum SentinelError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Device '{device}' is busy (already claimed by another acquisition loop)")]
    DeviceBusy { device: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid scan rate {rate} S/s: must be a finite value greater than zero")]
    InvalidScanRate { rate: f64 },

    #[error("Malformed batch: {samples} samples cannot be split into scans of {channels} channels")]
    MalformedBatch { samples: usize, channels: usize },

    #[error("Calculation error: {0}")]
    Calculation(#[from] CalcError),

    #[error("Unknown measurement configuration index {index} ({available} configured)")]
    UnknownConfiguration { index: usize, available: usize },

    #[error("Acquisition loop did not terminate within {timeout:?} after stop was requested")]
    LoopTerminationTimeout { timeout: Duration },

    #[error("Acquisition loop task failed: {0}")]
    LoopTaskFailed(String),

    #[error("Acquisition loop is already running")]
    LoopAlreadyRunning,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Delivery queue already shut down")]
    DeliveryClosed,

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<SentinelError>),
}

impl From<figment::Error> for SentinelError {
    fn from(err: figment::Error) -> Self {
        SentinelError::Config(Box::new(err))
    }
}

impl SentinelError {
    /// Whether the pipeline may keep running after this error.
    ///
    /// Only per-batch and per-point failures are recoverable; everything else
    /// aborts startup or the operation that raised it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SentinelError::MalformedBatch { .. } | SentinelError::Calculation(_)
        )
    }

    /// Check if the device is busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::DeviceBusy { .. })
    }
}
