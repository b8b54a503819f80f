//! # Sentinel
//!
//! Data-logging appliance for an energy-harvesting measurement rig. Analog
//! channels are read continuously from a DAQ HAT, derived measurements are
//! computed from configured arithmetic expressions, the resulting time series
//! are persisted one table per measurement, and a bistable relay is switched
//! according to the active measurement configuration.
//!
//! ## Crate Structure
//!
//! - **`calc`**: expression parsing (via `evalexpr`) and evaluation over channel tags.
//! - **`acquisition`**: device traits, the simulated HAT, the batch processor,
//!   the continuous scan loop and the reconfiguration controller.
//! - **`delivery`**: the fragment queue with its shutdown sentinel and the
//!   timestamp-keyed value cache.
//! - **`storage`**: the write-back service, CSV and in-memory table stores and
//!   the read-only database inspector.
//! - **`relay`**: H-bridge relay sequencing and GPIO backends.
//! - **`health`**: acquisition counters and degraded status.
//! - **`config`**: Figment-based configuration loading and validation.
//! - **`error`**: the crate error type.
//! - **`telemetry`**: tracing subscriber setup.
//! - **`sentinel`**: startup and shutdown of the whole pipeline.

pub mod acquisition;
pub mod calc;
pub mod config;
pub mod delivery;
pub mod error;
pub mod health;
pub mod relay;
pub mod sentinel;
pub mod storage;
pub mod telemetry;

pub use config::SentinelConfig;
pub use error::{SentinelError, SentinelResult};
pub use sentinel::{Sentinel, ShutdownReport};
