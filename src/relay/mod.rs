//! Bistable relay control.
//!
//! The relay coil sits in an H-bridge of four transistors. Three outputs drive
//! it: `A`, `B/C` (both gates tied together) and `D`. A configuration's output
//! state picks the current direction:
//!
//! | state   | drive phase         |
//! |---------|---------------------|
//! | `true`  | A and D on, B/C off |
//! | `false` | B/C on, A and D off |
//!
//! After the drive pulse the coil current is released actively through A
//! (flyback), then every output returns low. A switch is always one complete
//! `Idle -> Drive -> Flyback -> Idle` sequence; requests arriving meanwhile
//! queue up behind it.

pub mod gpio;

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SentinelError, SentinelResult};
use gpio::OutputPins;

/// Reacts to the active measurement configuration changing.
pub trait RelayControl: Send + Sync {
    /// Switch the relay for configuration `index`. Returns immediately.
    fn apply_configuration(&self, index: usize);
}

/// Header pins of the H-bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HBridgePins {
    /// Transistor A
    pub a: u8,
    /// Transistors B and C
    pub bc: u8,
    /// Transistor D
    pub d: u8,
}

impl From<[u8; 3]> for HBridgePins {
    fn from(pins: [u8; 3]) -> Self {
        Self {
            a: pins[0],
            bc: pins[1],
            d: pins[2],
        }
    }
}

/// Phase lengths of one switching sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTiming {
    /// Length of the drive pulse
    pub drive: Duration,
    /// Length of the active flyback
    pub flyback: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            drive: Duration::from_secs(1),
            flyback: Duration::from_secs(1),
        }
    }
}

/// H-bridge relay driver running its sequences on a background task.
pub struct HBridgeRelay {
    requests: Mutex<Option<mpsc::UnboundedSender<usize>>>,
    worker: Mutex<Option<JoinHandle<SentinelResult<u64>>>>,
}

impl std::fmt::Debug for HBridgeRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HBridgeRelay")
            .field("running", &self.requests.lock().is_some())
            .finish()
    }
}

impl HBridgeRelay {
    /// Configure the outputs (all low) and start the sequencer.
    ///
    /// `output_states[i]` is the drive direction of configuration `i`. Must be
    /// called from within a Tokio runtime.
    pub fn start(
        mut pins: Box<dyn OutputPins>,
        wiring: HBridgePins,
        output_states: Vec<bool>,
        timing: RelayTiming,
    ) -> SentinelResult<Self> {
        for pin in [wiring.a, wiring.bc, wiring.d] {
            pins.setup_output(pin)?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_sequencer(pins, wiring, output_states, timing, rx));
        info!(a = wiring.a, bc = wiring.bc, d = wiring.d, "Relay driver started");
        Ok(Self {
            requests: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Finish queued sequences, release the pins and stop the sequencer.
    ///
    /// Returns the number of sequences driven.
    pub async fn stop(&self) -> SentinelResult<u64> {
        // Closing the channel lets the sequencer drain and exit.
        self.requests.lock().take();
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker
                .await
                .map_err(|e| SentinelError::Relay(format!("relay task failed: {e}")))?,
            None => Ok(0),
        }
    }
}

impl RelayControl for HBridgeRelay {
    fn apply_configuration(&self, index: usize) {
        match self.requests.lock().as_ref() {
            Some(tx) => {
                if tx.send(index).is_err() {
                    warn!(index, "Relay sequencer is gone; request dropped");
                }
            }
            None => debug!(index, "Relay stopped; request ignored"),
        }
    }
}

async fn run_sequencer(
    mut pins: Box<dyn OutputPins>,
    wiring: HBridgePins,
    output_states: Vec<bool>,
    timing: RelayTiming,
    mut requests: mpsc::UnboundedReceiver<usize>,
) -> SentinelResult<u64> {
    let mut sequences = 0;
    while let Some(index) = requests.recv().await {
        let Some(&state) = output_states.get(index) else {
            warn!(index, "No output state for configuration; relay left unchanged");
            continue;
        };
        if let Err(e) = drive_sequence(&mut *pins, wiring, state, timing).await {
            error!(index, error = %e, "Relay sequence failed");
            // Never leave the coil energized.
            let _ = set_levels(&mut *pins, wiring, [false, false, false]);
            continue;
        }
        sequences += 1;
        debug!(index, state, "Relay switched");
    }
    pins.release()?;
    debug!(sequences, "Relay sequencer stopped");
    Ok(sequences)
}

async fn drive_sequence(
    pins: &mut dyn OutputPins,
    wiring: HBridgePins,
    state: bool,
    timing: RelayTiming,
) -> SentinelResult<()> {
    // The side being switched off is written first.
    if state {
        pins.write(wiring.bc, false)?;
        pins.write(wiring.a, true)?;
        pins.write(wiring.d, true)?;
    } else {
        pins.write(wiring.a, false)?;
        pins.write(wiring.d, false)?;
        pins.write(wiring.bc, true)?;
    }
    tokio::time::sleep(timing.drive).await;

    pins.write(wiring.bc, false)?;
    pins.write(wiring.a, true)?;
    pins.write(wiring.d, false)?;
    tokio::time::sleep(timing.flyback).await;

    set_levels(pins, wiring, [false, false, false])
}

/// `levels` are `[a, bc, d]`.
fn set_levels(pins: &mut dyn OutputPins, wiring: HBridgePins, levels: [bool; 3]) -> SentinelResult<()> {
    pins.write(wiring.bc, levels[1])?;
    pins.write(wiring.a, levels[0])?;
    pins.write(wiring.d, levels[2])
}
