//! GPIO output backends.
//!
//! Pins are addressed by their physical header number (BOARD numbering), the
//! numbering used in the configuration file. [`SysfsPins`] translates them to
//! BCM line numbers for the kernel.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sysfs_gpio::{Direction, Pin};
use tracing::{debug, trace, warn};

use crate::error::{SentinelError, SentinelResult};

/// Attempts at configuring a freshly exported line before giving up.
const EXPORT_RETRIES: u32 = 50;
const EXPORT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// 40-pin header: physical pin -> BCM GPIO line.
const BOARD_TO_BCM: [(u8, u8); 28] = [
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (27, 0),
    (28, 1),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

/// BCM line of header pin `pin`, or `None` for power, ground and
/// out-of-range pins.
pub fn board_to_bcm(pin: u8) -> Option<u8> {
    BOARD_TO_BCM
        .iter()
        .find(|(board, _)| *board == pin)
        .map(|(_, bcm)| *bcm)
}

/// A bank of digital outputs.
pub trait OutputPins: Send {
    /// Configure header pin `pin` as an output, driven low.
    fn setup_output(&mut self, pin: u8) -> SentinelResult<()>;

    /// Drive `pin` high or low.
    fn write(&mut self, pin: u8, high: bool) -> SentinelResult<()>;

    /// Return every configured pin to the system.
    fn release(&mut self) -> SentinelResult<()>;
}

/// Outputs driven through the kernel's sysfs GPIO interface.
#[derive(Debug, Default)]
pub struct SysfsPins {
    configured: Vec<(u8, Pin)>,
}

impl SysfsPins {
    /// Empty pin bank; pins are exported by [`OutputPins::setup_output`].
    pub fn new() -> Self {
        Self::default()
    }

    fn line(pin: u8) -> SentinelResult<u8> {
        board_to_bcm(pin)
            .ok_or_else(|| SentinelError::Relay(format!("header pin {pin} is not a GPIO")))
    }

    fn configured(&self, pin: u8) -> SentinelResult<Pin> {
        self.configured
            .iter()
            .find(|(board, _)| *board == pin)
            .map(|(_, gpio)| *gpio)
            .ok_or_else(|| SentinelError::Relay(format!("header pin {pin} is not configured")))
    }
}

fn gpio_error(pin: u8, action: &str, error: sysfs_gpio::Error) -> SentinelError {
    SentinelError::Relay(format!("header pin {pin}: {action} failed: {error}"))
}

impl OutputPins for SysfsPins {
    fn setup_output(&mut self, pin: u8) -> SentinelResult<()> {
        let line = Self::line(pin)?;
        let gpio = Pin::new(u64::from(line));
        gpio.export().map_err(|e| gpio_error(pin, "export", e))?;

        // udev needs a moment before the new attribute files are writable.
        let mut attempts = 0;
        loop {
            match gpio.set_direction(Direction::Low) {
                Ok(()) => break,
                Err(_) if attempts < EXPORT_RETRIES => {
                    attempts += 1;
                    thread::sleep(EXPORT_RETRY_DELAY);
                }
                Err(e) => return Err(gpio_error(pin, "set direction", e)),
            }
        }

        if self.configured(pin).is_err() {
            self.configured.push((pin, gpio));
        }
        debug!(pin, line, "GPIO configured as output");
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> SentinelResult<()> {
        let gpio = self.configured(pin)?;
        trace!(pin, line = gpio.get_pin_num(), high, "GPIO write");
        gpio.set_value(u8::from(high))
            .map_err(|e| gpio_error(pin, "write", e))
    }

    fn release(&mut self) -> SentinelResult<()> {
        let mut first_error = None;
        for (pin, gpio) in self.configured.drain(..) {
            let released = gpio
                .set_value(0)
                .and_then(|()| gpio.unexport())
                .map_err(|e| gpio_error(pin, "release", e));
            if let Err(e) = released {
                warn!(pin, error = %e, "GPIO release failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// One recorded pin operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEvent {
    /// Pin configured as output
    Setup(u8),
    /// Pin driven high (`true`) or low
    Write(u8, bool),
    /// All pins released
    Release,
}

/// Shared log of [`RecordingPins`] operations.
#[derive(Debug, Clone, Default)]
pub struct PinLog(Arc<Mutex<Vec<PinEvent>>>);

impl PinLog {
    /// Every event so far.
    pub fn events(&self) -> Vec<PinEvent> {
        self.0.lock().clone()
    }

    /// Only the writes, in order.
    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.0
            .lock()
            .iter()
            .filter_map(|event| match event {
                PinEvent::Write(pin, level) => Some((*pin, *level)),
                _ => None,
            })
            .collect()
    }
}

/// Outputs that only record what was asked of them.
#[derive(Debug, Default)]
pub struct RecordingPins {
    log: PinLog,
}

impl RecordingPins {
    /// New pin bank with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the log.
    pub fn log(&self) -> PinLog {
        self.log.clone()
    }
}

impl OutputPins for RecordingPins {
    fn setup_output(&mut self, pin: u8) -> SentinelResult<()> {
        self.log.0.lock().push(PinEvent::Setup(pin));
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> SentinelResult<()> {
        trace!(pin, high, "Simulated GPIO write");
        self.log.0.lock().push(PinEvent::Write(pin, high));
        Ok(())
    }

    fn release(&mut self) -> SentinelResult<()> {
        self.log.0.lock().push(PinEvent::Release);
        Ok(())
    }
}
