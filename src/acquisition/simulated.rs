//! Simulated DAQ devices.
//!
//! - [`SimulatedHat`]: behaves like a continuously scanning HAT. Samples are
//!   produced from wall-clock time at the configured rate into a finite
//!   buffer; draining it too slowly raises a buffer overrun and loses the
//!   backlog, exactly the failure mode a slow poll cadence causes on hardware.
//! - [`ScriptedDevice`]: replays queued reads. Used by tests to drive the
//!   loop through precise sequences (overruns, empty polls, slow reads).
//!
//! Both enforce exclusive ownership through a shared [`ClaimTracker`], so a
//! second open while a loop still holds the device fails with
//! [`SentinelError::DeviceBusy`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::device::{DeviceFactory, ScanDevice, ScanRead};
use crate::error::{SentinelError, SentinelResult};

/// Tracks whether the single physical device is claimed.
#[derive(Debug, Default)]
pub struct ClaimTracker {
    claimed: AtomicUsize,
    opens: AtomicUsize,
}

impl ClaimTracker {
    /// New, unclaimed tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn claim(self: &Arc<Self>, device: &str) -> SentinelResult<Claim> {
        self.claimed
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SentinelError::DeviceBusy {
                device: device.to_string(),
            })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Claim {
            tracker: Some(Arc::clone(self)),
        })
    }

    /// Whether a device handle is currently claimed.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst) != 0
    }

    /// Successful opens so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

/// Releases the claim once, on cleanup or drop.
#[derive(Debug)]
struct Claim {
    tracker: Option<Arc<ClaimTracker>>,
}

impl Claim {
    fn release(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.claimed.store(0, Ordering::SeqCst);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.release();
    }
}

// =============================================================================
// SimulatedHat
// =============================================================================

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Factory for [`SimulatedHat`] devices at one stack address.
#[derive(Debug)]
pub struct SimulatedHatFactory {
    address: u8,
    claims: Arc<ClaimTracker>,
}

impl SimulatedHatFactory {
    /// Factory for the HAT at `address`.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            claims: ClaimTracker::new(),
        }
    }

    /// Claim state shared with opened devices.
    pub fn claims(&self) -> Arc<ClaimTracker> {
        Arc::clone(&self.claims)
    }
}

impl DeviceFactory for SimulatedHatFactory {
    fn open(&self) -> SentinelResult<Box<dyn ScanDevice>> {
        let name = format!("simulated-hat@{}", self.address);
        let claim = self.claims.claim(&name)?;
        debug!(device = %name, "Claimed simulated HAT");
        Ok(Box::new(SimulatedHat {
            name,
            claim,
            scan: None,
        }))
    }
}

#[derive(Debug)]
struct ScanState {
    channels: Vec<u8>,
    rate: f64,
    capacity_scans: u64,
    started: Instant,
    produced_scans: u64,
    noise_seed: u64,
}

/// A simulated HAT producing per-channel sine waves plus noise.
#[derive(Debug)]
pub struct SimulatedHat {
    name: String,
    claim: Claim,
    scan: Option<ScanState>,
}

impl SimulatedHat {
    fn sample(channel: u8, t: f64, seed: &mut u64) -> f64 {
        *seed = prng(*seed);
        let noise = (*seed as f64 / 0x7fffffff as f64 - 0.5) * 0.002;
        let amplitude = 0.5 + 0.25 * f64::from(channel);
        let frequency = 0.5 + 0.5 * f64::from(channel);
        1.0 + amplitude * (std::f64::consts::TAU * frequency * t).sin() + noise
    }
}

impl ScanDevice for SimulatedHat {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_continuous_scan(
        &mut self,
        channel_mask: u8,
        buffer_size_hint: usize,
        sample_rate: f64,
    ) -> SentinelResult<()> {
        if self.scan.is_some() {
            return Err(SentinelError::Device(format!(
                "{}: a scan is already running",
                self.name
            )));
        }
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(SentinelError::InvalidScanRate { rate: sample_rate });
        }
        let channels: Vec<u8> = (0..8).filter(|ch| channel_mask & (1 << ch) != 0).collect();
        if channels.is_empty() {
            return Err(SentinelError::Device(format!(
                "{}: channel mask selects no channels",
                self.name
            )));
        }
        info!(
            device = %self.name,
            channels = ?channels,
            sample_rate,
            buffer_size_hint,
            "Starting continuous scan"
        );
        self.scan = Some(ScanState {
            channels,
            rate: sample_rate,
            capacity_scans: buffer_size_hint.max(1) as u64,
            started: Instant::now(),
            produced_scans: 0,
            noise_seed: 0x5e17,
        });
        Ok(())
    }

    fn read_available(&mut self, _timeout: Duration) -> SentinelResult<ScanRead> {
        let scan = self.scan.as_mut().ok_or_else(|| {
            SentinelError::Device(format!("{}: read without a running scan", self.name))
        })?;

        let due = (scan.started.elapsed().as_secs_f64() * scan.rate) as u64;
        let pending = due.saturating_sub(scan.produced_scans);
        if pending > scan.capacity_scans {
            // The backlog is lost; resume from now.
            scan.produced_scans = due;
            return Ok(ScanRead {
                data: Vec::new(),
                hardware_overrun: false,
                buffer_overrun: true,
            });
        }

        let mut data = Vec::with_capacity(pending as usize * scan.channels.len());
        for n in scan.produced_scans..due {
            let t = n as f64 / scan.rate;
            for &channel in &scan.channels {
                data.push(Self::sample(channel, t, &mut scan.noise_seed));
            }
        }
        scan.produced_scans = due;
        Ok(ScanRead::samples(data))
    }

    fn stop_scan(&mut self) -> SentinelResult<()> {
        if self.scan.take().is_some() {
            debug!(device = %self.name, "Stopped continuous scan");
        }
        Ok(())
    }

    fn cleanup(&mut self) -> SentinelResult<()> {
        self.scan = None;
        self.claim.release();
        debug!(device = %self.name, "Released simulated HAT");
        Ok(())
    }
}

// =============================================================================
// ScriptedDevice
// =============================================================================

/// Shared script of reads and observations for [`ScriptedDevice`].
#[derive(Debug, Default)]
pub struct DeviceScript {
    reads: Mutex<VecDeque<ScanRead>>,
    read_delay: Mutex<Duration>,
    read_error: Mutex<Option<String>>,
    reads_served: AtomicUsize,
    scans_started: Mutex<Vec<(u8, f64)>>,
    claims: Arc<ClaimTracker>,
}

impl DeviceScript {
    /// Empty script.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a read to be returned by a future poll.
    pub fn push(&self, read: ScanRead) {
        self.reads.lock().push_back(read);
    }

    /// Block every `read_available` call for `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    /// Make every following read fail with `message`.
    pub fn fail_reads(&self, message: &str) {
        *self.read_error.lock() = Some(message.to_string());
    }

    /// Reads served so far, including empty ones.
    pub fn reads_served(&self) -> usize {
        self.reads_served.load(Ordering::SeqCst)
    }

    /// Queued reads not yet served.
    pub fn pending(&self) -> usize {
        self.reads.lock().len()
    }

    /// `(channel_mask, rate)` of every scan started.
    pub fn scans_started(&self) -> Vec<(u8, f64)> {
        self.scans_started.lock().clone()
    }

    /// Claim state of the scripted device.
    pub fn claims(&self) -> &Arc<ClaimTracker> {
        &self.claims
    }
}

/// Factory handing out [`ScriptedDevice`]s that share one script.
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    script: Arc<DeviceScript>,
}

impl ScriptedFactory {
    /// Factory over `script`.
    pub fn new(script: Arc<DeviceScript>) -> Self {
        Self { script }
    }
}

impl DeviceFactory for ScriptedFactory {
    fn open(&self) -> SentinelResult<Box<dyn ScanDevice>> {
        let claim = self.script.claims.claim("scripted")?;
        Ok(Box::new(ScriptedDevice {
            script: Arc::clone(&self.script),
            claim,
            scanning: false,
        }))
    }
}

/// Device returning the reads queued in its [`DeviceScript`].
#[derive(Debug)]
pub struct ScriptedDevice {
    script: Arc<DeviceScript>,
    claim: Claim,
    scanning: bool,
}

impl ScanDevice for ScriptedDevice {
    fn name(&self) -> &str {
        "scripted"
    }

    fn start_continuous_scan(
        &mut self,
        channel_mask: u8,
        _buffer_size_hint: usize,
        sample_rate: f64,
    ) -> SentinelResult<()> {
        self.scanning = true;
        self.script
            .scans_started
            .lock()
            .push((channel_mask, sample_rate));
        Ok(())
    }

    fn read_available(&mut self, _timeout: Duration) -> SentinelResult<ScanRead> {
        if !self.scanning {
            return Err(SentinelError::Device("scripted: read without scan".into()));
        }
        let delay = *self.script.read_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(message) = self.script.read_error.lock().clone() {
            return Err(SentinelError::Device(message));
        }
        self.script.reads_served.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.reads.lock().pop_front().unwrap_or_default())
    }

    fn stop_scan(&mut self) -> SentinelResult<()> {
        self.scanning = false;
        Ok(())
    }

    fn cleanup(&mut self) -> SentinelResult<()> {
        self.claim.release();
        Ok(())
    }
}
