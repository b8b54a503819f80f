//! DAQ device abstraction.
//!
//! A [`ScanDevice`] is one claimed analog input HAT running a continuous scan
//! into its internal buffer. The acquisition loop is the only caller of these
//! methods for the whole life of a scan; devices therefore take `&mut self`
//! and only need to be `Send`.

use std::time::Duration;

use crate::error::SentinelResult;

/// Result of one `read_available` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRead {
    /// Channel-interleaved samples in volts, oldest first
    pub data: Vec<f64>,
    /// The HAT could not keep up with the requested rate
    pub hardware_overrun: bool,
    /// The internal buffer filled before it was drained
    pub buffer_overrun: bool,
}

impl ScanRead {
    /// A read returning `data` with no error flags.
    pub fn samples(data: Vec<f64>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Classify the read. Overruns take precedence over any returned data,
    /// which is discarded since it no longer forms a contiguous sequence.
    pub fn classify(self) -> PollOutcome {
        if self.hardware_overrun {
            PollOutcome::HardwareOverrun
        } else if self.buffer_overrun {
            PollOutcome::BufferOverrun
        } else if self.data.is_empty() {
            PollOutcome::Empty
        } else {
            PollOutcome::Batch(self.data)
        }
    }
}

/// What one poll of the device yielded.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Samples ready for processing
    Batch(Vec<f64>),
    /// Hardware overrun, samples lost
    HardwareOverrun,
    /// Buffer overrun, samples lost
    BufferOverrun,
    /// Nothing buffered yet
    Empty,
}

/// A claimed DAQ device.
pub trait ScanDevice: Send {
    /// Human-readable identifier for logs and errors.
    fn name(&self) -> &str;

    /// Start a continuous scan of the channels in `channel_mask` at
    /// `sample_rate` samples per second per channel.
    ///
    /// `buffer_size_hint` is the requested internal buffer size in samples per
    /// channel.
    fn start_continuous_scan(
        &mut self,
        channel_mask: u8,
        buffer_size_hint: usize,
        sample_rate: f64,
    ) -> SentinelResult<()>;

    /// Return every sample buffered since the last read. Implementations
    /// return immediately; `timeout` exists for API parity with the HAT
    /// library and is ignored when reading all available samples.
    fn read_available(&mut self, timeout: Duration) -> SentinelResult<ScanRead>;

    /// Stop the running scan.
    fn stop_scan(&mut self) -> SentinelResult<()>;

    /// Release the device; it may be opened again afterwards.
    fn cleanup(&mut self) -> SentinelResult<()>;
}

/// Opens (claims) the DAQ device.
///
/// At most one opened device may exist at a time; opening while another
/// handle is still claimed fails with
/// [`SentinelError::DeviceBusy`](crate::error::SentinelError::DeviceBusy).
pub trait DeviceFactory: Send + Sync {
    /// Claim the device.
    fn open(&self) -> SentinelResult<Box<dyn ScanDevice>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrun_flags_discard_data() {
        let read = ScanRead {
            data: vec![1.0, 2.0],
            hardware_overrun: true,
            buffer_overrun: true,
        };
        assert_eq!(read.classify(), PollOutcome::HardwareOverrun);

        let read = ScanRead {
            data: vec![1.0, 2.0],
            hardware_overrun: false,
            buffer_overrun: true,
        };
        assert_eq!(read.classify(), PollOutcome::BufferOverrun);
    }

    #[test]
    fn empty_and_data_reads_are_classified() {
        assert_eq!(ScanRead::default().classify(), PollOutcome::Empty);
        assert_eq!(
            ScanRead::samples(vec![0.5]).classify(),
            PollOutcome::Batch(vec![0.5])
        );
    }
}
