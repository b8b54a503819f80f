//! Post-acquisition processing of one device read.
//!
//! A batch is a flat, channel-interleaved run of samples, oldest first:
//! `[ch0@t0, ch1@t0, ..., chN@t0, ch0@t1, ...]`. Only the capture time of the
//! newest scan is known, so timestamps are reconstructed backwards from it at
//! the configured scan rate: scan `i`, counted from the newest, was taken at
//! `end - i / rate`.

use std::collections::{BTreeMap, HashMap};

use crate::acquisition::{ActiveConfiguration, ChannelSpec};
use crate::calc::CalcError;
use crate::delivery::{Fragment, Timestamp};
use crate::error::{SentinelError, SentinelResult};

/// One device read.
#[derive(Debug, Clone)]
pub struct AcquisitionBatch {
    /// Samples, channel-interleaved, oldest first
    pub samples: Vec<f64>,
    /// Capture time of the newest scan, seconds since the Unix epoch
    pub end_timestamp: f64,
    /// Scan rate the samples were captured at
    pub sample_rate: f64,
    /// Position in the loop's read sequence
    pub sequence: u64,
}

/// All channel values of one scan and its reconstructed time.
#[derive(Debug, Clone, Copy)]
pub struct ReconstructedSample<'a> {
    /// Reconstructed capture time
    pub timestamp: f64,
    channels: &'a [ChannelSpec],
    values: &'a [f64],
}

impl<'a> ReconstructedSample<'a> {
    /// Value of the channel tagged `tag`.
    pub fn value(&self, tag: &str) -> Option<f64> {
        self.channels
            .iter()
            .position(|c| c.tag == tag)
            .and_then(|i| self.values.get(i).copied())
    }

    /// Values in channel order.
    pub fn values(&self) -> &'a [f64] {
        self.values
    }

    /// Tag -> value map.
    pub fn to_map(&self) -> HashMap<String, f64> {
        self.channels
            .iter()
            .zip(self.values)
            .map(|(c, v)| (c.tag.clone(), *v))
            .collect()
    }
}

/// A computed value of one derived measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMeasurementPoint {
    /// Table name, `<configuration>_<measurement>`
    pub measurement: String,
    /// Reconstructed capture time
    pub timestamp: f64,
    /// Computed value
    pub value: f64,
}

/// A point that could not be computed.
#[derive(Debug, Clone, PartialEq)]
pub struct PointFailure {
    /// Table name of the measurement
    pub measurement: String,
    /// Reconstructed capture time
    pub timestamp: f64,
    /// Why evaluation failed
    pub error: CalcError,
}

/// Output of [`BatchProcessor::process`].
#[derive(Debug, Clone, Default)]
pub struct ProcessedBatch {
    /// Computed points, newest scan first, measurements in configuration order
    pub points: Vec<DerivedMeasurementPoint>,
    /// Skipped points
    pub failures: Vec<PointFailure>,
    /// Scans in the batch
    pub scans: usize,
}

impl ProcessedBatch {
    /// Group points into one delivery fragment per measurement.
    pub fn into_fragments(self) -> Vec<Fragment> {
        let mut grouped: BTreeMap<String, BTreeMap<Timestamp, f64>> = BTreeMap::new();
        for point in self.points {
            grouped
                .entry(point.measurement)
                .or_default()
                .insert(Timestamp::from_secs(point.timestamp), point.value);
        }
        grouped
            .into_iter()
            .map(|(measurement, values)| Fragment {
                measurement,
                values,
            })
            .collect()
    }
}

/// Reconstructs samples and evaluates derived measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProcessor;

impl BatchProcessor {
    /// Split `batch` into scans, newest first, with reconstructed timestamps.
    pub fn reconstruct<'a>(
        batch: &'a AcquisitionBatch,
        config: &'a ActiveConfiguration,
    ) -> SentinelResult<impl Iterator<Item = ReconstructedSample<'a>> + 'a> {
        let channels = config.channel_count();
        if channels == 0 || batch.samples.len() % channels != 0 {
            return Err(SentinelError::MalformedBatch {
                samples: batch.samples.len(),
                channels,
            });
        }
        if !batch.sample_rate.is_finite() || batch.sample_rate <= 0.0 {
            return Err(SentinelError::InvalidScanRate {
                rate: batch.sample_rate,
            });
        }

        let end = batch.end_timestamp;
        let rate = batch.sample_rate;
        Ok(batch
            .samples
            .chunks_exact(channels)
            .rev()
            .enumerate()
            .map(move |(i, values)| ReconstructedSample {
                timestamp: end - i as f64 / rate,
                channels: &config.channels,
                values,
            }))
    }

    /// Evaluate every measurement of `config` for every scan in `batch`.
    ///
    /// A failed evaluation skips that point only and is reported in
    /// [`ProcessedBatch::failures`].
    pub fn process(
        batch: &AcquisitionBatch,
        config: &ActiveConfiguration,
    ) -> SentinelResult<ProcessedBatch> {
        let mut out = ProcessedBatch {
            points: Vec::with_capacity(
                batch.samples.len() / config.channel_count().max(1) * config.measurements.len(),
            ),
            ..Default::default()
        };

        for sample in Self::reconstruct(batch, config)? {
            out.scans += 1;
            for measurement in &config.measurements {
                match measurement.expression.evaluate(sample.values()) {
                    Ok(value) => out.points.push(DerivedMeasurementPoint {
                        measurement: measurement.table.clone(),
                        timestamp: sample.timestamp,
                        value,
                    }),
                    Err(error) => out.failures.push(PointFailure {
                        measurement: measurement.table.clone(),
                        timestamp: sample.timestamp,
                        error,
                    }),
                }
            }
        }
        Ok(out)
    }
}
