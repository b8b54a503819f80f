//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a JSON file (`config/sentinel.json` by default)
//! 2. environment variables prefixed with `SENTINEL_`, using `__` to separate
//!    nested keys (e.g. `SENTINEL_DatabaseConfig__WriteIntervalMs=500`)
//!
//! Keys use PascalCase, matching the configuration files written for the lab
//! rig. After extraction the configuration is validated once; every problem is
//! a fatal [`SentinelError::Configuration`] raised before any component starts.
//! Validation also normalizes each measurement configuration into an
//! [`ActiveConfiguration`]: scan rates become samples per second, expressions
//! are parsed and bound to channel positions, and the poll interval is fixed.
//!
//! # Example
//! ```no_run
//! use sentinel::config::SentinelConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SentinelConfig::load_from("config/sentinel.json")?;
//! let configurations = config.measurement_configurations()?;
//! println!("{} measurement configurations", configurations.len());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::{ActiveConfiguration, ChannelSpec, DerivedMeasurement, TerminationPolicy};
use crate::calc::Expression;
use crate::error::{SentinelError, SentinelResult};
use crate::relay::gpio::board_to_bcm;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/sentinel.json";

/// Header pins that are wired to other functions on the HAT stack.
pub const GPIO_PROHIBITED_PINS: [u8; 7] = [8, 9, 10, 11, 12, 13, 26];

/// Number of analog inputs on the HAT.
pub const MAX_CHANNELS: u8 = 8;

/// Fraction of the device buffering horizon used as the default poll interval.
const DEFAULT_POLL_FRACTION: f64 = 0.8;

/// Upper bound for the derived default poll interval.
const MAX_DEFAULT_POLL: Duration = Duration::from_secs(1);

/// Loop termination waits this many poll intervals unless configured otherwise.
const DEFAULT_STOP_TIMEOUT_POLLS: u32 = 10;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SentinelConfig {
    /// Persistence settings
    pub database_config: DatabaseConfig,
    /// Ordered list of measurement configurations
    pub measurement_config: Vec<MeasurementConfig>,
    /// Switching, relay and loop tuning
    pub measurement_control: MeasurementControl,
    /// DAQ device selection
    #[serde(default)]
    pub device: DeviceConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseConfig {
    /// Base name of database files
    pub name: String,
    /// Directory databases are created in
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Period of the cache write-back in milliseconds
    #[serde(default = "default_write_interval")]
    pub write_interval_ms: u64,
    /// Number of write-backs after which a new database file is started (0 = never)
    #[serde(default)]
    pub change_interval: u64,
}

/// One measurement configuration as written in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeasurementConfig {
    /// Configuration name, prefix of every table it produces
    pub name: String,
    /// Scan rate in samples per second per channel
    #[serde(default)]
    pub scan_rate_hz: Option<f64>,
    /// Scan period in milliseconds (alternative to `ScanRateHz`)
    #[serde(default)]
    pub scan_period_ms: Option<f64>,
    /// Channel number -> tag
    pub channels: BTreeMap<String, String>,
    /// Measurement name -> expression over tags
    #[serde(default)]
    pub measurements: BTreeMap<String, String>,
    /// Relay direction while this configuration is active
    #[serde(default)]
    pub output_state: bool,
}

/// Measurement control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeasurementControl {
    /// Header pins driving the H-bridge: `[A, B/C, D]`
    pub meas_conf_output_gpio: [u8; 3],
    /// Period of automatic configuration switching in milliseconds (0 = disabled)
    #[serde(default)]
    pub auto_switch_interval_ms: u64,
    /// Index of the configuration active at startup
    #[serde(default)]
    pub initial_configuration: usize,
    /// Device poll interval; derived from the buffering horizon when absent
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Bound on loop termination during reconfiguration (0 = wait forever)
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
    /// Batches allowed in processing at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_batches: usize,
    /// Relay drive pulse length in milliseconds
    #[serde(default = "default_relay_phase")]
    pub drive_time_ms: u64,
    /// Relay active flyback length in milliseconds
    #[serde(default = "default_relay_phase")]
    pub flyback_time_ms: u64,
    /// GPIO backend
    #[serde(default)]
    pub relay: RelayKind,
}

/// GPIO backend for the relay driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    /// Linux sysfs GPIO
    Sysfs,
    /// Pin writes are recorded and logged only
    #[default]
    Simulated,
}

/// DAQ device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceConfig {
    /// Device implementation
    #[serde(default)]
    pub kind: DeviceKind,
    /// HAT address on the stack
    #[serde(default)]
    pub address: u8,
    /// Internal scan buffer size in samples per channel
    #[serde(default = "default_buffer_size")]
    pub buffer_size_per_channel: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::default(),
            address: 0,
            buffer_size_per_channel: default_buffer_size(),
        }
    }
}

/// DAQ device implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Waveform generator with HAT-like buffering and overrun behavior
    #[default]
    Simulated,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line, no colors
    Compact,
    /// Structured JSON
    Json,
}

// Default value functions
fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_write_interval() -> u64 {
    1000
}

fn default_max_in_flight() -> usize {
    4
}

fn default_relay_phase() -> u64 {
    1000
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SentinelConfig {
    /// Load from the default path and environment, then validate.
    pub fn load() -> SentinelResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SentinelResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SentinelError::Configuration(format!(
                "configuration file '{}' does not exist",
                path.display()
            )));
        }
        Self::from_figment(
            Figment::new()
                .merge(Json::file(path))
                .merge(Env::prefixed("SENTINEL_").split("__").lowercase(false)),
        )
    }

    /// Extract from an arbitrary figment, then validate.
    pub fn from_figment(figment: Figment) -> SentinelResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> SentinelResult<()> {
        let db = &self.database_config;
        if !is_table_name(&db.name) {
            return Err(invalid(format!(
                "DatabaseConfig.Name '{}' must be non-empty and contain only letters, digits and '_'",
                db.name
            )));
        }
        if db.write_interval_ms == 0 {
            return Err(invalid("DatabaseConfig.WriteIntervalMs must be greater than 0"));
        }

        let control = &self.measurement_control;
        if self.measurement_config.is_empty() {
            return Err(invalid("MeasurementConfig must contain at least one configuration"));
        }
        if control.initial_configuration >= self.measurement_config.len() {
            return Err(invalid(format!(
                "MeasurementControl.InitialConfiguration {} is out of range ({} configurations)",
                control.initial_configuration,
                self.measurement_config.len()
            )));
        }
        if control.max_in_flight_batches == 0 {
            return Err(invalid("MeasurementControl.MaxInFlightBatches must be at least 1"));
        }
        validate_gpio(&control.meas_conf_output_gpio)?;

        if self.device.buffer_size_per_channel == 0 {
            return Err(invalid("Device.BufferSizePerChannel must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid Logging.Level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let mut names = HashSet::new();
        for measurement in &self.measurement_config {
            if !names.insert(measurement.name.as_str()) {
                return Err(invalid(format!(
                    "Duplicate measurement configuration name: {}",
                    measurement.name
                )));
            }
        }

        // Building every configuration performs the per-configuration checks.
        let configurations = self.measurement_configurations()?;

        // `<config>_<measurement>` can collide across configurations.
        let mut tables = HashSet::new();
        for configuration in &configurations {
            for table in configuration.table_names() {
                if !tables.insert(table.clone()) {
                    return Err(invalid(format!(
                        "Configuration '{}': table '{table}' is already written by another configuration",
                        configuration.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Normalize every measurement configuration, in file order.
    pub fn measurement_configurations(&self) -> SentinelResult<Vec<Arc<ActiveConfiguration>>> {
        self.measurement_config
            .iter()
            .enumerate()
            .map(|(index, measurement)| self.normalize(index, measurement).map(Arc::new))
            .collect()
    }

    /// Every table any configuration can write to.
    pub fn table_names(&self) -> SentinelResult<Vec<String>> {
        Ok(self
            .measurement_configurations()?
            .iter()
            .flat_map(|config| config.table_names())
            .collect())
    }

    /// Termination wait applied when stopping an acquisition loop.
    pub fn termination_policy(&self) -> TerminationPolicy {
        match self.measurement_control.stop_timeout_ms {
            None => TerminationPolicy::PollMultiple(DEFAULT_STOP_TIMEOUT_POLLS),
            Some(0) => TerminationPolicy::Unbounded,
            Some(ms) => TerminationPolicy::Fixed(Duration::from_millis(ms)),
        }
    }

    /// Period of automatic switching, if enabled.
    pub fn auto_switch_interval(&self) -> Option<Duration> {
        match self.measurement_control.auto_switch_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn normalize(
        &self,
        index: usize,
        measurement: &MeasurementConfig,
    ) -> SentinelResult<ActiveConfiguration> {
        let name = &measurement.name;
        if !is_table_name(name) {
            return Err(invalid(format!(
                "MeasurementConfig[{index}].Name '{name}' must be non-empty and contain only letters, digits and '_'"
            )));
        }

        let scan_rate_hz = normalize_scan_rate(name, measurement)?;

        if measurement.channels.is_empty() {
            return Err(invalid(format!("Configuration '{name}' has no channels")));
        }
        let mut channels = Vec::with_capacity(measurement.channels.len());
        let mut tags = HashSet::new();
        for (number, tag) in &measurement.channels {
            let number: u8 = number.trim().parse().map_err(|_| {
                invalid(format!(
                    "Configuration '{name}': channel key '{number}' is not a channel number"
                ))
            })?;
            if number >= MAX_CHANNELS {
                return Err(invalid(format!(
                    "Configuration '{name}': channel {number} does not exist (0..{MAX_CHANNELS})"
                )));
            }
            if !is_identifier(tag) {
                return Err(invalid(format!(
                    "Configuration '{name}': channel tag '{tag}' is not a valid identifier"
                )));
            }
            if !tags.insert(tag.as_str()) {
                return Err(invalid(format!(
                    "Configuration '{name}': duplicate channel tag '{tag}'"
                )));
            }
            channels.push(ChannelSpec {
                number,
                tag: tag.clone(),
            });
        }
        // The HAT interleaves samples in ascending channel order.
        channels.sort_by_key(|channel| channel.number);
        if channels.windows(2).any(|pair| pair[0].number == pair[1].number) {
            return Err(invalid(format!(
                "Configuration '{name}': a channel number appears twice"
            )));
        }
        let ordered_tags: Vec<&str> = channels.iter().map(|c| c.tag.as_str()).collect();

        let mut measurements = Vec::with_capacity(measurement.measurements.len());
        for (measurement_name, text) in &measurement.measurements {
            if !is_table_name(measurement_name) {
                return Err(invalid(format!(
                    "Configuration '{name}': measurement name '{measurement_name}' must contain only letters, digits and '_'"
                )));
            }
            let expression = Expression::parse(text).map_err(|e| {
                invalid(format!("Configuration '{name}', measurement '{measurement_name}': {e}"))
            })?;
            let bound = expression.bind(&ordered_tags).map_err(|e| {
                invalid(format!("Configuration '{name}', measurement '{measurement_name}': {e}"))
            })?;
            measurements.push(DerivedMeasurement::new(name, measurement_name, bound));
        }

        let poll_interval = self.poll_interval_for(name, scan_rate_hz)?;

        Ok(ActiveConfiguration {
            index,
            name: name.clone(),
            scan_rate_hz,
            channels,
            measurements,
            output_state: measurement.output_state,
            poll_interval,
            buffer_size_per_channel: self.device.buffer_size_per_channel,
        })
    }

    /// Poll interval for a configuration; always strictly below the time the
    /// device buffer can hold at `scan_rate_hz`.
    fn poll_interval_for(&self, name: &str, scan_rate_hz: f64) -> SentinelResult<Duration> {
        let horizon = self.device.buffer_size_per_channel as f64 / scan_rate_hz;
        let default_interval = Duration::try_from_secs_f64(horizon * DEFAULT_POLL_FRACTION)
            .map_err(|_| {
                invalid(format!(
                    "Configuration '{name}': scan rate {scan_rate_hz} Hz gives an unrepresentable buffering horizon"
                ))
            })?;
        let interval = match self.measurement_control.poll_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => default_interval.min(MAX_DEFAULT_POLL),
        };
        if interval.is_zero() || interval.as_secs_f64() >= horizon {
            return Err(invalid(format!(
                "Configuration '{name}': poll interval {interval:?} must be non-zero and shorter than the device buffering horizon of {horizon:.3} s"
            )));
        }
        Ok(interval)
    }
}

fn normalize_scan_rate(name: &str, measurement: &MeasurementConfig) -> SentinelResult<f64> {
    let rate = match (measurement.scan_rate_hz, measurement.scan_period_ms) {
        (Some(hz), None) => hz,
        (None, Some(ms)) if ms > 0.0 => 1000.0 / ms,
        (None, Some(ms)) => ms,
        (Some(_), Some(_)) => {
            return Err(invalid(format!(
                "Configuration '{name}': specify either ScanRateHz or ScanPeriodMs, not both"
            )))
        }
        (None, None) => {
            return Err(invalid(format!(
                "Configuration '{name}': missing ScanRateHz or ScanPeriodMs"
            )))
        }
    };
    if !rate.is_finite() || rate <= 0.0 {
        return Err(SentinelError::InvalidScanRate { rate });
    }
    Ok(rate)
}

fn validate_gpio(pins: &[u8; 3]) -> SentinelResult<()> {
    let mut seen = HashSet::new();
    for pin in pins {
        if GPIO_PROHIBITED_PINS.contains(pin) {
            return Err(invalid(format!(
                "MeasurementControl.MeasConfOutputGpio defines prohibited GPIO pin {pin}"
            )));
        }
        if board_to_bcm(*pin).is_none() {
            return Err(invalid(format!(
                "MeasurementControl.MeasConfOutputGpio: header pin {pin} is not a GPIO"
            )));
        }
        if !seen.insert(pin) {
            return Err(invalid(format!(
                "MeasurementControl.MeasConfOutputGpio uses pin {pin} twice"
            )));
        }
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> SentinelError {
    SentinelError::Configuration(message.into())
}

/// Letters, digits and `_`; usable as a table name.
fn is_table_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// A table name that does not start with a digit; usable as a channel tag.
fn is_identifier(name: &str) -> bool {
    is_table_name(name) && !name.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASE: &str = r#"{
        "DatabaseConfig": { "Name": "sentinelDb", "WriteIntervalMs": 500, "ChangeInterval": 10 },
        "MeasurementConfig": [
            {
                "Name": "open",
                "ScanRateHz": 100,
                "Channels": { "1": "B", "0": "A" },
                "Measurements": { "sum": "A + B", "diff": "A - B" },
                "OutputState": true
            },
            {
                "Name": "loaded",
                "ScanPeriodMs": 20,
                "Channels": { "2": "U" },
                "Measurements": { "power": "U^2 / 47" }
            }
        ],
        "MeasurementControl": { "MeasConfOutputGpio": [29, 31, 33] }
    }"#;

    #[test]
    fn vanishing_scan_rate_is_a_configuration_error() {
        let json = patched(|v| v["MeasurementConfig"][0]["ScanRateHz"] = serde_json::json!(1e-300));
        assert!(matches!(from_json(&json), Err(SentinelError::Configuration(_))));

        let json = patched(|v| v["MeasurementConfig"][1]["ScanPeriodMs"] = serde_json::json!(1e305));
        assert!(matches!(from_json(&json), Err(SentinelError::Configuration(_))));
    }

    #[test]
    fn colliding_table_names_are_rejected() {
        let json = patched(|v| {
            v["MeasurementConfig"][0]["Name"] = serde_json::json!("a_b");
            v["MeasurementConfig"][0]["Measurements"] = serde_json::json!({ "c": "A + B" });
            v["MeasurementConfig"][1]["Name"] = serde_json::json!("a");
            v["MeasurementConfig"][1]["Measurements"] = serde_json::json!({ "b_c": "U" });
        });
        let err = from_json(&json).unwrap_err();
        assert!(
            matches!(err, SentinelError::Configuration(ref msg) if msg.contains("a_b_c")),
            "{err}"
        );
    }

    fn from_json(json: &str) -> SentinelResult<SentinelConfig> {
        SentinelConfig::from_figment(Figment::new().merge(Json::string(json)))
    }

    fn patched(f: impl FnOnce(&mut serde_json::Value)) -> String {
        let mut value: serde_json::Value = serde_json::from_str(BASE).unwrap();
        f(&mut value);
        value.to_string()
    }

    #[test]
    fn loads_and_normalizes_configurations() {
        let config = from_json(BASE).unwrap();
        let configs = config.measurement_configurations().unwrap();
        assert_eq!(configs.len(), 2);

        let open = &configs[0];
        assert_eq!(open.scan_rate_hz, 100.0);
        assert_eq!(open.tags(), vec!["A", "B"]);
        assert_eq!(open.channel_mask(), 0b11);
        assert!(open.output_state);
        assert_eq!(
            open.table_names(),
            vec!["open_diff".to_string(), "open_sum".to_string()]
        );

        let loaded = &configs[1];
        assert_eq!(loaded.scan_rate_hz, 50.0);
        assert_eq!(loaded.channel_mask(), 0b100);
        assert!(!loaded.output_state);
    }

    #[test]
    fn default_poll_interval_stays_inside_buffer_horizon() {
        let config = from_json(BASE).unwrap();
        for active in config.measurement_configurations().unwrap() {
            let horizon = active.buffer_size_per_channel as f64 / active.scan_rate_hz;
            assert!(active.poll_interval.as_secs_f64() < horizon);
            assert!(active.poll_interval <= MAX_DEFAULT_POLL);
        }
    }

    #[test]
    fn poll_interval_longer_than_horizon_is_rejected() {
        let json = patched(|v| {
            v["Device"] = serde_json::json!({ "BufferSizePerChannel": 10 });
            v["MeasurementControl"]["PollIntervalMs"] = serde_json::json!(500);
        });
        let err = from_json(&json).unwrap_err();
        assert!(err.to_string().contains("horizon"), "{err}");
    }

    #[test]
    fn non_positive_scan_rate_is_rejected() {
        let json = patched(|v| v["MeasurementConfig"][0]["ScanRateHz"] = serde_json::json!(0));
        assert!(matches!(
            from_json(&json),
            Err(SentinelError::InvalidScanRate { .. })
        ));
    }

    #[test]
    fn both_rate_forms_are_rejected() {
        let json = patched(|v| v["MeasurementConfig"][0]["ScanPeriodMs"] = serde_json::json!(10));
        assert!(from_json(&json).is_err());
    }

    #[test]
    fn prohibited_gpio_is_rejected() {
        let json = patched(|v| {
            v["MeasurementControl"]["MeasConfOutputGpio"] = serde_json::json!([29, 12, 33])
        });
        let err = from_json(&json).unwrap_err();
        assert!(err.to_string().contains("prohibited"), "{err}");
    }

    #[test]
    fn non_gpio_header_pin_is_rejected() {
        let json = patched(|v| {
            v["MeasurementControl"]["MeasConfOutputGpio"] = serde_json::json!([29, 1, 33])
        });
        assert!(from_json(&json).is_err());
    }

    #[test]
    fn expression_with_foreign_tag_is_rejected() {
        let json = patched(|v| {
            v["MeasurementConfig"][1]["Measurements"]["power"] = serde_json::json!("U * A")
        });
        let err = from_json(&json).unwrap_err();
        assert!(err.to_string().contains("Unknown channel tag 'A'"), "{err}");
    }

    #[test]
    fn malformed_expression_is_rejected() {
        let json = patched(|v| {
            v["MeasurementConfig"][0]["Measurements"]["sum"] = serde_json::json!("A + (B")
        });
        assert!(from_json(&json).is_err());
    }

    #[test]
    fn table_unsafe_names_are_rejected() {
        let json = patched(|v| v["MeasurementConfig"][0]["Name"] = serde_json::json!("open; DROP"));
        assert!(from_json(&json).is_err());
    }

    #[test]
    fn initial_configuration_must_exist() {
        let json = patched(|v| {
            v["MeasurementControl"]["InitialConfiguration"] = serde_json::json!(2)
        });
        assert!(from_json(&json).is_err());
    }

    #[test]
    fn termination_policy_follows_stop_timeout() {
        let config = from_json(BASE).unwrap();
        assert_eq!(
            config.termination_policy(),
            TerminationPolicy::PollMultiple(DEFAULT_STOP_TIMEOUT_POLLS)
        );

        let json = patched(|v| v["MeasurementControl"]["StopTimeoutMs"] = serde_json::json!(0));
        assert_eq!(
            from_json(&json).unwrap().termination_policy(),
            TerminationPolicy::Unbounded
        );
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = SentinelConfig::load_from("/nonexistent/sentinel.json").unwrap_err();
        assert!(matches!(err, SentinelError::Configuration(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BASE.as_bytes()).unwrap();
        let config = SentinelConfig::load_from(file.path()).unwrap();
        assert_eq!(config.database_config.name, "sentinelDb");
        assert_eq!(config.database_config.write_interval_ms, 500);
        assert_eq!(config.auto_switch_interval(), None);
    }
}
