//! Bridge configuration: a TOML assignment file plus an environment-variable
//! overlay for the per-deployment tuning knobs listed in spec §6.
//!
//! The assignment section (bridge id, stage, timer MAC, sensor MACs/targets)
//! is config-store data and rarely changes per deployment; the threshold
//! section is the kind of knob operators tweak in the field, so it gets the
//! env-var overlay on top of whatever the TOML says.

use std::path::Path;
use std::str::FromStr;

use bridge_types::{BridgeAssignment, SensorAssignment, TimerAssignment, TimerVendor};
use btleplug::api::BDAddr;
use serde::Deserialize;

use crate::error::ConfigError;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// BLE service/characteristic UUIDs for one device class. Kept as config, not
/// hard-coded in `transport::ble`, so a UUID change never requires a rebuild.
#[derive(Debug, Clone, Deserialize)]
pub struct BleIdentifiers {
    pub service_uuid: String,
    pub notify_characteristic_uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_peak_threshold")]
    pub peak_threshold_mg: f64,
    #[serde(default = "default_onset_threshold")]
    pub onset_threshold_mg: f64,
    #[serde(default = "default_lookback_samples")]
    pub lookback_samples: usize,
    #[serde(default = "default_rest_samples")]
    pub rest_samples: usize,
    #[serde(default = "default_dead_time_ms")]
    pub dead_time_ms: i64,
}

fn default_peak_threshold() -> f64 {
    10.0
}
fn default_onset_threshold() -> f64 {
    3.0
}
fn default_lookback_samples() -> usize {
    10
}
fn default_rest_samples() -> usize {
    3
}
fn default_dead_time_ms() -> i64 {
    50
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            peak_threshold_mg: default_peak_threshold(),
            onset_threshold_mg: default_onset_threshold(),
            lookback_samples: default_lookback_samples(),
            rest_samples: default_rest_samples(),
            dead_time_ms: default_dead_time_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_calibration_samples")]
    pub target_samples: usize,
    #[serde(default = "default_calibration_timeout_s")]
    pub timeout_s: u64,
    #[serde(default)]
    pub recalibrate_on_reconnect: bool,
}

fn default_calibration_samples() -> usize {
    100
}
fn default_calibration_timeout_s() -> u64 {
    30
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target_samples: default_calibration_samples(),
            timeout_s: default_calibration_timeout_s(),
            // Open question in spec §9: left off by default. A field unit
            // rarely moves sensors between runs, and re-running calibration
            // on every transient disconnect would leave the detector
            // disarmed for up to 30s each time — worse for availability than
            // trusting the frozen baseline. Operators can flip this on.
            recalibrate_on_reconnect: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_prior_mean_ms")]
    pub prior_mean_ms: f64,
    #[serde(default = "default_prior_sigma_ms")]
    pub prior_sigma_ms: f64,
    #[serde(default = "default_window_sigma")]
    pub window_sigma: f64,
    #[serde(default = "default_n_min")]
    pub n_min: u64,
    #[serde(default = "default_late_arrival_hold_ms")]
    pub late_arrival_hold_ms: i64,
}

fn default_prior_mean_ms() -> f64 {
    526.0
}
fn default_prior_sigma_ms() -> f64 {
    94.0
}
fn default_window_sigma() -> f64 {
    3.0
}
fn default_n_min() -> u64 {
    10
}
fn default_late_arrival_hold_ms() -> i64 {
    250
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            prior_mean_ms: default_prior_mean_ms(),
            prior_sigma_ms: default_prior_sigma_ms(),
            window_sigma: default_window_sigma(),
            n_min: default_n_min(),
            late_arrival_hold_ms: default_late_arrival_hold_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_connect_deadline_s")]
    pub connect_deadline_s: u64,
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_connect_deadline_s() -> u64 {
    15
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            connect_deadline_s: default_connect_deadline_s(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_config_db_path")]
    pub config_db_path: String,
    #[serde(default = "default_capture_db_path")]
    pub capture_db_path: String,
    #[serde(default)]
    pub verbose_sample_capture: bool,
    #[serde(default = "default_write_budget_ms")]
    pub write_retry_budget_ms: u64,
    #[serde(default = "default_ndjson_path")]
    pub ndjson_path: String,
    #[serde(default = "default_ndjson_max_bytes")]
    pub ndjson_max_bytes: u64,
}

fn default_config_db_path() -> String {
    "steeltrace-config.db".to_string()
}
fn default_capture_db_path() -> String {
    "steeltrace-capture.db".to_string()
}
fn default_write_budget_ms() -> u64 {
    5_000
}
fn default_ndjson_path() -> String {
    "steeltrace-events.ndjson".to_string()
}
fn default_ndjson_max_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            config_db_path: default_config_db_path(),
            capture_db_path: default_capture_db_path(),
            verbose_sample_capture: false,
            write_retry_budget_ms: default_write_budget_ms(),
            ndjson_path: default_ndjson_path(),
            ndjson_max_bytes: default_ndjson_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bridge_id: String,
    pub display_name: String,
    pub stage_id: u32,
    pub timer: TimerAssignment,
    pub sensors: Vec<SensorAssignment>,
    pub timer_ble: BleIdentifiers,
    pub sensor_ble: BleIdentifiers,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw)?;
        config.apply_env_overlay();
        config.validate()?;
        Ok(config)
    }

    /// Overlay the environment-variable toggles documented in spec §6 on top
    /// of whatever the TOML file set, so operators can tweak thresholds
    /// without editing the assignment file.
    fn apply_env_overlay(&mut self) {
        self.persistence.verbose_sample_capture = env_or(
            "VERBOSE_SAMPLE_CAPTURE",
            self.persistence.verbose_sample_capture,
        );
        self.calibration.target_samples =
            env_or("CALIBRATION_SAMPLES", self.calibration.target_samples);
        self.detector.peak_threshold_mg =
            env_or("PEAK_THRESHOLD", self.detector.peak_threshold_mg);
        self.detector.onset_threshold_mg =
            env_or("ONSET_THRESHOLD", self.detector.onset_threshold_mg);
        self.detector.lookback_samples =
            env_or("LOOKBACK_SAMPLES", self.detector.lookback_samples);
        self.detector.dead_time_ms = env_or("DEAD_TIME_MS", self.detector.dead_time_ms);
        self.correlation.prior_mean_ms =
            env_or("CORRELATION_PRIOR_MEAN_MS", self.correlation.prior_mean_ms);
        self.correlation.prior_sigma_ms = env_or(
            "CORRELATION_PRIOR_SIGMA_MS",
            self.correlation.prior_sigma_ms,
        );
        self.correlation.window_sigma =
            env_or("CORRELATION_WINDOW_SIGMA", self.correlation.window_sigma);
        self.reconnect.backoff_initial_ms = env_or(
            "RECONNECT_BACKOFF_INITIAL_MS",
            self.reconnect.backoff_initial_ms,
        );
        self.reconnect.backoff_cap_ms =
            env_or("RECONNECT_BACKOFF_CAP_MS", self.reconnect.backoff_cap_ms);
    }

    /// Fatal-at-startup validation per spec §7 ("Configuration invalid").
    fn validate(&self) -> Result<(), ConfigError> {
        if BDAddr::from_str(&self.timer.mac).is_err() {
            return Err(ConfigError::UnknownMac(self.timer.mac.clone()));
        }

        let mut seen_targets = std::collections::HashSet::new();
        for sensor in &self.sensors {
            if BDAddr::from_str(&sensor.mac).is_err() {
                return Err(ConfigError::UnknownMac(sensor.mac.clone()));
            }
            if !seen_targets.insert(sensor.target_id) {
                return Err(ConfigError::DuplicateTarget(sensor.target_id));
            }
        }
        Ok(())
    }

    pub fn assignment(&self) -> BridgeAssignment {
        BridgeAssignment {
            bridge_id: self.bridge_id.clone(),
            display_name: self.display_name.clone(),
            stage_id: self.stage_id,
            timer: self.timer.clone(),
            sensors: self.sensors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        bridge_id = "bridge-1"
        display_name = "Bay 1"
        stage_id = 3

        [timer]
        mac = "AA:AA:AA:AA:AA:AA"
        vendor = "AMG"

        [[sensors]]
        mac = "BB:BB:BB:BB:BB:BB"
        label = "Plate 1"
        target_id = 1

        [[sensors]]
        mac = "CC:CC:CC:CC:CC:CC"
        label = "Plate 2"
        target_id = 2

        [timer_ble]
        service_uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        notify_characteristic_uuid = "6e400003-b5a3-f393-e0a9-e50e24dcca9e"

        [sensor_ble]
        service_uuid = "0000ffe5-0000-1000-8000-00805f9a34fb"
        notify_characteristic_uuid = "0000ffe4-0000-1000-8000-00805f9a34fb"
        "#
    }

    #[test]
    fn loads_defaults_when_sections_omitted() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.detector.peak_threshold_mg, 10.0);
        assert_eq!(config.calibration.target_samples, 100);
        assert_eq!(config.correlation.prior_mean_ms, 526.0);
    }

    #[test]
    fn rejects_duplicate_target_ids() {
        let toml_str = sample_toml().replace("target_id = 2", "target_id = 1");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateTarget(1))
        ));
    }

    #[test]
    fn timer_vendor_parses_screaming_snake_case() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.timer.vendor, TimerVendor::Amg);
    }

    #[test]
    fn rejects_malformed_sensor_mac() {
        let toml_str = sample_toml().replace("BB:BB:BB:BB:BB:BB", "not-a-mac");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownMac(mac)) if mac == "not-a-mac"));
    }

    #[test]
    fn rejects_malformed_timer_mac() {
        let toml_str = sample_toml().replace("AA:AA:AA:AA:AA:AA", "bogus");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownMac(mac)) if mac == "bogus"));
    }

    #[test]
    fn accepts_well_formed_macs() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert!(config.validate().is_ok());
    }
}
