//! # bridge-types
//!
//! Shared wire, event, and row types for the steeltrace edge bridge.
//!
//! These types are used by:
//! - `bridge`: the BLE ingestion, detection, correlation and persistence pipeline
//! - any external admin/export surface that links against this crate for a
//!   stable view of the event and row shapes it must not need to guess at
//!
//! ## Time domains
//!
//! Every timestamped record carries both a monotonic timestamp (the
//! authoritative ordering domain, nanoseconds since an arbitrary bridge-local
//! epoch) and a wall-clock timestamp (milliseconds since the Unix epoch, for
//! human display and export only). Correlation and ordering logic must never
//! read the wall-clock field.

use serde::{Deserialize, Serialize};

// ── Time domain aliases ───────────────────────────────────────────────────────

/// Monotonic nanoseconds since an arbitrary bridge-local epoch.
pub type MonoNs = i64;
/// Unix epoch milliseconds, for display/export only.
pub type WallMs = i64;

/// MAC address (or equivalent stable identifier) of a BLE peripheral.
pub type DeviceId = String;
/// Alias of [`DeviceId`] scoped to accelerometer sensors, for readability.
pub type SensorId = String;
pub type TargetId = u32;

// ── Configuration / assignment entities (§3) ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerVendor {
    Amg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerAssignment {
    pub mac: String,
    pub vendor: TimerVendor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorAssignment {
    pub mac: String,
    pub label: String,
    pub target_id: TargetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeAssignment {
    pub bridge_id: String,
    pub display_name: String,
    pub stage_id: u32,
    pub timer: TimerAssignment,
    pub sensors: Vec<SensorAssignment>,
}

impl BridgeAssignment {
    /// Find the sensor assignment for a given target, if exactly one exists.
    ///
    /// A sensor is assigned to exactly one target at a time (spec §3); this
    /// looks the mapping up by target rather than assuming it.
    pub fn sensor_for_target(&self, target_id: TargetId) -> Option<&SensorAssignment> {
        self.sensors.iter().find(|s| s.target_id == target_id)
    }
}

// ── Frame records (§4.1) ──────────────────────────────────────────────────────

/// A decoded AMG-style timer frame. Parsers dispatch on the frame's tag byte(s)
/// and never panic on malformed input — unrecognized headers fall through to
/// `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimerFrame {
    Start {
        string_number: u8,
    },
    Shot {
        current_time_cs: u32,
        split_time_cs: u32,
        first_shot_time_cs: u32,
        /// Bytes 10..13 of the 14-byte frame — series/environmental fields of
        /// undocumented semantics. Exposed opaque per spec's open question.
        opaque: [u8; 3],
    },
    Stop {
        string_number: u8,
        total_time_cs: u32,
    },
    ShotSequenceBatch {
        shot_times_cs: Vec<u32>,
    },
    ScreenData {
        raw: Vec<u8>,
    },
    Unknown {
        raw: Vec<u8>,
    },
}

/// A decoded BT50-style accelerometer frame (20 bytes, magic `0x55 0x61`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    pub vx_mg: i16,
    pub vy_mg: i16,
    pub vz_mg: i16,
    pub magnitude_mg: f64,
    /// Remaining bytes of the 20-byte frame beyond the magic + 3 axes,
    /// of undocumented semantics (spec's open question). Present only when
    /// the verbose capture variant is in effect; zero-filled otherwise.
    pub opaque: [u8; 12],
}

impl SensorFrame {
    pub fn new(vx_mg: i16, vy_mg: i16, vz_mg: i16, opaque: [u8; 12]) -> Self {
        let magnitude_mg =
            ((vx_mg as f64).powi(2) + (vy_mg as f64).powi(2) + (vz_mg as f64).powi(2)).sqrt();
        Self {
            vx_mg,
            vy_mg,
            vz_mg,
            magnitude_mg,
            opaque,
        }
    }
}

// ── Runtime / bus / persistence entities (§3, §4.7, §4.8) ────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawSample {
    pub ts_mono_ns: MonoNs,
    pub ts_wall_ms: WallMs,
    pub vx_mg: f64,
    pub vy_mg: f64,
    pub vz_mg: f64,
    pub magnitude_mg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerEventKind {
    Start,
    Shot,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerEvent {
    pub device_id: DeviceId,
    pub ts_mono_ns: MonoNs,
    pub ts_wall_ms: WallMs,
    pub kind: TimerEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_cs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cs: Option<u32>,
    /// Set only on `TimerEventKind::Shot`: the id the correlator and the
    /// capture store both key on for this shot. `Start`/`Stop` events have
    /// no correlation identity, so this stays `None` for them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_id: Option<String>,
    pub raw_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactEvent {
    pub impact_id: String,
    pub sensor_id: SensorId,
    pub target_id: TargetId,
    pub ts_onset_mono_ns: MonoNs,
    pub ts_onset_wall_ms: WallMs,
    pub ts_peak_mono_ns: MonoNs,
    pub peak_magnitude: f64,
    pub duration_ms: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unmatched,
}

impl CorrelationQuality {
    /// Classify a standardized residual `|residual / sigma|` into a display
    /// quality label per spec §4.6.
    pub fn from_standardized_residual(abs_z: f64) -> Self {
        if abs_z <= 1.0 {
            Self::Excellent
        } else if abs_z <= 2.0 {
            Self::Good
        } else if abs_z <= 3.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub shot_id: String,
    pub impact_id: String,
    pub latency_ms: f64,
    pub residual_sigma: f64,
    pub quality: CorrelationQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingModel {
    pub mean_ms: f64,
    pub sigma_ms: f64,
    pub count: u64,
    pub last_updated_wall_ms: WallMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatusKind {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    CalibrationStarted,
    CalibrationComplete,
    CalibrationTimedOut,
    CalibrationDegenerate,
    SensorStalled,
    PersistenceDegraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub ts_wall_ms: WallMs,
    pub kind: DeviceStatusKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorBaseline {
    pub sensor_id: SensorId,
    pub zero_offset_mg: (f64, f64, f64),
    pub noise_sigma_mg: f64,
    pub sample_count: u32,
    pub completed: bool,
}

/// One fan-out event on the in-process bus (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    Timer(TimerEvent),
    RawSample(RawSample),
    Impact(ImpactEvent),
    Correlation(Correlation),
    Status(DeviceStatus),
    TimingUpdate(TimingModel),
}

// ── Derived read view (§4.8) ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotLogKind {
    Shot,
    Impact,
    TimerControl,
}

/// One row of the chronologically merged `shot_log` view: a timer event, an
/// impact, or both joined by a correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotLogRow {
    pub ts_mono_ns: MonoNs,
    pub ts_wall_ms: WallMs,
    pub kind: ShotLogKind,
    pub device_id: Option<String>,
    pub sensor_id: Option<String>,
    pub target_id: Option<TargetId>,
    pub shot_number: Option<u32>,
    pub split_cs: Option<u32>,
    pub total_cs: Option<u32>,
    pub peak_magnitude: Option<f64>,
    pub duration_ms: Option<f64>,
    pub confidence: Option<f64>,
    pub latency_ms: Option<f64>,
    pub residual_sigma: Option<f64>,
    pub quality: Option<CorrelationQuality>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_frame_magnitude_is_euclidean_norm() {
        let f = SensorFrame::new(3, 4, 0, [0; 12]);
        assert!((f.magnitude_mg - 5.0).abs() < 1e-9);
    }

    #[test]
    fn quality_thresholds_match_spec_boundaries() {
        assert_eq!(
            CorrelationQuality::from_standardized_residual(1.0),
            CorrelationQuality::Excellent
        );
        assert_eq!(
            CorrelationQuality::from_standardized_residual(1.5),
            CorrelationQuality::Good
        );
        assert_eq!(
            CorrelationQuality::from_standardized_residual(2.5),
            CorrelationQuality::Fair
        );
        assert_eq!(
            CorrelationQuality::from_standardized_residual(3.1),
            CorrelationQuality::Poor
        );
    }

    #[test]
    fn bridge_assignment_looks_up_sensor_by_target() {
        let assignment = BridgeAssignment {
            bridge_id: "bridge-1".into(),
            display_name: "Bay 1".into(),
            stage_id: 1,
            timer: TimerAssignment {
                mac: "AA:AA:AA:AA:AA:AA".into(),
                vendor: TimerVendor::Amg,
            },
            sensors: vec![SensorAssignment {
                mac: "BB:BB:BB:BB:BB:BB".into(),
                label: "Plate 1".into(),
                target_id: 1,
                battery_pct: Some(90),
            }],
        };
        assert!(assignment.sensor_for_target(1).is_some());
        assert!(assignment.sensor_for_target(2).is_none());
    }
}
