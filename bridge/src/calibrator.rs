//! Per-sensor baseline/noise calibration (spec §4.3).
//!
//! Each sensor accumulates raw frames until it has enough samples (or times
//! out), filters outliers by IQR on magnitude, and freezes a per-axis zero
//! offset plus a magnitude noise floor. The detector must not arm for a
//! sensor until its [`Calibrator`] reports [`CalibrationOutcome::Complete`].

use bridge_types::{SensorBaseline, SensorFrame};

/// Tunables lifted from `Config::calibration` / `Config::sensor_ble` — kept
/// as plain fields here so the calibrator has no dependency on `config.rs`.
#[derive(Debug, Clone, Copy)]
pub struct CalibratorConfig {
    pub target_samples: usize,
    pub timeout_s: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    /// Still accumulating samples.
    Pending,
    Complete(SensorBaseline),
    /// Sensor produced no samples for `timeout_s`; best-effort defaults follow.
    TimedOut(SensorBaseline),
    /// Target sample count reached, but the IQR-filtered baseline has a zero
    /// noise floor — arming a detector on it would treat every sample as a
    /// peak. The sensor stays disarmed until it's explicitly recalibrated.
    Degenerate,
}

/// Accumulates raw frames for one sensor and produces a [`SensorBaseline`]
/// once `target_samples` have arrived or the calibrator is asked to give up.
pub struct Calibrator {
    sensor_id: String,
    config: CalibratorConfig,
    frames: Vec<SensorFrame>,
    completed: bool,
}

impl Calibrator {
    pub fn new(sensor_id: impl Into<String>, config: CalibratorConfig) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            config,
            frames: Vec::with_capacity(config.target_samples),
            completed: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn sample_count(&self) -> usize {
        self.frames.len()
    }

    /// Feed one calibration-phase sample. Returns `Complete` the instant the
    /// target sample count is reached; the caller owns advancing a timeout
    /// clock and calling [`Calibrator::finish_on_timeout`] if samples never
    /// arrive.
    pub fn push(&mut self, frame: SensorFrame) -> CalibrationOutcome {
        if self.completed {
            return CalibrationOutcome::Pending;
        }
        self.frames.push(frame);
        if self.frames.len() >= self.config.target_samples {
            let baseline = self.compute_baseline(true);
            self.completed = true;
            if baseline.noise_sigma_mg <= 0.0 {
                CalibrationOutcome::Degenerate
            } else {
                CalibrationOutcome::Complete(baseline)
            }
        } else {
            CalibrationOutcome::Pending
        }
    }

    /// Called when `timeout_s` has elapsed with fewer than `target_samples`
    /// collected. Produces best-effort defaults from whatever arrived (zero
    /// offset if nothing arrived at all, per spec §4.3 step 5).
    pub fn finish_on_timeout(&mut self) -> CalibrationOutcome {
        if self.completed {
            return CalibrationOutcome::Pending;
        }
        self.completed = true;
        CalibrationOutcome::TimedOut(self.compute_baseline(false))
    }

    /// Discards all accumulated state; a fresh calibration run starts on the
    /// next `push`. Used by explicit `recalibrate(sensor_id)` (spec §4.3) and
    /// by reconnect handling when `recalibrate_on_reconnect` is set.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.completed = false;
    }

    fn compute_baseline(&self, filter_outliers: bool) -> SensorBaseline {
        if self.frames.is_empty() {
            return SensorBaseline {
                sensor_id: self.sensor_id.clone(),
                zero_offset_mg: (0.0, 0.0, 0.0),
                noise_sigma_mg: 0.0,
                sample_count: 0,
                completed: true,
            };
        }

        let kept: Vec<&SensorFrame> = if filter_outliers {
            let (lo, hi) = magnitude_iqr_bounds(&self.frames);
            self.frames
                .iter()
                .filter(|f| f.magnitude_mg >= lo && f.magnitude_mg <= hi)
                .collect()
        } else {
            self.frames.iter().collect()
        };

        let kept: Vec<&SensorFrame> = if kept.is_empty() {
            self.frames.iter().collect()
        } else {
            kept
        };

        let n = kept.len() as f64;
        let (sum_x, sum_y, sum_z) = kept.iter().fold((0.0, 0.0, 0.0), |acc, f| {
            (acc.0 + f.vx_mg as f64, acc.1 + f.vy_mg as f64, acc.2 + f.vz_mg as f64)
        });
        let mean = (sum_x / n, sum_y / n, sum_z / n);

        let mean_mag = kept.iter().map(|f| f.magnitude_mg).sum::<f64>() / n;
        let variance = kept
            .iter()
            .map(|f| (f.magnitude_mg - mean_mag).powi(2))
            .sum::<f64>()
            / n;

        SensorBaseline {
            sensor_id: self.sensor_id.clone(),
            zero_offset_mg: mean,
            noise_sigma_mg: variance.sqrt(),
            sample_count: kept.len() as u32,
            completed: true,
        }
    }

    pub fn timeout_s(&self) -> u64 {
        self.config.timeout_s
    }
}

/// Tukey-fence bounds `[Q1 - 1.5*IQR, Q3 + 1.5*IQR]` over sample magnitude.
fn magnitude_iqr_bounds(frames: &[SensorFrame]) -> (f64, f64) {
    let mut magnitudes: Vec<f64> = frames.iter().map(|f| f.magnitude_mg).collect();
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let q1 = percentile(&magnitudes, 0.25);
    let q3 = percentile(&magnitudes, 0.75);
    let iqr = q3 - q1;
    (q1 - 1.5 * iqr, q3 + 1.5 * iqr)
}

/// Linear-interpolated percentile over an already-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}
