//! Streaming dual-threshold onset/impact detector (spec §4.4).
//!
//! One [`Detector`] per sensor, fed calibrated magnitude samples in arrival
//! order. Contains no suspension points: it is a pure tick-in/result-out
//! state machine stepped by ring-buffer samples instead of wall-clock ticks.

use std::collections::VecDeque;

use bridge_types::MonoNs;

#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    pub peak_threshold_mg: f64,
    pub onset_threshold_mg: f64,
    pub lookback_samples: usize,
    /// K: consecutive below-peak samples required to close out a trigger.
    pub rest_samples: usize,
    pub dead_time_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    Idle,
    Triggered,
    DeadTime,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    ts_mono_ns: MonoNs,
    magnitude_mg: f64,
}

/// One impact, fully formed, ready to become a [`bridge_types::ImpactEvent`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedImpact {
    pub onset_ts_mono_ns: MonoNs,
    pub peak_ts_mono_ns: MonoNs,
    pub peak_magnitude: f64,
    pub duration_ms: f64,
    pub confidence: f64,
}

/// Per-sensor state machine: `Idle -> Triggered -> (emit) -> DeadTime -> Idle`.
/// `Emitting` is folded into `Triggered`: the walk-back-and-emit step is just
/// what closing out a trigger does, not an observable sojourn with its own
/// incoming samples.
pub struct Detector {
    config: DetectorConfig,
    state: DetectorState,
    ring: VecDeque<Sample>,
    noise_sigma_mg: f64,
    trigger_peak: Option<Sample>,
    below_peak_run: usize,
    dead_time_until_ns: MonoNs,
    dropped_frames: u64,
}

impl Detector {
    pub fn new(config: DetectorConfig, noise_sigma_mg: f64) -> Self {
        Self {
            config,
            state: DetectorState::Idle,
            ring: VecDeque::with_capacity(config.lookback_samples),
            noise_sigma_mg,
            trigger_peak: None,
            below_peak_run: 0,
            dead_time_until_ns: i64::MIN,
            dropped_frames: 0,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Feed one calibrated magnitude sample. Returns `Some` the instant an
    /// impact is fully formed (onset located, dead-time entered).
    pub fn push(&mut self, ts_mono_ns: MonoNs, magnitude_mg: f64) -> Option<DetectedImpact> {
        let sample = Sample {
            ts_mono_ns,
            magnitude_mg,
        };
        self.push_ring(sample);

        match self.state {
            DetectorState::DeadTime => {
                if ts_mono_ns >= self.dead_time_until_ns {
                    self.state = DetectorState::Idle;
                } else {
                    return None;
                }
                self.evaluate_idle(sample)
            }
            DetectorState::Idle => self.evaluate_idle(sample),
            DetectorState::Triggered => self.evaluate_triggered(sample),
        }
    }

    fn evaluate_idle(&mut self, sample: Sample) -> Option<DetectedImpact> {
        // sigma-aware floor: never treat sub-3-sigma magnitude as a peak,
        // regardless of how low an operator configures peak_threshold.
        let floor = (3.0 * self.noise_sigma_mg).max(0.0);
        if sample.magnitude_mg >= self.config.peak_threshold_mg && sample.magnitude_mg >= floor {
            self.state = DetectorState::Triggered;
            self.trigger_peak = Some(sample);
            self.below_peak_run = 0;
        }
        None
    }

    fn evaluate_triggered(&mut self, sample: Sample) -> Option<DetectedImpact> {
        let peak = self.trigger_peak.expect("Triggered state always has a recorded peak");
        if sample.magnitude_mg > peak.magnitude_mg {
            self.trigger_peak = Some(sample);
        }

        if sample.magnitude_mg < self.config.peak_threshold_mg {
            self.below_peak_run += 1;
        } else {
            self.below_peak_run = 0;
        }

        if self.below_peak_run >= self.config.rest_samples {
            return Some(self.emit());
        }
        None
    }

    /// Walk the ring buffer backward from the trigger peak to find onset,
    /// then transition into dead-time.
    fn emit(&mut self) -> DetectedImpact {
        let peak = self.trigger_peak.take().expect("emit called only from Triggered");
        self.below_peak_run = 0;

        let onset = self.lookback_onset(peak);
        let shallow_ring = onset.1;
        let onset_sample = onset.0;

        let duration_ms = (peak.ts_mono_ns - onset_sample.ts_mono_ns) as f64 / 1_000_000.0;
        let mut confidence = if self.noise_sigma_mg > 0.0 {
            (peak.magnitude_mg / (self.noise_sigma_mg.max(1e-9))).min(10.0) / 10.0
        } else {
            1.0
        }
        .clamp(0.0, 1.0);
        if shallow_ring {
            confidence = confidence.min(0.5);
        }

        self.state = DetectorState::DeadTime;
        self.dead_time_until_ns = peak.ts_mono_ns + self.config.dead_time_ms * 1_000_000;

        DetectedImpact {
            onset_ts_mono_ns: onset_sample.ts_mono_ns,
            peak_ts_mono_ns: peak.ts_mono_ns,
            peak_magnitude: peak.magnitude_mg,
            duration_ms,
            confidence,
        }
    }

    /// Returns the onset sample and whether the ring buffer was too shallow
    /// to find a genuine below-onset-threshold sample (spec §4.4: "if onset
    /// cannot be located ... use the oldest buffered sample").
    fn lookback_onset(&self, peak: Sample) -> (Sample, bool) {
        // samples up to and including the peak, oldest first.
        let preceding: Vec<&Sample> = self
            .ring
            .iter()
            .filter(|s| s.ts_mono_ns <= peak.ts_mono_ns)
            .collect();

        // walk backward from the sample just before the peak looking for the
        // most recent rest point (< onset_threshold); onset is the sample
        // right after it.
        for idx in (0..preceding.len().saturating_sub(1)).rev() {
            if preceding[idx].magnitude_mg < self.config.onset_threshold_mg {
                return (*preceding[idx + 1], false);
            }
        }

        // no rest point found within the buffered window: fall back to the
        // oldest sample we have, flagged as a shallow-ring match.
        (*preceding.first().unwrap_or(&&peak), true)
    }

    fn push_ring(&mut self, sample: Sample) {
        if self.ring.len() == self.config.lookback_samples {
            self.ring.pop_front();
        }
        self.ring.push_back(sample);
    }

    pub fn record_dropped_frame(&mut self) {
        self.dropped_frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig {
            peak_threshold_mg: 10.0,
            onset_threshold_mg: 3.0,
            lookback_samples: 10,
            rest_samples: 3,
            dead_time_ms: 50,
        }
    }

    const NS_PER_MS: i64 = 1_000_000;

    #[test]
    fn idle_sensor_never_triggers_below_peak_threshold() {
        let mut d = Detector::new(config(), 1.0);
        for t in 0..20 {
            assert!(d.push(t as i64 * NS_PER_MS, 1.0).is_none());
        }
    }

    #[test]
    fn single_spike_emits_one_impact_with_onset_before_peak() {
        let mut d = Detector::new(config(), 1.0);
        let mut ts = 0i64;
        for _ in 0..5 {
            d.push(ts, 0.5);
            ts += NS_PER_MS;
        }
        d.push(ts, 42.0); // peak
        let peak_ts = ts;
        ts += NS_PER_MS;

        let mut impact = None;
        for _ in 0..3 {
            let r = d.push(ts, 0.5);
            if r.is_some() {
                impact = r;
                break;
            }
            ts += NS_PER_MS;
        }

        let impact = impact.expect("impact should have been emitted");
        assert_eq!(impact.peak_ts_mono_ns, peak_ts);
        assert!(impact.onset_ts_mono_ns <= peak_ts);
        assert!(impact.confidence > 0.0);
    }

    #[test]
    fn dead_time_suppresses_second_spike_within_window() {
        // scenario 3 from spec §8: first spike peak=11 at t=1510ms, second
        // spike peak=40 at t=1525ms, dead_time=50ms — only one impact.
        let mut d = Detector::new(config(), 1.0);
        let mut impacts = Vec::new();

        let samples: Vec<(i64, f64)> = vec![
            (1490, 0.5),
            (1500, 0.5),
            (1510, 11.0),
            (1515, 0.5),
            (1518, 0.5),
            (1520, 0.5),
            (1525, 40.0),
            (1530, 0.5),
            (1535, 0.5),
            (1540, 0.5),
            (1600, 0.5),
        ];
        for (t_ms, mag) in samples {
            if let Some(impact) = d.push(t_ms * NS_PER_MS, mag) {
                impacts.push(impact);
            }
        }

        assert_eq!(impacts.len(), 1, "second spike inside dead-time must be suppressed");
        assert!((impacts[0].peak_magnitude - 11.0).abs() < 1e-9);
    }

    #[test]
    fn sigma_aware_floor_rejects_subthreshold_noise_even_if_configured_threshold_is_lower() {
        let mut config = config();
        config.peak_threshold_mg = 1.0; // misconfigured: lower than 3*sigma
        let mut d = Detector::new(config, 5.0); // 3*sigma = 15.0
        assert!(d.push(0, 5.0).is_none());
    }

    #[test]
    fn shallow_ring_falls_back_to_oldest_sample_with_capped_confidence() {
        let mut d = Detector::new(config(), 1.0);
        // Peak arrives with nothing preceding it in the ring.
        d.push(0, 42.0);
        let mut impact = None;
        let mut ts = NS_PER_MS;
        for _ in 0..3 {
            let r = d.push(ts, 0.5);
            if r.is_some() {
                impact = r;
                break;
            }
            ts += NS_PER_MS;
        }
        let impact = impact.unwrap();
        assert!(impact.confidence <= 0.5);
    }
}
