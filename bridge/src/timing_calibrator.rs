//! Shot→impact latency learning (spec §4.5).
//!
//! Accumulates accepted correlation latencies into a running mean/σ, blended
//! against a documented prior until enough samples have accrued to trust the
//! empirical estimate on its own.

use bridge_types::TimingModel;

#[derive(Debug, Clone, Copy)]
pub struct TimingCalibratorConfig {
    pub prior_mean_ms: f64,
    pub prior_sigma_ms: f64,
    /// N_min: minimum accepted samples before the model is fully trusted.
    pub n_min: u64,
}

/// Running mean/variance of shot→impact latency, blended against the prior
/// while `count < n_min`. Cheap enough to keep as plain Welford accumulators
/// rather than pulling in a stats crate for two numbers (same call as the
/// calibrator's own IQR/mean arithmetic).
pub struct TimingCalibrator {
    config: TimingCalibratorConfig,
    empirical_mean_ms: f64,
    empirical_m2: f64,
    count: u64,
    last_updated_wall_ms: i64,
}

impl TimingCalibrator {
    pub fn new(config: TimingCalibratorConfig) -> Self {
        Self {
            config,
            empirical_mean_ms: 0.0,
            empirical_m2: 0.0,
            count: 0,
            last_updated_wall_ms: 0,
        }
    }

    /// Restore from a checkpoint row so the model resumes where a prior
    /// process left off (spec §4.5 "Persistence").
    pub fn from_checkpoint(config: TimingCalibratorConfig, checkpoint: TimingModel) -> Self {
        let variance = checkpoint.sigma_ms.powi(2);
        Self {
            config,
            empirical_mean_ms: checkpoint.mean_ms,
            empirical_m2: variance * checkpoint.count.max(1) as f64,
            count: checkpoint.count,
            last_updated_wall_ms: checkpoint.last_updated_wall_ms,
        }
    }

    pub fn confidence(&self) -> f64 {
        (self.count as f64 / self.config.n_min.max(1) as f64).min(1.0)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// The (mean, sigma) the correlator should use right now: a blend of the
    /// documented prior and the empirical estimate, weighted by confidence
    /// so a fresh bridge starts on the prior and gradually trusts its own
    /// data as `count` grows toward `n_min`.
    pub fn current_estimate(&self) -> (f64, f64) {
        if self.count == 0 {
            return (self.config.prior_mean_ms, self.config.prior_sigma_ms);
        }
        let w = self.confidence();
        let empirical_sigma = self.empirical_sigma_ms();
        let mean = w * self.empirical_mean_ms + (1.0 - w) * self.config.prior_mean_ms;
        let sigma = w * empirical_sigma + (1.0 - w) * self.config.prior_sigma_ms;
        (mean, sigma.max(1e-6))
    }

    fn empirical_sigma_ms(&self) -> f64 {
        if self.count < 2 {
            self.config.prior_sigma_ms
        } else {
            (self.empirical_m2 / self.count as f64).sqrt()
        }
    }

    /// Record one accepted correlation's measured latency (Welford update).
    pub fn record(&mut self, latency_ms: f64, now_wall_ms: i64) {
        self.count += 1;
        let delta = latency_ms - self.empirical_mean_ms;
        self.empirical_mean_ms += delta / self.count as f64;
        let delta2 = latency_ms - self.empirical_mean_ms;
        self.empirical_m2 += delta * delta2;
        self.last_updated_wall_ms = now_wall_ms;
    }

    pub fn checkpoint(&self) -> TimingModel {
        TimingModel {
            mean_ms: self.current_estimate().0,
            sigma_ms: self.current_estimate().1,
            count: self.count,
            last_updated_wall_ms: self.last_updated_wall_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TimingCalibratorConfig {
        TimingCalibratorConfig {
            prior_mean_ms: 526.0,
            prior_sigma_ms: 94.0,
            n_min: 10,
        }
    }

    #[test]
    fn starts_purely_on_prior_with_zero_samples() {
        let tc = TimingCalibrator::new(config());
        assert_eq!(tc.current_estimate(), (526.0, 94.0));
        assert_eq!(tc.confidence(), 0.0);
    }

    #[test]
    fn confidence_grows_linearly_toward_n_min() {
        let mut tc = TimingCalibrator::new(config());
        for i in 0..5 {
            tc.record(500.0, i);
        }
        assert!((tc.confidence() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn confidence_caps_at_one_past_n_min() {
        let mut tc = TimingCalibrator::new(config());
        for i in 0..20 {
            tc.record(500.0, i);
        }
        assert_eq!(tc.confidence(), 1.0);
    }

    #[test]
    fn estimate_blends_toward_empirical_mean_as_samples_accrue() {
        let mut tc = TimingCalibrator::new(config());
        for i in 0..10 {
            tc.record(600.0, i);
        }
        let (mean, _) = tc.current_estimate();
        // fully trusted (count == n_min): should equal the empirical mean.
        assert!((mean - 600.0).abs() < 1.0);
    }

    #[test]
    fn checkpoint_round_trips_through_from_checkpoint() {
        let mut tc = TimingCalibrator::new(config());
        for i in 0..10 {
            tc.record(600.0, i);
        }
        let checkpoint = tc.checkpoint();
        let restored = TimingCalibrator::from_checkpoint(config(), checkpoint);
        assert_eq!(restored.count(), 10);
    }
}
