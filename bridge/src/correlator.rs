//! Shot↔impact correlator (spec §4.6).
//!
//! Deterministic given a timestamped input stream: every decision is made on
//! monotonic timestamps already carried by the events, never on
//! `Instant::now()` directly, so replaying the same event stream always
//! yields the same correlations.
//!
//! SHOT events sit in a small holding buffer for `late_arrival_hold_ms`
//! before becoming visible to matching (absorbing BLE reordering jitter,
//! design note in spec §9), then in a pending-match table until their
//! acceptance window closes. Window closure — not shutdown, not event
//! arrival — is what finalizes a correlation or an orphan (`timer_only`).

use bridge_types::{Correlation, CorrelationQuality, MonoNs};

#[derive(Debug, Clone, Copy)]
pub struct CorrelatorConfig {
    /// k in `[t_imp - (mu + k*sigma), t_imp - max(0, mu - k*sigma)]`.
    pub window_sigma: f64,
    pub late_arrival_hold_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationResult {
    Correlated(Correlation),
    ImpactOnly { impact_id: String },
    TimerOnly { shot_id: String },
}

struct HeldShot {
    shot_id: String,
    ts_mono_ns: MonoNs,
    release_at_ns: MonoNs,
}

struct BestCandidate {
    impact_id: String,
    latency_ms: f64,
    residual_sigma: f64,
    abs_z: f64,
}

struct PendingShot {
    shot_id: String,
    ts_mono_ns: MonoNs,
    closes_at_ns: MonoNs,
    best: Option<BestCandidate>,
}

pub struct Correlator {
    config: CorrelatorConfig,
    held: Vec<HeldShot>,
    pending: Vec<PendingShot>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            held: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Register a SHOT event. It enters the holding buffer and is not
    /// eligible for matching until `late_arrival_hold_ms` has elapsed
    /// (released by a later call to [`Correlator::on_impact`] or
    /// [`Correlator::advance_to`]).
    pub fn on_shot(&mut self, shot_id: impl Into<String>, ts_mono_ns: MonoNs) {
        self.held.push(HeldShot {
            shot_id: shot_id.into(),
            ts_mono_ns,
            release_at_ns: ts_mono_ns + self.config.late_arrival_hold_ms * 1_000_000,
        });
    }

    /// Process one impact against the current (μ, σ) timing estimate.
    /// Returns immediate outcomes (an impact that matches no shot, or an
    /// impact displaced from a shot slot by a better-matching one); the
    /// eventual `Correlated`/`TimerOnly` outcome for the shot itself only
    /// appears once its window closes, via [`Correlator::advance_to`].
    pub fn on_impact(
        &mut self,
        impact_id: impl Into<String>,
        ts_mono_ns: MonoNs,
        mu_ms: f64,
        sigma_ms: f64,
    ) -> Vec<CorrelationResult> {
        let impact_id = impact_id.into();
        self.release_due(ts_mono_ns);

        let sigma_ms = sigma_ms.max(1e-6);
        let half_hi = mu_ms + self.config.window_sigma * sigma_ms;
        let half_lo = (mu_ms - self.config.window_sigma * sigma_ms).max(0.0);
        let window_lo = ts_mono_ns - (half_hi * 1_000_000.0) as i64;
        let window_hi = ts_mono_ns - (half_lo * 1_000_000.0) as i64;

        let mut best_idx = None;
        let mut best_abs_z = f64::INFINITY;
        for (idx, shot) in self.pending.iter().enumerate() {
            if shot.ts_mono_ns < window_lo || shot.ts_mono_ns > window_hi {
                continue;
            }
            let latency_ms = (ts_mono_ns - shot.ts_mono_ns) as f64 / 1_000_000.0;
            if latency_ms < 0.0 {
                continue;
            }
            let residual_sigma = (latency_ms - mu_ms) / sigma_ms;
            let abs_z = residual_sigma.abs();
            if abs_z < best_abs_z {
                best_abs_z = abs_z;
                best_idx = Some(idx);
            }
        }

        let Some(idx) = best_idx else {
            return vec![CorrelationResult::ImpactOnly { impact_id }];
        };

        let shot = &mut self.pending[idx];
        let latency_ms = (ts_mono_ns - shot.ts_mono_ns) as f64 / 1_000_000.0;
        let residual_sigma = (latency_ms - mu_ms) / sigma_ms;
        let abs_z = residual_sigma.abs();

        match &shot.best {
            Some(current) if current.abs_z <= abs_z => {
                // this impact loses the contention immediately (scenario 6).
                vec![CorrelationResult::ImpactOnly { impact_id }]
            }
            Some(current) => {
                let displaced = current.impact_id.clone();
                shot.best = Some(BestCandidate {
                    impact_id,
                    latency_ms,
                    residual_sigma,
                    abs_z,
                });
                vec![CorrelationResult::ImpactOnly {
                    impact_id: displaced,
                }]
            }
            None => {
                shot.best = Some(BestCandidate {
                    impact_id,
                    latency_ms,
                    residual_sigma,
                    abs_z,
                });
                Vec::new()
            }
        }
    }

    /// Release held shots and close any pending shot whose acceptance
    /// window has passed `now_mono_ns`, finalizing it as a correlation or an
    /// orphan. Call on every event and from a watchdog tick (spec §4.6
    /// "Window closure").
    pub fn advance_to(&mut self, now_mono_ns: MonoNs, mu_ms: f64, sigma_ms: f64) -> Vec<CorrelationResult> {
        self.release_due(now_mono_ns);
        let mut results = Vec::new();
        let sigma_ms = sigma_ms.max(1e-6);
        let closes_after_ns = ((mu_ms + self.config.window_sigma * sigma_ms) * 1_000_000.0) as i64;

        let mut remaining = Vec::with_capacity(self.pending.len());
        for shot in self.pending.drain(..) {
            if now_mono_ns >= shot.ts_mono_ns + closes_after_ns {
                results.push(Self::finalize(shot));
            } else {
                remaining.push(shot);
            }
        }
        self.pending = remaining;
        results
    }

    /// Force-close every held and pending shot regardless of elapsed time
    /// (spec §5 shutdown: "unmatched shots are finalized as `timer_only`").
    pub fn finalize_all(&mut self) -> Vec<CorrelationResult> {
        for held in self.held.drain(..) {
            self.pending.push(PendingShot {
                shot_id: held.shot_id,
                ts_mono_ns: held.ts_mono_ns,
                closes_at_ns: held.ts_mono_ns,
                best: None,
            });
        }
        self.pending.drain(..).map(Self::finalize).collect()
    }

    fn release_due(&mut self, now_mono_ns: MonoNs) {
        let mut still_held = Vec::with_capacity(self.held.len());
        for held in self.held.drain(..) {
            if now_mono_ns >= held.release_at_ns {
                self.pending.push(PendingShot {
                    shot_id: held.shot_id,
                    ts_mono_ns: held.ts_mono_ns,
                    closes_at_ns: held.release_at_ns,
                    best: None,
                });
            } else {
                still_held.push(held);
            }
        }
        self.held = still_held;
    }

    fn finalize(shot: PendingShot) -> CorrelationResult {
        match shot.best {
            Some(best) => CorrelationResult::Correlated(Correlation {
                shot_id: shot.shot_id,
                impact_id: best.impact_id,
                latency_ms: best.latency_ms,
                residual_sigma: best.residual_sigma,
                quality: CorrelationQuality::from_standardized_residual(best.abs_z),
            }),
            None => CorrelationResult::TimerOnly { shot_id: shot.shot_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS_PER_MS: i64 = 1_000_000;
    fn config() -> CorrelatorConfig {
        CorrelatorConfig {
            window_sigma: 3.0,
            late_arrival_hold_ms: 250,
        }
    }

    #[test]
    fn happy_path_correlates_two_shots_to_two_impacts() {
        // scenario 1 from spec §8.
        let mut c = Correlator::new(config());
        let mu = 526.0;
        let sigma = 94.0;

        c.on_shot("shot-1", 1000 * NS_PER_MS);
        let r1 = c.on_impact("impact-a", 1526 * NS_PER_MS, mu, sigma);
        assert!(r1.is_empty());

        c.on_shot("shot-2", 1680 * NS_PER_MS);
        let r2 = c.on_impact("impact-b", 2210 * NS_PER_MS, mu, sigma);
        assert!(r2.is_empty());

        let closed = c.advance_to(3000 * NS_PER_MS, mu, sigma);
        assert_eq!(closed.len(), 2);
        for result in &closed {
            match result {
                CorrelationResult::Correlated(corr) => {
                    assert_eq!(corr.quality, CorrelationQuality::Excellent);
                }
                other => panic!("expected Correlated, got {other:?}"),
            }
        }
    }

    #[test]
    fn missed_target_finalizes_orphan_shot_as_timer_only() {
        // scenario 2: second shot gets no impact, finalizes timer_only.
        let mut c = Correlator::new(config());
        let mu = 526.0;
        let sigma = 94.0;

        c.on_shot("shot-1", 1000 * NS_PER_MS);
        c.on_impact("impact-a", 1526 * NS_PER_MS, mu, sigma);
        c.on_shot("shot-2", 1680 * NS_PER_MS);

        let closed = c.advance_to(2962 * NS_PER_MS, mu, sigma);
        let shot2_result = closed
            .iter()
            .find(|r| matches!(r, CorrelationResult::TimerOnly { shot_id } if shot_id == "shot-2"));
        assert!(shot2_result.is_some(), "shot-2 should finalize as timer_only");
    }

    #[test]
    fn competing_impacts_smaller_residual_wins() {
        // scenario 6: single shot at t=1000, impacts at 1520 and 1522 both
        // contend; whichever is closer to mu=526 wins. latency 520 has
        // |520-526|/94=0.064; latency 522 has |522-526|/94=0.043 — impact-b
        // is the better match and must displace impact-a.
        let mut c = Correlator::new(config());
        let mu = 526.0;
        let sigma = 94.0;

        c.on_shot("shot-1", 1000 * NS_PER_MS);
        let r1 = c.on_impact("impact-a", 1520 * NS_PER_MS, mu, sigma); // latency 520
        assert!(r1.is_empty());
        let r2 = c.on_impact("impact-b", 1522 * NS_PER_MS, mu, sigma); // latency 522, better
        assert_eq!(
            r2,
            vec![CorrelationResult::ImpactOnly {
                impact_id: "impact-a".to_string()
            }]
        );

        let closed = c.advance_to(3000 * NS_PER_MS, mu, sigma);
        match &closed[0] {
            CorrelationResult::Correlated(corr) => assert_eq!(corr.impact_id, "impact-b"),
            other => panic!("expected Correlated, got {other:?}"),
        }
    }

    #[test]
    fn impact_outside_every_window_is_impact_only() {
        let mut c = Correlator::new(config());
        let result = c.on_impact("impact-lonely", 100 * NS_PER_MS, 526.0, 94.0);
        assert_eq!(
            result,
            vec![CorrelationResult::ImpactOnly {
                impact_id: "impact-lonely".to_string()
            }]
        );
    }

    #[test]
    fn each_shot_yields_at_most_one_correlation() {
        let mut c = Correlator::new(config());
        let mu = 526.0;
        let sigma = 94.0;
        c.on_shot("shot-1", 1000 * NS_PER_MS);
        c.on_impact("impact-a", 1520 * NS_PER_MS, mu, sigma);
        c.on_impact("impact-b", 1530 * NS_PER_MS, mu, sigma);
        c.on_impact("impact-c", 1525 * NS_PER_MS, mu, sigma);
        let closed = c.advance_to(3000 * NS_PER_MS, mu, sigma);
        let correlated_count = closed
            .iter()
            .filter(|r| matches!(r, CorrelationResult::Correlated(_)))
            .count();
        assert_eq!(correlated_count, 1);
    }

    #[test]
    fn shutdown_finalizes_unmatched_shots_as_timer_only_regardless_of_time() {
        let mut c = Correlator::new(config());
        c.on_shot("shot-1", 1000 * NS_PER_MS);
        let results = c.finalize_all();
        assert_eq!(
            results,
            vec![CorrelationResult::TimerOnly {
                shot_id: "shot-1".to_string()
            }]
        );
    }
}
