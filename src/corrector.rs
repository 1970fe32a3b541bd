// ABOUTME: Proportional drift corrector: smooths sync error, plans insert/drop cadence
// ABOUTME: Hysteresis via deadband and re-anchor cooldown per the control law

use crate::kalman::ScalarKalmanFilter;

/// Sync error below this magnitude (microseconds) is treated as jitter;
/// no correction is scheduled.
pub const CORRECTION_DEADBAND_US: i64 = 2_000;

/// Sync error above this magnitude (microseconds) triggers a re-anchor
/// instead of a proportional correction.
pub const REANCHOR_THRESHOLD_US: i64 = 500_000;

/// Minimum time between re-anchor events.
pub const REANCHOR_COOLDOWN_US: i64 = 5_000_000;

/// Window over which a proportional correction aims to fully cancel the
/// error.
pub const CORRECTION_TARGET_SECONDS: f64 = 2.0;

/// Maximum allowed correction rate, expressed as a fraction of the sample
/// rate (4% speed deviation).
pub const MAX_SPEED_CORRECTION: f64 = 0.04;

/// Fixed measurement noise fed to the Kalman filter (5 ms, in
/// microseconds).
pub const MEASUREMENT_NOISE_US: f64 = 5_000.0;

/// Kalman process noise standard deviation (µs/update).
pub const PROCESS_STD_DEV: f64 = 0.01;

/// Kalman "forget factor": gently inflates posterior variance each update
/// so the filter keeps tracking slow drift.
pub const FORGET_FACTOR: f64 = 1.001;

/// A decision produced by one call to [`DriftCorrector::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionSchedule {
    pub insert_every_n_frames: i64,
    pub drop_every_n_frames: i64,
}

impl CorrectionSchedule {
    pub const NONE: Self = Self {
        insert_every_n_frames: 0,
        drop_every_n_frames: 0,
    };
}

/// Outcome of feeding a new raw sync-error sample into the corrector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// Cadence updated (possibly to `CorrectionSchedule::NONE` within the
    /// deadband).
    Schedule(CorrectionSchedule),
    /// Error was large enough, and cooldown had elapsed, to trigger a
    /// re-anchor instead of a proportional correction.
    Reanchor,
}

/// Converts a smoothed sync-error signal into a micro-correction cadence,
/// with hysteresis (deadband) and re-anchoring for gross errors.
pub struct DriftCorrector {
    filter: ScalarKalmanFilter,
    last_reanchor_monotonic_us: i64,
    has_reanchored: bool,
}

impl DriftCorrector {
    pub fn new() -> Self {
        Self {
            filter: ScalarKalmanFilter::new(PROCESS_STD_DEV, FORGET_FACTOR),
            last_reanchor_monotonic_us: i64::MIN / 2,
            has_reanchored: false,
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
        self.last_reanchor_monotonic_us = i64::MIN / 2;
        self.has_reanchored = false;
    }

    pub fn filtered_error_us(&self) -> f64 {
        self.filter.value()
    }

    pub fn has_reanchored(&self) -> bool {
        self.has_reanchored
    }

    /// Feed a new raw sync error (`playback_position - source_read_cursor`,
    /// microseconds) and produce the next correction decision.
    ///
    /// `sample_rate` is needed to convert the error into a frame cadence;
    /// `now_monotonic_us`/`is_playing` gate the re-anchor path.
    pub fn update(
        &mut self,
        error_us: i64,
        sample_rate: u32,
        now_monotonic_us: i64,
        is_playing: bool,
    ) -> CorrectionOutcome {
        self.filter.update(error_us as f64, MEASUREMENT_NOISE_US);
        let filtered = self.filter.value();
        let abs_err = filtered.abs();

        if abs_err <= CORRECTION_DEADBAND_US as f64 {
            return CorrectionOutcome::Schedule(CorrectionSchedule::NONE);
        }

        if abs_err > REANCHOR_THRESHOLD_US as f64
            && is_playing
            && now_monotonic_us - self.last_reanchor_monotonic_us > REANCHOR_COOLDOWN_US
        {
            self.last_reanchor_monotonic_us = now_monotonic_us;
            self.has_reanchored = true;
            return CorrectionOutcome::Reanchor;
        }

        let frames_error = abs_err * sample_rate as f64 / 1_000_000.0;
        let desired_corrections_per_sec = frames_error / CORRECTION_TARGET_SECONDS;
        let max_corrections_per_sec = sample_rate as f64 * MAX_SPEED_CORRECTION;
        let corrections_per_sec = desired_corrections_per_sec.min(max_corrections_per_sec);

        let interval_frames = if corrections_per_sec > 0.0 {
            ((sample_rate as f64 / corrections_per_sec) as i64).max(1)
        } else {
            (1.0 / MAX_SPEED_CORRECTION.max(0.001)) as i64
        };

        let schedule = if filtered > 0.0 {
            // Rendered audio is ahead of consumption: drop input to catch up.
            CorrectionSchedule {
                drop_every_n_frames: interval_frames,
                insert_every_n_frames: 0,
            }
        } else {
            // We're ahead of the renderer: insert duplicates to slow down.
            CorrectionSchedule {
                insert_every_n_frames: interval_frames,
                drop_every_n_frames: 0,
            }
        };
        CorrectionOutcome::Schedule(schedule)
    }
}

impl Default for DriftCorrector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadband_clears_cadence() {
        let mut corrector = DriftCorrector::new();
        let outcome = corrector.update(500, 44_100, 0, true);
        assert_eq!(
            outcome,
            CorrectionOutcome::Schedule(CorrectionSchedule::NONE)
        );
    }

    #[test]
    fn positive_error_schedules_drop() {
        let mut corrector = DriftCorrector::new();
        // Feed repeatedly so the filter settles near the true value.
        let mut outcome = CorrectionOutcome::Schedule(CorrectionSchedule::NONE);
        for i in 0..20 {
            outcome = corrector.update(20_000, 44_100, i * 20_000, true);
        }
        match outcome {
            CorrectionOutcome::Schedule(s) => {
                assert!(s.drop_every_n_frames > 0);
                assert_eq!(s.insert_every_n_frames, 0);
            }
            CorrectionOutcome::Reanchor => panic!("expected schedule, got reanchor"),
        }
    }

    #[test]
    fn negative_error_schedules_insert() {
        let mut corrector = DriftCorrector::new();
        let mut outcome = CorrectionOutcome::Schedule(CorrectionSchedule::NONE);
        for i in 0..20 {
            outcome = corrector.update(-20_000, 44_100, i * 20_000, true);
        }
        match outcome {
            CorrectionOutcome::Schedule(s) => {
                assert!(s.insert_every_n_frames > 0);
                assert_eq!(s.drop_every_n_frames, 0);
            }
            CorrectionOutcome::Reanchor => panic!("expected schedule, got reanchor"),
        }
    }

    /// Property 6: the scheduled correction rate never exceeds 4% of the
    /// sample rate in corrections/sec, regardless of the error magnitude.
    #[test]
    fn control_bounds_respected_for_huge_errors() {
        let mut corrector = DriftCorrector::new();
        // Large enough to be past the deadband but small enough (just under
        // the re-anchor threshold) to stay on the proportional path even
        // once filtered.
        let sample_rate = 44_100u32;
        let mut outcome = CorrectionOutcome::Schedule(CorrectionSchedule::NONE);
        for i in 0..5 {
            outcome = corrector.update(499_000, sample_rate, i * 100_000, true);
        }
        if let CorrectionOutcome::Schedule(s) = outcome {
            let interval = s.drop_every_n_frames.max(s.insert_every_n_frames);
            assert!(interval > 0);
            let corrections_per_sec = sample_rate as f64 / interval as f64;
            assert!(corrections_per_sec <= sample_rate as f64 * MAX_SPEED_CORRECTION + 1e-6);
        }
    }

    /// Property 7: two re-anchor triggers within 5s of each other produce
    /// at most one re-anchor.
    #[test]
    fn reanchor_hysteresis() {
        let mut corrector = DriftCorrector::new();
        // Prime the filter near the gross-error region across a couple of
        // updates so the deadband/variance settle, then trigger.
        for i in 0..3 {
            corrector.update(800_000, 44_100, i * 10_000, true);
        }
        let first = corrector.update(800_000, 44_100, 1_000_000, true);
        assert_eq!(first, CorrectionOutcome::Reanchor);

        // Second trigger 1s later (< 5s cooldown) must not re-anchor again.
        let second = corrector.update(800_000, 44_100, 2_000_000, true);
        assert_ne!(second, CorrectionOutcome::Reanchor);
    }

    #[test]
    fn reanchor_requires_playing_state() {
        let mut corrector = DriftCorrector::new();
        for i in 0..3 {
            corrector.update(800_000, 44_100, i * 10_000, false);
        }
        let outcome = corrector.update(800_000, 44_100, 1_000_000, false);
        assert_ne!(outcome, CorrectionOutcome::Reanchor);
    }
}
