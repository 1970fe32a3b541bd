// ABOUTME: Scalar Kalman filter smoothing the raw sync-error signal
// ABOUTME: Fixed measurement noise, small process noise, gentle "forget factor" for drift

/// A 1-D Kalman filter tracking a slowly-drifting scalar (the playback
/// sync error, in microseconds).
///
/// Each update inflates the posterior variance by `forget_factor` before
/// folding in the new measurement, so the filter keeps tracking slow drift
/// instead of becoming overconfident and ignoring real movement.
#[derive(Debug, Clone)]
pub struct ScalarKalmanFilter {
    estimate: f64,
    variance: f64,
    process_std_dev: f64,
    forget_factor: f64,
    initialized: bool,
}

impl ScalarKalmanFilter {
    pub fn new(process_std_dev: f64, forget_factor: f64) -> Self {
        Self {
            estimate: 0.0,
            variance: 0.0,
            process_std_dev,
            forget_factor,
            initialized: false,
        }
    }

    /// Reset to the uninitialized state (used on `clear()`/re-anchor).
    pub fn reset(&mut self) {
        self.estimate = 0.0;
        self.variance = 0.0;
        self.initialized = false;
    }

    /// Fold in a new measurement with the given measurement noise (as a
    /// standard deviation, in the same units as `measurement`).
    pub fn update(&mut self, measurement: f64, measurement_noise: f64) {
        if !self.initialized {
            self.estimate = measurement;
            self.variance = measurement_noise * measurement_noise;
            self.initialized = true;
            return;
        }

        // Predict: inflate variance to account for process noise and drift.
        self.variance = self.variance * self.forget_factor
            + self.process_std_dev * self.process_std_dev;

        // Update: standard scalar Kalman gain.
        let measurement_variance = measurement_noise * measurement_noise;
        let gain = self.variance / (self.variance + measurement_variance);
        self.estimate += gain * (measurement - self.estimate);
        self.variance *= 1.0 - gain;
    }

    /// Current filtered estimate.
    pub fn value(&self) -> f64 {
        self.estimate
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
