// ABOUTME: Optional GCC-PHAT cross-correlation calibrator for acoustic sync measurement
// ABOUTME: Correlates captured room audio against the reference stream to estimate timing offset

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

/// Correlation window (must be >= the chirp/signal duration we expect to
/// recognize).
pub const WINDOW_SECONDS: f64 = 1.0;
/// Minimum spacing between offset reports.
pub const REPORT_INTERVAL_SECONDS: f64 = 1.0;
/// Limits the correlation search to a plausible lag range, accounting for
/// audio arriving ahead of the reference timeline.
pub const MAX_LAG_MS: f64 = 250.0;
/// Epsilon guarding the PHAT whitening division.
const GCC_PHAT_EPS: f32 = 1e-10;
/// Ring buffer capacity, generous enough to tolerate scheduling jitter.
const BUFFER_DURATION_SECONDS: f64 = 10.0;
/// Time to wait before trusting the empirical capture-rate measurement
/// (skips startup noise in the mic clock).
const WARMUP_SECONDS: f64 = 30.0;
/// Per-measurement decay applied to the accumulated confidence histogram.
const CONFIDENCE_DECAY: f64 = 0.9;
/// Bins dropped below this accumulated confidence.
const CONFIDENCE_FLOOR: f64 = 0.1;
const MAX_DRIFT_HISTORY: usize = 50;
const CAPTURE_RATE_HISTORY_CAP: usize = 100;
const MIN_DRIFT_SAMPLES_FOR_REGRESSION: usize = 10;

type ServerTimeFn = Arc<dyn Fn(i64) -> i64 + Send + Sync>;

/// A ring buffer of mono float samples tagged with the source-timeline
/// timestamp of its first (position-0) sample, updated as writes wrap.
struct TimestampedRing {
    data: Vec<f32>,
    write_pos: usize,
    pos0_timestamp_us: Option<i64>,
    newest_timestamp_us: Option<i64>,
    total_samples: u64,
}

impl TimestampedRing {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            write_pos: 0,
            pos0_timestamp_us: None,
            newest_timestamp_us: None,
            total_samples: 0,
        }
    }

    /// Append `samples`, whose first sample plays/was-captured at
    /// `chunk_timestamp_us`, advancing at `sample_rate` samples/sec.
    fn write(&mut self, samples: &[f32], chunk_timestamp_us: i64, sample_rate: f64) {
        if samples.is_empty() {
            return;
        }
        if self.pos0_timestamp_us.is_none() {
            self.pos0_timestamp_us = Some(chunk_timestamp_us);
        }

        let capacity = self.data.len();
        let space_at_end = capacity - self.write_pos;
        let chunk_duration_us = (samples.len() as f64 * 1_000_000.0 / sample_rate).round() as i64;

        if samples.len() <= space_at_end {
            self.data[self.write_pos..self.write_pos + samples.len()].copy_from_slice(samples);
        } else {
            self.data[self.write_pos..].copy_from_slice(&samples[..space_at_end]);
            let wrapped = samples.len() - space_at_end;
            self.data[..wrapped].copy_from_slice(&samples[space_at_end..]);
            let time_into_new_cycle_us = (wrapped as f64 * 1_000_000.0 / sample_rate).round() as i64;
            self.pos0_timestamp_us =
                Some(chunk_timestamp_us + chunk_duration_us - time_into_new_cycle_us);
        }

        self.write_pos = (self.write_pos + samples.len()) % capacity;
        self.total_samples += samples.len() as u64;
        self.newest_timestamp_us = Some(chunk_timestamp_us + chunk_duration_us);
    }

    /// Extract a window of `window_samples` centered `samples_ago` samples
    /// before the write cursor, or `None` if out of the buffer's valid
    /// range.
    fn extract_centered(&self, samples_ago: i64, window_samples: usize) -> Option<Vec<f32>> {
        let capacity = self.data.len() as i64;
        if samples_ago < (window_samples / 2) as i64
            || samples_ago > capacity - (window_samples / 2) as i64
        {
            return None;
        }
        let center = (self.write_pos as i64 - samples_ago).rem_euclid(capacity) as usize;
        let half = window_samples / 2;
        let start = (center as i64 - half as i64).rem_euclid(capacity) as usize;
        let end = (start + window_samples) % self.data.len();

        if start < end {
            Some(self.data[start..end].to_vec())
        } else {
            let mut out = Vec::with_capacity(window_samples);
            out.extend_from_slice(&self.data[start..]);
            out.extend_from_slice(&self.data[..end]);
            Some(out)
        }
    }
}

/// A correlation peak found within the search window: `(lag_ms, magnitude,
/// confidence)`.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationPeak {
    pub lag_ms: f64,
    pub magnitude: f32,
    pub confidence: f64,
}

/// Snapshot of the accumulated confidence histogram, for UI/diagnostics.
#[derive(Debug, Clone)]
pub struct HistogramData {
    pub confidence_by_offset_ms: HashMap<i32, f64>,
    pub best_offset_ms: Option<i32>,
    pub elapsed_seconds: f64,
}

/// Cross-correlation sync calibrator.
///
/// Feeds two timestamped ring buffers (the reference stream we expect to
/// hear, and room audio captured by a microphone) into a GCC-PHAT
/// correlator and accumulates a decayed confidence histogram of measured
/// offsets, plus a linear-regression drift-rate estimate.
pub struct SyncCalibrator {
    sample_rate: u32,
    compute_server_time: ServerTimeFn,
    epoch: Instant,

    window_samples: usize,
    buffer_samples: usize,

    reference: TimestampedRing,
    capture: TimestampedRing,

    accumulated_confidence: HashMap<i32, f64>,
    drift_history: VecDeque<(f64, f64)>,

    start_monotonic_us: i64,
    last_report_monotonic_us: i64,

    total_mic_samples: u64,
    mic_start_monotonic_us: Option<i64>,
    warmup_complete: bool,
    warmup_baseline_monotonic_us: Option<i64>,
    warmup_baseline_samples: u64,
    capture_rate_history: VecDeque<(i64, u64)>,

    fft_planner: FftPlanner<f32>,
}

impl SyncCalibrator {
    pub fn new(sample_rate: u32, compute_server_time: impl Fn(i64) -> i64 + Send + Sync + 'static) -> Self {
        let window_samples = (WINDOW_SECONDS * sample_rate as f64) as usize;
        let buffer_samples = (BUFFER_DURATION_SECONDS * sample_rate as f64) as usize;
        Self {
            sample_rate,
            compute_server_time: Arc::new(compute_server_time),
            epoch: Instant::now(),
            window_samples,
            buffer_samples,
            reference: TimestampedRing::new(buffer_samples),
            capture: TimestampedRing::new(buffer_samples),
            accumulated_confidence: HashMap::new(),
            drift_history: VecDeque::new(),
            start_monotonic_us: 0,
            last_report_monotonic_us: 0,
            total_mic_samples: 0,
            mic_start_monotonic_us: None,
            warmup_complete: false,
            warmup_baseline_monotonic_us: None,
            warmup_baseline_samples: 0,
            capture_rate_history: VecDeque::with_capacity(CAPTURE_RATE_HISTORY_CAP),
            fft_planner: FftPlanner::new(),
        }
    }

    fn monotonic_now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    pub fn start(&mut self) {
        self.start_monotonic_us = self.monotonic_now_us();
    }

    /// Drop accumulated state; call on stream/track change.
    pub fn reset_buffers(&mut self) {
        self.reference = TimestampedRing::new(self.buffer_samples);
        self.capture = TimestampedRing::new(self.buffer_samples);
        self.accumulated_confidence.clear();
        self.drift_history.clear();
        self.last_report_monotonic_us = 0;
        self.start_monotonic_us = self.monotonic_now_us();
        self.total_mic_samples = 0;
        self.mic_start_monotonic_us = None;
        self.warmup_complete = false;
        self.warmup_baseline_monotonic_us = None;
        self.warmup_baseline_samples = 0;
        self.capture_rate_history.clear();
    }

    /// Feed a block of mono microphone samples captured by the input
    /// backend, tagged with `adc_time_us` — the hardware capture clock's
    /// reading for the block's first sample, the input-side counterpart of
    /// `dac_time_us`. Intended to run on a dedicated calibrator thread fed
    /// by the realtime input callback over a channel, not on the realtime
    /// thread itself.
    ///
    /// `now_us` (host monotonic) is tracked separately, purely to measure
    /// how fast the mic clock runs relative to the host clock during
    /// warmup — the two clocks are expected to disagree slightly, which is
    /// exactly what the empirical capture-rate estimate corrects for.
    pub fn push_capture_samples(&mut self, samples: &[i16], adc_time_us: i64) {
        let now_us = self.monotonic_now_us();
        if self.mic_start_monotonic_us.is_none() {
            self.mic_start_monotonic_us = Some(now_us);
        }
        self.total_mic_samples += samples.len() as u64;

        if self.total_mic_samples as usize % (self.sample_rate as usize / 5).max(1)
            < samples.len()
        {
            if self.capture_rate_history.len() == CAPTURE_RATE_HISTORY_CAP {
                self.capture_rate_history.pop_front();
            }
            self.capture_rate_history.push_back((now_us, self.total_mic_samples));
        }

        let mic_start = self.mic_start_monotonic_us.unwrap();
        let elapsed_us = now_us - mic_start;
        let elapsed_s = elapsed_us as f64 / 1_000_000.0;

        if !self.warmup_complete && elapsed_s >= WARMUP_SECONDS {
            self.warmup_complete = true;
            self.warmup_baseline_monotonic_us = Some(now_us);
            self.warmup_baseline_samples = self.total_mic_samples;
            log::info!("calibrator warmup complete at {elapsed_s:.1}s");
        }

        let empirical_rate = self.empirical_capture_rate(now_us, elapsed_s);

        let mono: Vec<f32> = samples.iter().map(|s| *s as f32 / 32768.0).collect();
        self.capture.write(&mono, adc_time_us, empirical_rate);
        self.maybe_report_offset();
    }

    fn empirical_capture_rate(&self, now_us: i64, elapsed_s: f64) -> f64 {
        if self.warmup_complete {
            if let Some(baseline) = self.warmup_baseline_monotonic_us {
                let time_since_baseline_s = (now_us - baseline) as f64 / 1_000_000.0;
                let samples_since_baseline =
                    (self.total_mic_samples - self.warmup_baseline_samples) as f64;
                if time_since_baseline_s > 1.0 {
                    return samples_since_baseline / time_since_baseline_s;
                }
            }
            self.sample_rate as f64
        } else if elapsed_s > 1.0 {
            self.total_mic_samples as f64 / elapsed_s
        } else {
            self.sample_rate as f64
        }
    }

    /// Feed reference (expected) PCM audio that will play at
    /// `server_timestamp_us`, so it can be compared against what the
    /// microphone actually picks up.
    pub fn submit_reference_audio(&mut self, server_timestamp_us: i64, pcm: &[u8], channels: u8) {
        let samples_i16: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let mono: Vec<f32> = if channels > 1 {
            samples_i16
                .chunks_exact(channels as usize)
                .map(|frame| frame[0] as f32 / 32768.0)
                .collect()
        } else {
            samples_i16.iter().map(|s| *s as f32 / 32768.0).collect()
        };

        self.reference
            .write(&mono, server_timestamp_us, self.sample_rate as f64);
        self.maybe_report_offset();
    }

    fn maybe_report_offset(&mut self) {
        let now_us = self.monotonic_now_us();
        if (now_us - self.last_report_monotonic_us) as f64 / 1_000_000.0 < REPORT_INTERVAL_SECONDS
        {
            return;
        }

        let safety_samples = (0.1 * self.sample_rate as f64) as u64;
        let min_samples_needed = self.window_samples as u64 + safety_samples;
        if self.reference.total_samples < min_samples_needed
            || self.capture.total_samples < min_samples_needed
        {
            return;
        }
        let Some(cap_newest) = self.capture.newest_timestamp_us else {
            return;
        };
        let Some(ref_newest) = self.reference.newest_timestamp_us else {
            return;
        };

        self.last_report_monotonic_us = now_us;

        let safety_time_us = ((WINDOW_SECONDS / 2.0 + 0.5) * 1_000_000.0).round() as i64;
        let target_loop_time_us = cap_newest - safety_time_us;
        let target_server_time_us = (self.compute_server_time)(target_loop_time_us);

        let ref_time_ago_us = ref_newest - target_server_time_us;
        let ref_samples_ago =
            (ref_time_ago_us as f64 * self.sample_rate as f64 / 1_000_000.0).round() as i64;
        let Some(reference) = self.reference.extract_centered(ref_samples_ago, self.window_samples)
        else {
            return;
        };

        let empirical_rate = self.empirical_capture_rate(
            now_us,
            self.mic_start_monotonic_us
                .map(|s| (now_us - s) as f64 / 1_000_000.0)
                .unwrap_or(0.0),
        );
        let cap_time_ago_us = cap_newest - target_loop_time_us;
        let cap_samples_ago =
            (cap_time_ago_us as f64 * empirical_rate / 1_000_000.0).round() as i64;
        let Some(captured) = self.capture.extract_centered(cap_samples_ago, self.window_samples)
        else {
            return;
        };

        let Some(peaks) = self.gcc_phat_peaks(&reference, &captured) else {
            return;
        };
        if peaks.is_empty() {
            log::debug!("calibrator: no peaks found in correlation");
            return;
        }

        for value in self.accumulated_confidence.values_mut() {
            *value *= CONFIDENCE_DECAY;
        }
        for peak in &peaks {
            let key = peak.lag_ms.round() as i32;
            *self.accumulated_confidence.entry(key).or_insert(0.0) += peak.confidence;
        }
        self.accumulated_confidence
            .retain(|_, confidence| *confidence > CONFIDENCE_FLOOR);

        let elapsed_s = (now_us - self.start_monotonic_us) as f64 / 1_000_000.0;
        let top_offset = self
            .accumulated_confidence
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(k, _)| *k)
            .unwrap_or(0);

        if self.warmup_complete {
            if self.drift_history.len() == MAX_DRIFT_HISTORY {
                self.drift_history.pop_front();
            }
            self.drift_history.push_back((elapsed_s, top_offset as f64));
        }

        let drift_per_minute = self.drift_slope_per_minute();
        log::debug!(
            "calibrator t={elapsed_s:.1}s best={top_offset:+}ms drift={drift_per_minute:?} ms/min"
        );
    }

    /// Linear-regression drift rate (ms of offset drift per minute) over
    /// the recent offset history, once enough samples have accumulated.
    pub fn drift_slope_per_minute(&self) -> Option<f64> {
        if self.drift_history.len() < MIN_DRIFT_SAMPLES_FOR_REGRESSION {
            return None;
        }
        let n = self.drift_history.len() as f64;
        let sum_t: f64 = self.drift_history.iter().map(|(t, _)| t).sum();
        let sum_o: f64 = self.drift_history.iter().map(|(_, o)| o).sum();
        let sum_tt: f64 = self.drift_history.iter().map(|(t, _)| t * t).sum();
        let sum_to: f64 = self.drift_history.iter().map(|(t, o)| t * o).sum();

        let denom = n * sum_tt - sum_t * sum_t;
        if denom.abs() <= 1e-10 {
            return None;
        }
        let slope_per_sec = (n * sum_to - sum_t * sum_o) / denom;
        Some(slope_per_sec * 60.0)
    }

    pub fn histogram(&self) -> HistogramData {
        let elapsed_seconds = if self.start_monotonic_us > 0 {
            (self.monotonic_now_us() - self.start_monotonic_us) as f64 / 1_000_000.0
        } else {
            0.0
        };
        let best_offset_ms = self
            .accumulated_confidence
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(k, _)| *k);
        HistogramData {
            confidence_by_offset_ms: self.accumulated_confidence.clone(),
            best_offset_ms,
            elapsed_seconds,
        }
    }

    /// GCC-PHAT correlation between two equal-length, zero-mean-normalized
    /// windows, returning local-maxima peaks within `MAX_LAG_MS` of
    /// zero-lag, sorted by correlation magnitude.
    fn gcc_phat_peaks(&mut self, reference: &[f32], captured: &[f32]) -> Option<Vec<CorrelationPeak>> {
        let n = reference.len();
        if n == 0 || captured.len() != n {
            return None;
        }

        let ref_mean = reference.iter().sum::<f32>() / n as f32;
        let cap_mean = captured.iter().sum::<f32>() / n as f32;
        let ref_std = variance(reference, ref_mean).sqrt();
        let cap_std = variance(captured, cap_mean).sqrt();
        if ref_std < 1e-6 || cap_std < 1e-6 {
            log::debug!("calibrator: insufficient signal level for correlation");
            return None;
        }

        let fft_size = (2 * n - 1).next_power_of_two();

        let mut ref_buf: Vec<Complex32> = reference
            .iter()
            .map(|s| Complex32::new(s - ref_mean, 0.0))
            .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
            .take(fft_size)
            .collect();
        let mut cap_buf: Vec<Complex32> = captured
            .iter()
            .map(|s| Complex32::new(s - cap_mean, 0.0))
            .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
            .take(fft_size)
            .collect();

        let fft = self.fft_planner.plan_fft_forward(fft_size);
        fft.process(&mut ref_buf);
        fft.process(&mut cap_buf);

        let mut cross_spectrum: Vec<Complex32> = cap_buf
            .iter()
            .zip(ref_buf.iter())
            .map(|(c, r)| {
                let cross = c * r.conj();
                let magnitude = cross.norm();
                cross / (magnitude + GCC_PHAT_EPS)
            })
            .collect();

        let ifft = self.fft_planner.plan_fft_inverse(fft_size);
        ifft.process(&mut cross_spectrum);
        let scale = 1.0 / fft_size as f32;
        let correlation_full: Vec<f32> = cross_spectrum.iter().map(|c| c.re * scale).collect();

        // Rearrange the circular correlation into linear lag order:
        // negative lags first, then zero and positive lags.
        let mut correlation = Vec::with_capacity(2 * n - 1);
        correlation.extend_from_slice(&correlation_full[fft_size - (n - 1)..]);
        correlation.extend_from_slice(&correlation_full[..n]);

        let max_lag_samples = (MAX_LAG_MS * self.sample_rate as f64 / 1000.0) as i64;
        let center_idx = (n - 1) as i64;
        let search_start = (center_idx - max_lag_samples).max(0) as usize;
        let search_end = ((center_idx + max_lag_samples + 1) as usize).min(correlation.len());
        let search_region: Vec<f32> = correlation[search_start..search_end]
            .iter()
            .map(|v| v.abs())
            .collect();
        if search_region.len() < 3 {
            return Some(Vec::new());
        }
        let mean_val = search_region.iter().sum::<f32>() / search_region.len() as f32;

        let mut peaks = Vec::new();
        for i in 1..search_region.len() - 1 {
            if search_region[i] > search_region[i - 1] && search_region[i] > search_region[i + 1] {
                let peak_idx = (search_start + i) as i64;
                let lag_samples = center_idx - peak_idx;
                let lag_ms = lag_samples as f64 * 1000.0 / self.sample_rate as f64;
                let confidence = if mean_val > 0.0 {
                    (search_region[i] / mean_val) as f64
                } else {
                    0.0
                };
                peaks.push(CorrelationPeak {
                    lag_ms,
                    magnitude: search_region[i],
                    confidence,
                });
            }
        }
        peaks.sort_by(|a, b| b.magnitude.partial_cmp(&a.magnitude).unwrap());
        peaks.truncate(5);
        Some(peaks)
    }
}

fn variance(samples: &[f32], mean: f32) -> f32 {
    samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / samples.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| ((2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate).sin()) as f32)
            .collect()
    }

    #[test]
    fn gcc_phat_recovers_known_shift() {
        let sample_rate = 8_000u32;
        let mut calibrator = SyncCalibrator::new(sample_rate, |ts| ts);
        let n = 1_000;
        let signal = sine(440.0, sample_rate as f64, n + 50);
        let reference = &signal[25..25 + n];
        let shift = 10usize;
        let captured = &signal[25 - shift..25 - shift + n];

        let peaks = calibrator.gcc_phat_peaks(reference, captured).unwrap();
        assert!(!peaks.is_empty());
        let best = peaks[0];
        let expected_lag_ms = shift as f64 * 1000.0 / sample_rate as f64;
        assert!((best.lag_ms - expected_lag_ms).abs() < 2.0);
    }

    #[test]
    fn low_signal_level_yields_no_peaks() {
        let sample_rate = 8_000u32;
        let mut calibrator = SyncCalibrator::new(sample_rate, |ts| ts);
        let silence = vec![0.0f32; 1000];
        assert!(calibrator.gcc_phat_peaks(&silence, &silence).is_none());
    }

    #[test]
    fn ring_buffer_tracks_wraparound_timestamp() {
        let mut ring = TimestampedRing::new(100);
        ring.write(&vec![0.1f32; 80], 0, 1000.0);
        assert_eq!(ring.pos0_timestamp_us, Some(0));
        ring.write(&vec![0.2f32; 40], 80_000, 1000.0);
        // 20 samples wrapped into the start of the buffer.
        assert!(ring.pos0_timestamp_us.unwrap() > 80_000);
    }

    #[test]
    fn drift_slope_requires_minimum_history() {
        let calibrator = SyncCalibrator::new(8_000, |ts| ts);
        assert_eq!(calibrator.drift_slope_per_minute(), None);
    }

    #[test]
    fn confidence_histogram_decays_and_floors() {
        let mut calibrator = SyncCalibrator::new(8_000, |ts| ts);
        calibrator.accumulated_confidence.insert(5, 1.0);
        calibrator.accumulated_confidence.insert(-3, 0.05);
        for value in calibrator.accumulated_confidence.values_mut() {
            *value *= CONFIDENCE_DECAY;
        }
        calibrator
            .accumulated_confidence
            .retain(|_, c| *c > CONFIDENCE_FLOOR);
        assert!(calibrator.accumulated_confidence.contains_key(&5));
        assert!(!calibrator.accumulated_confidence.contains_key(&-3));
    }
}
