// ABOUTME: Integration coverage for the GCC-PHAT sync calibrator's public surface

use sendspin_core::SyncCalibrator;

#[test]
fn histogram_is_empty_before_any_measurements() {
    let calibrator = SyncCalibrator::new(48_000, |ts| ts);
    let histogram = calibrator.histogram();
    assert!(histogram.confidence_by_offset_ms.is_empty());
    assert_eq!(histogram.best_offset_ms, None);
}

#[test]
fn reset_buffers_clears_accumulated_state() {
    let mut calibrator = SyncCalibrator::new(48_000, |ts| ts);
    calibrator.start();
    // Feed a chunk of reference audio; too little data to produce a
    // measurement yet, but exercises the write path without panicking.
    let silence = vec![0u8; 4096];
    calibrator.submit_reference_audio(0, &silence, 2);
    calibrator.reset_buffers();
    let histogram = calibrator.histogram();
    assert!(histogram.confidence_by_offset_ms.is_empty());
}

#[test]
fn drift_slope_absent_without_enough_history() {
    let calibrator = SyncCalibrator::new(48_000, |ts| ts);
    assert_eq!(calibrator.drift_slope_per_minute(), None);
}
