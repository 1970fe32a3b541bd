// ABOUTME: Integration coverage for DAC <-> monotonic clock extrapolation

use sendspin_core::ClockMapper;

#[test]
fn tracks_gentle_drift_within_clamp() {
    let mut mapper = ClockMapper::new();
    // DAC clock running very slightly fast relative to monotonic time.
    for i in 0..10i64 {
        let monotonic = i * 100_000;
        let dac = (monotonic as f64 * 1.0005) as i64;
        mapper.record(dac, monotonic);
    }
    let estimate = mapper.estimate_dac_for_monotonic(1_000_000).unwrap();
    assert!((estimate - 1_000_500).abs() < 2_000);
}

#[test]
fn empty_mapper_reports_unknown() {
    let mapper = ClockMapper::new();
    assert_eq!(mapper.estimate_dac_for_monotonic(0), None);
    assert_eq!(mapper.estimate_monotonic_for_dac(0), None);
}
