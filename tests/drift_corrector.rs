// ABOUTME: Integration coverage for the proportional drift corrector's control law

use sendspin_core::{CorrectionOutcome, CorrectionSchedule, DriftCorrector};

#[test]
fn settles_to_no_correction_when_error_is_removed() {
    let mut corrector = DriftCorrector::new();
    for i in 0..10 {
        corrector.update(30_000, 44_100, i * 20_000, true);
    }
    // Error disappears; filter should relax back toward the deadband
    // given enough updates.
    let mut outcome = CorrectionOutcome::Schedule(CorrectionSchedule::NONE);
    for i in 0..500 {
        outcome = corrector.update(0, 44_100, 10 * 20_000 + i * 20_000, true);
    }
    assert_eq!(outcome, CorrectionOutcome::Schedule(CorrectionSchedule::NONE));
}

#[test]
fn correction_direction_follows_sign_of_error() {
    let mut behind = DriftCorrector::new();
    let mut ahead = DriftCorrector::new();
    let mut behind_outcome = CorrectionOutcome::Schedule(CorrectionSchedule::NONE);
    let mut ahead_outcome = CorrectionOutcome::Schedule(CorrectionSchedule::NONE);
    for i in 0..30 {
        behind_outcome = behind.update(50_000, 44_100, i * 20_000, true);
        ahead_outcome = ahead.update(-50_000, 44_100, i * 20_000, true);
    }
    match (behind_outcome, ahead_outcome) {
        (CorrectionOutcome::Schedule(b), CorrectionOutcome::Schedule(a)) => {
            assert!(b.drop_every_n_frames > 0);
            assert!(a.insert_every_n_frames > 0);
        }
        _ => panic!("expected proportional schedules, not a re-anchor"),
    }
}
