// ABOUTME: Playback state machine shared across the event and audio threads
// ABOUTME: Stored as an atomic so the audio callback can read it without locking

use std::sync::atomic::{AtomicU8, Ordering};

/// Coarse playback lifecycle state.
///
/// Transitions: `Initializing` -> `WaitingForStart` -> `Playing`, with a
/// gross sync error sending `Playing` to `Reanchoring` and back to
/// `Initializing` once the queue has been cleared and a fresh start time is
/// awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    /// No format set yet, or freshly cleared; nothing is scheduled.
    Initializing = 0,
    /// Format and a scheduled start time are known; emitting silence until
    /// the DAC clock reaches the start time.
    WaitingForStart = 1,
    /// Actively consuming queued chunks and emitting samples.
    Playing = 2,
    /// A gross sync error was detected; draining in-flight state before
    /// returning to `Initializing`.
    Reanchoring = 3,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PlaybackState::Initializing,
            1 => PlaybackState::WaitingForStart,
            2 => PlaybackState::Playing,
            3 => PlaybackState::Reanchoring,
            _ => unreachable!("invalid PlaybackState encoding"),
        }
    }
}

/// Lock-free holder for [`PlaybackState`], read by the audio callback on
/// every invocation and written by the event thread.
#[derive(Debug)]
pub struct AtomicPlaybackState(AtomicU8);

impl AtomicPlaybackState {
    pub fn new(initial: PlaybackState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> PlaybackState {
        PlaybackState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: PlaybackState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for AtomicPlaybackState {
    fn default() -> Self {
        Self::new(PlaybackState::Initializing)
    }
}
