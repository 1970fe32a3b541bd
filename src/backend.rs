// ABOUTME: Backend abstraction the playback core drives its audio callback through
// ABOUTME: Operates on raw interleaved PCM bytes so the core stays backend-agnostic

use crate::error::Result;
use crate::format::AudioFormat;

/// Per-callback timing the backend hands back alongside the buffer it wants
/// filled.
///
/// `dac_time_us` is the backend's own hardware clock reading for the first
/// frame of the buffer being filled (the quantity [`crate::clock::ClockMapper`]
/// calibrates against host-monotonic time).
///
/// `underflow` reports a hardware underflow on the *previous* buffer (an
/// xrun the backend detected since the last callback); the fill callback
/// must treat this buffer as silence and request a full reset rather than
/// trusting `dac_time_us`, which is unreliable across an xrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackTiming {
    pub dac_time_us: i64,
    pub frame_count: usize,
    pub underflow: bool,
}

/// Abstraction over a realtime audio output device.
///
/// Implementors own the platform stream and invoke `fill` from their
/// realtime callback once per buffer; `fill` receives a byte slice sized to
/// a whole number of frames at the backend's negotiated [`AudioFormat`] and
/// must fill every byte (silence on underrun, never partial).
pub trait AudioBackend: Send {
    /// Negotiated output format.
    fn format(&self) -> AudioFormat;

    /// Start the stream. The backend begins invoking the fill callback
    /// supplied at construction time.
    fn start(&mut self) -> Result<()>;

    /// Stop the stream; no further callback invocations occur until
    /// [`AudioBackend::start`] is called again.
    fn stop(&mut self) -> Result<()>;
}

/// Abstraction over a realtime audio input device, used only by the
/// optional cross-correlation calibrator to capture the room's rendered
/// audio via a microphone.
pub trait AudioInputBackend: Send {
    fn format(&self) -> AudioFormat;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}
