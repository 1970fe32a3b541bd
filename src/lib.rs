// ABOUTME: Sendspin playback core: time-synchronized audio output for multi-room clients
// ABOUTME: Public surface re-exports the engine, clock/drift machinery, and backend traits

pub mod backend;
pub mod calibrator;
pub mod clock;
pub mod corrector;
pub mod cpal_backend;
pub mod engine;
pub mod error;
pub mod format;
pub mod kalman;
pub mod queue;
pub mod state;

pub use backend::{AudioBackend, AudioInputBackend, CallbackTiming};
pub use calibrator::{HistogramData, SyncCalibrator};
pub use clock::ClockMapper;
pub use corrector::{CorrectionOutcome, CorrectionSchedule, DriftCorrector};
pub use cpal_backend::{CpalInputBackend, CpalOutputBackend};
pub use engine::{PlaybackCore, TimingMetrics};
pub use error::{Error, Result};
pub use format::AudioFormat;
pub use kalman::ScalarKalmanFilter;
pub use queue::{ChunkQueue, QueuedChunk};
pub use state::{AtomicPlaybackState, PlaybackState};
