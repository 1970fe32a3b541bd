// ABOUTME: Crate-wide error type
// ABOUTME: Boundary-operation failures only; in-callback failures degrade to silence per design

use thiserror::Error;

/// Errors surfaced at the boundary operations of the playback core.
///
/// Per the core's error-handling design, failures inside the audio
/// callback or chunk ingress never propagate as `Result` — they degrade
/// to a logged warning and silence. This type covers only the operations
/// that can genuinely fail: configuring a backend, building a stream, and
/// calibrator setup.
#[derive(Debug, Error)]
pub enum Error {
    /// The audio backend failed to open, configure, or start a stream.
    #[error("audio backend error: {0}")]
    Backend(String),

    /// An invalid format or device was supplied to `set_format`.
    #[error("invalid audio configuration: {0}")]
    Config(String),

    /// The cross-correlation calibrator could not be started or configured.
    #[error("calibrator error: {0}")]
    Calibration(String),
}

pub type Result<T> = std::result::Result<T, Error>;
