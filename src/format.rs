// ABOUTME: Sample-format descriptor shared by the queue, engine, and backends
// ABOUTME: Fixed at 16-bit signed interleaved PCM per the core's scope

/// Describes the PCM stream the playback core is configured for.
///
/// Per the data model, the core only ever deals in 16-bit signed
/// interleaved PCM; resampling and other bit depths are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Number of interleaved channels (1 or 2).
    pub channels: u8,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioFormat {
    /// Bytes per sample (fixed: 16-bit signed PCM).
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn new(channels: u8, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Size in bytes of one interleaved frame (one sample per channel).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * Self::BYTES_PER_SAMPLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_stereo() {
        let fmt = AudioFormat::new(2, 44_100);
        assert_eq!(fmt.frame_size(), 4);
    }

    #[test]
    fn frame_size_mono() {
        let fmt = AudioFormat::new(1, 48_000);
        assert_eq!(fmt.frame_size(), 2);
    }
}
