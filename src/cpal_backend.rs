// ABOUTME: cpal-based realtime audio output/input backends
// ABOUTME: Bridges cpal's native i16 callback to the byte-oriented AudioBackend trait

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use crate::backend::{AudioBackend, AudioInputBackend, CallbackTiming};
use crate::error::{Error, Result};
use crate::format::AudioFormat;

/// cpal-based realtime output backend.
///
/// The fill callback operates on raw interleaved bytes (per the core's
/// 16-bit PCM data model); this type owns a scratch `i16` buffer and
/// converts to/from bytes at the boundary since cpal's native callback
/// works in typed samples.
pub struct CpalOutputBackend {
    format: AudioFormat,
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    fill: Option<Arc<dyn Fn(&mut [u8], CallbackTiming) + Send + Sync>>,
}

impl CpalOutputBackend {
    pub fn new(format: AudioFormat) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Backend("no output device available".into()))?;

        if let Ok(def) = device.default_output_config() {
            log::info!(
                "output device default: {:?} {}Hz {}ch",
                def.sample_format(),
                def.sample_rate().0,
                def.channels()
            );
            if def.sample_rate().0 != format.sample_rate || def.channels() != format.channels as u16
            {
                log::warn!(
                    "requested {}Hz/{}ch but device default is {}Hz/{}ch; OS may resample",
                    format.sample_rate,
                    format.channels,
                    def.sample_rate().0,
                    def.channels()
                );
            }
        }

        let config = StreamConfig {
            channels: format.channels as u16,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            format,
            device,
            config,
            stream: None,
            fill: None,
        })
    }

    /// Install the fill callback. Must be called before
    /// [`AudioBackend::start`].
    pub fn set_fill_callback<F>(&mut self, fill: F)
    where
        F: Fn(&mut [u8], CallbackTiming) + Send + Sync + 'static,
    {
        self.fill = Some(Arc::new(fill));
    }

    fn build_stream(&self) -> Result<Stream> {
        let fill = self
            .fill
            .clone()
            .ok_or_else(|| Error::Config("no fill callback installed".into()))?;
        let channels = self.format.channels as usize;
        let mut scratch: Vec<u8> = Vec::new();
        let mut stream_origin: Option<cpal::StreamInstant> = None;
        let underflow_flag = Arc::new(AtomicBool::new(false));
        let underflow_flag_err = Arc::clone(&underflow_flag);

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [i16], info: &cpal::OutputCallbackInfo| {
                    let byte_len = data.len() * 2;
                    if scratch.len() < byte_len {
                        scratch.resize(byte_len, 0);
                    }
                    let bytes = &mut scratch[..byte_len];

                    let playback = info.timestamp().playback;
                    let origin = *stream_origin.get_or_insert(playback);
                    let dac_time_us = playback
                        .duration_since(&origin)
                        .map(|d| d.as_micros() as i64)
                        .unwrap_or(0);
                    let underflow = underflow_flag.swap(false, Ordering::Relaxed);

                    fill(
                        bytes,
                        CallbackTiming {
                            dac_time_us,
                            frame_count: data.len() / channels.max(1),
                            underflow,
                        },
                    );

                    for (out, chunk) in data.iter_mut().zip(bytes.chunks_exact(2)) {
                        *out = i16::from_le_bytes([chunk[0], chunk[1]]);
                    }
                },
                move |err| {
                    log::error!("audio output stream error: {err}");
                    underflow_flag_err.store(true, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| Error::Backend(e.to_string()))?;

        Ok(stream)
    }
}

impl AudioBackend for CpalOutputBackend {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn start(&mut self) -> Result<()> {
        let stream = self.build_stream()?;
        stream.play().map_err(|e| Error::Backend(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.pause().map_err(|e| Error::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

/// cpal-based realtime input backend, used by the calibrator to capture the
/// rendered room audio for GCC-PHAT correlation against the reference
/// signal.
pub struct CpalInputBackend {
    format: AudioFormat,
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    on_samples: Option<Arc<dyn Fn(&[i16], i64) + Send + Sync>>,
}

impl CpalInputBackend {
    pub fn new(format: AudioFormat) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Backend("no input device available".into()))?;

        let config = StreamConfig {
            channels: format.channels as u16,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            format,
            device,
            config,
            stream: None,
            on_samples: None,
        })
    }

    /// Install the sample callback. `on_samples` receives the captured
    /// frames alongside the ADC time (microseconds, relative to stream
    /// start) the backend stamped the buffer with — the input-side
    /// counterpart of `dac_time_us`, required by the calibrator to anchor
    /// captured audio against the reference stream.
    pub fn set_sample_callback<F>(&mut self, on_samples: F)
    where
        F: Fn(&[i16], i64) + Send + Sync + 'static,
    {
        self.on_samples = Some(Arc::new(on_samples));
    }

    fn build_stream(&self) -> Result<Stream> {
        let on_samples = self
            .on_samples
            .clone()
            .ok_or_else(|| Error::Config("no sample callback installed".into()))?;

        let supported = self
            .device
            .default_input_config()
            .map_err(|e| Error::Backend(e.to_string()))?;

        let mut stream_origin: Option<cpal::StreamInstant> = None;

        let stream = match supported.sample_format() {
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &self.config,
                    move |data: &[i16], info: &cpal::InputCallbackInfo| {
                        let capture = info.timestamp().capture;
                        let origin = *stream_origin.get_or_insert(capture);
                        let adc_time_us = capture
                            .duration_since(&origin)
                            .map(|d| d.as_micros() as i64)
                            .unwrap_or(0);
                        on_samples(data, adc_time_us);
                    },
                    |err| log::error!("audio input stream error: {err}"),
                    None,
                )
                .map_err(|e| Error::Backend(e.to_string()))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported input sample format: {other:?}"
                )))
            }
        };

        Ok(stream)
    }
}

impl AudioInputBackend for CpalInputBackend {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn start(&mut self) -> Result<()> {
        let stream = self.build_stream()?;
        stream.play().map_err(|e| Error::Backend(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.pause().map_err(|e| Error::Backend(e.to_string()))?;
        }
        Ok(())
    }
}
