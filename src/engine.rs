// ABOUTME: Playback core: format/volume control, chunk ingress, and the realtime audio callback
// ABOUTME: Owns event-thread state; cross-thread state lives in `Shared` per the concurrency model

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{AudioBackend, CallbackTiming};
use crate::clock::ClockMapper;
use crate::corrector::{CorrectionOutcome, DriftCorrector};
use crate::cpal_backend::CpalOutputBackend;
use crate::error::Result;
use crate::format::AudioFormat;
use crate::queue::{ChunkQueue, QueuedChunk};
use crate::state::{AtomicPlaybackState, PlaybackState};

/// Minimum chunks buffered before starting playback to absorb network jitter.
pub const MIN_CHUNKS_TO_START: usize = 16;

/// Threshold below which a scheduled start is suspected to be an
/// unsynchronized fallback mapping rather than a real server schedule.
pub const EARLY_START_THRESHOLD_US: i64 = 700_000;

/// Minimum movement of the scheduled start time worth applying, to avoid
/// churn as time sync improves.
pub const START_TIME_UPDATE_THRESHOLD_US: i64 = 5_000;

const UNSET: i64 = i64::MIN;

/// Rate limit for the periodic sync-error/throughput debug log.
const LOG_INTERVAL_US: i64 = 1_000_000;

type TimeFn = Arc<dyn Fn(i64) -> i64 + Send + Sync>;

/// State touched by both the event thread and the realtime audio callback.
///
/// Every field here is either an atomic or guarded by a `parking_lot` mutex
/// cheap enough to never meaningfully contend (the audio thread only ever
/// holds the `clock_mapper` lock for the duration of a single push +
/// estimate, and the event thread only touches it when planning a start
/// time or logging metrics).
struct Shared {
    state: AtomicPlaybackState,
    clock_mapper: parking_lot::Mutex<ClockMapper>,
    playback_position_us: AtomicI64,
    queued_duration_us: AtomicI64,
    server_ts_cursor_us: AtomicI64,
    clear_requested: AtomicBool,
    insert_every_n_frames: AtomicI64,
    drop_every_n_frames: AtomicI64,
    scheduled_start_dac_time_us: AtomicI64,
    scheduled_start_monotonic_us: AtomicI64,
    early_start_suspect: AtomicBool,
    has_reanchored: AtomicBool,
    volume: AtomicU8,
    muted: AtomicBool,
    queue: ChunkQueue,
    compute_server_time: TimeFn,

    /// Smoothed sync error, updated by `submit`'s corrector call and read
    /// back by the audio callback's periodic throughput log.
    filtered_sync_error_us: AtomicI64,
    callback_count: AtomicU64,
    callback_time_total_us: AtomicU64,
    frames_inserted_since_log: AtomicI64,
    frames_dropped_since_log: AtomicI64,
}

/// Snapshot of timing counters for monitoring, mirroring the metrics the
/// original player exposes to its status surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingMetrics {
    pub playback_position_us: i64,
    pub buffered_audio_us: i64,
    pub dac_samples_recorded: usize,
}

/// Time-synchronized playback engine.
///
/// `compute_client_time` converts a source-timeline (server) timestamp into
/// this engine's monotonic timeline; `compute_server_time` is its inverse.
/// Both are supplied by the caller's time-sync layer and injected at
/// construction rather than looked up globally.
pub struct PlaybackCore {
    shared: Arc<Shared>,
    format: Option<AudioFormat>,
    compute_client_time: TimeFn,
    epoch: Instant,
    backend: Option<Box<dyn AudioBackend>>,

    corrector: DriftCorrector,

    stream_started: bool,
    expected_next_timestamp: Option<i64>,
    scheduled_start_loop_time_us: Option<i64>,
    first_server_timestamp_us: Option<i64>,
}

impl PlaybackCore {
    pub fn new(
        compute_client_time: impl Fn(i64) -> i64 + Send + Sync + 'static,
        compute_server_time: impl Fn(i64) -> i64 + Send + Sync + 'static,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: AtomicPlaybackState::new(PlaybackState::Initializing),
            clock_mapper: parking_lot::Mutex::new(ClockMapper::new()),
            playback_position_us: AtomicI64::new(0),
            queued_duration_us: AtomicI64::new(0),
            server_ts_cursor_us: AtomicI64::new(0),
            clear_requested: AtomicBool::new(false),
            insert_every_n_frames: AtomicI64::new(0),
            drop_every_n_frames: AtomicI64::new(0),
            scheduled_start_dac_time_us: AtomicI64::new(UNSET),
            scheduled_start_monotonic_us: AtomicI64::new(UNSET),
            early_start_suspect: AtomicBool::new(false),
            has_reanchored: AtomicBool::new(false),
            volume: AtomicU8::new(100),
            muted: AtomicBool::new(false),
            queue: ChunkQueue::new(),
            compute_server_time: Arc::new(compute_server_time),
            filtered_sync_error_us: AtomicI64::new(0),
            callback_count: AtomicU64::new(0),
            callback_time_total_us: AtomicU64::new(0),
            frames_inserted_since_log: AtomicI64::new(0),
            frames_dropped_since_log: AtomicI64::new(0),
        });

        Self {
            shared,
            format: None,
            compute_client_time: Arc::new(compute_client_time),
            epoch: Instant::now(),
            backend: None,
            corrector: DriftCorrector::new(),
            stream_started: false,
            expected_next_timestamp: None,
            scheduled_start_loop_time_us: None,
            first_server_timestamp_us: None,
        }
    }

    fn monotonic_now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    /// Configure the output format and (re)build the realtime backend.
    /// Resets all playback state, per the original's format-change
    /// behavior.
    pub fn set_format(&mut self, format: AudioFormat) -> Result<()> {
        if let Some(mut backend) = self.backend.take() {
            let _ = backend.stop();
        }
        self.format = Some(format);
        self.clear();

        let mut backend = CpalOutputBackend::new(format)?;
        let shared = Arc::clone(&self.shared);
        let epoch = self.epoch;
        backend.set_fill_callback(move |bytes, timing| {
            fill_callback(&shared, epoch, format, bytes, timing);
        });
        self.backend = Some(Box::new(backend));
        self.stream_started = false;
        log::info!(
            "audio backend configured: {}ch {}Hz",
            format.channels,
            format.sample_rate
        );
        Ok(())
    }

    pub fn set_volume(&mut self, volume: u8, muted: bool) {
        self.shared
            .volume
            .store(volume.min(100), Ordering::Relaxed);
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(mut backend) = self.backend.take() {
            backend.stop()?;
        }
        Ok(())
    }

    /// Drop all queued audio and reset to `Initializing`, ready for a fresh
    /// start anchor on the next `submit`.
    pub fn clear(&mut self) {
        self.shared.clear_requested.store(false, Ordering::Relaxed);
        self.shared.queue.clear();
        self.shared.state.store(PlaybackState::Initializing);
        self.stream_started = false;
        self.expected_next_timestamp = None;
        self.shared.queued_duration_us.store(0, Ordering::Relaxed);
        self.shared.clock_mapper.lock().clear();
        self.shared.playback_position_us.store(0, Ordering::Relaxed);
        self.shared
            .scheduled_start_dac_time_us
            .store(UNSET, Ordering::Relaxed);
        self.shared
            .scheduled_start_monotonic_us
            .store(UNSET, Ordering::Relaxed);
        self.scheduled_start_loop_time_us = None;
        self.shared.server_ts_cursor_us.store(0, Ordering::Relaxed);
        self.first_server_timestamp_us = None;
        self.shared
            .early_start_suspect
            .store(false, Ordering::Relaxed);
        self.shared.has_reanchored.store(false, Ordering::Relaxed);
        self.shared
            .insert_every_n_frames
            .store(0, Ordering::Relaxed);
        self.shared.drop_every_n_frames.store(0, Ordering::Relaxed);
        self.shared.filtered_sync_error_us.store(0, Ordering::Relaxed);
        self.shared.callback_count.store(0, Ordering::Relaxed);
        self.shared.callback_time_total_us.store(0, Ordering::Relaxed);
        self.shared
            .frames_inserted_since_log
            .store(0, Ordering::Relaxed);
        self.shared
            .frames_dropped_since_log
            .store(0, Ordering::Relaxed);
        self.corrector.reset();
    }

    pub fn get_timing_metrics(&self) -> TimingMetrics {
        TimingMetrics {
            playback_position_us: self.shared.playback_position_us.load(Ordering::Relaxed),
            buffered_audio_us: self.shared.queued_duration_us.load(Ordering::Relaxed),
            dac_samples_recorded: self.shared.clock_mapper.lock().len(),
        }
    }

    /// Queue a chunk of PCM audio tagged with its source-timeline
    /// timestamp, reconciling gaps (filled with silence) and overlaps
    /// (trimmed) against the previous chunk's expected continuation point.
    pub fn submit(&mut self, server_timestamp_us: i64, payload: Arc<[u8]>) {
        if self.shared.clear_requested.swap(false, Ordering::AcqRel) {
            self.clear();
            log::info!("cleared audio queue after underflow (deferred from audio thread)");
        }

        let Some(format) = self.format else {
            log::debug!("audio format missing; dropping audio chunk");
            return;
        };
        if payload.len() % format.frame_size() != 0 {
            log::warn!(
                "dropping audio chunk with invalid size: {} bytes (frame size {})",
                payload.len(),
                format.frame_size()
            );
            return;
        }

        let now_us = self.monotonic_now_us();

        if self.scheduled_start_loop_time_us.is_none() {
            let loop_start = (self.compute_client_time)(server_timestamp_us);
            self.scheduled_start_loop_time_us = Some(loop_start);
            self.shared
                .scheduled_start_monotonic_us
                .store(loop_start, Ordering::Relaxed);
            let est_dac = self.estimate_dac_time_for_server_timestamp(server_timestamp_us);
            self.shared
                .scheduled_start_dac_time_us
                .store(est_dac.unwrap_or(UNSET), Ordering::Relaxed);
            self.shared.state.store(PlaybackState::WaitingForStart);
            self.first_server_timestamp_us = Some(server_timestamp_us);
            if loop_start - now_us <= EARLY_START_THRESHOLD_US {
                self.shared
                    .early_start_suspect
                    .store(true, Ordering::Relaxed);
            }
        } else if self.shared.state.load() == PlaybackState::WaitingForStart {
            if let Some(first_ts) = self.first_server_timestamp_us {
                let updated_loop_start = (self.compute_client_time)(first_ts);
                let current = self.scheduled_start_loop_time_us.unwrap_or(0);
                if (updated_loop_start - current).abs() > START_TIME_UPDATE_THRESHOLD_US {
                    self.scheduled_start_loop_time_us = Some(updated_loop_start);
                    self.shared
                        .scheduled_start_monotonic_us
                        .store(updated_loop_start, Ordering::Relaxed);
                    let est_dac = self.estimate_dac_time_for_server_timestamp(first_ts);
                    self.shared
                        .scheduled_start_dac_time_us
                        .store(est_dac.unwrap_or(UNSET), Ordering::Relaxed);
                }
            }
        }

        let playback_position = self.shared.playback_position_us.load(Ordering::Relaxed);
        let cursor = self.shared.server_ts_cursor_us.load(Ordering::Relaxed);
        if self.shared.state.load() == PlaybackState::Playing && playback_position > 0 && cursor > 0
        {
            let sync_error_us = playback_position - cursor;
            let outcome = self.corrector.update(
                sync_error_us,
                format.sample_rate,
                now_us,
                self.shared.state.load() == PlaybackState::Playing,
            );
            self.shared
                .filtered_sync_error_us
                .store(self.corrector.filtered_error_us().round() as i64, Ordering::Relaxed);

            match outcome {
                CorrectionOutcome::Schedule(schedule) => {
                    self.shared
                        .insert_every_n_frames
                        .store(schedule.insert_every_n_frames, Ordering::Relaxed);
                    self.shared
                        .drop_every_n_frames
                        .store(schedule.drop_every_n_frames, Ordering::Relaxed);
                }
                CorrectionOutcome::Reanchor => {
                    log::info!(
                        "sync error {:.1} ms too large; re-anchoring",
                        self.corrector.filtered_error_us() / 1000.0
                    );
                    self.shared.has_reanchored.store(true, Ordering::Relaxed);
                    self.shared.state.store(PlaybackState::Reanchoring);
                    self.clear();
                    return;
                }
            }
        }

        let mut server_timestamp_us = server_timestamp_us;
        let mut payload = payload;

        match self.expected_next_timestamp {
            None => self.expected_next_timestamp = Some(server_timestamp_us),
            Some(expected) if server_timestamp_us > expected => {
                let gap_us = server_timestamp_us - expected;
                let gap_frames = (gap_us * format.sample_rate as i64) / 1_000_000;
                let silence_bytes = gap_frames as usize * format.frame_size();
                let silence: Arc<[u8]> = Arc::from(vec![0u8; silence_bytes].into_boxed_slice());
                self.shared
                    .queue
                    .push(QueuedChunk::new(expected, silence));
                let silence_duration_us =
                    (gap_frames * 1_000_000) / format.sample_rate as i64;
                self.shared
                    .queued_duration_us
                    .fetch_add(silence_duration_us, Ordering::Relaxed);
                log::debug!("gap: {:.1} ms filled with silence", gap_us as f64 / 1000.0);
                self.expected_next_timestamp = Some(server_timestamp_us);
            }
            Some(expected) if server_timestamp_us < expected => {
                let overlap_us = expected - server_timestamp_us;
                let overlap_frames = (overlap_us * format.sample_rate as i64) / 1_000_000;
                let trim_bytes = overlap_frames as usize * format.frame_size();
                if trim_bytes < payload.len() {
                    payload = Arc::from(&payload[trim_bytes..]);
                    server_timestamp_us = expected;
                    log::debug!("overlap: {:.1} ms trimmed", overlap_us as f64 / 1000.0);
                } else {
                    log::debug!(
                        "overlap: {:.1} ms (chunk skipped, already played)",
                        overlap_us as f64 / 1000.0
                    );
                    return;
                }
            }
            _ => {}
        }

        if !payload.is_empty() {
            let chunk_frames = payload.len() / format.frame_size();
            let chunk_duration_us =
                (chunk_frames as i64 * 1_000_000) / format.sample_rate as i64;
            self.shared
                .queue
                .push(QueuedChunk::new(server_timestamp_us, payload));
            self.shared
                .queued_duration_us
                .fetch_add(chunk_duration_us, Ordering::Relaxed);
            self.expected_next_timestamp = Some(server_timestamp_us + chunk_duration_us);
        }

        if !self.stream_started && !self.shared.queue.is_empty() {
            if let Some(backend) = self.backend.as_mut() {
                if backend.start().is_ok() {
                    self.stream_started = true;
                    log::info!(
                        "stream started: {} chunks, {:.2} s buffered",
                        self.shared.queue.len(),
                        self.shared.queued_duration_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
                    );
                }
            }
        }
    }

    fn estimate_dac_time_for_server_timestamp(&self, server_timestamp_us: i64) -> Option<i64> {
        let loop_time_us = (self.compute_client_time)(server_timestamp_us);
        self.shared
            .clock_mapper
            .lock()
            .estimate_dac_for_monotonic(loop_time_us)
    }
}

/// Realtime fill callback run on the audio backend's thread. Owns all
/// per-callback state that the spec requires to stay off the shared
/// structure (the partial-chunk cursor, the correction cadence countdown,
/// the duplicate-frame buffer for inserts).
fn fill_callback(
    shared: &Arc<Shared>,
    epoch: Instant,
    format: AudioFormat,
    bytes: &mut [u8],
    timing: CallbackTiming,
) {
    thread_local! {
        static LOCAL: std::cell::RefCell<LocalCallbackState> =
            std::cell::RefCell::new(LocalCallbackState::default());
    }

    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        run_callback(shared, epoch, format, bytes, timing, &mut local);
    });
}

#[derive(Default)]
struct LocalCallbackState {
    current_chunk: Option<QueuedChunk>,
    current_chunk_offset: usize,
    server_ts_cursor_remainder: i64,
    last_output_frame: Vec<u8>,
    frames_until_next_insert: i64,
    frames_until_next_drop: i64,
    last_log_monotonic_us: i64,
}

fn run_callback(
    shared: &Arc<Shared>,
    epoch: Instant,
    format: AudioFormat,
    bytes: &mut [u8],
    timing: CallbackTiming,
    local: &mut LocalCallbackState,
) {
    let callback_start = Instant::now();
    let monotonic_now_us = epoch.elapsed().as_micros() as i64;

    if timing.underflow {
        shared.clear_requested.store(true, Ordering::Relaxed);
        bytes.fill(0);
        log::warn!("hardware underflow reported; requesting a clear on the next submit");
        return;
    }

    {
        let mut mapper = shared.clock_mapper.lock();
        mapper.record(timing.dac_time_us, monotonic_now_us);
        if let Some(loop_at_dac) = mapper.estimate_monotonic_for_dac(timing.dac_time_us) {
            let position = (shared.compute_server_time)(loop_at_dac);
            shared.playback_position_us.store(position, Ordering::Relaxed);
        }
        if shared.scheduled_start_dac_time_us.load(Ordering::Relaxed) == UNSET {
            let scheduled_monotonic = shared.scheduled_start_monotonic_us.load(Ordering::Relaxed);
            if scheduled_monotonic != UNSET {
                if let Some(est_dac) = mapper.estimate_dac_for_monotonic(scheduled_monotonic) {
                    shared
                        .scheduled_start_dac_time_us
                        .store(est_dac, Ordering::Relaxed);
                }
            }
        }
    }

    let frame_size = format.frame_size();
    let bytes_needed = bytes.len();
    let mut bytes_written = 0usize;

    let state = shared.state.load();
    if state == PlaybackState::WaitingForStart {
        bytes_written = handle_start_gating(
            shared,
            format,
            timing,
            monotonic_now_us,
            bytes,
            bytes_written,
            local,
        );
        if shared.state.load() == PlaybackState::WaitingForStart && bytes_written < bytes_needed {
            bytes[bytes_written..].fill(0);
            bytes_written = bytes_needed;
        }
    } else {
        let insert_every_n = shared.insert_every_n_frames.load(Ordering::Relaxed);
        let drop_every_n = shared.drop_every_n_frames.load(Ordering::Relaxed);
        let frame_count = bytes_needed / frame_size.max(1);

        if insert_every_n == 0 && drop_every_n == 0 {
            bytes_written += read_input_frames_bulk(
                shared,
                format,
                local,
                &mut bytes[bytes_written..bytes_written + frame_count * frame_size],
            );
        } else {
            bytes_written += read_with_corrections(
                shared,
                format,
                local,
                insert_every_n,
                drop_every_n,
                frame_count,
                &mut bytes[bytes_written..],
            );
        }
    }

    if bytes_written < bytes_needed {
        bytes[bytes_written..].fill(0);
    }

    apply_volume(shared, bytes);

    let elapsed_us = callback_start.elapsed().as_micros() as u64;
    shared.callback_count.fetch_add(1, Ordering::Relaxed);
    shared
        .callback_time_total_us
        .fetch_add(elapsed_us, Ordering::Relaxed);
    maybe_log_chunk_timing(shared, monotonic_now_us, local);
}

/// Rate-limited (§11 ambient logging) debug line reporting smoothed sync
/// error, buffered duration, effective playback speed, and average
/// callback execution time; resets the per-interval insert/drop counters
/// after each line.
fn maybe_log_chunk_timing(shared: &Arc<Shared>, monotonic_now_us: i64, local: &mut LocalCallbackState) {
    if monotonic_now_us - local.last_log_monotonic_us < LOG_INTERVAL_US {
        return;
    }
    local.last_log_monotonic_us = monotonic_now_us;

    let count = shared.callback_count.swap(0, Ordering::Relaxed);
    let total_us = shared.callback_time_total_us.swap(0, Ordering::Relaxed);
    let inserted = shared.frames_inserted_since_log.swap(0, Ordering::Relaxed);
    let dropped = shared.frames_dropped_since_log.swap(0, Ordering::Relaxed);
    if count == 0 {
        return;
    }

    let avg_callback_us = total_us as f64 / count as f64;
    let sync_error_us = shared.filtered_sync_error_us.load(Ordering::Relaxed);
    let buffered_s = shared.queued_duration_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
    let insert_every_n = shared.insert_every_n_frames.load(Ordering::Relaxed);
    let drop_every_n = shared.drop_every_n_frames.load(Ordering::Relaxed);
    let speed_pct = effective_speed_percent(insert_every_n, drop_every_n);

    log::debug!(
        "sync error {:.1} ms, buffered {:.2} s, speed {:.2}%, avg callback {:.1} us, +{} -{}",
        sync_error_us as f64 / 1000.0,
        buffered_s,
        speed_pct,
        avg_callback_us,
        inserted,
        dropped,
    );
}

/// Effective playback speed as a percentage of nominal, implied by the
/// current insert/drop cadence (a drop consumes two input frames per
/// output frame; an insert consumes none).
fn effective_speed_percent(insert_every_n: i64, drop_every_n: i64) -> f64 {
    let mut speed = 1.0;
    if drop_every_n > 0 {
        speed += 1.0 / drop_every_n as f64;
    }
    if insert_every_n > 0 {
        speed -= 1.0 / insert_every_n as f64;
    }
    speed * 100.0
}

fn handle_start_gating(
    shared: &Arc<Shared>,
    format: AudioFormat,
    timing: CallbackTiming,
    monotonic_now_us: i64,
    output: &mut [u8],
    mut bytes_written: usize,
    local: &mut LocalCallbackState,
) -> usize {
    let scheduled_start_dac = shared.scheduled_start_dac_time_us.load(Ordering::Relaxed);
    let dac_based = scheduled_start_dac != UNSET;

    let (delta_us, current_us, scheduled_us) = if dac_based {
        (
            scheduled_start_dac - timing.dac_time_us,
            timing.dac_time_us,
            scheduled_start_dac,
        )
    } else {
        let scheduled_start_monotonic = shared.scheduled_start_monotonic_us.load(Ordering::Relaxed);
        if scheduled_start_monotonic == UNSET {
            return bytes_written;
        }
        (
            scheduled_start_monotonic - monotonic_now_us,
            monotonic_now_us,
            scheduled_start_monotonic,
        )
    };

    if delta_us > 0 {
        let frames_until_start =
            (delta_us * format.sample_rate as i64 + 999_999) / 1_000_000;
        let frames_requested = timing.frame_count as i64;
        let frames_to_silence = frames_until_start.min(frames_requested).max(0) as usize;
        let silence_bytes = (frames_to_silence * format.frame_size())
            .min(output.len().saturating_sub(bytes_written));
        output[bytes_written..bytes_written + silence_bytes].fill(0);
        bytes_written += silence_bytes;
    } else if dac_based {
        // Fast-forwarding past a negative delta is only trustworthy with a
        // DAC-based gate; a monotonic-only gate just waits for `current_us`
        // to catch up to `scheduled_us` below.
        let early_start_suspect = shared.early_start_suspect.load(Ordering::Relaxed);
        let has_reanchored = shared.has_reanchored.load(Ordering::Relaxed);
        if !(early_start_suspect && !has_reanchored) {
            let frames_to_drop =
                ((-delta_us) * format.sample_rate as i64 + 999_999) / 1_000_000;
            skip_input_frames(shared, format, local, frames_to_drop);
            shared.state.store(PlaybackState::Playing);
        }
    }

    if current_us >= scheduled_us {
        shared.state.store(PlaybackState::Playing);
    }

    bytes_written
}

fn advance_server_cursor_frames(shared: &Arc<Shared>, format: AudioFormat, local: &mut LocalCallbackState, frames: i64) {
    if frames <= 0 {
        return;
    }
    local.server_ts_cursor_remainder += frames * 1_000_000;
    let sr = format.sample_rate as i64;
    if local.server_ts_cursor_remainder >= sr {
        let inc_us = local.server_ts_cursor_remainder / sr;
        local.server_ts_cursor_remainder %= sr;
        shared
            .server_ts_cursor_us
            .fetch_add(inc_us, Ordering::Relaxed);
    }
}

fn advance_finished_chunk(shared: &Arc<Shared>, format: AudioFormat, local: &mut LocalCallbackState) {
    let Some(chunk) = local.current_chunk.take() else {
        return;
    };
    let chunk_frames = chunk.audio_data.len() / format.frame_size();
    let chunk_duration_us = (chunk_frames as i64 * 1_000_000) / format.sample_rate as i64;
    shared
        .queued_duration_us
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
            Some((d - chunk_duration_us).max(0))
        })
        .ok();
    local.current_chunk_offset = 0;
}

/// Reads `n_frames` worth of bytes from the queue into `out`, padding with
/// silence once the queue is exhausted. Returns bytes written (always
/// `out.len()`).
fn read_input_frames_bulk(
    shared: &Arc<Shared>,
    format: AudioFormat,
    local: &mut LocalCallbackState,
    out: &mut [u8],
) -> usize {
    let frame_size = format.frame_size();
    let total = out.len();
    let mut written = 0usize;

    while written < total {
        if local.current_chunk.is_none() {
            match shared.queue.pop() {
                Some(chunk) => {
                    if shared.server_ts_cursor_us.load(Ordering::Relaxed) == 0 {
                        shared
                            .server_ts_cursor_us
                            .store(chunk.source_ts_us, Ordering::Relaxed);
                    }
                    local.current_chunk = Some(chunk);
                    local.current_chunk_offset = 0;
                }
                None => {
                    out[written..].fill(0);
                    break;
                }
            }
        }

        let chunk = local.current_chunk.as_ref().unwrap();
        let available = chunk.audio_data.len() - local.current_chunk_offset;
        let to_read = available.min(total - written);

        out[written..written + to_read].copy_from_slice(
            &chunk.audio_data[local.current_chunk_offset..local.current_chunk_offset + to_read],
        );

        local.current_chunk_offset += to_read;
        written += to_read;
        let frames_read = (to_read / frame_size) as i64;
        advance_server_cursor_frames(shared, format, local, frames_read);

        if local.current_chunk_offset >= chunk.audio_data.len() {
            advance_finished_chunk(shared, format, local);
        }
    }

    if written >= frame_size {
        local.last_output_frame = out[written - frame_size..written].to_vec();
    }

    written
}

fn skip_input_frames(shared: &Arc<Shared>, format: AudioFormat, local: &mut LocalCallbackState, mut frames_to_skip: i64) {
    let frame_size = format.frame_size();
    while frames_to_skip > 0 {
        if local.current_chunk.is_none() {
            match shared.queue.pop() {
                Some(chunk) => {
                    if shared.server_ts_cursor_us.load(Ordering::Relaxed) == 0 {
                        shared
                            .server_ts_cursor_us
                            .store(chunk.source_ts_us, Ordering::Relaxed);
                    }
                    local.current_chunk = Some(chunk);
                    local.current_chunk_offset = 0;
                }
                None => break,
            }
        }
        let chunk = local.current_chunk.as_ref().unwrap();
        let remaining_frames = (chunk.audio_data.len() - local.current_chunk_offset) / frame_size;
        if remaining_frames == 0 {
            advance_finished_chunk(shared, format, local);
            continue;
        }
        let take = (remaining_frames as i64).min(frames_to_skip);
        local.current_chunk_offset += take as usize * frame_size;
        advance_server_cursor_frames(shared, format, local, take);
        frames_to_skip -= take;
        if local.current_chunk_offset >= chunk.audio_data.len() {
            advance_finished_chunk(shared, format, local);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn read_with_corrections(
    shared: &Arc<Shared>,
    format: AudioFormat,
    local: &mut LocalCallbackState,
    insert_every_n: i64,
    drop_every_n: i64,
    frame_count: usize,
    out: &mut [u8],
) -> usize {
    let frame_size = format.frame_size();
    if local.frames_until_next_insert <= 0 && insert_every_n > 0 {
        local.frames_until_next_insert = insert_every_n;
    }
    if local.frames_until_next_drop <= 0 && drop_every_n > 0 {
        local.frames_until_next_drop = drop_every_n;
    }
    if local.last_output_frame.is_empty() {
        local.last_output_frame = vec![0u8; frame_size];
    }

    let mut insert_counter = local.frames_until_next_insert;
    let mut drop_counter = local.frames_until_next_drop;
    let mut frames_remaining = frame_count as i64;
    let mut written = 0usize;

    while frames_remaining > 0 {
        let frames_until_insert = if insert_every_n > 0 {
            insert_counter
        } else {
            frames_remaining + 1
        };
        let frames_until_drop = if drop_every_n > 0 {
            drop_counter
        } else {
            frames_remaining + 1
        };
        let next_event_in = frames_until_insert.min(frames_until_drop).min(frames_remaining);

        if next_event_in > 0 {
            let segment_bytes = next_event_in as usize * frame_size;
            written += read_input_frames_bulk(
                shared,
                format,
                local,
                &mut out[written..written + segment_bytes],
            );
            frames_remaining -= next_event_in;
            insert_counter -= next_event_in;
            drop_counter -= next_event_in;
        }

        if frames_remaining > 0 {
            if drop_counter <= 0 && drop_every_n > 0 {
                let mut scratch = vec![0u8; frame_size];
                read_input_frames_bulk(shared, format, local, &mut scratch);
                read_input_frames_bulk(shared, format, local, &mut scratch);
                drop_counter = drop_every_n;
                out[written..written + frame_size].copy_from_slice(&local.last_output_frame);
                written += frame_size;
                frames_remaining -= 1;
                insert_counter -= 1;
                shared
                    .frames_dropped_since_log
                    .fetch_add(1, Ordering::Relaxed);
            } else if insert_counter <= 0 && insert_every_n > 0 {
                insert_counter = insert_every_n;
                out[written..written + frame_size].copy_from_slice(&local.last_output_frame);
                written += frame_size;
                frames_remaining -= 1;
                drop_counter -= 1;
                shared
                    .frames_inserted_since_log
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    local.frames_until_next_insert = insert_counter;
    local.frames_until_next_drop = drop_counter;
    written
}

fn apply_volume(shared: &Arc<Shared>, bytes: &mut [u8]) {
    let muted = shared.muted.load(Ordering::Relaxed);
    let volume = shared.volume.load(Ordering::Relaxed);

    if muted || volume == 0 {
        bytes.fill(0);
        return;
    }
    if volume == 100 {
        return;
    }

    let amplitude = (volume as f64 / 100.0).powf(1.5);
    for chunk in bytes.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        let scaled = (sample as f64 * amplitude).clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        let out = scaled.to_le_bytes();
        chunk[0] = out[0];
        chunk[1] = out[1];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_core() -> PlaybackCore {
        PlaybackCore::new(|ts| ts, |ts| ts)
    }

    /// Builds a `Shared` in isolation, for tests exercising the callback-side
    /// functions directly without a real backend.
    fn test_shared(state: PlaybackState, volume: u8, muted: bool) -> Arc<Shared> {
        Arc::new(Shared {
            state: AtomicPlaybackState::new(state),
            clock_mapper: parking_lot::Mutex::new(ClockMapper::new()),
            playback_position_us: AtomicI64::new(0),
            queued_duration_us: AtomicI64::new(0),
            server_ts_cursor_us: AtomicI64::new(0),
            clear_requested: AtomicBool::new(false),
            insert_every_n_frames: AtomicI64::new(0),
            drop_every_n_frames: AtomicI64::new(0),
            scheduled_start_dac_time_us: AtomicI64::new(UNSET),
            scheduled_start_monotonic_us: AtomicI64::new(UNSET),
            early_start_suspect: AtomicBool::new(false),
            has_reanchored: AtomicBool::new(false),
            volume: AtomicU8::new(volume),
            muted: AtomicBool::new(muted),
            queue: ChunkQueue::new(),
            compute_server_time: Arc::new(|ts| ts),
            filtered_sync_error_us: AtomicI64::new(0),
            callback_count: AtomicU64::new(0),
            callback_time_total_us: AtomicU64::new(0),
            frames_inserted_since_log: AtomicI64::new(0),
            frames_dropped_since_log: AtomicI64::new(0),
        })
    }

    #[test]
    fn volume_curve_matches_power_law() {
        let shared = test_shared(PlaybackState::Playing, 50, false);
        let sample: i16 = 10_000;
        let mut bytes = sample.to_le_bytes().to_vec();
        apply_volume(&shared, &mut bytes);
        let out = i16::from_le_bytes([bytes[0], bytes[1]]);
        let expected = (sample as f64 * (0.5f64).powf(1.5)).round() as i16;
        assert!((out - expected).abs() <= 1);
    }

    #[test]
    fn mute_forces_silence() {
        let shared = test_shared(PlaybackState::Playing, 80, true);
        let mut bytes = 12345i16.to_le_bytes().to_vec();
        apply_volume(&shared, &mut bytes);
        assert_eq!(bytes, vec![0, 0]);
    }

    #[test]
    fn clear_resets_to_initializing() {
        let mut core = identity_core();
        core.format = Some(AudioFormat::new(2, 44_100));
        core.shared.state.store(PlaybackState::Playing);
        core.clear();
        assert_eq!(core.shared.state.load(), PlaybackState::Initializing);
        assert!(core.shared.queue.is_empty());
    }

    #[test]
    fn submit_without_format_is_a_noop() {
        let mut core = identity_core();
        core.submit(0, Arc::from(vec![0u8; 4].into_boxed_slice()));
        assert!(core.shared.queue.is_empty());
    }

    #[test]
    fn submit_schedules_start_on_first_chunk() {
        let mut core = identity_core();
        core.format = Some(AudioFormat::new(2, 44_100));
        core.submit(1_000_000, Arc::from(vec![0u8; 4].into_boxed_slice()));
        assert_eq!(core.shared.state.load(), PlaybackState::WaitingForStart);
        assert_eq!(core.scheduled_start_loop_time_us, Some(1_000_000));
    }

    #[test]
    fn submit_fills_gap_with_silence() {
        let mut core = identity_core();
        let format = AudioFormat::new(1, 1_000);
        core.format = Some(format);
        core.submit(0, Arc::from(vec![0u8; 2].into_boxed_slice()));
        core.submit(10_000, Arc::from(vec![1u8, 2u8].into_boxed_slice()));
        // First chunk (real), then a gap-silence chunk, then the second real chunk.
        assert_eq!(core.shared.queue.len(), 3);
    }

    /// Property 2: submitting an overlap shorter than the chunk trims the
    /// payload and re-tags it at the expected continuation point, rather
    /// than enqueuing a duplicate or a short silence gap.
    #[test]
    fn submit_trims_overlap_shorter_than_chunk() {
        let mut core = identity_core();
        let format = AudioFormat::new(1, 1_000); // 1 frame = 2 bytes = 1 ms
        core.format = Some(format);
        // 10 frames (10 ms) starting at ts=0; expected continuation is 10_000.
        core.submit(0, Arc::from(vec![0u8; 20].into_boxed_slice()));
        // Starts 6 ms before the expected continuation; the first 6 frames
        // (12 bytes) of its 10-frame payload are trimmed away.
        let payload: Vec<u8> = (0..20u8).collect();
        core.submit(4_000, Arc::from(payload.into_boxed_slice()));

        assert_eq!(core.shared.queue.len(), 2);
        let first = core.shared.queue.pop().unwrap();
        assert_eq!(first.source_ts_us, 0);
        let second = core.shared.queue.pop().unwrap();
        assert_eq!(second.source_ts_us, 10_000);
        assert_eq!(second.audio_data.len(), 8);
    }

    /// Property 2 (trim idempotence): an overlap that covers the entire
    /// payload is a no-op on the queue, not an empty enqueued chunk.
    #[test]
    fn submit_drops_overlap_covering_entire_chunk() {
        let mut core = identity_core();
        let format = AudioFormat::new(1, 1_000);
        core.format = Some(format);
        core.submit(0, Arc::from(vec![0u8; 20].into_boxed_slice()));
        // Entirely before the expected continuation point (8 ms of overlap
        // against a 4 ms payload); must be skipped, not enqueued.
        core.submit(2_000, Arc::from(vec![9u8; 8].into_boxed_slice()));
        assert_eq!(core.shared.queue.len(), 1);
    }

    #[test]
    fn start_gating_falls_back_to_monotonic_when_dac_unknown() {
        let shared = test_shared(PlaybackState::WaitingForStart, 100, false);
        shared
            .scheduled_start_monotonic_us
            .store(10_000, Ordering::Relaxed);
        let format = AudioFormat::new(1, 1_000);
        let mut local = LocalCallbackState::default();
        let timing = CallbackTiming {
            dac_time_us: 0,
            frame_count: 20,
            underflow: false,
        };
        let mut output = vec![0xFFu8; 40];
        let written =
            handle_start_gating(&shared, format, timing, 5_000, &mut output, 0, &mut local);
        // 5 ms remain until the 10 ms monotonic start; at 1000 frames/sec
        // that's 5 frames (10 bytes) of silence.
        assert_eq!(written, 10);
        assert_eq!(&output[..10], &[0u8; 10]);
        assert_eq!(shared.state.load(), PlaybackState::WaitingForStart);
    }

    #[test]
    fn start_gating_transitions_to_playing_once_monotonic_catches_up() {
        let shared = test_shared(PlaybackState::WaitingForStart, 100, false);
        shared
            .scheduled_start_monotonic_us
            .store(10_000, Ordering::Relaxed);
        let format = AudioFormat::new(1, 1_000);
        let mut local = LocalCallbackState::default();
        let timing = CallbackTiming {
            dac_time_us: 0,
            frame_count: 20,
            underflow: false,
        };
        let mut output = vec![0xFFu8; 40];
        handle_start_gating(&shared, format, timing, 10_000, &mut output, 0, &mut local);
        assert_eq!(shared.state.load(), PlaybackState::Playing);
    }

    #[test]
    fn run_callback_honors_hardware_underflow() {
        let shared = test_shared(PlaybackState::Playing, 100, false);
        let format = AudioFormat::new(1, 1_000);
        let mut local = LocalCallbackState::default();
        let mut bytes = vec![0xFFu8; 16];
        let timing = CallbackTiming {
            dac_time_us: 0,
            frame_count: 8,
            underflow: true,
        };
        run_callback(&shared, Instant::now(), format, &mut bytes, timing, &mut local);
        assert_eq!(bytes, vec![0u8; 16]);
        assert!(shared.clear_requested.load(Ordering::Relaxed));
        // An underflow callback returns before the calibration step, so the
        // clock mapper never sees a bogus DAC/monotonic pair from it.
        assert!(shared.clock_mapper.lock().is_empty());
    }
}
