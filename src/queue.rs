// ABOUTME: FIFO of timestamped PCM chunks consumed by the audio callback
// ABOUTME: Singly-owned by the engine; enqueue/dequeue are the only cross-thread ops

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::format::AudioFormat;

/// A chunk of PCM audio tagged with the source-timeline timestamp of its
/// first frame.
///
/// `audio_data` is a reference-counted immutable buffer so enqueue never
/// copies the payload — the transport layer that produced the bytes keeps
/// ownership semantics simple via `Arc`.
#[derive(Debug, Clone)]
pub struct QueuedChunk {
    /// Source timestamp (microseconds) of this chunk's first frame.
    pub source_ts_us: i64,
    /// Interleaved PCM bytes; length is always a whole multiple of the
    /// configured frame size.
    pub audio_data: Arc<[u8]>,
}

impl QueuedChunk {
    pub fn new(source_ts_us: i64, audio_data: Arc<[u8]>) -> Self {
        Self {
            source_ts_us,
            audio_data,
        }
    }

    pub fn frame_count(&self, format: &AudioFormat) -> usize {
        self.audio_data.len() / format.frame_size()
    }
}

/// Fine-locked single-producer/single-consumer FIFO of queued chunks.
///
/// The event thread is the sole producer (`push`); the audio thread is the
/// sole consumer (draining via [`ChunkQueue::pop`] or the bulk helpers used
/// by the engine). A `parking_lot::Mutex` guards the deque rather than a
/// true lock-free ring: contention is effectively zero since each side
/// only ever touches it from its own thread, and correctness is easier to
/// reason about than a hand-rolled ring buffer.
#[derive(Default)]
pub struct ChunkQueue {
    chunks: Mutex<VecDeque<QueuedChunk>>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, chunk: QueuedChunk) {
        self.chunks.lock().push_back(chunk);
    }

    pub fn pop(&self) -> Option<QueuedChunk> {
        self.chunks.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ts: i64, len: usize) -> QueuedChunk {
        QueuedChunk::new(ts, Arc::from(vec![0u8; len].into_boxed_slice()))
    }

    #[test]
    fn fifo_ordering() {
        let q = ChunkQueue::new();
        q.push(chunk(0, 4));
        q.push(chunk(1000, 4));
        assert_eq!(q.pop().unwrap().source_ts_us, 0);
        assert_eq!(q.pop().unwrap().source_ts_us, 1000);
        assert!(q.pop().is_none());
    }

    #[test]
    fn clear_empties_queue() {
        let q = ChunkQueue::new();
        q.push(chunk(0, 4));
        q.push(chunk(1000, 4));
        q.clear();
        assert!(q.is_empty());
    }
}
