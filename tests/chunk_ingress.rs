// ABOUTME: Integration coverage for the raw chunk-queue FIFO
// ABOUTME: Gap/overlap reconciliation in PlaybackCore::submit is covered in engine.rs's own tests,
// ABOUTME: since exercising it needs the private `format` field that a real backend would otherwise require

use std::sync::Arc;

use sendspin_core::{ChunkQueue, QueuedChunk};

#[test]
fn queue_preserves_arrival_order_across_many_pushes() {
    let queue = ChunkQueue::new();
    for i in 0..50 {
        queue.push(QueuedChunk::new(
            i * 1_000,
            Arc::from(vec![i as u8; 4].into_boxed_slice()),
        ));
    }
    for i in 0..50 {
        let chunk = queue.pop().unwrap();
        assert_eq!(chunk.source_ts_us, i * 1_000);
    }
    assert!(queue.pop().is_none());
}

#[test]
fn clear_is_idempotent() {
    let queue = ChunkQueue::new();
    queue.push(QueuedChunk::new(0, Arc::from(vec![0u8; 4].into_boxed_slice())));
    queue.clear();
    queue.clear();
    assert!(queue.is_empty());
    assert_eq!(queue.len(), 0);
}
