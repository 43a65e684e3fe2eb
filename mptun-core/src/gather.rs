//! Fan-in of decoded batches from every link, with duplicate suppression.

use crate::buffer::{BufferHandle, BufferPool};
use crate::filter::DuplicateFilter;
use crate::proto::FrameRef;
use crate::stats::FlowStats;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Frames decoded from one received buffer.
///
/// The frames borrow nothing: they are ranges into `buffer`, which travels
/// with them so the bytes stay alive until the batch is consumed.
#[derive(Debug)]
pub struct DecodedBatch {
    pub buffer: BufferHandle,
    pub frames: Vec<FrameRef>,
}

impl DecodedBatch {
    pub fn new(buffer: BufferHandle, frames: Vec<FrameRef>) -> Self {
        Self { buffer, frames }
    }

    pub fn payload(&self, frame: &FrameRef) -> &[u8] {
        frame.payload(self.buffer.data())
    }

    /// Each frame paired with its payload bytes.
    pub fn iter(&self) -> impl Iterator<Item = (&FrameRef, &[u8])> {
        self.frames.iter().map(|f| (f, self.payload(f)))
    }

    pub fn payload_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Destination for batches produced by a link's receive loop.
pub trait FrameSink: Send + Sync {
    fn forward(&self, batch: DecodedBatch);
}

/// Sink that discards everything, for links that only transmit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl FrameSink for Discard {
    fn forward(&self, batch: DecodedBatch) {
        tracing::trace!(frames = batch.frames.len(), "discarding inbound batch");
    }
}

/// Fan-in collector: deduplicates and publishes to one bounded queue.
pub struct Gatherer {
    tx: mpsc::Sender<DecodedBatch>,
    filter: DuplicateFilter,
    stats: Arc<FlowStats>,
}

impl Gatherer {
    /// Create a gatherer whose output queue holds `capacity` batches.
    pub fn new(capacity: usize, stats: Arc<FlowStats>) -> (Self, mpsc::Receiver<DecodedBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let gatherer = Self {
            tx,
            filter: DuplicateFilter::new(),
            stats,
        };
        (gatherer, rx)
    }

    pub fn stats(&self) -> &Arc<FlowStats> {
        &self.stats
    }

    /// Drop already-seen frames and queue the rest. Never blocks; a full queue
    /// loses the batch.
    pub fn forward(&self, mut batch: DecodedBatch) {
        self.stats
            .input
            .count(batch.frames.len(), batch.payload_bytes());

        batch
            .frames
            .retain(|frame| !self.filter.check_and_mark(frame.packet_id));
        if batch.is_empty() {
            return;
        }

        let (packets, bytes) = (batch.frames.len(), batch.payload_bytes());
        match self.tx.try_send(batch) {
            Ok(()) => self.stats.output.count(packets, bytes),
            Err(TrySendError::Full(_)) => {
                tracing::debug!(packets, bytes, "gather queue full, dropping batch");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("gather queue closed");
            }
        }
    }
}

impl FrameSink for Gatherer {
    fn forward(&self, batch: DecodedBatch) {
        Gatherer::forward(self, batch)
    }
}

/// Copy the payloads of `batch` into one pooled buffer per connection id,
/// one sub-packet per frame, keeping arrival order within a connection.
pub fn split_by_conn(batch: &DecodedBatch, pool: &BufferPool) -> Vec<(u16, BufferHandle)> {
    let mut groups: Vec<(u16, BufferHandle)> = Vec::new();
    for (frame, payload) in batch.iter() {
        let idx = match groups.iter().position(|(id, _)| *id == frame.conn_id) {
            Some(idx) => idx,
            None => {
                groups.push((frame.conn_id, pool.allocate()));
                groups.len() - 1
            }
        };
        if let Some(buf) = groups[idx].1.get_mut() {
            buf.append(payload);
        }
    }
    groups
}

/// Copy every frame of `batch`, header included, into a pooled buffer with
/// one sub-packet per frame.
pub fn repack_frames(batch: &DecodedBatch, pool: &BufferPool) -> BufferHandle {
    let mut out = pool.allocate();
    if let Some(buf) = out.get_mut() {
        for frame in &batch.frames {
            buf.append(&batch.buffer.data()[frame.frame_range()]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::proto::{decode_batch, push_frame, Packet};

    fn encoded(pool: &BufferPool, packets: &[Packet<'_>]) -> DecodedBatch {
        let mut handle = pool.allocate();
        let buf = handle.get_mut().unwrap();
        for packet in packets {
            assert!(push_frame(buf, packet));
        }
        let (frames, trailing) = decode_batch(handle.data());
        assert_eq!(trailing, 0);
        DecodedBatch::new(handle, frames)
    }

    #[test]
    fn test_same_packet_twice_forwards_once() {
        let pool = BufferPool::new(4);
        let stats = FlowStats::new();
        let (gatherer, mut rx) = Gatherer::new(8, Arc::clone(&stats));
        let hello = Packet::new(7, 42, b"hello");

        gatherer.forward(encoded(&pool, &[hello]));
        gatherer.forward(encoded(&pool, &[hello]));

        let batch = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        let forwarded: Vec<_> = batch.iter().collect();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0.conn_id, 7);
        assert_eq!(forwarded[0].1, b"hello");

        assert_eq!(stats.input.take().packets, 2);
        assert_eq!(stats.output.take().packets, 1);

        drop(batch);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_partial_duplicates_are_trimmed() {
        let pool = BufferPool::new(4);
        let (gatherer, mut rx) = Gatherer::new(8, FlowStats::new());

        gatherer.forward(encoded(&pool, &[Packet::new(1, 1, b"a"), Packet::new(1, 2, b"b")]));
        gatherer.forward(encoded(&pool, &[Packet::new(1, 2, b"b"), Packet::new(1, 3, b"c")]));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.frames.len(), 2);
        let ids: Vec<u16> = second.frames.iter().map(|f| f.packet_id).collect();
        assert_eq!(ids, vec![3]);
        assert_eq!(second.payload(&second.frames[0]), b"c");
    }

    #[test]
    fn test_full_queue_drops_batch() {
        let pool = BufferPool::new(4);
        let stats = FlowStats::new();
        let (gatherer, mut rx) = Gatherer::new(1, Arc::clone(&stats));

        gatherer.forward(encoded(&pool, &[Packet::new(1, 1, b"kept")]));
        gatherer.forward(encoded(&pool, &[Packet::new(1, 2, b"lost")]));

        assert_eq!(pool.outstanding(), 1);
        assert_eq!(rx.try_recv().unwrap().frames[0].packet_id, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.output.take().packets, 1);
    }

    #[test]
    fn test_discard_sink_releases() {
        let pool = BufferPool::new(4);
        Discard.forward(encoded(&pool, &[Packet::new(1, 1, b"x")]));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_split_by_conn_groups_in_order() {
        let pool = BufferPool::new(8);
        let batch = encoded(
            &pool,
            &[
                Packet::new(1, 1, b"a1"),
                Packet::new(2, 2, b"b1"),
                Packet::new(1, 3, b"a2"),
            ],
        );

        let groups = split_by_conn(&batch, &pool);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, 1);
        let a: Vec<&[u8]> = groups[0].1.segments().collect();
        assert_eq!(a, vec![&b"a1"[..], &b"a2"[..]]);
        assert_eq!(groups[1].0, 2);
        assert_eq!(groups[1].1.data(), b"b1");
    }

    #[test]
    fn test_repack_frames_keeps_headers() {
        let pool = BufferPool::new(8);
        let batch = encoded(&pool, &[Packet::new(5, 1, b"x"), Packet::new(5, 2, b"yz")]);

        let out = repack_frames(&batch, &pool);
        assert_eq!(out.data(), batch.buffer.data());
        assert_eq!(out.sub_packets(), batch.buffer.sub_packets());
    }
}
