//! Pooled packet buffers with reference-counted ownership.
//!
//! A [`PackedBuffer`] is a fixed 64 KiB region plus a list of sub-packet
//! lengths describing how the occupied prefix splits into datagrams. Buffers
//! are handed out by a [`BufferPool`] wrapped in a [`BufferHandle`]:
//!
//! - a new handle holds the only reference (count 1) and may mutate the buffer
//! - [`BufferHandle::share`] acquires another reference to the same bytes
//! - [`BufferHandle::release`] (or dropping the handle) gives one reference up
//! - moving a handle by value transfers ownership; the old binding is gone
//!
//! When the last reference is released the buffer goes back to the pool it
//! came from, exactly once. A buffer can only be written while its handle is
//! exclusive, so shared bytes stay immutable until every share is released.

use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Capacity of every packed buffer in bytes.
pub const BUFFER_SIZE: usize = 65535;

/// Number of idle buffers a pool keeps around by default.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// A fixed-capacity byte region split into sub-packets.
pub struct PackedBuffer {
    data: Box<[u8]>,
    sub_packets: Vec<usize>,
    total_size: usize,
}

impl PackedBuffer {
    fn new() -> Self {
        Self {
            data: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            sub_packets: Vec::new(),
            total_size: 0,
        }
    }

    /// Placeholder left behind when a buffer is moved back into its pool.
    fn detached() -> Self {
        Self {
            data: Box::default(),
            sub_packets: Vec::new(),
            total_size: 0,
        }
    }

    /// Total capacity of the region.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes still free after the occupied prefix.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.total_size
    }

    /// Number of occupied bytes.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    /// Lengths of the sub-packets in the occupied prefix, in order.
    pub fn sub_packets(&self) -> &[usize] {
        &self.sub_packets
    }

    /// The occupied prefix.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.total_size]
    }

    /// The whole region, for reads that fill it directly from a socket.
    pub fn region_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The free space after the occupied prefix.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.total_size..]
    }

    /// Iterate over the sub-packets as byte slices.
    pub fn segments(&self) -> Segments<'_> {
        Segments {
            data: self.data(),
            lengths: self.sub_packets.iter(),
        }
    }

    /// Record `len` bytes written at the start of the spare region as one
    /// more sub-packet.
    pub fn commit(&mut self, len: usize) {
        debug_assert!(len <= self.remaining(), "commit past buffer capacity");
        self.total_size += len;
        self.sub_packets.push(len);
    }

    /// Copy `bytes` in as a new sub-packet. Returns `false` if it doesn't fit.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.spare_mut()[..bytes.len()].copy_from_slice(bytes);
        self.commit(bytes.len());
        true
    }

    /// Mark the first `len` bytes of the region as one unsplit sub-packet.
    pub fn set_filled(&mut self, len: usize) {
        self.clear();
        self.commit(len);
    }

    /// Mark the first `len` bytes as occupied and slice them into pieces of
    /// `segment` bytes. A shorter tail becomes its own final piece, and an
    /// empty read still yields one empty sub-packet.
    pub fn set_segmented(&mut self, len: usize, segment: usize) {
        self.clear();
        if len == 0 || segment == 0 || segment >= len {
            self.commit(len);
            return;
        }
        let mut left = len;
        while left > 0 {
            let piece = left.min(segment);
            self.commit(piece);
            left -= piece;
        }
    }

    /// Forget the contents. The bytes themselves are not zeroed.
    pub fn clear(&mut self) {
        self.sub_packets.clear();
        self.total_size = 0;
    }

    /// Returns the uniform sub-packet length if every sub-packet has the
    /// same size.
    pub fn uniform_segment(&self) -> Option<usize> {
        let (&first, rest) = self.sub_packets.split_first()?;
        rest.iter().all(|&len| len == first).then_some(first)
    }
}

impl fmt::Debug for PackedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedBuffer")
            .field("total_size", &self.total_size)
            .field("sub_packets", &self.sub_packets)
            .finish()
    }
}

/// Iterator over the sub-packets of a [`PackedBuffer`].
pub struct Segments<'a> {
    data: &'a [u8],
    lengths: std::slice::Iter<'a, usize>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.lengths.next()?;
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Some(head)
    }
}

struct PoolInner {
    free: ArrayQueue<PackedBuffer>,
    outstanding: AtomicUsize,
    allocated: AtomicU64,
    recycled: AtomicU64,
}

impl PoolInner {
    fn recycle(&self, mut buf: PackedBuffer) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "buffer returned to a pool with nothing outstanding");
        self.recycled.fetch_add(1, Ordering::Relaxed);
        buf.clear();
        if self.free.push(buf).is_err() {
            tracing::trace!("buffer pool full, freeing returned buffer");
        }
    }
}

/// Lock-free pool of [`PackedBuffer`]s.
///
/// Allocation never blocks: an empty pool allocates a fresh buffer, and a full
/// pool frees returned buffers instead of keeping them.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool that keeps at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(capacity.max(1)),
                outstanding: AtomicUsize::new(0),
                allocated: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    /// Take an empty buffer with a reference count of one.
    pub fn allocate(&self) -> BufferHandle {
        let buf = self.inner.free.pop().unwrap_or_else(PackedBuffer::new);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        BufferHandle {
            shared: Arc::new(Pooled {
                buf,
                pool: Arc::clone(&self.inner),
            }),
        }
    }

    /// Idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Total number of allocations served.
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Total number of buffers returned after their last release.
    pub fn recycled(&self) -> u64 {
        self.inner.recycled.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

struct Pooled {
    buf: PackedBuffer,
    pool: Arc<PoolInner>,
}

impl Drop for Pooled {
    fn drop(&mut self) {
        let buf = std::mem::replace(&mut self.buf, PackedBuffer::detached());
        self.pool.recycle(buf);
    }
}

/// An owning reference to a pooled [`PackedBuffer`].
pub struct BufferHandle {
    shared: Arc<Pooled>,
}

impl BufferHandle {
    /// Acquire another owning reference to the same buffer.
    pub fn share(&self) -> BufferHandle {
        BufferHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Give up this reference. The buffer returns to its pool when this was
    /// the last one.
    pub fn release(self) {
        drop(self);
    }

    /// Live references to the underlying buffer, this one included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Mutable access, available only while this handle is the sole owner.
    pub fn get_mut(&mut self) -> Option<&mut PackedBuffer> {
        Arc::get_mut(&mut self.shared).map(|pooled| &mut pooled.buf)
    }
}

impl Deref for BufferHandle {
    type Target = PackedBuffer;

    fn deref(&self) -> &PackedBuffer {
        &self.shared.buf
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("refs", &self.ref_count())
            .field("buffer", &self.shared.buf)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_exclusive() {
        let pool = BufferPool::new(4);
        let mut handle = pool.allocate();

        assert_eq!(handle.ref_count(), 1);
        assert_eq!(handle.capacity(), BUFFER_SIZE);
        assert!(handle.is_empty());
        assert!(handle.get_mut().is_some());
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_share_and_release_balance() {
        let pool = BufferPool::new(4);
        let first = pool.allocate();
        let second = first.share();
        let third = second.share();
        assert_eq!(first.ref_count(), 3);

        second.release();
        assert_eq!(first.ref_count(), 2);
        assert_eq!(pool.recycled(), 0);

        first.release();
        assert_eq!(third.ref_count(), 1);
        assert_eq!(pool.recycled(), 0);

        third.release();
        assert_eq!(pool.recycled(), 1);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_shared_buffer_is_immutable() {
        let pool = BufferPool::new(4);
        let mut handle = pool.allocate();
        let other = handle.share();

        assert!(handle.get_mut().is_none());
        other.release();
        assert!(handle.get_mut().is_some());
    }

    #[test]
    fn test_move_keeps_count() {
        let pool = BufferPool::new(4);
        let handle = pool.allocate();
        let moved = handle;

        assert_eq!(moved.ref_count(), 1);
        assert_eq!(pool.outstanding(), 1);
        drop(moved);
        assert_eq!(pool.recycled(), 1);
    }

    #[test]
    fn test_recycled_buffer_is_cleared() {
        let pool = BufferPool::new(1);
        let mut handle = pool.allocate();
        assert!(handle.get_mut().unwrap().append(b"stale"));
        handle.release();

        let reused = pool.allocate();
        assert_eq!(pool.available(), 0);
        assert!(reused.is_empty());
        assert!(reused.sub_packets().is_empty());
    }

    #[test]
    fn test_release_across_threads() {
        let pool = BufferPool::new(8);
        let handle = pool.allocate();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let share = handle.share();
                std::thread::spawn(move || share.release())
            })
            .collect();
        handle.release();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(pool.recycled(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_full_pool_frees_extra_buffers() {
        let pool = BufferPool::new(1);
        let a = pool.allocate();
        let b = pool.allocate();
        a.release();
        b.release();

        assert_eq!(pool.available(), 1);
        assert_eq!(pool.recycled(), 2);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn test_append_and_segments() {
        let pool = BufferPool::new(1);
        let mut handle = pool.allocate();
        let buf = handle.get_mut().unwrap();
        assert!(buf.append(b"abc"));
        assert!(buf.append(b"de"));

        assert_eq!(buf.total_size(), 5);
        assert_eq!(buf.sub_packets(), &[3, 2]);
        let parts: Vec<&[u8]> = buf.segments().collect();
        assert_eq!(parts, vec![&b"abc"[..], &b"de"[..]]);
        assert_eq!(buf.uniform_segment(), None);
    }

    #[test]
    fn test_append_rejects_overflow() {
        let pool = BufferPool::new(1);
        let mut handle = pool.allocate();
        let buf = handle.get_mut().unwrap();
        assert!(buf.append(&vec![1u8; BUFFER_SIZE - 1]));
        assert!(!buf.append(b"xy"));
        assert!(buf.append(b"z"));
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_set_segmented_keeps_short_tail() {
        let pool = BufferPool::new(1);
        let mut handle = pool.allocate();
        let buf = handle.get_mut().unwrap();

        buf.set_segmented(3000, 1200);
        assert_eq!(buf.sub_packets(), &[1200, 1200, 600]);

        buf.set_segmented(2400, 1200);
        assert_eq!(buf.sub_packets(), &[1200, 1200]);
        assert_eq!(buf.uniform_segment(), Some(1200));

        buf.set_segmented(0, 1200);
        assert_eq!(buf.sub_packets(), &[0]);
        assert_eq!(buf.total_size(), 0);
    }
}
