//! Pooled buffer segments for the transmit pipeline.
//!
//! Segments are fixed-capacity `BytesMut` buffers recycled between the
//! chunk writer and the transport feed loop. Ownership moves with the
//! segment: it is either being written into, queued for send, or back in
//! the pool, never two of those at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;

/// Default number of segments kept pooled for reuse.
pub const DEFAULT_MAX_POOLED: usize = 16;

/// Pool of fixed-capacity byte segments.
#[derive(Debug)]
pub struct SegmentPool {
    segments: Mutex<Vec<BytesMut>>,
    segment_size: usize,
    max_pooled: usize,
    allocated: AtomicUsize,
}

impl SegmentPool {
    /// Create a pool handing out segments of `segment_size` bytes.
    pub fn new(segment_size: usize) -> Self {
        Self::with_max_pooled(segment_size, DEFAULT_MAX_POOLED)
    }

    /// Create a pool retaining at most `max_pooled` idle segments.
    pub fn with_max_pooled(segment_size: usize, max_pooled: usize) -> Self {
        Self {
            segments: Mutex::new(Vec::with_capacity(max_pooled)),
            segment_size,
            max_pooled,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take a cleared segment from the pool, allocating if none is idle.
    pub fn acquire(&self) -> BytesMut {
        let recycled = self
            .segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(segment) => segment,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.segment_size)
            }
        }
    }

    /// Return a segment for reuse.
    ///
    /// Segments whose capacity was consumed elsewhere (split off by the
    /// transport path) or beyond the retention cap are dropped instead.
    pub fn release(&self, mut segment: BytesMut) {
        segment.clear();
        if segment.capacity() < self.segment_size {
            return;
        }
        let mut pool = self.segments.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < self.max_pooled {
            pool.push(segment);
        }
    }

    /// Capacity of segments handed out by this pool.
    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Number of idle segments currently pooled.
    pub fn pooled(&self) -> usize {
        self.segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total segments ever allocated (not counting recycled reuse).
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Drop all idle segments.
    pub fn drain(&self) {
        self.segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_with_capacity() {
        let pool = SegmentPool::new(1024);
        let segment = pool.acquire();
        assert!(segment.capacity() >= 1024);
        assert!(segment.is_empty());
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_release_recycles() {
        let pool = SegmentPool::new(256);
        let mut segment = pool.acquire();
        segment.extend_from_slice(b"dirty");
        pool.release(segment);

        assert_eq!(pool.pooled(), 1);

        let recycled = pool.acquire();
        assert!(recycled.is_empty());
        assert_eq!(pool.pooled(), 0);
        // No second allocation happened.
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_release_drops_shrunk_segments() {
        let pool = SegmentPool::new(256);
        let mut segment = pool.acquire();
        segment.extend_from_slice(&[0u8; 200]);
        // Freezing the front steals its capacity from the BytesMut.
        let _front = segment.split_to(200).freeze();
        pool.release(segment);

        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_retention_cap() {
        let pool = SegmentPool::with_max_pooled(64, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        pool.release(a);
        pool.release(b);
        pool.release(c);

        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn test_drain() {
        let pool = SegmentPool::new(64);
        pool.release(pool.acquire());
        assert_eq!(pool.pooled(), 1);
        pool.drain();
        assert_eq!(pool.pooled(), 0);
    }
}
