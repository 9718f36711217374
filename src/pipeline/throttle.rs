//! Transmit backpressure gate.
//!
//! Tracks the volume of queued-but-unsent bytes in the transmit pipeline
//! and stalls producers once it crosses the configured cap. Admission is
//! check-then-add: a producer is admitted as long as the counter is
//! below the cap, then charges its full message size, so the counter can
//! overshoot by at most one message.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, RpcError};

/// Interval between gate re-checks while waiting for room.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Byte-budget gate shared by producers and the transport feed loop.
///
/// Lock-free counter tracking; clones share state.
#[derive(Debug, Clone)]
pub struct TxThrottle {
    queued: Arc<AtomicUsize>,
    max_queued: usize,
    timeout: Duration,
}

impl TxThrottle {
    /// Create a gate admitting producers while fewer than `max_queued`
    /// bytes are pending.
    pub fn new(max_queued: usize, timeout: Duration) -> Self {
        Self {
            queued: Arc::new(AtomicUsize::new(0)),
            max_queued,
            timeout,
        }
    }

    /// Charge `bytes` to the gate, waiting for room if it is full.
    ///
    /// Returns `Err(SendTimeout)` if the gate stays full past the
    /// configured timeout.
    pub async fn reserve(&self, bytes: usize) -> Result<()> {
        // Fast path.
        if self.queued.load(Ordering::Acquire) < self.max_queued {
            self.queued.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        }

        let start = Instant::now();
        loop {
            if self.queued.load(Ordering::Acquire) < self.max_queued {
                self.queued.fetch_add(bytes, Ordering::AcqRel);
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(RpcError::SendTimeout);
            }

            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Charge `bytes` without waiting.
    ///
    /// Returns `Err(SendTimeout)` immediately if the gate is full.
    pub fn try_reserve(&self, bytes: usize) -> Result<()> {
        if self.queued.load(Ordering::Acquire) >= self.max_queued {
            return Err(RpcError::SendTimeout);
        }
        self.queued.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Credit `bytes` back after they reached the transport (or were
    /// discarded with their message).
    #[inline]
    pub fn release(&self, bytes: usize) {
        self.queued.fetch_sub(bytes, Ordering::Release);
    }

    /// Current queued-but-unsent byte count.
    #[inline]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether producers would currently stall.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.queued.load(Ordering::Acquire) >= self.max_queued
    }
}
