//! Backpressure handling for write operations.
//!
//! Tracks frames that have been handed to the writer task but not yet
//! written, and bounds that number. Senders that hit the bound are suspended
//! until the writer drains a batch or the configured timeout elapses, at
//! which point the send fails with [`QueryError::BackpressureTimeout`].
//!
//! # Configuration
//!
//! - `max_pending`: Maximum number of queued frames (default: 1024)
//! - Timeout: How long a sender may wait for space (default: 5s)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{QueryError, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default backpressure timeout (how long to wait for space to become available).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Shared {
    pending: AtomicUsize,
    released: Notify,
}

/// Backpressure controller for managing write queue pressure.
///
/// Clones share the same counter, so the writer task and every sender see
/// one queue depth.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    shared: Arc<Shared>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    /// Create a controller with custom timeout.
    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            max_pending,
            timeout,
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }

    /// Get current pending count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Reserve a slot, waiting if necessary.
    ///
    /// Returns `Err(BackpressureTimeout)` if timeout is reached.
    pub async fn reserve(&self) -> Result<()> {
        if self.claim_slot() {
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            // Register interest before re-checking so a release in between
            // is not missed.
            notified.as_mut().enable();

            if self.claim_slot() {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueryError::BackpressureTimeout);
            }
        }
    }

    /// Release a slot (called after a frame is written or dropped).
    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Release multiple slots at once (for batch writes).
    pub fn release_many(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.shared.pending.fetch_sub(count, Ordering::AcqRel);
        self.shared.released.notify_waiters();
    }

    fn claim_slot(&self) -> bool {
        self.shared
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_pending).then_some(current + 1)
            })
            .is_ok()
    }
}

#[cfg(test)]
impl BackpressureController {
    fn new(max_pending: usize) -> Self {
        Self::with_timeout(max_pending, DEFAULT_TIMEOUT)
    }

    fn max_pending(&self) -> usize {
        self.max_pending
    }

    fn try_reserve(&self) -> Result<()> {
        if self.claim_slot() {
            Ok(())
        } else {
            Err(QueryError::BackpressureTimeout)
        }
    }
}
