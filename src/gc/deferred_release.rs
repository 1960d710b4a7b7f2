//! Deferred release queue for pinned heap slots.
//!
//! A remote handle may be dropped from a thread that does not hold its
//! owning isolate's lock, and the heap must never be touched from such a
//! thread. Instead of unpinning inline, the drop queues the slot here and
//! the queue is drained whenever the isolate's lock is next acquired.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::engine::heap::Heap;

/// Per-isolate queue of heap slots whose pins are pending release.
///
/// Thread-safe: any thread may queue a slot without holding the isolate
/// lock. `process_all` runs under the lock.
pub(crate) struct DeferredReleaseQueue {
    queue: Mutex<VecDeque<u32>>,

    /// Fast check for pending items, so lock acquisition stays cheap on
    /// the hot path.
    pending_count: AtomicU64,
}

impl Default for DeferredReleaseQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredReleaseQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(8)),
            pending_count: AtomicU64::new(0),
        }
    }

    /// Queue a slot for release. Callable from any thread.
    pub(crate) fn defer(&self, slot: u32) {
        self.queue
            .lock()
            .expect("deferred release queue poisoned")
            .push_back(slot);
        self.pending_count.fetch_add(1, Ordering::Release);

        tracing::trace!(slot, pending = self.len(), "deferred remote handle release");
    }

    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Release all queued pins. Must run under the owning isolate's lock.
    pub(crate) fn process_all(&self, heap: &mut Heap) {
        if !self.has_pending() {
            return;
        }

        let slots: VecDeque<u32> = {
            let mut queue = self.queue.lock().expect("deferred release queue poisoned");
            std::mem::take(&mut *queue)
        };

        let count = slots.len();
        if count == 0 {
            return;
        }

        for slot in slots {
            heap.unpin(slot);
        }

        self.pending_count
            .fetch_sub(count as u64, Ordering::Release);

        tracing::trace!(count, "processed deferred releases");
    }
}

impl std::fmt::Debug for DeferredReleaseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredReleaseQueue")
            .field("pending_count", &self.len())
            .finish()
    }
}
