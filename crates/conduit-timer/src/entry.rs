use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

pub(crate) type Action = Box<dyn FnOnce() + Send>;

/// Shared slot between a queued entry and the [`CancelHandle`] handed back to the caller.
/// Cancelling takes the action out rather than merely flagging it, so whatever the closure
/// captured (promises, buffers) is freed the moment `cancel` runs instead of lingering until
/// the entry would have fired.
pub(crate) type Slot = Arc<Mutex<Option<Action>>>;

/// One scheduled action, ordered by `(deadline, seq)` so that entries with an identical
/// deadline still fire in submission order.
pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) seq: u64,
    pub(crate) slot: Slot,
}

impl TimerEntry {
    pub(crate) fn take(&self) -> Option<Action> {
        self.slot.lock().take()
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Handle returned by [`crate::queue::TimerQueue::schedule`]. Dropping it does not cancel the
/// entry — callers that want fire-and-forget semantics simply let it fall out of scope.
#[derive(Clone)]
pub struct CancelHandle {
    slot: Slot,
}

impl CancelHandle {
    pub(crate) fn new(slot: Slot) -> Self {
        Self { slot }
    }

    /// Idempotent: cancelling an already-fired or already-cancelled entry is a no-op.
    pub fn cancel(&self) {
        self.slot.lock().take();
    }

    /// True if the entry has neither fired nor been cancelled yet.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }
}
