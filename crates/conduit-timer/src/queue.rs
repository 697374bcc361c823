use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::entry::{Action, CancelHandle, TimerEntry};

/// A min-heap of pending deadlines served by a single worker task. `schedule` is cheap and
/// non-blocking: it only takes the heap lock long enough to push, waking the worker if the
/// new entry is now the soonest.
///
/// When `resolution` is set, deadlines are rounded up to the next multiple of it (measured
/// from the queue's creation instant) before insertion, trading precision for a bound on how
/// often the worker has to re-sort the heap — see [`LowResolutionTimerQueue`].
pub struct TimerQueue {
    heap: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    seq: AtomicU64,
    notify: Notify,
    resolution: Option<Duration>,
    created_at: Instant,
}

impl TimerQueue {
    pub fn new() -> Arc<Self> {
        Self::with_resolution(None)
    }

    pub fn with_resolution(resolution: Option<Duration>) -> Arc<Self> {
        let this = Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            resolution,
            created_at: Instant::now(),
        });
        tokio::spawn(this.clone().run());
        this
    }

    /// Schedules `action` to run at `deadline`. The action runs on its own spawned task, so a
    /// slow or panicking handler never stalls the worker loop for every other pending timer.
    pub fn schedule(
        self: &Arc<Self>,
        deadline: Instant,
        action: impl FnOnce() + Send + 'static,
    ) -> CancelHandle {
        let deadline = self.quantize(deadline);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(Some(Box::new(action) as Action)));
        let handle = CancelHandle::new(slot.clone());

        let became_soonest = {
            let mut heap = self.heap.lock();
            let became_soonest = heap
                .peek()
                .map_or(true, |Reverse(top)| deadline < top.deadline);
            heap.push(Reverse(TimerEntry { deadline, seq, slot }));
            became_soonest
        };
        if became_soonest {
            self.notify.notify_one();
        }
        handle
    }

    pub fn after(
        self: &Arc<Self>,
        delay: Duration,
        action: impl FnOnce() + Send + 'static,
    ) -> CancelHandle {
        self.schedule(Instant::now() + delay, action)
    }

    fn quantize(&self, deadline: Instant) -> Instant {
        let resolution = match self.resolution {
            Some(r) if !r.is_zero() => r,
            _ => return deadline,
        };
        let elapsed = deadline.saturating_duration_since(self.created_at);
        let step = resolution.as_nanos().max(1);
        let nanos = elapsed.as_nanos();
        let rounded = nanos.div_ceil(step) * step;
        self.created_at + Duration::from_nanos(rounded.min(u64::MAX as u128) as u64)
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next_deadline = { self.heap.lock().peek().map(|Reverse(e)| e.deadline) };
            match next_deadline {
                None => self.notify.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline.into()) => self.fire_ready(),
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    /// Pops and runs every entry whose deadline has passed. An entry already cancelled (its
    /// slot emptied by [`CancelHandle::cancel`]) is popped and silently discarded.
    fn fire_ready(&self) {
        let now = Instant::now();
        loop {
            let entry = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(Reverse(e)) if e.deadline <= now => heap.pop().map(|Reverse(e)| e),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            if let Some(action) = entry.take() {
                tokio::spawn(async move { action() });
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.heap.lock().len()
    }
}

/// The coarse-grained sibling of [`TimerQueue`]: deadlines are rounded up to the next whole
/// second, bounding how often the heap is touched for consumers (liveness pings, idle pool
/// reaping) that don't need sub-second precision.
pub struct LowResolutionTimerQueue(Arc<TimerQueue>);

impl LowResolutionTimerQueue {
    pub fn new() -> Self {
        Self(TimerQueue::with_resolution(Some(Duration::from_secs(1))))
    }

    pub fn schedule(
        &self,
        deadline: Instant,
        action: impl FnOnce() + Send + 'static,
    ) -> CancelHandle {
        self.0.schedule(deadline, action)
    }

    pub fn after(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> CancelHandle {
        self.0.after(delay, action)
    }
}

impl Default for LowResolutionTimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_entries_in_deadline_order() {
        let queue = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        queue.after(Duration::from_millis(30), move || o1.lock().push(1));
        let o2 = order.clone();
        queue.after(Duration::from_millis(10), move || o2.lock().push(2));
        let o3 = order.clone();
        queue.after(Duration::from_millis(20), move || o3.lock().push(3));

        tokio::time::advance(Duration::from_millis(40)).await;
        tokio::task::yield_now().await;

        assert_eq!(*order.lock(), vec![2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_suppresses_action() {
        let queue = TimerQueue::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = queue.after(Duration::from_millis(50), move || {
            f.store(true, Ordering::SeqCst);
        });

        handle.cancel();
        assert!(!handle.is_pending());

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_rounds_deadlines_up() {
        let queue = TimerQueue::with_resolution(Some(Duration::from_millis(100)));
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        queue.after(Duration::from_millis(5), move || {
            f.store(true, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst), "should not fire before the rounded bucket");

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
