//! Shared deadline scheduler used to bound how long a call is allowed to wait for a reply.
//!
//! [`TimerQueue`] is a single min-heap worker serving every deadline in the process, rather
//! than one `tokio::time::sleep` per call — the [`TimeoutSink`] races the downstream chain
//! against an entry scheduled on it.

mod entry;
mod queue;
mod timeout_sink;

pub use entry::CancelHandle;
pub use queue::{LowResolutionTimerQueue, TimerQueue};
pub use timeout_sink::TimeoutSink;
