use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use conduit_core::message::WireMessage;
use conduit_core::sink::{Sink, SinkStack, SinkState};

/// Keeps up to `high_watermark` idle sinks around for reuse. A checked-out sink is simply an
/// `Arc` the caller holds for the duration of one request; it comes back to the idle set when
/// that request's response handler runs, via the frame this sink pushes before forwarding. A
/// sink that has transitioned to [`SinkState::Closed`] while checked out is dropped instead of
/// being returned to the idle set.
pub struct WatermarkPoolSink<F> {
    factory: F,
    high_watermark: usize,
    idle: Mutex<VecDeque<Arc<dyn Sink>>>,
}

impl<F> WatermarkPoolSink<F>
where
    F: Fn() -> Arc<dyn Sink> + Send + Sync + 'static,
{
    pub fn new(high_watermark: usize, factory: F) -> Self {
        Self {
            factory,
            high_watermark,
            idle: Mutex::new(VecDeque::new()),
        }
    }

    fn checkout(&self) -> Arc<dyn Sink> {
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop_front() {
            if candidate.state() == SinkState::Open {
                return candidate;
            }
        }
        drop(idle);
        (self.factory)()
    }

    fn checkin(&self, sink: Arc<dyn Sink>) {
        if sink.state() != SinkState::Open {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.high_watermark {
            idle.push_back(sink);
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

#[async_trait]
impl<F> Sink for WatermarkPoolSink<F>
where
    F: Fn() -> Arc<dyn Sink> + Send + Sync + 'static,
{
    fn state(&self) -> SinkState {
        SinkState::Open
    }

    async fn process_request(self: Arc<Self>, stack: &mut SinkStack, message: WireMessage) {
        let sink = self.checkout();
        let pool = self.clone();
        let sink_for_checkin = sink.clone();
        stack.push(Box::new(move |stack, reply| {
            pool.checkin(sink_for_checkin);
            Box::pin(async move { stack.respond(reply).await })
        }));
        sink.process_request(stack, message).await;
    }
}
