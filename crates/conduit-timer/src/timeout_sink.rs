use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::oneshot;

use conduit_core::error::RpcError;
use conduit_core::message::{MethodReturnMessage, WireMessage};
use conduit_core::sink::{Sink, SinkStack, SinkState};

use crate::queue::TimerQueue;

/// Races the downstream chain against the call's deadline, installed via the shared
/// [`TimerQueue`] rather than a per-call `tokio::time::sleep`. Sits directly beneath the
/// dispatcher in a typical chain: the deadline it reads off `CallContext` is the one the
/// dispatcher stamped when the call was made.
///
/// A call with no deadline set is forwarded untouched — this sink adds nothing to the stack
/// in that case.
pub struct TimeoutSink {
    next: Arc<dyn Sink>,
    queue: Arc<TimerQueue>,
}

impl TimeoutSink {
    pub fn new(next: Arc<dyn Sink>, queue: Arc<TimerQueue>) -> Self {
        Self { next, queue }
    }
}

#[async_trait]
impl Sink for TimeoutSink {
    fn state(&self) -> SinkState {
        self.next.state()
    }

    async fn process_request(self: Arc<Self>, stack: &mut SinkStack, message: WireMessage) {
        let Some(deadline) = message.as_call().and_then(|c| c.context.deadline) else {
            self.next.clone().process_request(stack, message).await;
            return;
        };

        let now = SystemTime::now();
        if deadline <= now {
            stack
                .respond(WireMessage::Return(MethodReturnMessage::err(
                    RpcError::Timeout,
                )))
                .await;
            return;
        }

        let deadline_event = message.as_call().and_then(|c| c.context.deadline_event.clone());
        let (fire_tx, fire_rx) = oneshot::channel::<()>();
        let at = Instant::now() + deadline.duration_since(now).unwrap_or_default();
        let cancel = self.queue.schedule(at, move || {
            let _ = fire_tx.send(());
        });

        let cancel_on_reply = cancel.clone();
        stack.push(Box::new(move |stack, reply| {
            cancel_on_reply.cancel();
            Box::pin(async move { stack.respond(reply).await })
        }));

        let forward = self.next.clone().process_request(stack, message);
        tokio::select! {
            _ = forward => {}
            _ = fire_rx => {
                cancel.cancel();
                if let Some(event) = deadline_event {
                    event.fire();
                }
                stack
                    .respond(WireMessage::Return(MethodReturnMessage::err(RpcError::Timeout)))
                    .await;
            }
        }
    }
}
