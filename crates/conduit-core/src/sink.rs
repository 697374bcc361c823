use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::WireMessage;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lifecycle of a sink, queried by pool sinks to decide whether an instance can be reused.
/// `Closed` is terminal: once reached, a sink must never transition out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    Open,
    Busy,
    Closed,
}

/// One stage of the request/response pipeline. A sink forwards a request to at most one
/// successor, forming a chain rather than a DAG. A sink that wants to observe the response
/// pushes a [`ResponseHandler`] onto the [`SinkStack`] before forwarding.
#[async_trait]
pub trait Sink: Send + Sync {
    fn state(&self) -> SinkState;

    async fn process_request(self: Arc<Self>, stack: &mut SinkStack, message: WireMessage);
}

/// A pushed frame: a one-shot continuation invoked when the response for the request that
/// pushed it arrives. Frames are plain boxed closures rather than `(sink, Box<dyn Any>)`
/// pairs — each sink captures its own already-typed context when it pushes, so there is no
/// downcasting at pop time. A handler typically finishes by calling `stack.respond(..)`
/// again to keep unwinding; the dispatcher's handler is the one exception, which completes
/// the caller's promise instead.
pub type ResponseHandler = Box<
    dyn for<'a> FnOnce(&'a mut SinkStack, WireMessage) -> BoxFuture<'a, ()> + Send,
>;

/// The per-call LIFO of pending response handlers. Every push made while handling a request
/// is matched by exactly one pop, on either the success or the error path.
#[derive(Default)]
pub struct SinkStack {
    frames: Vec<ResponseHandler>,
}

impl SinkStack {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self, handler: ResponseHandler) {
        self.frames.push(handler);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Pops the most recently pushed frame and invokes it with `message`. A stack with no
    /// pending frame silently drops the message and logs it — this should only happen for a
    /// message that was never associated with a live call (e.g. a duplicate wire reply
    /// arriving after the in-flight entry was already torn down).
    pub fn respond(&mut self, message: WireMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match self.frames.pop() {
                Some(handler) => handler(self, message).await,
                None => tracing::debug!("sink stack underflow: response with no pending frame"),
            }
        })
    }
}

impl std::fmt::Debug for SinkStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkStack")
            .field("depth", &self.frames.len())
            .finish()
    }
}
