use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use conduit_core::message::WireMessage;
use conduit_core::sink::{Sink, SinkStack, SinkState};

/// Lazily builds one shared inner sink the first time a request arrives, then reuses it for
/// every subsequent call. Concurrent first calls race to build it exactly once — the loser(s)
/// simply wait for the winner's result rather than constructing a duplicate.
pub struct SingletonPoolSink<F> {
    factory: F,
    inner: OnceCell<Arc<dyn Sink>>,
}

impl<F> SingletonPoolSink<F>
where
    F: Fn() -> Arc<dyn Sink> + Send + Sync + 'static,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            inner: OnceCell::new(),
        }
    }

    async fn get(&self) -> Arc<dyn Sink> {
        self.inner
            .get_or_init(|| async { (self.factory)() })
            .await
            .clone()
    }
}

#[async_trait]
impl<F> Sink for SingletonPoolSink<F>
where
    F: Fn() -> Arc<dyn Sink> + Send + Sync + 'static,
{
    fn state(&self) -> SinkState {
        self.inner.get().map_or(SinkState::Idle, |s| s.state())
    }

    async fn process_request(self: Arc<Self>, stack: &mut SinkStack, message: WireMessage) {
        let inner = self.get().await;
        inner.process_request(stack, message).await;
    }
}
