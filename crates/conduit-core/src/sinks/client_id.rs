use std::sync::Arc;

use async_trait::async_trait;

use crate::message::WireMessage;
use crate::sink::{Sink, SinkState};

/// Stamps a `client_id` header on every outbound call. Does not participate in responses:
/// it forwards the request and never pushes a frame of its own.
pub struct ClientIdInterceptor {
    next: Arc<dyn Sink>,
    client_id: String,
}

impl ClientIdInterceptor {
    pub fn new(next: Arc<dyn Sink>, client_id: impl Into<String>) -> Self {
        Self {
            next,
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl Sink for ClientIdInterceptor {
    fn state(&self) -> SinkState {
        self.next.state()
    }

    async fn process_request(
        self: Arc<Self>,
        stack: &mut crate::sink::SinkStack,
        message: WireMessage,
    ) {
        let message = match message {
            WireMessage::Call(mut call) => {
                call.context.client_id = Some(self.client_id.clone());
                WireMessage::Call(call)
            }
            other => other,
        };
        self.next.clone().process_request(stack, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MethodCallMessage;
    use crate::sink::SinkStack;
    use async_trait::async_trait;

    struct CapturingNext {
        seen_client_id: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl Sink for CapturingNext {
        fn state(&self) -> SinkState {
            SinkState::Open
        }

        async fn process_request(self: Arc<Self>, _stack: &mut SinkStack, message: WireMessage) {
            if let Some(call) = message.as_call() {
                *self.seen_client_id.lock().unwrap() = call.context.client_id.clone();
            }
        }
    }

    #[tokio::test]
    async fn stamps_client_id_header() {
        let captor = Arc::new(CapturingNext {
            seen_client_id: std::sync::Mutex::new(None),
        });
        let sink = Arc::new(ClientIdInterceptor::new(captor.clone(), "my-client"));
        let mut stack = SinkStack::new();
        sink.process_request(&mut stack, WireMessage::Call(MethodCallMessage::new("svc", "m")))
            .await;
        assert_eq!(
            captor.seen_client_id.lock().unwrap().as_deref(),
            Some("my-client")
        );
    }
}
