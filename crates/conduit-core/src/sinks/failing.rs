use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RpcError;
use crate::message::{MethodReturnMessage, WireMessage};
use crate::sink::{Sink, SinkState};

/// A terminal sink that immediately fails every request with a fixed error. Used by a load
/// balancer to represent "no endpoint available" without needing a real transport.
pub struct FailingSink {
    error: RpcError,
}

impl FailingSink {
    pub fn new(error: RpcError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl Sink for FailingSink {
    fn state(&self) -> SinkState {
        SinkState::Closed
    }

    async fn process_request(
        self: Arc<Self>,
        stack: &mut crate::sink::SinkStack,
        _message: WireMessage,
    ) {
        stack
            .respond(WireMessage::Return(MethodReturnMessage::err(
                self.error.clone(),
            )))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MethodCallMessage;
    use crate::sink::SinkStack;

    #[tokio::test]
    async fn every_request_fails_with_configured_error() {
        let sink = Arc::new(FailingSink::new(RpcError::transport_fault("no endpoint available")));
        let mut stack = SinkStack::new();
        let (p, r) = crate::future::promise::<()>();
        stack.push(Box::new(move |_stack, reply| {
            Box::pin(async move {
                if let WireMessage::Return(ret) = reply {
                    match ret.into_result() {
                        Ok(_) => p.set(()),
                        Err(e) => p.set_exception(e),
                    }
                }
            })
        }));
        sink.process_request(&mut stack, WireMessage::Call(MethodCallMessage::new("svc", "m")))
            .await;
        assert!(matches!(r.await, Err(RpcError::TransportFault(_))));
    }
}
