use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::Codec;
use crate::message::{EncodedCall, MethodReturnMessage, WireMessage};
use crate::sink::{Sink, SinkState};

/// Translates between message objects and byte buffers using a configured [`Codec`].
/// Rejects non-call messages with a client error before anything is forwarded. On the way
/// back, a `Return` that already arrived decoded (e.g. a synthesized timeout) is forwarded
/// untouched; a `RawReply` is decoded.
pub struct SerializerSink<C> {
    next: Arc<dyn Sink>,
    codec: Arc<C>,
}

impl<C: Codec> SerializerSink<C> {
    pub fn new(next: Arc<dyn Sink>, codec: Arc<C>) -> Self {
        Self { next, codec }
    }
}

#[async_trait]
impl<C: Codec> Sink for SerializerSink<C> {
    fn state(&self) -> SinkState {
        self.next.state()
    }

    async fn process_request(
        self: Arc<Self>,
        stack: &mut crate::sink::SinkStack,
        message: WireMessage,
    ) {
        let call = match message {
            WireMessage::Call(call) => call,
            _non_call => {
                stack
                    .respond(WireMessage::Return(MethodReturnMessage::err(
                        crate::error::RpcError::client("serializer sink received a non-call message"),
                    )))
                    .await;
                return;
            }
        };

        let payload = match self.codec.encode(&call) {
            Ok(bytes) => bytes,
            Err(error) => {
                stack
                    .respond(WireMessage::Return(MethodReturnMessage::err(error)))
                    .await;
                return;
            }
        };

        let codec = Arc::clone(&self.codec);
        stack.push(Box::new(move |stack, reply| {
            Box::pin(async move {
                match reply {
                    WireMessage::RawReply(bytes) => {
                        let decoded = codec.decode(bytes);
                        stack.respond(WireMessage::Return(decoded)).await;
                    }
                    already_decoded => stack.respond(already_decoded).await,
                }
            })
        }));

        let next = Arc::clone(&self.next);
        let encoded = WireMessage::Encoded(EncodedCall {
            payload,
            context: call.context.clone(),
        });
        next.process_request(stack, encoded).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EchoCodec;
    use crate::error::RpcError;
    use crate::message::MethodCallMessage;
    use crate::sink::SinkStack;
    use bytes::Bytes;

    struct CapturingTransport;

    #[async_trait]
    impl Sink for CapturingTransport {
        fn state(&self) -> SinkState {
            SinkState::Open
        }

        async fn process_request(self: Arc<Self>, stack: &mut SinkStack, message: WireMessage) {
            let encoded = message.into_encoded().unwrap();
            stack
                .respond(WireMessage::RawReply(encoded.payload))
                .await;
        }
    }

    #[tokio::test]
    async fn round_trips_through_echo_codec() {
        let sink = Arc::new(SerializerSink::new(Arc::new(CapturingTransport), Arc::new(EchoCodec)));
        let mut stack = SinkStack::new();
        let (p, r) = crate::future::promise::<Bytes>();
        stack.push(Box::new(move |_stack, reply| {
            Box::pin(async move {
                if let WireMessage::Return(ret) = reply {
                    p.set(ret.into_result().unwrap());
                }
            })
        }));
        let call = MethodCallMessage::new("svc", "echo");
        sink.process_request(&mut stack, WireMessage::Call(call)).await;
        assert_eq!(r.await.unwrap(), Bytes::from_static(b"echo"));
    }

    #[tokio::test]
    async fn rejects_non_call_message() {
        let sink = Arc::new(SerializerSink::new(Arc::new(CapturingTransport), Arc::new(EchoCodec)));
        let mut stack = SinkStack::new();
        let (p, r) = crate::future::promise::<Bytes>();
        stack.push(Box::new(move |_stack, reply| {
            Box::pin(async move {
                if let WireMessage::Return(ret) = reply {
                    if let Err(e) = ret.into_result() {
                        p.set_exception(e);
                    }
                }
            })
        }));
        sink.process_request(
            &mut stack,
            WireMessage::Discard(crate::message::MethodDiscardMessage::new(
                crate::message::Tag(1),
                "test",
            )),
        )
        .await;
        assert!(matches!(r.await, Err(RpcError::Client(_))));
    }
}
