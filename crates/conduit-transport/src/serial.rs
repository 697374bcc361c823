use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};

use conduit_core::error::RpcError;
use conduit_core::message::{MethodReturnMessage, WireMessage};
use conduit_core::sink::{Sink, SinkState};

use crate::connection::Connection;
use crate::fault::FaultObservable;

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// The terminal sink for a single, non-multiplexed connection: exactly one call may be
/// outstanding at a time. A second request arriving while one is in flight never touches the
/// socket — it is rejected immediately with [`RpcError::ChannelConcurrency`], matching the
/// `_processing` guard of the protocol this is modeled on.
///
/// On a client-side timeout the connection is considered unsynchronized (the server may still
/// write a reply for the call the client gave up on) and is closed; on any other I/O failure
/// the same happens via [`FaultObservable::fire`]. Neither path reopens the connection —
/// that is a pool's job, driven by [`Sink::state`] returning [`SinkState::Closed`].
pub struct SerialTransportSink {
    connection: Arc<dyn Connection>,
    processing: AtomicBool,
    closed: AtomicBool,
    fault: FaultObservable,
}

impl SerialTransportSink {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fault: FaultObservable::new(),
        }
    }

    /// Resolves once this sink has faulted, with the reason it was given. A pool awaits this
    /// alongside its own lifecycle to learn when to evict.
    pub async fn on_faulted(&self) -> String {
        self.fault.wait().await
    }

    fn fault(&self, reason: impl Into<String>) {
        self.closed.store(true, Ordering::Release);
        self.fault.fire(reason);
    }

    async fn exchange(&self, payload: &[u8]) -> std::io::Result<Bytes> {
        if payload.len() as u64 > MAX_FRAME_LEN as u64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "payload exceeds maximum frame length",
            ));
        }
        let mut framed = BytesMut::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        self.connection.write_all(&framed).await?;

        let mut len_buf = [0u8; 4];
        self.connection.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "peer announced an oversized frame",
            ));
        }
        let mut body = vec![0u8; len as usize];
        self.connection.read_exact(&mut body).await?;
        Ok(Bytes::from(body))
    }
}

#[async_trait]
impl Sink for SerialTransportSink {
    fn state(&self) -> SinkState {
        if self.closed.load(Ordering::Acquire) {
            SinkState::Closed
        } else {
            SinkState::Open
        }
    }

    async fn process_request(
        self: Arc<Self>,
        stack: &mut conduit_core::sink::SinkStack,
        message: WireMessage,
    ) {
        if self.state() == SinkState::Closed {
            stack
                .respond(WireMessage::Return(MethodReturnMessage::err(
                    RpcError::transport_fault("connection is closed"),
                )))
                .await;
            return;
        }

        let encoded = match message.into_encoded() {
            Ok(encoded) => encoded,
            Err(_) => {
                stack
                    .respond(WireMessage::Return(MethodReturnMessage::err(
                        RpcError::client("serial transport expects an already-encoded call"),
                    )))
                    .await;
                return;
            }
        };

        if self.processing.swap(true, Ordering::AcqRel) {
            stack
                .respond(WireMessage::Return(MethodReturnMessage::err(
                    RpcError::ChannelConcurrency,
                )))
                .await;
            return;
        }

        let timeout = encoded.context.deadline.and_then(|d| {
            d.duration_since(SystemTime::now())
                .ok()
                .or(Some(Duration::ZERO))
        });

        let outcome = match timeout {
            Some(dur) => match tokio::time::timeout(dur, self.exchange(&encoded.payload)).await {
                Ok(result) => result.map_err(ExchangeFailure::Io),
                Err(_) => Err(ExchangeFailure::Timeout),
            },
            None => self.exchange(&encoded.payload).await.map_err(ExchangeFailure::Io),
        };

        self.processing.store(false, Ordering::Release);

        let reply = match outcome {
            Ok(body) => WireMessage::RawReply(body),
            Err(ExchangeFailure::Timeout) => {
                tracing::warn!(peer = %self.connection.peer_description(), "serial transport timed out; closing");
                self.connection.close().await;
                self.fault("client timeout");
                WireMessage::Return(MethodReturnMessage::err(RpcError::Timeout))
            }
            Err(ExchangeFailure::Io(err)) => {
                tracing::warn!(peer = %self.connection.peer_description(), error = %err, "serial transport I/O failure");
                self.connection.close().await;
                self.fault(err.to_string());
                WireMessage::Return(MethodReturnMessage::err(RpcError::transport_fault(
                    err.to_string(),
                )))
            }
        };
        stack.respond(reply).await;
    }
}

enum ExchangeFailure {
    Timeout,
    Io(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::future::promise;
    use conduit_core::message::{CallContext, EncodedCall};
    use conduit_core::sink::SinkStack;
    use std::sync::Mutex as StdMutex;

    struct LoopbackConnection {
        reply: Bytes,
        delay: Option<Duration>,
        write_fails: bool,
        closed: StdMutex<bool>,
    }

    #[async_trait]
    impl Connection for LoopbackConnection {
        async fn write_all(&self, _buf: &[u8]) -> std::io::Result<()> {
            if self.write_fails {
                return Err(std::io::Error::other("broken pipe"));
            }
            Ok(())
        }

        async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if buf.len() == 4 {
                buf.copy_from_slice(&(self.reply.len() as u32).to_be_bytes());
            } else {
                let mut reply = self.reply.clone();
                reply.copy_to_slice(buf);
            }
            Ok(())
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }

        fn peer_description(&self) -> String {
            "loopback".to_string()
        }
    }

    fn push_completion(stack: &mut SinkStack) -> conduit_core::future::AsyncResult<Bytes> {
        let (p, r) = promise::<Bytes>();
        stack.push(Box::new(move |_stack, reply| {
            Box::pin(async move {
                if let WireMessage::Return(ret) = reply {
                    match ret.into_result() {
                        Ok(v) => p.set(v),
                        Err(e) => p.set_exception(e),
                    }
                }
            })
        }));
        r
    }

    fn encoded_call() -> WireMessage {
        WireMessage::Encoded(EncodedCall {
            payload: Bytes::from_static(b"ping"),
            context: CallContext::default(),
        })
    }

    #[tokio::test]
    async fn round_trips_a_reply() {
        let connection = Arc::new(LoopbackConnection {
            reply: Bytes::from_static(b"pong"),
            delay: None,
            write_fails: false,
            closed: StdMutex::new(false),
        });
        let sink = Arc::new(SerialTransportSink::new(connection));
        let mut stack = SinkStack::new();
        let result = push_completion(&mut stack);
        sink.process_request(&mut stack, encoded_call()).await;
        assert_eq!(result.await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn second_call_while_busy_is_rejected_without_touching_socket() {
        let connection = Arc::new(LoopbackConnection {
            reply: Bytes::from_static(b"pong"),
            delay: Some(Duration::from_millis(50)),
            write_fails: false,
            closed: StdMutex::new(false),
        });
        let sink = Arc::new(SerialTransportSink::new(connection));

        sink.processing.store(true, Ordering::SeqCst);
        let mut stack = SinkStack::new();
        let result = push_completion(&mut stack);
        sink.process_request(&mut stack, encoded_call()).await;
        assert!(matches!(result.await, Err(RpcError::ChannelConcurrency)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_closes_the_connection_and_yields_timeout_error() {
        let connection = Arc::new(LoopbackConnection {
            reply: Bytes::from_static(b"pong"),
            delay: Some(Duration::from_secs(10)),
            write_fails: false,
            closed: StdMutex::new(false),
        });
        let sink = Arc::new(SerialTransportSink::new(connection.clone()));

        let mut call = EncodedCall {
            payload: Bytes::from_static(b"ping"),
            context: CallContext::default(),
        };
        call.context.deadline = Some(SystemTime::now() + Duration::from_millis(20));

        let mut stack = SinkStack::new();
        let result = push_completion(&mut stack);
        let handle = tokio::spawn(async move {
            let mut stack = stack;
            sink.process_request(&mut stack, WireMessage::Encoded(call)).await;
            sink
        });

        tokio::time::advance(Duration::from_millis(30)).await;
        let sink = handle.await.unwrap();

        assert!(matches!(result.await, Err(RpcError::Timeout)));
        assert_eq!(sink.state(), SinkState::Closed);
        assert!(*connection.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn write_failure_faults_the_sink() {
        let connection = Arc::new(LoopbackConnection {
            reply: Bytes::from_static(b"pong"),
            delay: None,
            write_fails: true,
            closed: StdMutex::new(false),
        });
        let sink = Arc::new(SerialTransportSink::new(connection));
        let mut stack = SinkStack::new();
        let result = push_completion(&mut stack);
        sink.process_request(&mut stack, encoded_call()).await;
        assert!(matches!(result.await, Err(RpcError::TransportFault(_))));
        assert_eq!(sink.state(), SinkState::Closed);
        assert!(sink.fault.is_fired());
    }
}
