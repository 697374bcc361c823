use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::config::ClientConfig;
use crate::error::RpcError;
use crate::future::{promise, AsyncResult};
use crate::message::{CallContext, MethodCallMessage, WireMessage};
use crate::sink::{Sink, SinkStack};

/// Entry point for a service's sink chain. Turns a `(method, args)` tuple into a future and
/// seeds the pipeline; one `Dispatcher` is constructed per service and owns the head of its
/// chain exclusively (see the data model's ownership rules).
pub struct Dispatcher {
    service: String,
    chain_head: Arc<dyn Sink>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(service: impl Into<String>, chain_head: Arc<dyn Sink>, default_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            chain_head,
            default_timeout,
        }
    }

    /// Builds a dispatcher from an embedding application's [`ClientConfig`]. The config's
    /// `client_id`/`protocol` fields are consumed by the sinks an application wires into
    /// `chain_head` (e.g. `sinks::client_id::ClientIdInterceptor`), not by the dispatcher itself.
    pub fn from_config(config: &ClientConfig, chain_head: Arc<dyn Sink>) -> Self {
        Self::new(config.service.clone(), chain_head, config.default_timeout)
    }

    /// Stamps the message with an absolute deadline, builds a fresh sink stack, pushes
    /// itself (capturing start time and the caller's promise), and hands the message to the
    /// chain head.
    pub fn call(
        &self,
        method: impl Into<String>,
        message: MethodCallMessage,
        timeout: Option<Duration>,
    ) -> AsyncResult<Bytes> {
        let method = method.into();
        let service = self.service.clone();
        let start = SystemTime::now();
        let deadline = start + timeout.unwrap_or(self.default_timeout);

        let mut call = message;
        call.method = method.clone();
        call.service = service.clone();
        call.context = CallContext {
            deadline: Some(deadline),
            ..call.context
        };

        let (result_promise, result_future) = promise::<Bytes>();
        let mut stack = SinkStack::new();
        stack.push(Box::new(move |_stack, reply| {
            Box::pin(async move {
                complete_from_reply(&service, &method, start, result_promise, reply);
            })
        }));

        let chain_head = self.chain_head.clone();
        let wire = WireMessage::Call(call);
        tokio::spawn(async move {
            chain_head.process_request(&mut stack, wire).await;
        });

        result_future
    }
}

fn complete_from_reply(
    service: &str,
    method: &str,
    start: SystemTime,
    result_promise: crate::future::Promise<Bytes>,
    reply: WireMessage,
) {
    let elapsed = start.elapsed().unwrap_or_default();
    match reply {
        WireMessage::Return(ret) => match ret.into_result() {
            Ok(value) => {
                tracing::debug!(service, method, ?elapsed, "call completed");
                result_promise.set(value);
            }
            Err(error) if error.is_timeout() => {
                tracing::debug!(service, method, ?elapsed, "call timed out");
                result_promise.set_exception(error);
            }
            Err(error) => {
                tracing::debug!(service, method, ?elapsed, %error, "call failed");
                result_promise.set_exception(wrap_server_error(service, method, error));
            }
        },
        other => {
            tracing::warn!(service, method, ?other, "unrecognized response message kind");
            result_promise.set_exception(RpcError::internal(
                "dispatcher received a non-return message as a reply",
            ));
        }
    }
}

/// Preserves any remote stack string while annotating the error with the call that
/// produced it. `TimeoutError` never reaches this path — see [`complete_from_reply`].
fn wrap_server_error(service: &str, method: &str, error: RpcError) -> RpcError {
    match error {
        RpcError::Server {
            message,
            remote_trace,
        } => RpcError::Server {
            message: format!("{service}.{method}: {message}"),
            remote_trace,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MethodReturnMessage;
    use crate::sink::SinkState;
    use async_trait::async_trait;

    struct EchoSink;

    #[async_trait]
    impl Sink for EchoSink {
        fn state(&self) -> SinkState {
            SinkState::Open
        }

        async fn process_request(self: Arc<Self>, stack: &mut SinkStack, message: WireMessage) {
            let call = message.into_call().unwrap();
            let value = call
                .args
                .first()
                .map(|_| Bytes::from_static(b"hi"))
                .unwrap_or_default();
            stack.respond(WireMessage::Return(MethodReturnMessage::ok(value))).await;
        }
    }

    #[tokio::test]
    async fn happy_path_completes_with_value() {
        let dispatcher = Dispatcher::new("echo-service", Arc::new(EchoSink), Duration::from_secs(1));
        let mut call = MethodCallMessage::new("echo-service", "echo");
        call.args.push(crate::message::ArgValue::Text("hi".into()));
        let result = dispatcher.call("echo", call, None).await.unwrap();
        assert_eq!(result, Bytes::from_static(b"hi"));
    }

    struct FailingSinkStub;

    #[async_trait]
    impl Sink for FailingSinkStub {
        fn state(&self) -> SinkState {
            SinkState::Open
        }

        async fn process_request(self: Arc<Self>, stack: &mut SinkStack, _message: WireMessage) {
            stack
                .respond(WireMessage::Return(MethodReturnMessage::err(
                    RpcError::server("boom"),
                )))
                .await;
        }
    }

    #[tokio::test]
    async fn server_error_is_wrapped_with_call_context() {
        let dispatcher = Dispatcher::new("svc", Arc::new(FailingSinkStub), Duration::from_secs(1));
        let call = MethodCallMessage::new("svc", "explode");
        let err = dispatcher.call("explode", call, None).await.unwrap_err();
        match err {
            RpcError::Server { message, .. } => assert!(message.contains("svc.explode")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    struct UnresponsiveSink;

    #[async_trait]
    impl Sink for UnresponsiveSink {
        fn state(&self) -> SinkState {
            SinkState::Open
        }

        async fn process_request(self: Arc<Self>, _stack: &mut SinkStack, _message: WireMessage) {
            // Never responds — simulates a timeout sink that already synthesized a
            // response via a separate path, exercised elsewhere.
        }
    }

    #[tokio::test]
    async fn timeout_error_is_not_wrapped() {
        use crate::future::promise;

        let (p, r) = promise::<Bytes>();
        p.set_exception(RpcError::Timeout);
        assert!(matches!(r.await, Err(RpcError::Timeout)));

        // Exercise the dispatcher path too, to ensure a chain that never responds doesn't
        // spuriously wrap anything (it simply never completes within the test's scope).
        let dispatcher = Dispatcher::new("svc", Arc::new(UnresponsiveSink), Duration::from_millis(5));
        let call = MethodCallMessage::new("svc", "never");
        let fut = dispatcher.call("never", call, None);
        let outcome = fut.wait(Duration::from_millis(20)).await;
        assert!(matches!(outcome, Err(RpcError::Timeout)));
    }
}
