use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::RpcError;

/// Per-connection tag used to correlate a request to its reply on a multiplexed transport.
/// `0` is reserved for one-way calls, `1` for liveness pings (see `conduit-mux`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u32);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single-set signal that a `Deadline` property carries alongside the absolute deadline
/// itself. The timeout sink cancels it once a reply (of any kind) is observed; anything
/// downstream may subscribe to learn that the call has been abandoned client-side.
#[derive(Debug, Clone, Default)]
pub struct DeadlineEvent(std::sync::Arc<Notify>);

impl DeadlineEvent {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(Notify::new()))
    }

    pub fn fire(&self) {
        self.0.notify_waiters();
    }

    pub async fn wait(&self) {
        self.0.notified().await;
    }
}

/// Recognized properties on a call's context, modeled as an enumerated struct per the
/// expanded spec's redesign note rather than a dynamic string-keyed map. Arbitrary
/// transport headers still flow through the `headers` overflow map.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Absolute wall-clock time by which the call must complete.
    pub deadline: Option<SystemTime>,
    /// Fired when the call is abandoned client-side (timeout or cancellation).
    pub deadline_event: Option<DeadlineEvent>,
    /// Per-connection tag, stamped by the multiplexed transport when it accepts the call.
    pub tag: Option<Tag>,
    /// Client identifier header, stamped by the client-id interceptor.
    pub client_id: Option<String>,
    /// Arbitrary transport headers that do not warrant a first-class field.
    pub headers: HashMap<String, Bytes>,
}

impl CallContext {
    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
        self.deadline
            .map(|d| d.duration_since(now).unwrap_or(Duration::ZERO))
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }
}

/// A single positional or keyword argument. Kept intentionally small and untyped: concrete
/// wire codecs (out of scope for this core) decide how to serialize each variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

/// Immutable view of an outgoing invocation.
#[derive(Debug, Clone)]
pub struct MethodCallMessage {
    pub service: String,
    pub method: String,
    pub args: Vec<ArgValue>,
    pub kwargs: HashMap<String, ArgValue>,
    pub context: CallContext,
}

impl MethodCallMessage {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args: Vec::new(),
            kwargs: HashMap::new(),
            context: CallContext::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<ArgValue>) -> Self {
        self.args = args;
        self
    }
}

/// Either a return value or an error — never both. Constructed exclusively through
/// [`MethodReturnMessage::ok`] / [`MethodReturnMessage::err`] so the invariant holds.
#[derive(Debug, Clone)]
pub struct MethodReturnMessage {
    return_value: Option<Bytes>,
    error: Option<RpcError>,
}

impl MethodReturnMessage {
    pub fn ok(value: Bytes) -> Self {
        Self {
            return_value: Some(value),
            error: None,
        }
    }

    pub fn err(error: RpcError) -> Self {
        Self {
            return_value: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.return_value.as_ref()
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<Bytes, RpcError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.return_value.expect("return value set when no error")),
        }
    }
}

/// References the call to be cancelled on a multiplexed transport, plus a human-readable
/// reason carried in the `Tdiscarded` frame.
#[derive(Debug, Clone)]
pub struct MethodDiscardMessage {
    pub tag: Tag,
    pub reason: String,
}

impl MethodDiscardMessage {
    pub fn new(tag: Tag, reason: impl Into<String>) -> Self {
        Self {
            tag,
            reason: reason.into(),
        }
    }
}

/// A call already turned into bytes by a serializer sink, still carrying its context
/// (deadline, tag once stamped, headers) for the transport sinks beneath the serializer.
#[derive(Debug, Clone)]
pub struct EncodedCall {
    pub payload: Bytes,
    pub context: CallContext,
}

/// The message shapes that flow through a sink chain, downstream (`Call`, `Encoded`,
/// `Discard`) or upstream (`RawReply`, `Return`). A sink that only cares about one
/// direction simply never constructs the others.
#[derive(Debug, Clone)]
pub enum WireMessage {
    /// Application-level call, not yet serialized. Produced by the dispatcher.
    Call(MethodCallMessage),
    /// Call after serialization, ready for a transport sink to put on the wire.
    Encoded(EncodedCall),
    /// Undecoded bytes read off the wire, travelling back up to a serializer sink.
    RawReply(Bytes),
    /// A fully decoded (or synthesized, e.g. by the timeout sink) response.
    Return(MethodReturnMessage),
    /// References a tag to cancel; only meaningful on multiplexed transports.
    Discard(MethodDiscardMessage),
}

impl WireMessage {
    pub fn as_call(&self) -> Option<&MethodCallMessage> {
        match self {
            WireMessage::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_call(self) -> Result<MethodCallMessage, RpcError> {
        match self {
            WireMessage::Call(c) => Ok(c),
            _ => Err(RpcError::client("expected a call message")),
        }
    }

    pub fn into_encoded(self) -> Result<EncodedCall, RpcError> {
        match self {
            WireMessage::Encoded(e) => Ok(e),
            _ => Err(RpcError::client("expected an encoded call")),
        }
    }
}
