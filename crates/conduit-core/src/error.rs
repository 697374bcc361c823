/// The error domain shared by every sink in a dispatcher's chain.
///
/// Errors never unwind across a [`crate::sink::Sink`] boundary: a sink that fails converts
/// the failure into a [`crate::message::MethodReturnMessage`] carrying one of these variants
/// and forwards it exactly like a successful response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The deadline elapsed before a reply arrived. Never wrapped by the dispatcher; it
    /// surfaces to the caller exactly as produced by the timeout sink.
    #[error("call timed out")]
    Timeout,

    /// The client rejected the call before it reached the wire (wrong message class, a
    /// serializer asked to encode something that isn't a call, ...).
    #[error("client error: {0}")]
    Client(String),

    /// A serial transport received a second request while one was still in flight.
    #[error("channel is busy with another request")]
    ChannelConcurrency,

    /// The server returned an application-level error (NACK, `Rerr`, or an error `Rdispatch`).
    #[error("server error: {message}")]
    Server {
        message: String,
        /// Remote stack trace, when the server supplied one, preserved for diagnostics.
        remote_trace: Option<String>,
    },

    /// The underlying connection failed or was shut down; every in-flight waiter observes
    /// this exactly once.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// The pipeline produced a response message of a kind the dispatcher does not recognize.
    #[error("internal error: {0}")]
    Internal(String),

    /// The multiplexed transport's tag pool has no free tags and cannot grow further.
    #[error("tag pool exhausted")]
    PoolExhausted,
}

impl RpcError {
    pub fn client(msg: impl Into<String>) -> Self {
        RpcError::Client(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RpcError::Internal(msg.into())
    }

    pub fn transport_fault(msg: impl Into<String>) -> Self {
        RpcError::TransportFault(msg.into())
    }

    pub fn server(msg: impl Into<String>) -> Self {
        RpcError::Server {
            message: msg.into(),
            remote_trace: None,
        }
    }

    pub fn server_with_trace(msg: impl Into<String>, trace: impl Into<String>) -> Self {
        RpcError::Server {
            message: msg.into(),
            remote_trace: Some(trace.into()),
        }
    }

    /// True for errors that should never be wrapped with an additional stack annotation
    /// by the dispatcher (currently just timeouts, per the wire contract).
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout)
    }
}

/// A lightweight alias used throughout the crate; mirrors the convention of naming the
/// error type explicitly rather than hiding it behind `anyhow`.
pub type Result<T, E = RpcError> = std::result::Result<T, E>;
