//! Sink pipeline, dispatcher, and message contracts shared by every conduit transport.
//!
//! This crate holds the protocol-agnostic core: the [`sink::Sink`] chain abstraction, the
//! message types that flow through it, the [`dispatcher::Dispatcher`] entry point, and the
//! single-assignment [`future::AsyncResult`]/[`future::Promise`] pair every call completes
//! through. Concrete transports and codecs live in sibling crates.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod future;
pub mod message;
pub mod sink;
pub mod sinks;

pub mod prelude {
    pub use crate::codec::Codec;
    pub use crate::config::ClientConfig;
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{Result, RpcError};
    pub use crate::future::{promise, AsyncResult, Promise};
    pub use crate::message::{
        ArgValue, CallContext, DeadlineEvent, EncodedCall, MethodCallMessage,
        MethodDiscardMessage, MethodReturnMessage, Tag, WireMessage,
    };
    pub use crate::sink::{ResponseHandler, Sink, SinkStack, SinkState};
}
