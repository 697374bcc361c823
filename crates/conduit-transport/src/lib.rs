//! Connection contract and the serial transport sink: one call in flight per connection.
//!
//! The tag-multiplexed variant that pipelines many concurrent calls over one connection lives
//! in `conduit-mux`, built on top of the same [`connection::Connection`] trait.

mod connection;
mod fault;
mod serial;

pub use connection::Connection;
pub use fault::FaultObservable;
pub use serial::SerialTransportSink;
