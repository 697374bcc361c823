use bytes::Bytes;

use crate::error::RpcError;
use crate::message::{MethodCallMessage, MethodReturnMessage};

/// The interface a concrete wire codec (Thrift, ThriftMux, HTTP, ...) must satisfy for the
/// serializer sink to use it. Concrete codecs are out of scope for this core; this trait is
/// the entire surface the pipeline requires: "given a call message, write bytes; given
/// bytes, produce a reply message."
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, call: &MethodCallMessage) -> Result<Bytes, RpcError>;
    fn decode(&self, bytes: Bytes) -> MethodReturnMessage;
}

/// A trivial codec used only to exercise the serializer sink in tests: encodes the method
/// name as UTF-8 and decodes any payload back into a successful return of the same bytes.
#[derive(Debug, Default)]
pub struct EchoCodec;

impl Codec for EchoCodec {
    fn encode(&self, call: &MethodCallMessage) -> Result<Bytes, RpcError> {
        Ok(Bytes::from(call.method.clone().into_bytes()))
    }

    fn decode(&self, bytes: Bytes) -> MethodReturnMessage {
        MethodReturnMessage::ok(bytes)
    }
}
