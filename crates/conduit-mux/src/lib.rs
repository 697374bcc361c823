//! Tag-multiplexed transport: one connection pipelines many concurrent in-flight calls by
//! tagging each request and matching replies on that tag.

mod sink;
mod tag_pool;
mod wire;

pub use sink::MuxTransportSink;
pub use tag_pool::{PoolExhausted, TagPool, MAX_TAG};
pub use wire::{
    decode_header, encode_frame, encode_tdispatch_body, parse_rdispatch_body, FrameError,
    FrameHeader, MessageType, RdispatchOutcome, HEADER_LEN,
};
