//! Connection-reuse sinks: a lazy singleton and a bounded idle pool. Neither implements a
//! load-balancing policy across multiple endpoints — that is a sink a caller layers on top,
//! selecting among several of these.

mod singleton;
mod watermark;

pub use singleton::SingletonPoolSink;
pub use watermark::WatermarkPoolSink;
