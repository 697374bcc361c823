mod client_id;
mod failing;
mod serializer;

pub use client_id::ClientIdInterceptor;
pub use failing::FailingSink;
pub use serializer::SerializerSink;
