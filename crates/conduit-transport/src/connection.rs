use async_trait::async_trait;

/// A raw byte-stream connection, abstracted over the concrete socket implementation so the
/// serial transport sink can be tested against an in-memory stub. Implementations are
/// expected to serialize their own reads against their own writes if the underlying stream
/// requires it; [`crate::serial::SerialTransportSink`] never calls `read_exact` and
/// `write_all` concurrently on the same connection, but may call either from different sink
/// instances sharing a pooled connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn write_all(&self, buf: &[u8]) -> std::io::Result<()>;

    async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()>;

    /// Best-effort close; implementations should not panic if the peer already went away.
    async fn close(&self);

    /// Human-readable peer identity for logging.
    fn peer_description(&self) -> String;
}
