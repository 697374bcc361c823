use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use conduit_transport::Connection;

/// A [`Connection`] backed by a real `tokio::net::TcpStream`. Reads and writes are each
/// serialized behind their own mutex so that the stream can still be read and written
/// concurrently from two different tasks if a future transport wants that; `SerialTransportSink`
/// itself never does, since it holds off a second call until the first's exchange finishes.
pub struct TokioTcpConnection {
    peer: String,
    reader: Mutex<tokio::net::tcp::OwnedReadHalf>,
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

impl TokioTcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let (read_half, write_half) = stream.into_split();
        Self {
            peer,
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
        }
    }

    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl Connection for TokioTcpConnection {
    async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await
    }

    async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut reader = self.reader.lock().await;
        reader.read_exact(buf).await.map(|_| ())
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn peer_description(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_bytes_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = TokioTcpConnection::new(stream);
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let client = TokioTcpConnection::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }
}
