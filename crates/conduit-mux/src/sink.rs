use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, OnceCell};

use conduit_core::error::RpcError;
use conduit_core::message::{MethodReturnMessage, Tag, WireMessage};
use conduit_core::sink::{Sink, SinkStack, SinkState};
use conduit_transport::{Connection, FaultObservable};

use crate::tag_pool::TagPool;
use crate::wire::{
    decode_header, encode_frame, encode_tdispatch_body, parse_rdispatch_body, FrameHeader,
    MessageType, RdispatchOutcome, HEADER_LEN, MAX_FRAME_BODY_LEN,
};

const PING_TAG: Tag = Tag(1);
const ONE_WAY_TAG: Tag = Tag(0);
const PING_INTERVAL_MIN_MS: u64 = 30_000;
const PING_INTERVAL_MAX_MS: u64 = 40_000;
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RunState {
    Uninitialized = 0,
    Starting = 1,
    Running = 2,
    Stopped = 3,
}

impl From<u8> for RunState {
    fn from(v: u8) -> Self {
        match v {
            0 => RunState::Uninitialized,
            1 => RunState::Starting,
            2 => RunState::Running,
            _ => RunState::Stopped,
        }
    }
}

/// Pipelines many concurrent calls over a single connection by tagging each request and
/// correlating replies to the tag in their header. One send-loop task owns the socket's write
/// half, one recv-loop task owns the read half, and a ping loop proves liveness; all three are
/// spawned once, lazily, behind a [`OnceCell`] shared by however many callers race to make the
/// first call (the "shared-open future").
pub struct MuxTransportSink {
    connection: Arc<dyn Connection>,
    tag_pool: TagPool,
    in_flight: DashMap<Tag, oneshot::Sender<WireMessage>>,
    send_tx: mpsc::UnboundedSender<Bytes>,
    send_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    state: AtomicU8,
    fault: FaultObservable,
    started: OnceCell<Result<(), String>>,
}

impl MuxTransportSink {
    pub fn new(connection: Arc<dyn Connection>) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connection,
            tag_pool: TagPool::new(),
            in_flight: DashMap::new(),
            send_tx,
            send_rx: parking_lot::Mutex::new(Some(send_rx)),
            state: AtomicU8::new(RunState::Uninitialized as u8),
            fault: FaultObservable::new(),
            started: OnceCell::new(),
        })
    }

    pub async fn on_faulted(&self) -> String {
        self.fault.wait().await
    }

    fn run_state(&self) -> RunState {
        RunState::from(self.state.load(Ordering::SeqCst))
    }

    /// Drives the shared "open" sequence exactly once: start the send/recv loops, then block
    /// on a single synchronous ping before ever reaching `Running` — a dead peer must never be
    /// handed a real call. Every concurrent first caller awaits the same future; later callers
    /// just read back its cached outcome.
    async fn ensure_started(self: &Arc<Self>) -> Result<(), String> {
        self.started
            .get_or_init(|| async {
                self.state.store(RunState::Starting as u8, Ordering::SeqCst);
                let send_rx = self
                    .send_rx
                    .lock()
                    .take()
                    .expect("ensure_started runs its body at most once");
                tokio::spawn(Self::send_loop(self.clone(), send_rx));
                tokio::spawn(Self::recv_loop(self.clone()));

                let (tx, rx) = oneshot::channel();
                self.in_flight.insert(PING_TAG, tx);
                let frame = encode_frame(MessageType::Tping, PING_TAG, b"")
                    .expect("an empty ping body never exceeds the frame length ceiling");
                if self.send_tx.send(frame).is_err() {
                    self.in_flight.remove(&PING_TAG);
                    let reason = "failed to enqueue the initial ping".to_string();
                    self.shutdown(reason.clone()).await;
                    return Err(reason);
                }

                let outcome = tokio::time::timeout(PING_TIMEOUT, rx).await;
                self.in_flight.remove(&PING_TAG);
                match outcome {
                    Ok(Ok(WireMessage::Return(ret))) if ret.is_ok() => {
                        tracing::debug!("initial ping succeeded, transport is running");
                        tokio::spawn(Self::ping_loop(self.clone()));
                        self.state.store(RunState::Running as u8, Ordering::SeqCst);
                        Ok(())
                    }
                    Ok(Ok(WireMessage::Return(ret))) => {
                        let reason = format!(
                            "initial ping rejected: {}",
                            ret.error().map(ToString::to_string).unwrap_or_default()
                        );
                        self.shutdown(reason.clone()).await;
                        Err(reason)
                    }
                    _ => {
                        let reason = "initial ping did not complete".to_string();
                        self.shutdown(reason.clone()).await;
                        Err(reason)
                    }
                }
            })
            .await
            .clone()
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = self.connection.write_all(&frame).await {
                self.shutdown(format!("write error: {err}")).await;
                return;
            }
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        loop {
            let mut len_buf = [0u8; 4];
            if let Err(err) = self.connection.read_exact(&mut len_buf).await {
                self.shutdown(format!("read error: {err}")).await;
                return;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > HEADER_LEN + MAX_FRAME_BODY_LEN as usize {
                self.shutdown("peer announced an oversized frame").await;
                return;
            }
            let mut buf = vec![0u8; len];
            if let Err(err) = self.connection.read_exact(&mut buf).await {
                self.shutdown(format!("read error: {err}")).await;
                return;
            }
            match decode_header(&buf) {
                Ok(header) => {
                    let body = Bytes::copy_from_slice(&buf[HEADER_LEN..]);
                    self.handle_frame(header, body);
                }
                Err(err) => tracing::warn!(%err, "dropping unparseable frame"),
            }
        }
    }

    fn handle_frame(&self, header: FrameHeader, body: Bytes) {
        match header.msg_type {
            MessageType::Rping => {
                if let Some((_, tx)) = self.in_flight.remove(&PING_TAG) {
                    let _ = tx.send(WireMessage::Return(MethodReturnMessage::ok(Bytes::new())));
                }
            }
            MessageType::Rdispatch | MessageType::Rerr | MessageType::BadRerr => {
                if header.tag == ONE_WAY_TAG {
                    tracing::debug!("dropping reply addressed to the one-way tag");
                    return;
                }
                match self.in_flight.remove(&header.tag) {
                    Some((_, tx)) => {
                        self.tag_pool.release(header.tag);
                        let reply = match header.msg_type {
                            MessageType::Rdispatch => match parse_rdispatch_body(&body) {
                                Ok(RdispatchOutcome::Ok(payload)) => WireMessage::RawReply(payload),
                                Ok(RdispatchOutcome::Error(text)) => {
                                    WireMessage::Return(MethodReturnMessage::err(RpcError::server(text)))
                                }
                                Ok(RdispatchOutcome::Nack) => WireMessage::Return(
                                    MethodReturnMessage::err(RpcError::server("the server returned a NACK")),
                                ),
                                Err(err) => WireMessage::Return(MethodReturnMessage::err(
                                    RpcError::server(format!("malformed Rdispatch body: {err}")),
                                )),
                            },
                            _ => WireMessage::Return(MethodReturnMessage::err(RpcError::server(
                                String::from_utf8_lossy(&body).into_owned(),
                            ))),
                        };
                        let _ = tx.send(reply);
                    }
                    None => tracing::debug!(tag = %header.tag, "dropping reply for a tag no longer tracked"),
                }
            }
            other => tracing::debug!(?other, tag = %header.tag, "dropping unexpected frame"),
        }
    }

    async fn ping_loop(self: Arc<Self>) {
        loop {
            let jitter_ms = rand::thread_rng().gen_range(PING_INTERVAL_MIN_MS..=PING_INTERVAL_MAX_MS);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            if self.run_state() != RunState::Running {
                return;
            }

            let (tx, rx) = oneshot::channel();
            self.in_flight.insert(PING_TAG, tx);
            let frame = encode_frame(MessageType::Tping, PING_TAG, b"")
                .expect("an empty ping body never exceeds the frame length ceiling");
            if self.send_tx.send(frame).is_err() {
                return;
            }

            match tokio::time::timeout(PING_TIMEOUT, rx).await {
                Ok(Ok(_)) => continue,
                _ => {
                    self.in_flight.remove(&PING_TAG);
                    self.shutdown("Ping Timeout").await;
                    return;
                }
            }
        }
    }

    /// Idempotent and atomic: transitions to `Stopped`, closes the socket, completes every
    /// outstanding waiter with a transport-faulted return, and fires the fault observable so
    /// pools evict this sink.
    async fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.store(RunState::Stopped as u8, Ordering::SeqCst);
        self.connection.close().await;
        let stranded: Vec<Tag> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        for tag in stranded {
            if let Some((_, tx)) = self.in_flight.remove(&tag) {
                let _ = tx.send(WireMessage::Return(MethodReturnMessage::err(
                    RpcError::transport_fault(reason.clone()),
                )));
            }
        }
        self.fault.fire(reason);
    }
}

/// Enqueues a `Tdiscarded` for `tag` if dropped before being marked complete — the fallout of
/// a client timeout synthesized upstream, which cancels this future without the server ever
/// having acknowledged the call.
struct DiscardOnDrop {
    tag: Tag,
    send_tx: mpsc::UnboundedSender<Bytes>,
    completed: bool,
}

impl Drop for DiscardOnDrop {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Ok(frame) = encode_frame(MessageType::Tdiscarded, self.tag, b"client timeout") {
            let _ = self.send_tx.send(frame);
        }
    }
}

#[async_trait]
impl Sink for MuxTransportSink {
    fn state(&self) -> SinkState {
        match self.run_state() {
            RunState::Running => SinkState::Open,
            RunState::Stopped => SinkState::Closed,
            RunState::Uninitialized | RunState::Starting => SinkState::Idle,
        }
    }

    async fn process_request(self: Arc<Self>, stack: &mut SinkStack, message: WireMessage) {
        if let Err(reason) = self.ensure_started().await {
            stack
                .respond(WireMessage::Return(MethodReturnMessage::err(
                    RpcError::transport_fault(reason),
                )))
                .await;
            return;
        }

        if self.run_state() != RunState::Running {
            stack
                .respond(WireMessage::Return(MethodReturnMessage::err(
                    RpcError::transport_fault("transport is not running"),
                )))
                .await;
            return;
        }

        let encoded = match message.into_encoded() {
            Ok(encoded) => encoded,
            Err(_) => {
                stack
                    .respond(WireMessage::Return(MethodReturnMessage::err(
                        RpcError::client("multiplexed transport expects an already-encoded call"),
                    )))
                    .await;
                return;
            }
        };

        // A call pre-stamped with tag 0 is one-way: fire the frame and complete immediately
        // without recording any in-flight state, per the wire contract's reserved tag 0.
        if encoded.context.tag == Some(ONE_WAY_TAG) {
            let body = encode_tdispatch_body(&encoded.payload, &encoded.context);
            match encode_frame(MessageType::Tdispatch, ONE_WAY_TAG, &body) {
                Ok(frame) => {
                    let _ = self.send_tx.send(frame);
                    stack
                        .respond(WireMessage::Return(MethodReturnMessage::ok(Bytes::new())))
                        .await;
                }
                Err(err) => {
                    stack
                        .respond(WireMessage::Return(MethodReturnMessage::err(
                            RpcError::client(err.to_string()),
                        )))
                        .await;
                }
            }
            return;
        }

        let tag = match self.tag_pool.acquire() {
            Ok(tag) => tag,
            Err(_) => {
                stack
                    .respond(WireMessage::Return(MethodReturnMessage::err(
                        RpcError::PoolExhausted,
                    )))
                    .await;
                return;
            }
        };

        let body = encode_tdispatch_body(&encoded.payload, &encoded.context);
        let frame = match encode_frame(MessageType::Tdispatch, tag, &body) {
            Ok(frame) => frame,
            Err(err) => {
                self.tag_pool.release(tag);
                stack
                    .respond(WireMessage::Return(MethodReturnMessage::err(
                        RpcError::client(err.to_string()),
                    )))
                    .await;
                return;
            }
        };

        let (tx, rx) = oneshot::channel();
        self.in_flight.insert(tag, tx);
        let mut guard = DiscardOnDrop {
            tag,
            send_tx: self.send_tx.clone(),
            completed: false,
        };
        let _ = self.send_tx.send(frame);

        let reply = match rx.await {
            Ok(reply) => reply,
            Err(_) => WireMessage::Return(MethodReturnMessage::err(RpcError::transport_fault(
                "transport closed before a reply arrived",
            ))),
        };
        guard.completed = true;
        stack.respond(reply).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::future::{promise, AsyncResult};
    use conduit_core::message::{CallContext, EncodedCall};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct DuplexConnection {
        reader: tokio::sync::Mutex<ReadHalf<DuplexStream>>,
        writer: tokio::sync::Mutex<WriteHalf<DuplexStream>>,
    }

    impl DuplexConnection {
        fn new(stream: DuplexStream) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            Self {
                reader: tokio::sync::Mutex::new(reader),
                writer: tokio::sync::Mutex::new(writer),
            }
        }
    }

    #[async_trait]
    impl Connection for DuplexConnection {
        async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
            let mut w = self.writer.lock().await;
            w.write_all(buf).await?;
            w.flush().await
        }

        async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
            self.reader.lock().await.read_exact(buf).await.map(|_| ())
        }

        async fn close(&self) {
            let _ = self.writer.lock().await.shutdown().await;
        }

        fn peer_description(&self) -> String {
            "duplex-test-peer".to_string()
        }
    }

    fn call_with_stack() -> (WireMessage, SinkStack, AsyncResult<Bytes>) {
        let message = WireMessage::Encoded(EncodedCall {
            payload: Bytes::from_static(b"ping"),
            context: CallContext::default(),
        });
        let (p, r) = promise::<Bytes>();
        let mut stack = SinkStack::new();
        stack.push(Box::new(move |_stack, reply| {
            Box::pin(async move {
                if let WireMessage::Return(ret) = reply {
                    match ret.into_result() {
                        Ok(v) => p.set(v),
                        Err(e) => p.set_exception(e),
                    }
                }
            })
        }));
        (message, stack, r)
    }

    async fn read_frame(server: &mut DuplexStream) -> (FrameHeader, Bytes) {
        let mut len_buf = [0u8; 4];
        server.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        server.read_exact(&mut buf).await.unwrap();
        let header = decode_header(&buf).unwrap();
        (header, Bytes::copy_from_slice(&buf[HEADER_LEN..]))
    }

    /// Every call now has to clear the synchronous "open" handshake first: read the initial
    /// `Tping` the sink sends before it ever reaches `Running`, and answer it.
    async fn complete_initial_ping(server: &mut DuplexStream) {
        let (header, _) = read_frame(server).await;
        assert_eq!(header.msg_type, MessageType::Tping);
        assert_eq!(header.tag, PING_TAG);
        let reply = encode_frame(MessageType::Rping, PING_TAG, b"").unwrap();
        server.write_all(&reply).await.unwrap();
    }

    fn ok_rdispatch_body(payload: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8]; // status: OK
        body.extend_from_slice(&0i16.to_be_bytes()); // context_count
        body.extend_from_slice(payload);
        body
    }

    #[tokio::test]
    async fn round_trips_a_tagged_call() {
        let (client_side, mut server) = tokio::io::duplex(4096);
        let sink = MuxTransportSink::new(Arc::new(DuplexConnection::new(client_side)));

        let (message, mut stack, result) = call_with_stack();
        let call = tokio::spawn(async move {
            sink.process_request(&mut stack, message).await;
        });

        complete_initial_ping(&mut server).await;

        let (header, _body) = read_frame(&mut server).await;
        assert_eq!(header.msg_type, MessageType::Tdispatch);
        assert!(header.tag.0 >= 2);

        let reply = encode_frame(MessageType::Rdispatch, header.tag, &ok_rdispatch_body(b"pong")).unwrap();
        server.write_all(&reply).await.unwrap();

        call.await.unwrap();
        assert_eq!(result.await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn a_nack_rdispatch_surfaces_as_a_server_error() {
        let (client_side, mut server) = tokio::io::duplex(4096);
        let sink = MuxTransportSink::new(Arc::new(DuplexConnection::new(client_side)));

        let (message, mut stack, result) = call_with_stack();
        let call = tokio::spawn(async move {
            sink.process_request(&mut stack, message).await;
        });

        complete_initial_ping(&mut server).await;
        let (header, _body) = read_frame(&mut server).await;

        let mut nack_body = vec![2u8]; // status: NACK
        nack_body.extend_from_slice(&0i16.to_be_bytes());
        let reply = encode_frame(MessageType::Rdispatch, header.tag, &nack_body).unwrap();
        server.write_all(&reply).await.unwrap();

        call.await.unwrap();
        match result.await {
            Err(RpcError::Server { message, .. }) => assert!(message.contains("NACK")),
            other => panic!("expected a server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_way_call_completes_without_waiting_for_a_reply() {
        let (client_side, mut server) = tokio::io::duplex(4096);
        let sink = MuxTransportSink::new(Arc::new(DuplexConnection::new(client_side)));

        let message = WireMessage::Encoded(EncodedCall {
            payload: Bytes::from_static(b"fire"),
            context: CallContext {
                tag: Some(ONE_WAY_TAG),
                ..Default::default()
            },
        });
        let (p, r) = promise::<Bytes>();
        let mut stack = SinkStack::new();
        stack.push(Box::new(move |_stack, reply| {
            Box::pin(async move {
                if let WireMessage::Return(ret) = reply {
                    if let Ok(v) = ret.into_result() {
                        p.set(v);
                    }
                }
            })
        }));

        let call = tokio::spawn(async move {
            sink.process_request(&mut stack, message).await;
        });

        complete_initial_ping(&mut server).await;
        assert!(r.await.is_ok());
        call.await.unwrap();

        let (header, _) = read_frame(&mut server).await;
        assert_eq!(header.tag, ONE_WAY_TAG);
        assert_eq!(header.msg_type, MessageType::Tdispatch);
    }

    #[tokio::test]
    async fn cancelling_before_a_reply_enqueues_a_discard() {
        let (client_side, mut server) = tokio::io::duplex(4096);
        let sink = MuxTransportSink::new(Arc::new(DuplexConnection::new(client_side)));

        let (message, mut stack, _result) = call_with_stack();
        let abort_handle = tokio::spawn(async move {
            sink.process_request(&mut stack, message).await;
        });

        complete_initial_ping(&mut server).await;

        let (header, _) = read_frame(&mut server).await;
        assert_eq!(header.msg_type, MessageType::Tdispatch);

        abort_handle.abort();
        let _ = abort_handle.await;

        let (discard_header, _) = read_frame(&mut server).await;
        assert_eq!(discard_header.msg_type, MessageType::Tdiscarded);
        assert_eq!(discard_header.tag, header.tag);
    }
}
