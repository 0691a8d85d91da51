//! Connection driver: multiplexing, reply routing, credit flow control.
//!
//! One tokio task owns both directions of the transport. Outgoing messages
//! are chunked into frames and interleaved round-robin; sending pauses
//! while the peer's unacknowledged byte count exceeds the credit window.
//! Completed inbound requests are handed to the receiver channel; replies
//! resolve the oneshot registered when the request was sent.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use super::codec::{get_varint, put_varint, Frame, FrameCodec, MAX_FRAME_PAYLOAD};
use super::{flags, Message, MessageType, DEFAULT_CREDIT, SUBPROTOCOL};
use crate::error::{Error, Result};

/// Tuning knobs for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bytes the peer may leave unacknowledged before we stop sending.
    pub credit: u64,
    /// Capacity of the incoming-request channel.
    pub incoming_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            credit: DEFAULT_CREDIT,
            incoming_capacity: 1000,
        }
    }
}

/// An inbound request, paired with nothing: respond via the `Connection`.
pub type IncomingRequest = Message;

enum Command {
    Request {
        message: Message,
        reply: Option<oneshot::Sender<Result<Message>>>,
    },
    Reply {
        message: Message,
    },
    Close,
}

/// Cloneable handle to a running connection.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: flume::Sender<Command>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Connection")
    }
}

impl Connection {
    /// Spawn the driver over a transport. Returns the handle, the stream
    /// of inbound requests, and the driver's join handle.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        options: ConnectionOptions,
    ) -> (
        Connection,
        flume::Receiver<IncomingRequest>,
        tokio::task::JoinHandle<Result<()>>,
    )
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = flume::bounded(options.incoming_capacity);
        let (incoming_tx, incoming_rx) = flume::bounded(options.incoming_capacity);
        let driver = Driver {
            cmd_rx,
            incoming_tx,
            credit: options.credit,
            next_number: 0,
            unacked: 0,
            received_since_ack: 0,
            outbox: VecDeque::new(),
            pending_replies: HashMap::new(),
            assembly: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run(
            FramedRead::new(reader, FrameCodec),
            FramedWrite::new(writer, FrameCodec),
        ));
        (Connection { cmd_tx }, incoming_rx, handle)
    }

    /// Send a request and await its reply.
    pub async fn request(&self, message: Message) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send_async(Command::Request {
                message,
                reply: Some(tx),
            })
            .await
            .map_err(|_| Error::NetworkReset)?;
        let reply = rx.await.map_err(|_| Error::NetworkReset)??;
        Ok(reply)
    }

    /// Send a request and await the reply, converting an error reply into
    /// an `Error::Remote`.
    pub async fn request_ok(&self, message: Message) -> Result<Message> {
        let reply = self.request(message).await?;
        if let Some((domain, code, text)) = reply.error() {
            return Err(Error::Remote {
                code,
                message: format!("{domain}: {text}"),
            });
        }
        Ok(reply)
    }

    /// Send a one-way message (no reply expected).
    pub async fn send(&self, message: Message) -> Result<()> {
        self.cmd_tx
            .send_async(Command::Request {
                message: message.no_reply(),
                reply: None,
            })
            .await
            .map_err(|_| Error::NetworkReset)
    }

    /// Send a reply to a received request.
    pub async fn respond(&self, message: Message) -> Result<()> {
        self.cmd_tx
            .send_async(Command::Reply { message })
            .await
            .map_err(|_| Error::NetworkReset)
    }

    /// Flush and close the transport.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send_async(Command::Close).await;
    }

    /// Active-side handshake: announce the subprotocol and verify the
    /// peer accepts it.
    pub async fn handshake(&self) -> Result<()> {
        let reply = self
            .request(Message::request("handshake").with_property("subprotocol", SUBPROTOCOL))
            .await?;
        match reply.property("subprotocol") {
            Some(sub) if sub == SUBPROTOCOL => Ok(()),
            other => Err(Error::WebSocketClosed {
                code: 1002,
                reason: format!("subprotocol mismatch: {other:?}"),
            }),
        }
    }
}

struct Outgoing {
    number: u64,
    type_bits: u8,
    msg_flags: u8,
    remaining: Bytes,
}

struct Assembly {
    msg_type: MessageType,
    msg_flags: u8,
    buf: BytesMut,
}

struct Driver {
    cmd_rx: flume::Receiver<Command>,
    incoming_tx: flume::Sender<Message>,
    credit: u64,
    next_number: u64,
    unacked: u64,
    received_since_ack: u64,
    outbox: VecDeque<Outgoing>,
    pending_replies: HashMap<u64, oneshot::Sender<Result<Message>>>,
    assembly: HashMap<(u64, bool), Assembly>,
}

impl Driver {
    async fn run<R, W>(
        mut self,
        mut reader: FramedRead<R, FrameCodec>,
        mut writer: FramedWrite<W, FrameCodec>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut closing = false;
        loop {
            if closing && self.outbox.is_empty() {
                break;
            }
            let can_send = !self.outbox.is_empty() && self.unacked < self.credit;
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv_async(), if !closing => {
                    match cmd {
                        Ok(Command::Request { message, reply }) => self.enqueue_request(message, reply),
                        Ok(Command::Reply { message }) => self.enqueue_reply(message),
                        Ok(Command::Close) | Err(_) => closing = true,
                    }
                }
                frame = reader.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            if let Some(ack) = self.on_frame(frame).await? {
                                writer.send(ack).await?;
                            }
                        }
                        Some(Err(err)) => {
                            self.fail_pending(&err);
                            return Err(err);
                        }
                        None => {
                            debug!("transport closed by peer");
                            self.fail_pending(&Error::NetworkReset);
                            return Ok(());
                        }
                    }
                }
                _ = std::future::ready(()), if can_send => {
                    let frame = self.next_frame();
                    writer.send(frame).await?;
                }
            }
        }
        let _ = writer.flush().await;
        self.fail_pending(&Error::Canceled);
        Ok(())
    }

    fn enqueue_request(
        &mut self,
        mut message: Message,
        reply: Option<oneshot::Sender<Result<Message>>>,
    ) {
        self.next_number += 1;
        message.number = self.next_number;
        if let Some(reply) = reply {
            self.pending_replies.insert(message.number, reply);
        }
        self.enqueue(message, MessageType::Request);
    }

    fn enqueue_reply(&mut self, message: Message) {
        let msg_type = if message.msg_type == MessageType::Error {
            MessageType::Error
        } else {
            MessageType::Response
        };
        self.enqueue(message, msg_type);
    }

    fn enqueue(&mut self, message: Message, msg_type: MessageType) {
        match message.encode_payload() {
            Ok(payload) => {
                trace!(number = message.number, ?msg_type, len = payload.len(), "enqueue");
                self.outbox.push_back(Outgoing {
                    number: message.number,
                    type_bits: msg_type as u8,
                    msg_flags: message.flags,
                    remaining: payload,
                });
            }
            Err(err) => {
                warn!("failed to encode message: {err}");
                if let Some(reply) = self.pending_replies.remove(&message.number) {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }

    /// Pop the next frame to send, round-robin across queued messages.
    fn next_frame(&mut self) -> Frame {
        let mut out = self.outbox.pop_front().expect("outbox not empty");
        let chunk_len = out.remaining.len().min(MAX_FRAME_PAYLOAD);
        let payload = out.remaining.split_to(chunk_len);
        let number = out.number;
        let mut frame_flags = out.type_bits | out.msg_flags;
        if !out.remaining.is_empty() {
            frame_flags |= flags::MORE_COMING;
            self.outbox.push_back(out);
        }
        self.unacked += payload.len() as u64;
        Frame {
            number,
            flags: frame_flags,
            payload,
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Option<Frame>> {
        let msg_type = MessageType::from_bits(frame.flags)?;
        if msg_type.is_ack() {
            let mut cursor = &frame.payload[..];
            let delta = get_varint(&mut cursor).unwrap_or(0);
            self.unacked = self.unacked.saturating_sub(delta);
            return Ok(None);
        }
        self.received_since_ack += frame.credit_size();
        let is_reply = msg_type.is_reply();
        let key = (frame.number, is_reply);
        let entry = self.assembly.entry(key).or_insert_with(|| Assembly {
            msg_type,
            msg_flags: frame.flags,
            buf: BytesMut::new(),
        });
        entry.buf.extend_from_slice(&frame.payload);
        let more = frame.flags & flags::MORE_COMING != 0;
        if !more {
            let assembly = self.assembly.remove(&key).expect("just inserted");
            let message = Message::decode_payload(
                frame.number,
                assembly.msg_type,
                assembly.msg_flags,
                &assembly.buf,
            )?;
            self.dispatch(message, is_reply).await;
        }
        // Acknowledge received bytes so the peer's window refills.
        if self.received_since_ack >= self.credit / 4 {
            let mut payload = Vec::with_capacity(10);
            put_varint(&mut payload, self.received_since_ack);
            self.received_since_ack = 0;
            let ack_type = if is_reply {
                MessageType::AckResponse
            } else {
                MessageType::AckRequest
            };
            return Ok(Some(Frame {
                number: frame.number,
                flags: ack_type as u8,
                payload: payload.into(),
            }));
        }
        Ok(None)
    }

    async fn dispatch(&mut self, message: Message, is_reply: bool) {
        if is_reply {
            match self.pending_replies.remove(&message.number) {
                Some(reply) => {
                    let _ = reply.send(Ok(message));
                }
                None => warn!(number = message.number, "reply to unknown request"),
            }
        } else {
            // A full channel here is backpressure: the reader stalls, the
            // peer's credit drains, and it stops sending.
            if self.incoming_tx.send_async(message).await.is_err() {
                debug!("incoming receiver dropped");
            }
        }
    }

    fn fail_pending(&mut self, err: &Error) {
        for (_, reply) in self.pending_replies.drain() {
            let _ = reply.send(Err(clone_error(err)));
        }
    }
}

fn clone_error(err: &Error) -> Error {
    match err {
        Error::NetworkReset => Error::NetworkReset,
        Error::Canceled => Error::Canceled,
        Error::Timeout => Error::Timeout,
        other => Error::Busy(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        Connection,
        flume::Receiver<Message>,
        Connection,
        flume::Receiver<Message>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (conn_a, inc_a, _) = Connection::spawn(ar, aw, ConnectionOptions::default());
        let (conn_b, inc_b, _) = Connection::spawn(br, bw, ConnectionOptions::default());
        (conn_a, inc_a, conn_b, inc_b)
    }

    #[tokio::test]
    async fn request_reply_round_trip() -> anyhow::Result<()> {
        let (conn_a, _inc_a, conn_b, inc_b) = pair();
        let server = tokio::spawn(async move {
            let req = inc_b.recv_async().await.unwrap();
            assert_eq!(req.profile(), Some("ping"));
            conn_b
                .respond(Message::response_to(&req).with_body(&b"pong"[..]))
                .await
                .unwrap();
        });
        let reply = conn_a.request(Message::request("ping")).await?;
        assert_eq!(&reply.body[..], b"pong");
        server.await.unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn large_bodies_cross_many_frames() -> anyhow::Result<()> {
        let (conn_a, _inc_a, conn_b, inc_b) = pair();
        let body: Vec<u8> = (0..=255u8).cycle().take(1_000_000).collect();
        let expected = body.clone();
        let server = tokio::spawn(async move {
            let req = inc_b.recv_async().await.unwrap();
            assert_eq!(&req.body[..], &expected[..]);
            conn_b
                .respond(Message::response_to(&req).with_body(req.body.clone()))
                .await
                .unwrap();
        });
        let reply = conn_a
            .request(Message::request("echo").with_body(body.clone()))
            .await?;
        assert_eq!(&reply.body[..], &body[..]);
        server.await.unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn sender_stalls_until_acks_arrive() -> anyhow::Result<()> {
        use tokio::time::{timeout, Duration};

        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (conn, _incoming, _driver) = Connection::spawn(ar, aw, ConnectionOptions::default());

        // The peer decodes frames but withholds every acknowledgement.
        let mut reader = FramedRead::new(br, FrameCodec);
        let mut writer = FramedWrite::new(bw, FrameCodec);

        let body = vec![0x5au8; 600_000];
        let sender = conn.clone();
        tokio::spawn(async move {
            let _ = sender
                .request(Message::request("bulk").with_body(body))
                .await;
        });

        let mut received = 0u64;
        let mut number = 0u64;
        while let Ok(Some(Ok(frame))) = timeout(Duration::from_millis(500), reader.next()).await {
            received += frame.payload.len() as u64;
            number = frame.number;
        }
        // Emission stopped at the credit window, far short of the message.
        assert!(received >= DEFAULT_CREDIT, "sent only {received} bytes");
        assert!(
            received < DEFAULT_CREDIT + MAX_FRAME_PAYLOAD as u64,
            "sent {received} bytes, past the credit window"
        );

        // Acknowledging the received bytes reopens the window.
        let mut payload = Vec::new();
        put_varint(&mut payload, received);
        writer
            .send(Frame {
                number,
                flags: MessageType::AckRequest as u8,
                payload: payload.into(),
            })
            .await?;
        let mut resumed = 0u64;
        while let Ok(Some(Ok(frame))) = timeout(Duration::from_millis(500), reader.next()).await {
            resumed += frame.payload.len() as u64;
        }
        assert!(resumed > 0, "sender did not resume after acks");
        assert!(resumed < 600_000, "a single ack cannot drain the message");
        Ok(())
    }

    #[tokio::test]
    async fn handshake_round_trip() -> anyhow::Result<()> {
        let (conn_a, _inc_a, conn_b, inc_b) = pair();
        tokio::spawn(async move {
            let req = inc_b.recv_async().await.unwrap();
            let sub = req.property("subprotocol").unwrap().to_string();
            conn_b
                .respond(Message::response_to(&req).with_property("subprotocol", sub))
                .await
                .unwrap();
        });
        conn_a.handshake().await?;
        Ok(())
    }

    #[tokio::test]
    async fn error_reply_surfaces_identity() -> anyhow::Result<()> {
        let (conn_a, _inc_a, conn_b, inc_b) = pair();
        tokio::spawn(async move {
            let req = inc_b.recv_async().await.unwrap();
            conn_b
                .respond(Message::error_response(&req, "Db", 404, "no such doc"))
                .await
                .unwrap();
        });
        let err = conn_a.request_ok(Message::request("rev")).await.unwrap_err();
        match err {
            Error::Remote { code, .. } => assert_eq!(code, 404),
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }
}
