//! Implements the `p2p` capability and the RLPx message-id multiplexing on
//! top of a framed byte transport.
//!
//! After the `Hello` exchange every frame starts with a message id. Ids
//! `0x00..=0x0f` are reserved for `p2p` itself (hello, disconnect, ping/pong
//! and the dynamic capability announcement); everything above belongs to the
//! negotiated subprotocols, whose id spaces are assigned by
//! [`SharedCapabilities`].

use crate::{
    capability::{Capability, SharedCapabilities, MAX_RESERVED_MESSAGE_ID},
    disconnect::DisconnectReason,
    errors::{P2PHandshakeError, P2PStreamError},
    hello::{HelloMessage, HelloMessageWithProtocols},
    pinger::{Pinger, PingerEvent},
    ProtocolVersion,
};
use alloy_primitives::bytes::{Buf, BufMut, Bytes, BytesMut};
use alloy_rlp::{Decodable, Encodable, EMPTY_STRING_CODE};
use futures::{Sink, SinkExt, StreamExt};
use pin_project::pin_project;
use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};
use tokio_stream::Stream;
use tracing::{debug, trace};

/// [`MAX_PAYLOAD_SIZE`] is the maximum size of an uncompressed message payload.
/// This is defined in [EIP-706](https://eips.ethereum.org/EIPS/eip-706).
const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// [`HANDSHAKE_TIMEOUT`] determines the amount of time to wait before determining that a `p2p`
/// handshake has timed out.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// [`PING_TIMEOUT`] determines the amount of time to wait before determining that a `p2p` ping has
/// timed out.
const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// [`PING_INTERVAL`] determines the amount of time to wait between sending `p2p` ping messages
/// when the peer is responsive.
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// An un-authenticated [`P2PStream`]. This is consumed and returns a [`P2PStream`] after the
/// `Hello` handshake is completed.
#[pin_project]
#[derive(Debug)]
pub struct UnauthedP2PStream<S> {
    #[pin]
    inner: S,
}

impl<S> UnauthedP2PStream<S> {
    /// Create a new `UnauthedP2PStream` from a type `S` which implements `Stream` and `Sink`.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Returns a reference to the inner stream.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S> UnauthedP2PStream<S>
where
    S: Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Unpin,
{
    /// Consumes the `UnauthedP2PStream` and returns a `P2PStream` after the `Hello`
    /// handshake is completed successfully. This also returns the `Hello` message sent by the
    /// remote peer.
    pub async fn handshake(
        mut self,
        hello: HelloMessageWithProtocols,
    ) -> Result<(P2PStream<S>, HelloMessage), P2PStreamError> {
        trace!(?hello, "sending p2p hello to peer");

        // send our hello message with the Sink
        let mut raw_hello_bytes = BytesMut::new();
        P2PMessage::Hello(hello.message()).encode(&mut raw_hello_bytes);
        self.inner.send(raw_hello_bytes.into()).await?;

        let first_message_bytes = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.inner.next())
            .await
            .or(Err(P2PStreamError::HandshakeError(P2PHandshakeError::Timeout)))?
            .ok_or(P2PStreamError::HandshakeError(P2PHandshakeError::NoResponse))??;

        // let's check the compressed length first, we will need to check again once confirming
        // that it contains snappy-compressed data (this will be the case for all non-p2p messages).
        if first_message_bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(P2PStreamError::MessageTooBig {
                message_size: first_message_bytes.len(),
                max_size: MAX_PAYLOAD_SIZE,
            })
        }

        // The first message sent MUST be the hello OR disconnect message
        let their_hello = match P2PMessage::decode(&mut &first_message_bytes[..]) {
            Ok(P2PMessage::Hello(hello)) => Ok(hello),
            Ok(P2PMessage::Disconnect(reason)) => {
                debug!(%reason, "Disconnected by peer during handshake");
                Err(P2PStreamError::HandshakeError(P2PHandshakeError::Disconnected(reason)))
            }
            Err(err) => {
                debug!(%err, msg=%alloy_primitives::hex::encode(&first_message_bytes), "Failed to decode first message from peer");
                Err(P2PStreamError::HandshakeError(err.into()))
            }
            Ok(msg) => {
                debug!(?msg, "expected hello message but received another message");
                Err(P2PStreamError::HandshakeError(P2PHandshakeError::NonHelloMessageInHandshake))
            }
        }?;

        trace!(
            hello = ?their_hello,
            "validating incoming p2p hello from peer"
        );

        // the lower of the two versions is the version of the p2p session
        let p2p_version = hello.protocol_version.min(their_hello.protocol_version);

        // determine shared capabilities (currently returns only one capability)
        let capability_res =
            SharedCapabilities::try_new(hello.protocols, their_hello.capabilities.clone());

        let shared_capabilities = match capability_res {
            Err(err) => {
                // we don't share any capabilities, send a disconnect message
                self.send_disconnect(DisconnectReason::UselessPeer).await?;
                Err(err)
            }
            Ok(cap) => Ok(cap),
        }?;

        let stream = P2PStream::new(self.inner, p2p_version, shared_capabilities);

        Ok((stream, their_hello))
    }

    /// Send a disconnect message during the handshake. This is sent without snappy compression.
    pub async fn send_disconnect(
        &mut self,
        reason: DisconnectReason,
    ) -> Result<(), P2PStreamError> {
        let mut buf = BytesMut::new();
        P2PMessage::Disconnect(reason).encode(&mut buf);
        trace!(
            %reason,
            "Sending disconnect message during the handshake",
        );
        self.inner.send(buf.into()).await.map_err(P2PStreamError::Io)
    }
}

/// A `P2PStream` wraps over any `Stream` that yields bytes and makes it compatible with `p2p`
/// protocol messages.
///
/// The stream yields subprotocol frames with their message id normalized to
/// the shared subprotocol space, i.e. the first subprotocol message id is `0`.
#[pin_project]
#[derive(Debug)]
pub struct P2PStream<S> {
    #[pin]
    inner: S,

    /// The negotiated p2p version.
    p2p_version: ProtocolVersion,

    /// The snappy encoder used for compressing outgoing messages
    encoder: snap::raw::Encoder,

    /// The snappy decoder used for decompressing incoming messages
    decoder: snap::raw::Decoder,

    /// The state machine used for keeping track of the peer's ping status.
    pinger: Pinger,

    /// The supported capability for this stream.
    shared_capabilities: SharedCapabilities,

    /// Outgoing messages buffered for sending to the underlying stream.
    outgoing_messages: VecDeque<Bytes>,

    /// Capabilities announced by the remote after the handshake via
    /// add-capability control frames.
    added_capabilities: Vec<Capability>,

    /// Whether this stream is currently in the process of disconnecting by sending a disconnect
    /// message.
    disconnecting: bool,
}

impl<S> P2PStream<S> {
    /// Create a new [`P2PStream`] from the provided stream. New [`P2PStream`]s are expected to have
    /// completed the `p2p` handshake.
    pub fn new(
        inner: S,
        p2p_version: ProtocolVersion,
        shared_capabilities: SharedCapabilities,
    ) -> Self {
        Self {
            inner,
            p2p_version,
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
            pinger: Pinger::new(PING_INTERVAL, PING_TIMEOUT),
            shared_capabilities,
            outgoing_messages: VecDeque::new(),
            added_capabilities: Vec::new(),
            disconnecting: false,
        }
    }

    /// Returns the negotiated p2p version.
    pub const fn p2p_version(&self) -> ProtocolVersion {
        self.p2p_version
    }

    /// Returns `true` if frames on this stream are snappy compressed, which
    /// is the case from p2p version 5 on.
    pub const fn is_compressed(&self) -> bool {
        self.p2p_version.is_compressed()
    }

    /// Returns the shared capabilities negotiated during the handshake.
    pub const fn shared_capabilities(&self) -> &SharedCapabilities {
        &self.shared_capabilities
    }

    /// Returns `true` if the connection is about to disconnect.
    pub const fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    /// Drains the capabilities the remote announced after the handshake.
    pub fn take_added_capabilities(&mut self) -> Vec<Capability> {
        std::mem::take(&mut self.added_capabilities)
    }

    /// Queues an add-capability control frame announcing the given capability
    /// to the remote.
    pub fn queue_add_capability(&mut self, cap: &Capability) {
        let mut payload = BytesMut::new();
        cap.encode(&mut payload);
        let frame = self.encode_control_frame(P2PMessageID::AddCapability as u8, &payload);
        self.outgoing_messages.push_back(frame);
    }

    /// Queues in a message to be sent to the remote, with the given relative
    /// subprotocol message id.
    fn send_control(&mut self, id: P2PMessageID, payload: &[u8]) {
        let frame = self.encode_control_frame(id as u8, payload);
        self.outgoing_messages.push_back(frame);
    }

    /// Assembles a full frame for the given p2p message id and uncompressed
    /// rlp payload, compressing the payload if the negotiated version calls
    /// for it.
    fn encode_control_frame(&mut self, id: u8, payload: &[u8]) -> Bytes {
        let mut frame = BytesMut::with_capacity(payload.len() + 1);
        frame.put_u8(id);
        if self.p2p_version.is_compressed() {
            let mut compressed = vec![0u8; 1 + snap::raw::max_compress_len(payload.len())];
            let compressed_size = self
                .encoder
                .compress(payload, &mut compressed)
                .expect("output buffer sized with max_compress_len");
            frame.extend_from_slice(&compressed[..compressed_size]);
        } else {
            frame.extend_from_slice(payload);
        }
        frame.freeze()
    }

    /// Starts to gracefully disconnect the connection by sending a disconnect message.
    ///
    /// This only queues the disconnect message; the stream resolves once it
    /// was flushed to the underlying transport.
    pub fn start_disconnect(&mut self, reason: DisconnectReason) -> Result<(), P2PStreamError> {
        if self.disconnecting {
            return Err(P2PStreamError::Disconnecting)
        }

        let mut payload = BytesMut::new();
        reason.encode(&mut payload);
        self.send_control(P2PMessageID::Disconnect, &payload);
        self.disconnecting = true;
        Ok(())
    }
}

impl<S> P2PStream<S>
where
    S: Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Unpin,
{
    /// Disconnects the connection by sending a disconnect message.
    ///
    /// This flushes the disconnect message and closes the underlying transport.
    pub async fn disconnect(mut self, reason: DisconnectReason) -> Result<(), P2PStreamError> {
        if !self.disconnecting {
            self.start_disconnect(reason)?;
        }
        self.close().await
    }
}

// S must also be `Sink` because we need to be able to respond with ping messages to follow the
// protocol
impl<S> Stream for P2PStream<S>
where
    S: Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Unpin,
{
    type Item = Result<BytesMut, P2PStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.disconnecting {
            // if the disconnect message was queued we only flush the remaining messages
            return Poll::Ready(None)
        }

        // poll the pinger to determine if we should send a ping
        match this.pinger.poll_ping(cx) {
            Poll::Ready(Ok(PingerEvent::Ping)) => {
                this.send_control(P2PMessageID::Ping, &[EMPTY_STRING_CODE]);
            }
            Poll::Ready(Ok(PingerEvent::Timeout)) => {
                // the peer has not responded to our pings, disconnect
                debug!("ping timed out, disconnecting peer");
                let _ = this.start_disconnect(DisconnectReason::PingTimeout);
                return Poll::Ready(Some(Err(P2PStreamError::PingTimeout)))
            }
            Poll::Ready(Err(_)) | Poll::Pending => {}
        }

        // flush any queued control frames without blocking incoming messages
        while !this.outgoing_messages.is_empty() {
            match Pin::new(&mut this.inner).poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if let Some(message) = this.outgoing_messages.pop_front() {
                        if let Err(err) = Pin::new(&mut this.inner).start_send(message) {
                            return Poll::Ready(Some(Err(err.into())))
                        }
                    }
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Some(Err(err.into()))),
                Poll::Pending => break,
            }
        }
        let _ = Pin::new(&mut this.inner).poll_flush(cx);

        // we should loop here to ensure we don't return Poll::Pending if we have a message to
        // return behind any pings we need to respond to
        while let Poll::Ready(res) = this.inner.poll_next_unpin(cx) {
            let bytes = match res {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => return Poll::Ready(Some(Err(err.into()))),
                None => return Poll::Ready(None),
            };

            if bytes.is_empty() {
                return Poll::Ready(Some(Err(P2PStreamError::EmptyProtocolMessage)))
            }

            let id = bytes[0];

            // decompress the payload, the message id itself is never compressed
            let payload = if this.p2p_version.is_compressed() && bytes.len() > 1 {
                let decompressed_len = snap::raw::decompress_len(&bytes[1..])?;
                if decompressed_len > MAX_PAYLOAD_SIZE {
                    return Poll::Ready(Some(Err(P2PStreamError::MessageTooBig {
                        message_size: decompressed_len,
                        max_size: MAX_PAYLOAD_SIZE,
                    })))
                }
                let mut decompressed = BytesMut::zeroed(decompressed_len);
                this.decoder.decompress(&bytes[1..], &mut decompressed)?;
                decompressed
            } else {
                let mut payload = bytes;
                payload.advance(1);
                payload
            };

            if id == P2PMessageID::Ping as u8 {
                trace!("received ping, sending pong");
                this.send_control(P2PMessageID::Pong, &[EMPTY_STRING_CODE]);
                // make sure the pong is flushed promptly
                cx.waker().wake_by_ref();
                continue
            } else if id == P2PMessageID::Pong as u8 {
                this.pinger.on_pong();
                continue
            } else if id == P2PMessageID::Disconnect as u8 {
                let reason = DisconnectReason::decode(&mut &payload[..]).inspect_err(|err| {
                    debug!(
                        %err,
                        msg=%alloy_primitives::hex::encode(&payload),
                        "Failed to decode disconnect message from peer"
                    );
                })?;
                return Poll::Ready(Some(Err(P2PStreamError::Disconnected(reason))))
            } else if id == P2PMessageID::Hello as u8 {
                // a hello message outside of the handshake is a protocol violation
                return Poll::Ready(Some(Err(P2PStreamError::HandshakeError(
                    P2PHandshakeError::HelloNotInHandshake,
                ))))
            } else if id == P2PMessageID::AddCapability as u8 {
                match Capability::decode(&mut &payload[..]) {
                    Ok(cap) => {
                        trace!(%cap, "peer announced additional capability");
                        this.added_capabilities.push(cap);
                    }
                    Err(err) => {
                        debug!(%err, "failed to decode add-capability frame");
                    }
                }
                continue
            } else if id <= MAX_RESERVED_MESSAGE_ID {
                return Poll::Ready(Some(Err(P2PStreamError::UnknownReservedMessageId(id))))
            }

            // a subprotocol message, normalize the id to the shared
            // subprotocol space so the next layer does not need to be aware of
            // the reserved p2p ids
            let mut frame = BytesMut::with_capacity(payload.len() + 1);
            frame.put_u8(id - MAX_RESERVED_MESSAGE_ID - 1);
            frame.extend_from_slice(&payload);
            return Poll::Ready(Some(Ok(frame)))
        }

        Poll::Pending
    }
}

impl<S> Sink<Bytes> for P2PStream<S>
where
    S: Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Unpin,
{
    type Error = P2PStreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();

        // poll the pinger so a quiet sink-only user still keeps the
        // connection alive
        match this.pinger.poll_ping(cx) {
            Poll::Ready(Ok(PingerEvent::Ping)) => {
                this.send_control(P2PMessageID::Ping, &[EMPTY_STRING_CODE]);
            }
            Poll::Ready(Ok(PingerEvent::Timeout)) => {
                return Poll::Ready(Err(P2PStreamError::PingTimeout))
            }
            Poll::Ready(Err(_)) | Poll::Pending => {}
        }

        // drain queued control frames first, they have priority over
        // subprotocol messages
        while !this.outgoing_messages.is_empty() {
            ready!(Pin::new(&mut this.inner).poll_ready(cx))?;
            if let Some(message) = this.outgoing_messages.pop_front() {
                Pin::new(&mut this.inner).start_send(message)?;
            }
        }

        Pin::new(&mut this.inner).poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let this = self.get_mut();

        if this.disconnecting {
            return Err(P2PStreamError::Disconnecting)
        }

        if item.is_empty() {
            return Err(P2PStreamError::EmptyProtocolMessage)
        }

        if item.len() > MAX_PAYLOAD_SIZE {
            return Err(P2PStreamError::MessageTooBig {
                message_size: item.len(),
                max_size: MAX_PAYLOAD_SIZE,
            })
        }

        // the first byte is the relative subprotocol message id, the rest the
        // uncompressed payload
        let frame = this
            .encode_control_frame(item[0] + MAX_RESERVED_MESSAGE_ID + 1, &item[1..]);

        Pin::new(&mut this.inner).start_send(frame).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();

        // flush queued control frames before flushing the transport
        while !this.outgoing_messages.is_empty() {
            ready!(Pin::new(&mut this.inner).poll_ready(cx))?;
            if let Some(message) = this.outgoing_messages.pop_front() {
                Pin::new(&mut this.inner).start_send(message)?;
            }
        }

        Pin::new(&mut this.inner).poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_close(cx).map_err(Into::into)
    }
}

/// This represents only the reserved `p2p` subprotocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2PMessage {
    /// The first packet sent over the connection, and sent once by both sides.
    Hello(HelloMessage),

    /// Inform the peer that a disconnection is imminent; if received, a peer should disconnect
    /// immediately.
    Disconnect(DisconnectReason),

    /// Requests an immediate reply of [`P2PMessage::Pong`] from the peer.
    Ping,

    /// Reply to the peer's [`P2PMessage::Ping`] packet.
    Pong,

    /// Announces a capability that became available after the handshake, so
    /// a long-lived session can start using it without reconnecting.
    AddCapability(Capability),
}

impl P2PMessage {
    /// Gets the [`P2PMessageID`] for the given message.
    pub const fn message_id(&self) -> P2PMessageID {
        match self {
            Self::Hello(_) => P2PMessageID::Hello,
            Self::Disconnect(_) => P2PMessageID::Disconnect,
            Self::Ping => P2PMessageID::Ping,
            Self::Pong => P2PMessageID::Pong,
            Self::AddCapability(_) => P2PMessageID::AddCapability,
        }
    }
}

/// The [`Encodable`] implementation prepends the raw message id byte to the
/// RLP-encoded payload.
impl Encodable for P2PMessage {
    fn encode(&self, out: &mut dyn BufMut) {
        out.put_u8(self.message_id() as u8);
        match self {
            Self::Hello(msg) => msg.encode(out),
            Self::Disconnect(msg) => msg.encode(out),
            Self::Ping | Self::Pong => {
                // Ping and Pong payloads are an empty string
                out.put_u8(EMPTY_STRING_CODE);
            }
            Self::AddCapability(cap) => cap.encode(out),
        }
    }

    fn length(&self) -> usize {
        let payload_len = match self {
            Self::Hello(msg) => msg.length(),
            Self::Disconnect(msg) => msg.length(),
            Self::Ping | Self::Pong => 1,
            Self::AddCapability(cap) => cap.length(),
        };
        payload_len + 1 // (1 for length of p2p message id)
    }
}

impl Decodable for P2PMessage {
    /// The [`Decodable`] implementation for [`P2PMessage`] assumes that each of the message
    /// variants are RLP-encoded.
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        /// Advances over the empty-string payload of a Ping/Pong message.
        fn advance_ping_pong_payload(buf: &mut &[u8]) -> alloy_rlp::Result<()> {
            if buf.is_empty() {
                return Err(alloy_rlp::Error::InputTooShort)
            }
            if buf[0] != EMPTY_STRING_CODE {
                return Err(alloy_rlp::Error::Custom("expected empty ping/pong payload"))
            }
            buf.advance(1);
            Ok(())
        }

        // the message id is a raw byte
        let message_id = *buf.first().ok_or(alloy_rlp::Error::InputTooShort)?;
        let id = P2PMessageID::try_from(message_id)
            .or(Err(alloy_rlp::Error::Custom("unknown p2p message id")))?;
        buf.advance(1);
        match id {
            P2PMessageID::Hello => Ok(Self::Hello(HelloMessage::decode(buf)?)),
            P2PMessageID::Disconnect => Ok(Self::Disconnect(DisconnectReason::decode(buf)?)),
            P2PMessageID::Ping => {
                advance_ping_pong_payload(buf)?;
                Ok(Self::Ping)
            }
            P2PMessageID::Pong => {
                advance_ping_pong_payload(buf)?;
                Ok(Self::Pong)
            }
            P2PMessageID::AddCapability => Ok(Self::AddCapability(Capability::decode(buf)?)),
        }
    }
}

/// Message IDs for `p2p` subprotocol messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum P2PMessageID {
    /// Message ID for the [`P2PMessage::Hello`] message.
    Hello = 0x00,

    /// Message ID for the [`P2PMessage::Disconnect`] message.
    Disconnect = 0x01,

    /// Message ID for the [`P2PMessage::Ping`] message.
    Ping = 0x02,

    /// Message ID for the [`P2PMessage::Pong`] message.
    Pong = 0x03,

    /// Message ID for the [`P2PMessage::AddCapability`] message.
    AddCapability = 0x07,
}

impl TryFrom<u8> for P2PMessageID {
    type Error = P2PStreamError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0x00 => Ok(Self::Hello),
            0x01 => Ok(Self::Disconnect),
            0x02 => Ok(Self::Ping),
            0x03 => Ok(Self::Pong),
            0x07 => Ok(Self::AddCapability),
            _ => Err(P2PStreamError::UnknownReservedMessageId(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capability::Protocol, hello::pk2id, DisconnectReason, EthVersion,
        HelloMessageWithProtocols,
    };
    use secp256k1::{SecretKey, SECP256K1};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    /// Returns a testing `HelloMessageWithProtocols`.
    fn test_hello() -> HelloMessageWithProtocols {
        let key = SecretKey::new(&mut rand::thread_rng());
        HelloMessageWithProtocols::builder(pk2id(&key.public_key(SECP256K1)))
            .protocol(Protocol::eth(EthVersion::Eth66))
            .build()
    }

    #[tokio::test]
    async fn handshake_succeeds_with_shared_caps() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (incoming, _) = listener.accept().await.unwrap();
            let stream = Framed::new(incoming, LengthDelimitedCodec::new());
            let (p2p_stream, _their_hello) =
                UnauthedP2PStream::new(stream).handshake(test_hello()).await.unwrap();
            assert!(p2p_stream.shared_capabilities().eth_version().is_ok());
        });

        let outgoing = TcpStream::connect(local_addr).await.unwrap();
        let sink = Framed::new(outgoing, LengthDelimitedCodec::new());
        let (p2p_stream, _) = UnauthedP2PStream::new(sink).handshake(test_hello()).await.unwrap();

        assert_eq!(p2p_stream.shared_capabilities().eth_version().unwrap(), EthVersion::Eth66);
        assert!(p2p_stream.is_compressed());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_fails_on_no_shared_caps() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let key = SecretKey::new(&mut rand::thread_rng());
        let server_hello = HelloMessageWithProtocols::builder(pk2id(&key.public_key(SECP256K1)))
            .protocol(Protocol::eth(EthVersion::Eth65))
            .build();

        let server = tokio::spawn(async move {
            let (incoming, _) = listener.accept().await.unwrap();
            let stream = Framed::new(incoming, LengthDelimitedCodec::new());
            let err = UnauthedP2PStream::new(stream).handshake(server_hello).await.unwrap_err();
            assert!(matches!(
                err,
                P2PStreamError::HandshakeError(P2PHandshakeError::NoSharedCapabilities)
            ));
        });

        let outgoing = TcpStream::connect(local_addr).await.unwrap();
        let sink = Framed::new(outgoing, LengthDelimitedCodec::new());
        // client only speaks eth/66, server only eth/65
        let result = UnauthedP2PStream::new(sink).handshake(test_hello()).await;
        assert!(result.is_err());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_propagated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let expected_disconnect = DisconnectReason::UselessPeer;

        let server = tokio::spawn(async move {
            let (incoming, _) = listener.accept().await.unwrap();
            let stream = Framed::new(incoming, LengthDelimitedCodec::new());
            let (p2p_stream, _) =
                UnauthedP2PStream::new(stream).handshake(test_hello()).await.unwrap();
            p2p_stream.disconnect(expected_disconnect).await.unwrap();
        });

        let outgoing = TcpStream::connect(local_addr).await.unwrap();
        let sink = Framed::new(outgoing, LengthDelimitedCodec::new());
        let (mut p2p_stream, _) =
            UnauthedP2PStream::new(sink).handshake(test_hello()).await.unwrap();

        let err = p2p_stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.as_disconnected(), Some(expected_disconnect));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn add_capability_frames_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (incoming, _) = listener.accept().await.unwrap();
            let stream = Framed::new(incoming, LengthDelimitedCodec::new());
            let (mut p2p_stream, _) =
                UnauthedP2PStream::new(stream).handshake(test_hello()).await.unwrap();
            p2p_stream.queue_add_capability(&Capability::snap());
            // a flush drains the queued control frame
            futures::SinkExt::<Bytes>::flush(&mut p2p_stream).await.unwrap();
            // keep the connection alive until the client read the frame
            let _ = tokio::time::timeout(Duration::from_secs(1), p2p_stream.next()).await;
        });

        let outgoing = TcpStream::connect(local_addr).await.unwrap();
        let sink = Framed::new(outgoing, LengthDelimitedCodec::new());
        let (mut p2p_stream, _) =
            UnauthedP2PStream::new(sink).handshake(test_hello()).await.unwrap();

        // drive the stream until the control frame was processed
        let _ = tokio::time::timeout(Duration::from_millis(500), p2p_stream.next()).await;
        assert_eq!(p2p_stream.take_added_capabilities(), vec![Capability::snap()]);

        server.await.unwrap();
    }

    #[test]
    fn ping_pong_round_trip() {
        for message in [P2PMessage::Ping, P2PMessage::Pong] {
            let mut encoded = Vec::new();
            message.encode(&mut encoded);
            assert_eq!(encoded.len(), message.length());
            assert_eq!(P2PMessage::decode(&mut &encoded[..]).unwrap(), message);
        }
    }

    #[test]
    fn hello_message_round_trip() {
        let message = P2PMessage::Hello(test_hello().message());
        let mut encoded = Vec::new();
        message.encode(&mut encoded);
        assert_eq!(encoded.len(), message.length());
        assert_eq!(P2PMessage::decode(&mut &encoded[..]).unwrap(), message);
    }
}
