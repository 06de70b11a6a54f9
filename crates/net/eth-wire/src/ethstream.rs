//! The `eth` protocol stream: status handshake and framing of `eth` messages
//! over a negotiated `p2p` connection.
//!
//! The stream yields raw frames: the message id is decoded eagerly so the
//! session can route and prioritize, but payload decoding is deferred to the
//! caller. A slow decode must never stall the socket.

use crate::{
    errors::{EthHandshakeError, EthStreamError},
    types::{EthMessage, EthMessageID, Status, StatusMessage, MAX_MESSAGE_SIZE},
    EthVersion,
};
use alloy_primitives::bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, StreamExt};
use pin_project::pin_project;
use quartz_ethereum_forks::ForkFilter;
use std::{
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};
use tokio_stream::Stream;
use tracing::{debug, trace};

/// [`HANDSHAKE_TIMEOUT`] determines the amount of time to wait before determining that an `eth`
/// handshake (status exchange) has timed out.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The maximum number of bits allowed for the total difficulty in a status
/// message. Value chosen to fit the interim total difficulty of mainnet with
/// headroom.
const MAX_TD_BITLEN: usize = 100;

/// A raw frame read from an [`EthStream`], with the payload still rlp encoded.
#[derive(Debug)]
pub enum EthStreamFrame {
    /// A message of the `eth` protocol. Payload decoding is deferred to the
    /// caller, see [`EthMessage::decode_payload`].
    Eth {
        /// The eth message id.
        id: EthMessageID,
        /// The rlp encoded payload.
        payload: BytesMut,
    },
    /// A frame of another negotiated subprotocol, e.g. `snap/1`. The id is
    /// relative to the start of the shared subprotocol space.
    Satellite {
        /// The message id, relative to the shared subprotocol space.
        relative_id: u8,
        /// The rlp encoded payload.
        payload: BytesMut,
    },
}

/// An `EthStream` before the status handshake was executed.
#[pin_project]
#[derive(Debug)]
pub struct UnauthedEthStream<S> {
    #[pin]
    inner: S,
    /// Message-id offset of the `eth` space relative to the shared
    /// subprotocol space. Zero when `eth` is the only or first negotiated
    /// subprotocol.
    offset: u8,
}

impl<S> UnauthedEthStream<S> {
    /// Create a new `UnauthedEthStream` from a type `S` which implements `Stream` and `Sink`.
    pub const fn new(inner: S) -> Self {
        Self { inner, offset: 0 }
    }

    /// Create a new `UnauthedEthStream` with the given relative message-id
    /// offset for the `eth` space.
    pub const fn new_with_offset(inner: S, offset: u8) -> Self {
        Self { inner, offset }
    }

    /// Consumes the type and returns the wrapped stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, E> UnauthedEthStream<S>
where
    S: Stream<Item = Result<BytesMut, E>> + Sink<Bytes, Error = E> + Unpin,
    EthStreamError: From<E>,
{
    /// Consumes the [`UnauthedEthStream`] and returns an [`EthStream`] after the `Status`
    /// handshake is completed successfully. This also returns the `Status` message sent by the
    /// remote peer.
    pub async fn handshake(
        self,
        status: Status,
        fork_filter: ForkFilter,
    ) -> Result<(EthStream<S>, StatusMessage), EthStreamError> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake_without_timeout(status, fork_filter))
            .await
            .map_err(|_| EthStreamError::EthHandshakeError(EthHandshakeError::Timeout))?
    }

    /// Wrapper around the handshake without a timeout.
    async fn handshake_without_timeout(
        mut self,
        status: Status,
        fork_filter: ForkFilter,
    ) -> Result<(EthStream<S>, StatusMessage), EthStreamError> {
        let version = status.version;
        trace!(%status, "sending eth status to peer");

        let our_status = status.message_for_version(version);
        let mut our_status_bytes = BytesMut::new();
        our_status_bytes.put_u8(self.offset + EthMessageID::Status.to_u8());
        EthMessage::Status(our_status).encode_payload(version, &mut our_status_bytes);
        self.inner.send(our_status_bytes.freeze()).await?;

        let mut their_msg_res = self.inner.next().await;

        let mut their_msg = match their_msg_res.take() {
            Some(msg) => msg,
            None => {
                return Err(EthStreamError::EthHandshakeError(EthHandshakeError::NoResponse))
            }
        }?;

        if their_msg.len() > MAX_MESSAGE_SIZE {
            return Err(EthStreamError::MessageTooBig(their_msg.len()))
        }

        if their_msg.is_empty() || their_msg[0] != self.offset + EthMessageID::Status.to_u8() {
            debug!("expected status message id in eth handshake");
            return Err(EthStreamError::EthHandshakeError(
                EthHandshakeError::NonStatusMessageInHandshake,
            ))
        }
        their_msg.advance(1);

        let their_status = match EthMessage::decode_payload(
            EthMessageID::Status,
            version,
            &mut their_msg.as_ref(),
        ) {
            Ok(EthMessage::Status(status)) => status,
            Ok(_) => unreachable!("decode_payload with the status id yields a status"),
            Err(err) => {
                debug!(%err, "decoding status message failed");
                return Err(err.into())
            }
        };

        trace!(status=%their_status.version(), "validating incoming eth status from peer");

        if status.genesis != their_status.genesis() {
            return Err(EthHandshakeError::MismatchedGenesis {
                got: their_status.genesis(),
                expected: status.genesis,
            }
            .into())
        }

        if version as u8 != their_status.version() as u8 {
            return Err(EthHandshakeError::MismatchedProtocolVersion {
                got: their_status.version() as u8,
                expected: version as u8,
            }
            .into())
        }

        if status.chain != their_status.chain() {
            return Err(EthHandshakeError::MismatchedChain {
                got: their_status.chain(),
                expected: status.chain,
            }
            .into())
        }

        if their_status.total_difficulty().bit_len() > MAX_TD_BITLEN {
            return Err(EthHandshakeError::TotalDifficultyBitLenTooLarge {
                got: their_status.total_difficulty().bit_len(),
                maximum: MAX_TD_BITLEN,
            }
            .into())
        }

        // fork validation only applies from `eth/64` on
        if let Some(forkid) = their_status.forkid() {
            fork_filter.validate(forkid).map_err(EthHandshakeError::InvalidFork)?;
        }

        // now we can create the `EthStream` because the handshake was successful
        let stream = EthStream::new_with_offset(version, self.offset, self.inner);

        Ok((stream, their_status))
    }
}

/// An `EthStream` wraps over any `Stream` that yields bytes and makes it
/// compatible with eth-networking protocol messages.
#[pin_project]
#[derive(Debug)]
pub struct EthStream<S> {
    /// Negotiated eth version.
    version: EthVersion,
    /// Message-id offset of the `eth` space relative to the shared
    /// subprotocol space.
    offset: u8,
    #[pin]
    inner: S,
}

impl<S> EthStream<S> {
    /// Creates a new unauthed [`EthStream`] from a provided stream. You will need
    /// to manually handshake a peer.
    pub const fn new(version: EthVersion, inner: S) -> Self {
        Self { version, offset: 0, inner }
    }

    /// Creates a new [`EthStream`] with the given relative message-id offset.
    pub const fn new_with_offset(version: EthVersion, offset: u8, inner: S) -> Self {
        Self { version, offset, inner }
    }

    /// Returns the eth version.
    pub const fn version(&self) -> EthVersion {
        self.version
    }

    /// Returns the underlying stream.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns mutable access to the underlying stream.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this type and returns the wrapped stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, E> EthStream<S>
where
    S: Sink<Bytes, Error = E> + Unpin,
    EthStreamError: From<E>,
{
    /// Sends a raw frame of another subprotocol, with the given id relative
    /// to the shared subprotocol space.
    ///
    /// The caller is responsible for ensuring the sink is ready.
    pub fn start_send_satellite(
        &mut self,
        relative_id: u8,
        payload: &[u8],
    ) -> Result<(), EthStreamError> {
        let mut bytes = BytesMut::with_capacity(payload.len() + 1);
        bytes.put_u8(relative_id);
        bytes.extend_from_slice(payload);
        self.inner.start_send_unpin(bytes.freeze()).map_err(Into::into)
    }
}

impl<S, E> Stream for EthStream<S>
where
    S: Stream<Item = Result<BytesMut, E>> + Unpin,
    EthStreamError: From<E>,
{
    type Item = Result<EthStreamFrame, EthStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let res = ready!(this.inner.poll_next(cx));

        let mut bytes = match res {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => return Poll::Ready(Some(Err(err.into()))),
            None => return Poll::Ready(None),
        };

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Poll::Ready(Some(Err(EthStreamError::MessageTooBig(bytes.len()))))
        }

        if bytes.is_empty() {
            return Poll::Ready(Some(Err(alloy_rlp::Error::InputTooShort.into())))
        }

        let relative_id = bytes[0];
        bytes.advance(1);

        let eth_space = *this.offset..(*this.offset + this.version.total_messages());
        if !eth_space.contains(&relative_id) {
            // a frame that belongs to another negotiated subprotocol
            return Poll::Ready(Some(Ok(EthStreamFrame::Satellite { relative_id, payload: bytes })))
        }

        let id = match EthMessageID::try_from(relative_id - *this.offset) {
            Ok(id) => id,
            Err(err) => return Poll::Ready(Some(Err(err.into()))),
        };

        if id == EthMessageID::Status {
            return Poll::Ready(Some(Err(EthStreamError::EthHandshakeError(
                EthHandshakeError::StatusNotInHandshake,
            ))))
        }

        if !id.is_valid_for_version(*this.version) {
            return Poll::Ready(Some(Err(crate::errors::EthMessageError::InvalidMessageForVersion(
                *this.version,
                id,
            )
            .into())))
        }

        Poll::Ready(Some(Ok(EthStreamFrame::Eth { id, payload: bytes })))
    }
}

impl<S, E> Sink<EthMessage> for EthStream<S>
where
    S: Sink<Bytes, Error = E> + Unpin,
    EthStreamError: From<E>,
{
    type Error = EthStreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: Pin<&mut Self>, item: EthMessage) -> Result<(), Self::Error> {
        if matches!(item, EthMessage::Status(_)) {
            // status messages can only be sent in the status handshake
            return Err(EthHandshakeError::StatusNotInHandshake.into())
        }

        let id = item.message_id();
        if !id.is_valid_for_version(self.version) {
            return Err(
                crate::errors::EthMessageError::InvalidMessageForVersion(self.version, id).into()
            )
        }

        let this = self.project();
        let mut bytes = BytesMut::with_capacity(item.payload_length(*this.version) + 1);
        bytes.put_u8(*this.offset + id.to_u8());
        item.encode_payload(*this.version, &mut bytes);

        this.inner.start_send(bytes.freeze())?;
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capability::Protocol,
        hello::pk2id,
        types::{GetBlockHeaders, RequestPair},
        HelloMessageWithProtocols, UnauthedP2PStream,
    };
    use alloy_eips::BlockHashOrNumber;
    use alloy_primitives::{B256, U256};
    use futures::SinkExt;
    use quartz_ethereum_forks::{ForkFilter, Head};
    use secp256k1::{SecretKey, SECP256K1};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    fn test_status_and_filter() -> (Status, ForkFilter) {
        let genesis = B256::with_last_byte(0xaa);
        let fork_filter = ForkFilter::new(Head::default(), genesis, 0, Vec::new());
        let status = Status::builder()
            .version(EthVersion::Eth66)
            .genesis(genesis)
            .total_difficulty(U256::from(100))
            .forkid(fork_filter.current())
            .build();
        (status, fork_filter)
    }

    #[tokio::test]
    async fn status_handshake_passes() {
        let (status, fork_filter) = test_status_and_filter();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let (server_status, server_filter) = (status, fork_filter.clone());
        let server = tokio::spawn(async move {
            let (incoming, _) = listener.accept().await.unwrap();
            let stream = Framed::new(incoming, LengthDelimitedCodec::new());
            let (_, their_status) = UnauthedEthStream::new(stream)
                .handshake(server_status, server_filter)
                .await
                .unwrap();
            assert_eq!(their_status.version(), EthVersion::Eth66);
        });

        let outgoing = TcpStream::connect(local_addr).await.unwrap();
        let sink = Framed::new(outgoing, LengthDelimitedCodec::new());
        let (_, their_status) =
            UnauthedEthStream::new(sink).handshake(status, fork_filter).await.unwrap();

        assert_eq!(their_status.genesis(), status.genesis);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn status_handshake_mismatched_genesis() {
        let (status, fork_filter) = test_status_and_filter();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let (mut server_status, server_filter) = (status, fork_filter.clone());
        server_status.genesis = B256::with_last_byte(0xbb);
        let server = tokio::spawn(async move {
            let (incoming, _) = listener.accept().await.unwrap();
            let stream = Framed::new(incoming, LengthDelimitedCodec::new());
            let _ = UnauthedEthStream::new(stream).handshake(server_status, server_filter).await;
        });

        let outgoing = TcpStream::connect(local_addr).await.unwrap();
        let sink = Framed::new(outgoing, LengthDelimitedCodec::new());
        let err = UnauthedEthStream::new(sink).handshake(status, fork_filter).await.unwrap_err();
        assert!(matches!(
            err,
            EthStreamError::EthHandshakeError(EthHandshakeError::MismatchedGenesis { .. })
        ));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn message_frames_round_trip_over_p2p_stream() {
        let (status, fork_filter) = test_status_and_filter();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let test_hello = |key: &SecretKey| {
            HelloMessageWithProtocols::builder(pk2id(&key.public_key(SECP256K1)))
                .protocol(Protocol::eth(EthVersion::Eth66))
                .build()
        };

        let request = EthMessage::GetBlockHeaders(RequestPair::new(
            1,
            GetBlockHeaders {
                start_block: BlockHashOrNumber::Number(100),
                limit: 5,
                skip: 0,
                reverse: false,
            },
        ));

        let (server_status, server_filter) = (status, fork_filter.clone());
        let expected = request.clone();
        let server = tokio::spawn(async move {
            let key = SecretKey::new(&mut rand::thread_rng());
            let (incoming, _) = listener.accept().await.unwrap();
            let stream = Framed::new(incoming, LengthDelimitedCodec::new());
            let (p2p_stream, _) =
                UnauthedP2PStream::new(stream).handshake(test_hello(&key)).await.unwrap();
            let (mut eth_stream, _) = UnauthedEthStream::new(p2p_stream)
                .handshake(server_status, server_filter)
                .await
                .unwrap();

            let frame = eth_stream.next().await.unwrap().unwrap();
            match frame {
                EthStreamFrame::Eth { id, payload } => {
                    assert_eq!(id, EthMessageID::GetBlockHeaders);
                    let decoded =
                        EthMessage::decode_payload(id, EthVersion::Eth66, &mut payload.as_ref())
                            .unwrap();
                    assert_eq!(decoded, expected);
                }
                EthStreamFrame::Satellite { .. } => panic!("expected an eth frame"),
            }
        });

        let key = SecretKey::new(&mut rand::thread_rng());
        let outgoing = TcpStream::connect(local_addr).await.unwrap();
        let sink = Framed::new(outgoing, LengthDelimitedCodec::new());
        let (p2p_stream, _) =
            UnauthedP2PStream::new(sink).handshake(test_hello(&key)).await.unwrap();
        let (mut eth_stream, _) =
            UnauthedEthStream::new(p2p_stream).handshake(status, fork_filter).await.unwrap();

        eth_stream.send(request).await.unwrap();

        server.await.unwrap();
    }
}
