//! Error handling for [`P2PStream`](crate::P2PStream).

use crate::{capability::SharedCapabilityError, DisconnectReason, ProtocolVersion};
use std::io;

/// Errors when sending/receiving `p2p` messages. These should result in a
/// disconnection from the peer.
#[derive(Debug, thiserror::Error)]
pub enum P2PStreamError {
    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// An RLP de/encoding error.
    #[error(transparent)]
    Rlp(#[from] alloy_rlp::Error),

    /// Failed to compress or decompress a snappy payload.
    #[error(transparent)]
    Snap(#[from] snap::Error),

    /// Error during the `p2p` handshake.
    #[error(transparent)]
    HandshakeError(#[from] P2PHandshakeError),

    /// Message size exceeds the maximum frame size.
    #[error("message size ({message_size}) exceeds max length ({max_size})")]
    MessageTooBig {
        /// The size of the message that was received.
        message_size: usize,
        /// The maximum allowed size.
        max_size: usize,
    },

    /// Received a message with an unknown reserved `p2p` message id.
    #[error("unknown reserved p2p message id: {0}")]
    UnknownReservedMessageId(u8),

    /// A message was received with an empty payload.
    #[error("empty protocol message received")]
    EmptyProtocolMessage,

    /// The peer did not respond to a ping in time.
    #[error("ping timed out")]
    PingTimeout,

    /// Failed to negotiate a shared capability.
    #[error(transparent)]
    CapabilityError(#[from] SharedCapabilityError),

    /// The message id does not belong to any negotiated capability.
    #[error("capability not supported on the stream to this peer")]
    CapabilityNotShared,

    /// The remote sent a disconnect message.
    #[error("disconnected by peer: {0}")]
    Disconnected(DisconnectReason),

    /// An operation was attempted on a stream that is already disconnecting.
    #[error("started disconnect process")]
    Disconnecting,

    /// The remote's disconnect reason could not be decoded.
    #[error("unknown disconnect reason: {0}")]
    UnknownDisconnectReason(u8),
}

// === impl P2PStreamError ===

impl P2PStreamError {
    /// Returns the [`DisconnectReason`] if it is the `Disconnected` variant.
    pub const fn as_disconnected(&self) -> Option<DisconnectReason> {
        let reason = match self {
            Self::HandshakeError(P2PHandshakeError::Disconnected(reason)) => reason,
            Self::Disconnected(reason) => reason,
            _ => return None,
        };

        Some(*reason)
    }
}

/// Errors that can occur during the `p2p` handshake.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum P2PHandshakeError {
    /// The remote's `p2p` protocol version is not supported.
    #[error("hello message can only be recv/sent in handshake")]
    HelloNotInHandshake,

    /// Received a message other than `Hello` during the handshake.
    #[error("received non-hello message when trying to handshake")]
    NonHelloMessageInHandshake,

    /// No capabilities are shared with the remote.
    #[error("no capabilities shared with peer")]
    NoSharedCapabilities,

    /// No response received within the handshake timeout.
    #[error("no response received when sending out handshake")]
    NoResponse,

    /// The handshake timed out.
    #[error("handshake timed out")]
    Timeout,

    /// The remote disconnected during the handshake.
    #[error("disconnected by peer: {0}")]
    Disconnected(DisconnectReason),

    /// Failed to decode a handshake message.
    #[error("error decoding a message during handshake: {0}")]
    DecodeError(#[from] alloy_rlp::Error),

    /// The negotiated `p2p` versions are incompatible.
    #[error("mismatched p2p protocol version: got {got}, expected {expected}")]
    MismatchedProtocolVersion {
        /// The version the remote advertised.
        got: ProtocolVersion,
        /// The lowest version we accept.
        expected: ProtocolVersion,
    },
}
