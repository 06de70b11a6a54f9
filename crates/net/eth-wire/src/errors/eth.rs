//! Error handling for the [`EthStream`](crate::EthStream).

use crate::{
    errors::P2PStreamError, DisconnectReason, EthMessageID, EthVersion, ParseVersionError,
};
use alloy_chains::Chain;
use alloy_primitives::B256;
use quartz_ethereum_forks::ValidationError;
use std::io;

/// Errors when sending/receiving eth messages.
#[derive(Debug, thiserror::Error)]
pub enum EthStreamError {
    /// Error of the underlying `p2p` stream.
    #[error(transparent)]
    P2PStreamError(#[from] P2PStreamError),

    /// Failed to parse an eth protocol version.
    #[error(transparent)]
    ParseVersionError(#[from] ParseVersionError),

    /// Error during the `eth` status handshake.
    #[error(transparent)]
    EthHandshakeError(#[from] EthHandshakeError),

    /// A message was invalid for the negotiated version, or failed to decode.
    #[error(transparent)]
    InvalidMessage(#[from] EthMessageError),

    /// Message size exceeds the 10MB limit imposed on decoded eth messages.
    #[error("message size ({0}) exceeds max length (10MB)")]
    MessageTooBig(usize),
}

// === impl EthStreamError ===

impl EthStreamError {
    /// Returns the [`DisconnectReason`] if the error is a disconnect message.
    pub const fn as_disconnected(&self) -> Option<DisconnectReason> {
        if let Self::P2PStreamError(err) = self {
            err.as_disconnected()
        } else {
            None
        }
    }

    /// Returns the [`io::Error`] if it was caused by IO.
    pub const fn as_io(&self) -> Option<&io::Error> {
        if let Self::P2PStreamError(P2PStreamError::Io(io)) = self {
            return Some(io)
        }
        None
    }
}

impl From<io::Error> for EthStreamError {
    fn from(err: io::Error) -> Self {
        P2PStreamError::from(err).into()
    }
}

impl From<alloy_rlp::Error> for EthStreamError {
    fn from(err: alloy_rlp::Error) -> Self {
        EthMessageError::from(err).into()
    }
}

/// Error that can occur when decoding an [`EthMessage`](crate::EthMessage)
/// from the wire.
#[derive(Debug, thiserror::Error)]
pub enum EthMessageError {
    /// Message id is not known at all.
    #[error("unknown eth message id: {0}")]
    UnknownMessageId(u8),

    /// Message id is known but not part of the negotiated version.
    #[error("message id {1:?} is invalid for version {0}")]
    InvalidMessageForVersion(EthVersion, EthMessageID),

    /// RLP decoding of the payload failed.
    #[error(transparent)]
    Rlp(#[from] alloy_rlp::Error),
}

/// Error that can occur during the `eth` sub-protocol handshake.
#[derive(Debug, thiserror::Error)]
pub enum EthHandshakeError {
    /// A status message was received or sent outside of the handshake.
    #[error("status message can only be recv/sent in handshake")]
    StatusNotInHandshake,

    /// Receiving a non-status message during the handshake phase.
    #[error("received non-status message when trying to handshake")]
    NonStatusMessageInHandshake,

    /// No response received during the handshake.
    #[error("no response received when sending out handshake")]
    NoResponse,

    /// The handshake timed out.
    #[error("handshake timed out")]
    Timeout,

    /// The remote's fork id failed validation against our fork filter.
    #[error(transparent)]
    InvalidFork(#[from] ValidationError),

    /// The genesis hash in the status message did not match ours.
    #[error("mismatched genesis in status message: got {got}, expected {expected}")]
    MismatchedGenesis {
        /// The genesis the remote announced.
        got: B256,
        /// Our genesis hash.
        expected: B256,
    },

    /// The eth protocol version in the status message did not match the
    /// negotiated one.
    #[error("mismatched protocol version in status message: got {got}, expected {expected}")]
    MismatchedProtocolVersion {
        /// The version carried in the status message.
        got: u8,
        /// The negotiated version.
        expected: u8,
    },

    /// The chain in the status message did not match ours.
    #[error("mismatched chain in status message: got {got}, expected {expected}")]
    MismatchedChain {
        /// The chain the remote announced.
        got: Chain,
        /// Our chain.
        expected: Chain,
    },

    /// The total difficulty in the status message is unreasonably large.
    #[error("total difficulty bitlen is too large: got {got}, maximum {maximum}")]
    TotalDifficultyBitLenTooLarge {
        /// The actual bit length of the total difficulty.
        got: usize,
        /// The maximum allowed bit length.
        maximum: usize,
    },
}
