//! Possible errors when interacting with the network.

use quartz_eth_wire::{
    errors::{EthHandshakeError, EthStreamError},
    DisconnectReason,
};
use quartz_ethereum_forks::ValidationError;

/// All error variants for the network.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// General IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A redial was attempted while the reconnection throttle still holds the
    /// peer back.
    #[error("connection to the peer is currently delayed")]
    DelayedPeer,
    /// A session to the peer already exists.
    #[error("already connected to the peer")]
    AlreadyConnected,
}

/// Errors that can occur during the authentication of a pending session.
#[derive(Debug, thiserror::Error)]
pub enum PendingSessionHandshakeError {
    /// The `p2p` or `eth` handshake failed.
    #[error(transparent)]
    Eth(#[from] EthStreamError),
    /// An outgoing connection reached a node other than the one dialed.
    #[error("expected peer {expected}, connected to {got}")]
    UnexpectedIdentity {
        /// The identity the remote announced.
        got: quartz_eth_wire::PeerId,
        /// The identity that was dialed.
        expected: quartz_eth_wire::PeerId,
    },
    /// The handshake did not complete in time.
    #[error("session authentication timed out")]
    Timeout,
}

impl PendingSessionHandshakeError {
    /// Returns the fork-id validation error, if the handshake failed on fork
    /// divergence.
    pub const fn as_chain_mismatch(&self) -> Option<&ValidationError> {
        match self {
            Self::Eth(EthStreamError::EthHandshakeError(EthHandshakeError::InvalidFork(err))) => {
                Some(err)
            }
            _ => None,
        }
    }

    /// The disconnect reason to send for this handshake failure.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::Eth(EthStreamError::EthHandshakeError(EthHandshakeError::InvalidFork(_))) => {
                DisconnectReason::UselessPeer
            }
            Self::Eth(EthStreamError::EthHandshakeError(_)) => DisconnectReason::ProtocolBreach,
            _ => DisconnectReason::Other,
        }
    }
}

/// Errors that terminate an active session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Error of the underlying connection.
    #[error(transparent)]
    Stream(#[from] EthStreamError),
    /// The bounded queue towards the message workers is full; the peer sends
    /// faster than the node processes.
    #[error("incoming message queue is full")]
    IncomingQueueFull,
    /// A subprotocol handler failed while handling a message.
    #[error("subprotocol {protocol} failed to handle a message: {message}")]
    ProtocolHandler {
        /// The protocol code of the failing handler.
        protocol: String,
        /// The handler error message.
        message: String,
    },
    /// The peer did not respond to a request within the protocol-breach
    /// window.
    #[error("peer exceeded the protocol breach request timeout")]
    ProtocolBreach,
}

impl SessionError {
    /// The disconnect reason sent to the peer when the session closes on this
    /// error.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::Stream(err) => {
                if err.as_disconnected().is_some() {
                    // the remote disconnected first, nothing to send
                    DisconnectReason::DisconnectRequested
                } else {
                    DisconnectReason::ProtocolBreach
                }
            }
            Self::IncomingQueueFull | Self::ProtocolHandler { .. } => DisconnectReason::Other,
            Self::ProtocolBreach => DisconnectReason::ProtocolBreach,
        }
    }
}
