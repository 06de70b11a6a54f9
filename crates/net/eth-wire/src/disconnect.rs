//! RLPx disconnect reasons as defined in
//! <https://github.com/ethereum/devp2p/blob/master/rlpx.md#disconnect-0x01>

use alloy_rlp::{Decodable, Encodable, Error as RlpError, Header};
use bytes::BufMut;
use derive_more::Display;

/// RLPx disconnect reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum DisconnectReason {
    /// Disconnect requested by the local node or remote peer.
    #[display("disconnect requested")]
    DisconnectRequested = 0x00,
    /// TCP related error
    #[display("TCP sub-system error")]
    TcpSubsystemError = 0x01,
    /// Breach of protocol at the transport or p2p level
    #[display("breach of protocol, e.g. a malformed message, bad RLP, ...")]
    ProtocolBreach = 0x02,
    /// Node has no matching protocols.
    #[display("useless peer")]
    UselessPeer = 0x03,
    /// Either the remote or local node has too many peers.
    #[display("too many peers")]
    TooManyPeers = 0x04,
    /// Already connected to the peer.
    #[display("already connected")]
    AlreadyConnected = 0x05,
    /// `p2p` protocol version is incompatible
    #[display("incompatible P2P protocol version")]
    IncompatibleP2PProtocolVersion = 0x06,
    /// Received a null node identity.
    #[display("null node identity received - this is automatically invalid")]
    NullNodeIdentity = 0x07,
    /// Reason when the client is shutting down.
    #[display("client quitting")]
    ClientQuitting = 0x08,
    /// When the received handshake's identity differs from what is expected.
    #[display("unexpected identity in handshake")]
    UnexpectedHandshakeIdentity = 0x09,
    /// The node is connected to itself
    #[display("identity is the same as this node (i.e. connected to itself)")]
    ConnectedToSelf = 0x0a,
    /// Peer or local node did not respond to a ping in time.
    #[display("ping timeout")]
    PingTimeout = 0x0b,
    /// Some other reason specific to a subprotocol.
    #[display("some other reason specific to a subprotocol")]
    Other = 0x10,
}

/// This represents an unknown disconnect reason with the given code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown disconnect reason: {0}")]
pub struct UnknownDisconnectReason(u8);

impl TryFrom<u8> for DisconnectReason {
    // This error type should not be used to crash the node, but rather to log the error and
    // disconnect the peer.
    type Error = UnknownDisconnectReason;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::DisconnectRequested),
            0x01 => Ok(Self::TcpSubsystemError),
            0x02 => Ok(Self::ProtocolBreach),
            0x03 => Ok(Self::UselessPeer),
            0x04 => Ok(Self::TooManyPeers),
            0x05 => Ok(Self::AlreadyConnected),
            0x06 => Ok(Self::IncompatibleP2PProtocolVersion),
            0x07 => Ok(Self::NullNodeIdentity),
            0x08 => Ok(Self::ClientQuitting),
            0x09 => Ok(Self::UnexpectedHandshakeIdentity),
            0x0a => Ok(Self::ConnectedToSelf),
            0x0b => Ok(Self::PingTimeout),
            0x10 => Ok(Self::Other),
            _ => Err(UnknownDisconnectReason(value)),
        }
    }
}

/// The [`DisconnectReason`] is encoded as a single-element RLP list.
impl Encodable for DisconnectReason {
    fn encode(&self, out: &mut dyn BufMut) {
        Header { list: true, payload_length: 1 }.encode(out);
        (*self as u8).encode(out);
    }

    fn length(&self) -> usize {
        // disconnect reasons are encoded as a list of a single byte
        2
    }
}

/// Decodes a [`DisconnectReason`] from either a single-element RLP list or a
/// plain RLP byte, which some clients emit.
impl Decodable for DisconnectReason {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        if buf.is_empty() {
            return Err(RlpError::InputTooShort)
        }

        if buf[0] >= 0xc0 {
            let header = Header::decode(buf)?;
            if !header.list {
                return Err(RlpError::UnexpectedString)
            }
        }

        let reason = u8::decode(buf)?;
        Self::try_from(reason).map_err(|_| RlpError::Custom("unknown disconnect reason"))
    }
}
