//! Session handles.

use crate::{
    error::{PendingSessionHandshakeError, SessionError},
    message::{PeerMessage, PeerRequest},
    protocol::SatelliteFrame,
    session::{state::SessionStateTracker, Direction, EthRlpxConnection, SessionId},
};
use quartz_eth_wire::{
    Capabilities, Capability, DisconnectReason, EthMessage, EthVersion, PeerId, ProtocolVersion,
    StatusMessage,
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::{mpsc, oneshot};

/// A handler attached to a peer session that's not authenticated yet, pending Handshake and hello
/// message which exchanges the `capabilities` of the peer.
///
/// This session needs to wait until it is authenticated.
#[derive(Debug)]
pub struct PendingSessionHandle {
    /// Can be used to tell the session to disconnect the connection/abort the handshake process.
    pub(crate) disconnect_tx: Option<oneshot::Sender<()>>,
    /// The direction of the session
    pub(crate) direction: Direction,
}

// === impl PendingSessionHandle ===

impl PendingSessionHandle {
    /// Sends a disconnect command to the pending session.
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.disconnect_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Returns the direction of the pending session (inbound or outbound).
    pub const fn direction(&self) -> Direction {
        self.direction
    }
}

/// An established session with a remote peer.
#[derive(Debug)]
pub struct ActiveSessionHandle {
    /// The direction of the session
    pub(crate) direction: Direction,
    /// The assigned id for this session
    pub(crate) session_id: SessionId,
    /// The negotiated eth version.
    pub(crate) version: EthVersion,
    /// The negotiated p2p version.
    pub(crate) p2p_version: ProtocolVersion,
    /// The identifier of the remote peer
    pub(crate) remote_id: PeerId,
    /// The timestamp when the session has been established.
    pub(crate) established: Instant,
    /// Announced capabilities of the peer.
    pub(crate) capabilities: Arc<Capabilities>,
    /// Sender half of the command channel used send commands _to_ the spawned session
    pub(crate) commands_to_session: mpsc::Sender<SessionCommand>,
    /// The client's name and version
    pub(crate) client_version: Arc<str>,
    /// The address we're connected to
    pub(crate) remote_addr: SocketAddr,
    /// The status message the peer sent during the `eth` handshake
    pub(crate) status: Arc<StatusMessage>,
    /// The lifecycle state of the session.
    pub(crate) state: SessionStateTracker,
    /// The reason of a locally requested disconnect, if one was requested.
    pub(crate) requested_disconnect: Option<DisconnectReason>,
}

// === impl ActiveSessionHandle ===

impl ActiveSessionHandle {
    /// Sends a disconnect command to the session.
    pub fn disconnect(&self, reason: Option<DisconnectReason>) {
        // Note: we clone the sender which ensures the channel has capacity to send the message
        let _ = self.commands_to_session.clone().try_send(SessionCommand::Disconnect { reason });
    }

    /// Sends a message into the session, to be delivered to the peer.
    pub fn send_message(&self, message: EthMessage) {
        let _ = self.commands_to_session.clone().try_send(SessionCommand::Message(message));
    }

    /// Sends a request into the session, correlated with its response.
    pub fn send_request(&self, request: PeerRequest) {
        let _ = self.commands_to_session.clone().try_send(SessionCommand::Request(request));
    }

    /// Returns a sender half of the session command channel, e.g. for wiring
    /// the session into the transaction gossip manager.
    pub fn command_sender(&self) -> mpsc::Sender<SessionCommand> {
        self.commands_to_session.clone()
    }

    /// Returns the direction of the active session (inbound or outbound).
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the assigned session id for this session.
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns the negotiated eth version for this session.
    pub const fn version(&self) -> EthVersion {
        self.version
    }

    /// Returns the negotiated p2p version for this session.
    pub const fn p2p_version(&self) -> ProtocolVersion {
        self.p2p_version
    }

    /// Returns the identifier of the remote peer.
    pub const fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    /// Returns the timestamp when the session has been established.
    pub const fn established(&self) -> Instant {
        self.established
    }

    /// Returns the announced capabilities of the peer.
    pub fn capabilities(&self) -> Arc<Capabilities> {
        self.capabilities.clone()
    }

    /// Returns the client's name and version.
    pub fn client_version(&self) -> Arc<str> {
        self.client_version.clone()
    }

    /// Returns the address we're connected to.
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns the status message the peer sent during the handshake.
    pub fn status(&self) -> Arc<StatusMessage> {
        self.status.clone()
    }

    /// Returns the lifecycle state of the session.
    pub const fn state(&self) -> SessionStateTracker {
        self.state
    }
}

/// Events a pending session can produce.
pub enum PendingSessionEvent {
    /// Represents a successful `Hello` and `Status` exchange.
    Established {
        /// An internal identifier for the established session
        session_id: SessionId,
        /// The remote node's socket address
        remote_addr: SocketAddr,
        /// The remote node's public key
        peer_id: PeerId,
        /// All capabilities the peer announced
        capabilities: Arc<Capabilities>,
        /// The status message the peer sent for the `eth` handshake
        status: Box<StatusMessage>,
        /// The actual connection stream
        conn: Box<EthRlpxConnection>,
        /// The direction of the session, either `Inbound` or `Outgoing`
        direction: Direction,
        /// The remote node's user agent, usually containing the client name and version
        client_id: String,
        /// The negotiated p2p version.
        p2p_version: ProtocolVersion,
        /// The tcp listen port the peer announced in its hello, zero if the
        /// peer is not listening.
        listen_port: u16,
    },
    /// Handshake unsuccessful, session was disconnected.
    Disconnected {
        /// The remote node's socket address
        remote_addr: SocketAddr,
        /// The internal identifier for the disconnected session
        session_id: SessionId,
        /// The direction of the session, either `Inbound` or `Outgoing`
        direction: Direction,
        /// The error that caused the disconnect
        error: Option<PendingSessionHandshakeError>,
    },
}

impl std::fmt::Debug for PendingSessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Established { session_id, remote_addr, peer_id, direction, client_id, .. } => f
                .debug_struct("Established")
                .field("session_id", session_id)
                .field("remote_addr", remote_addr)
                .field("peer_id", peer_id)
                .field("direction", direction)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Self::Disconnected { remote_addr, session_id, direction, error } => f
                .debug_struct("Disconnected")
                .field("remote_addr", remote_addr)
                .field("session_id", session_id)
                .field("direction", direction)
                .field("error", error)
                .finish(),
        }
    }
}

/// Commands that can be sent to the spawned session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Disconnect the connection
    Disconnect {
        /// Why the disconnect was initiated
        reason: Option<DisconnectReason>,
    },
    /// Sends a message to the peer
    Message(EthMessage),
    /// Sends a correlated request to the peer.
    Request(PeerRequest),
    /// Sends a frame of the named satellite protocol to the peer.
    Satellite {
        /// The protocol code the frame belongs to.
        protocol: String,
        /// The frame to send.
        frame: SatelliteFrame,
    },
    /// Announces a dynamically added capability to the peer.
    AddCapability(Capability),
}

/// Message variants an active session can produce and send back to the
/// [`SessionManager`](crate::session::SessionManager)
#[derive(Debug)]
pub enum ActiveSessionMessage {
    /// Session was gracefully disconnected.
    Disconnected {
        /// The remote node's public key
        peer_id: PeerId,
        /// The remote node's socket address
        remote_addr: SocketAddr,
    },
    /// Session was closed due to an error
    ClosedOnConnectionError {
        /// The remote node's public key
        peer_id: PeerId,
        /// The remote node's socket address
        remote_addr: SocketAddr,
        /// The error that caused the session to close
        error: SessionError,
    },
    /// A session received a valid message via RLPx.
    ValidMessage {
        /// Identifier of the remote peer.
        peer_id: PeerId,
        /// Message received from the peer.
        message: PeerMessage,
    },
    /// Received a bad message from the peer.
    BadMessage {
        /// Identifier of the remote peer.
        peer_id: PeerId,
    },
    /// Remote peer is considered in protocol violation
    ProtocolBreach {
        /// Identifier of the remote peer.
        peer_id: PeerId,
    },
}
