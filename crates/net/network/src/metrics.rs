use metrics::Counter;
use metrics_derive::Metrics;
use quartz_eth_wire::{DisconnectReason, EthMessageID};

/// Metrics for the entire network, handled by the session manager.
#[derive(Metrics)]
#[metrics(scope = "network")]
pub struct NetworkMetrics {
    /// Cumulative number of failures of pending sessions
    pub(crate) pending_session_failures: Counter,

    /// Total number of sessions closed
    pub(crate) closed_sessions: Counter,

    /// Total number of incoming connections handled
    pub(crate) total_incoming_connections: Counter,

    /// Total number of outgoing connections established
    pub(crate) total_outgoing_connections: Counter,

    /// Number of dial attempts rejected by the reconnection throttle
    pub(crate) throttled_dials: Counter,
}

/// Metrics for a single active session.
#[derive(Metrics)]
#[metrics(scope = "network")]
pub struct SessionMetrics {
    /// Number of messages that could not be queued because the heavy message
    /// queue was full
    pub(crate) incoming_queue_full: Counter,
}

/// Metrics for disconnection types.
///
/// These are just counters, and ideally we would implement these metrics on a peer-by-peer basis,
/// in that we do not double-count peers for `TooManyPeers` if we make an outgoing connection and
/// get disconnected twice
#[derive(Metrics)]
#[metrics(scope = "network")]
pub struct DisconnectMetrics {
    /// Number of peer disconnects due to DisconnectRequested (0x00)
    pub(crate) disconnect_requested: Counter,

    /// Number of peer disconnects due to TcpSubsystemError (0x01)
    pub(crate) tcp_subsystem_error: Counter,

    /// Number of peer disconnects due to ProtocolBreach (0x02)
    pub(crate) protocol_breach: Counter,

    /// Number of peer disconnects due to UselessPeer (0x03)
    pub(crate) useless_peer: Counter,

    /// Number of peer disconnects due to TooManyPeers (0x04)
    pub(crate) too_many_peers: Counter,

    /// Number of peer disconnects due to AlreadyConnected (0x05)
    pub(crate) already_connected: Counter,

    /// Number of peer disconnects due to IncompatibleP2PProtocolVersion (0x06)
    pub(crate) incompatible: Counter,

    /// Number of peer disconnects due to NullNodeIdentity (0x07)
    pub(crate) null_node_identity: Counter,

    /// Number of peer disconnects due to ClientQuitting (0x08)
    pub(crate) client_quitting: Counter,

    /// Number of peer disconnects due to UnexpectedHandshakeIdentity (0x09)
    pub(crate) unexpected_identity: Counter,

    /// Number of peer disconnects due to ConnectedToSelf (0x0a)
    pub(crate) connected_to_self: Counter,

    /// Number of peer disconnects due to PingTimeout (0x0b)
    pub(crate) ping_timeout: Counter,

    /// Number of peer disconnects due to Other (0x10)
    pub(crate) other: Counter,
}

impl DisconnectMetrics {
    /// Increments the proper counter for the given disconnect reason
    pub(crate) fn increment(&self, reason: DisconnectReason) {
        match reason {
            DisconnectReason::DisconnectRequested => self.disconnect_requested.increment(1),
            DisconnectReason::TcpSubsystemError => self.tcp_subsystem_error.increment(1),
            DisconnectReason::ProtocolBreach => self.protocol_breach.increment(1),
            DisconnectReason::UselessPeer => self.useless_peer.increment(1),
            DisconnectReason::TooManyPeers => self.too_many_peers.increment(1),
            DisconnectReason::AlreadyConnected => self.already_connected.increment(1),
            DisconnectReason::IncompatibleP2PProtocolVersion => self.incompatible.increment(1),
            DisconnectReason::NullNodeIdentity => self.null_node_identity.increment(1),
            DisconnectReason::ClientQuitting => self.client_quitting.increment(1),
            DisconnectReason::UnexpectedHandshakeIdentity => self.unexpected_identity.increment(1),
            DisconnectReason::ConnectedToSelf => self.connected_to_self.increment(1),
            DisconnectReason::PingTimeout => self.ping_timeout.increment(1),
            DisconnectReason::Other => self.other.increment(1),
        }
    }
}

/// One counter per eth request/response kind received over the wire.
#[derive(Metrics)]
#[metrics(scope = "network")]
pub struct MessageMetrics {
    /// Number of GetBlockHeaders requests received
    pub(crate) get_block_headers_received: Counter,
    /// Number of BlockHeaders responses received
    pub(crate) block_headers_received: Counter,
    /// Number of GetBlockBodies requests received
    pub(crate) get_block_bodies_received: Counter,
    /// Number of BlockBodies responses received
    pub(crate) block_bodies_received: Counter,
    /// Number of GetPooledTransactions requests received
    pub(crate) get_pooled_transactions_received: Counter,
    /// Number of PooledTransactions responses received
    pub(crate) pooled_transactions_received: Counter,
    /// Number of GetNodeData requests received
    pub(crate) get_node_data_received: Counter,
    /// Number of NodeData responses received
    pub(crate) node_data_received: Counter,
    /// Number of GetReceipts requests received
    pub(crate) get_receipts_received: Counter,
    /// Number of Receipts responses received
    pub(crate) receipts_received: Counter,
}

impl MessageMetrics {
    /// Increments the counter for the given received message kind.
    pub(crate) fn record_received(&self, id: EthMessageID) {
        match id {
            EthMessageID::GetBlockHeaders => self.get_block_headers_received.increment(1),
            EthMessageID::BlockHeaders => self.block_headers_received.increment(1),
            EthMessageID::GetBlockBodies => self.get_block_bodies_received.increment(1),
            EthMessageID::BlockBodies => self.block_bodies_received.increment(1),
            EthMessageID::GetPooledTransactions => {
                self.get_pooled_transactions_received.increment(1)
            }
            EthMessageID::PooledTransactions => self.pooled_transactions_received.increment(1),
            EthMessageID::GetNodeData => self.get_node_data_received.increment(1),
            EthMessageID::NodeData => self.node_data_received.increment(1),
            EthMessageID::GetReceipts => self.get_receipts_received.increment(1),
            EthMessageID::Receipts => self.receipts_received.increment(1),
            _ => {}
        }
    }
}
