//! Capability messaging
//!
//! An RLPx stream is multiplexed via the prepended message-id of a framed message.
//! Capabilities are exchanged via the RLPx `Hello` message as pairs of `(id, version)`.

use crate::stats::TransferSpeedType;
use alloy_primitives::{B256, U256};
use quartz_eth_wire::{
    BlockBodies, BlockHeaders, EthMessage, EthMessageID, GetBlockBodies, GetBlockHeaders,
    GetNodeData, GetPooledTransactions, GetReceipts, NewBlock, NewBlockHashes,
    NewPooledTransactionHashes, NodeData, PooledTransactions, Receipts, RequestPair, Transactions,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Result alias for the result of a request.
pub type RequestResult<T> = Result<T, RequestError>;

/// Error variants that can happen when sending requests to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Closed channel to the session.
    #[error("channel closed")]
    ChannelClosed,
    /// Connection to a peer dropped while handling the request.
    #[error("connection to a peer dropped while handling the request")]
    ConnectionDropped,
    /// Capability message is not supported by the remote peer.
    #[error("capability message is not supported by remote peer")]
    UnsupportedCapability,
    /// Request timed out while awaiting response.
    #[error("request timed out while awaiting response")]
    Timeout,
    /// Received bad response.
    #[error("received bad response")]
    BadResponse,
}

impl<T> From<mpsc::error::SendError<T>> for RequestError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<oneshot::error::RecvError> for RequestError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}

/// Protocol related request messages that expect a response, together with
/// the sender half the response is delivered through.
#[derive(Debug)]
pub enum PeerRequest {
    /// Requests block headers from the peer.
    GetBlockHeaders {
        /// The request for block headers.
        request: GetBlockHeaders,
        /// The channel to send the response for block headers.
        response: oneshot::Sender<RequestResult<BlockHeaders>>,
    },
    /// Requests block bodies from the peer.
    GetBlockBodies {
        /// The request for block bodies.
        request: GetBlockBodies,
        /// The channel to send the response for block bodies.
        response: oneshot::Sender<RequestResult<BlockBodies>>,
    },
    /// Requests pooled transactions from the peer.
    GetPooledTransactions {
        /// The request for pooled transactions.
        request: GetPooledTransactions,
        /// The channel to send the response for pooled transactions.
        response: oneshot::Sender<RequestResult<PooledTransactions>>,
    },
    /// Requests `NodeData` from the peer.
    GetNodeData {
        /// The request for `NodeData`.
        request: GetNodeData,
        /// The channel to send the response for `NodeData`.
        response: oneshot::Sender<RequestResult<NodeData>>,
    },
    /// Requests receipts from the peer.
    GetReceipts {
        /// The request for receipts.
        request: GetReceipts,
        /// The channel to send the response for receipts.
        response: oneshot::Sender<RequestResult<Receipts>>,
    },
}

// === impl PeerRequest ===

impl PeerRequest {
    /// Invoked if we received a response which does not match the request.
    pub fn send_bad_response(self) {
        self.send_err_response(RequestError::BadResponse)
    }

    /// Sends an error back to the receiver.
    pub fn send_err_response(self, err: RequestError) {
        let _ = match self {
            Self::GetBlockHeaders { response, .. } => response.send(Err(err)).ok(),
            Self::GetBlockBodies { response, .. } => response.send(Err(err)).ok(),
            Self::GetPooledTransactions { response, .. } => response.send(Err(err)).ok(),
            Self::GetNodeData { response, .. } => response.send(Err(err)).ok(),
            Self::GetReceipts { response, .. } => response.send(Err(err)).ok(),
        };
    }

    /// Returns the [`EthMessage`] for this type, wrapped with the given
    /// request id.
    pub fn create_request_message(&self, request_id: u64) -> EthMessage {
        match self {
            Self::GetBlockHeaders { request, .. } => {
                EthMessage::GetBlockHeaders(RequestPair::new(request_id, *request))
            }
            Self::GetBlockBodies { request, .. } => {
                EthMessage::GetBlockBodies(RequestPair::new(request_id, request.clone()))
            }
            Self::GetPooledTransactions { request, .. } => {
                EthMessage::GetPooledTransactions(RequestPair::new(request_id, request.clone()))
            }
            Self::GetNodeData { request, .. } => {
                EthMessage::GetNodeData(RequestPair::new(request_id, request.clone()))
            }
            Self::GetReceipts { request, .. } => {
                EthMessage::GetReceipts(RequestPair::new(request_id, request.clone()))
            }
        }
    }

    /// The [`EthMessageID`] of the request message.
    pub const fn message_id(&self) -> EthMessageID {
        match self {
            Self::GetBlockHeaders { .. } => EthMessageID::GetBlockHeaders,
            Self::GetBlockBodies { .. } => EthMessageID::GetBlockBodies,
            Self::GetPooledTransactions { .. } => EthMessageID::GetPooledTransactions,
            Self::GetNodeData { .. } => EthMessageID::GetNodeData,
            Self::GetReceipts { .. } => EthMessageID::GetReceipts,
        }
    }

    /// The transfer-speed bucket that samples for this request kind are
    /// recorded under.
    pub const fn transfer_speed_type(&self) -> TransferSpeedType {
        match self {
            Self::GetBlockHeaders { .. } => TransferSpeedType::Headers,
            Self::GetBlockBodies { .. } => TransferSpeedType::Bodies,
            Self::GetPooledTransactions { .. } => TransferSpeedType::Latency,
            Self::GetNodeData { .. } => TransferSpeedType::NodeData,
            Self::GetReceipts { .. } => TransferSpeedType::Receipts,
        }
    }
}

/// A message from the network that was received from a peer session, to be
/// routed to the gossip consumers.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// Announcement of new block hashes.
    NewBlockHashes(NewBlockHashes),
    /// A new block broadcast, with its precomputed hash.
    NewBlock(NewBlockMessage),
    /// Received transactions from the peer.
    ReceivedTransaction(Transactions),
    /// Announcement of pooled transaction hashes.
    PooledTransactionHashes(NewPooledTransactionHashes),
}

/// Internal form of a `NewBlock` message, with the hash computed once.
#[derive(Debug, Clone)]
pub struct NewBlockMessage {
    /// The block hash.
    pub hash: B256,
    /// The block payload and announced total difficulty.
    pub block: Arc<NewBlock>,
}

impl NewBlockMessage {
    /// Returns the announced total difficulty.
    pub fn total_difficulty(&self) -> U256 {
        self.block.td
    }
}
