//! Peer session management and chain synchronization networking.
//!
//! This crate owns the live peer sessions of the node: the devp2p handshakes,
//! the `eth` request/response correlation with backpressure-bounded message
//! workers, the `snap/1` state-sync client and server, per-peer quality
//! statistics with a reconnection throttle, and the open registry for
//! satellite RLPx protocols.
//!
//! ## Feature overview
//!
//! - [`SessionManager`](session::SessionManager): owns pending and active
//!   sessions and surfaces [`SessionEvent`](session::SessionEvent)s.
//! - [`EthRequestHandler`](eth_requests::EthRequestHandler): serves incoming
//!   `eth` data requests from the chain.
//! - [`SnapProtocolFactory`](snap::SnapProtocolFactory): the `snap/1`
//!   client/server with its adaptive byte budget.
//! - [`NodeStats`](stats::NodeStats): rolling transfer-speed averages and
//!   reconnect delays per peer.
//! - [`TransactionsManager`](transactions::TransactionsManager): transaction
//!   gossip policy.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod error;
pub mod eth_requests;
pub mod message;
mod metrics;
pub mod protocol;
pub mod session;
pub mod snap;
pub mod stats;
pub mod traits;
pub mod transactions;

pub use error::{NetworkError, PendingSessionHandshakeError, SessionError};
pub use message::{PeerMessage, PeerRequest, RequestError, RequestResult};
pub use protocol::{
    DuplicateProtocolError, ProtocolFactory, ProtocolRegistry, SessionProtocolHandler,
};
pub use session::{
    BoxRlpxTransport, Direction, SessionEvent, SessionId, SessionManager, SessionsConfig,
};
pub use stats::{NodeStats, PeerStats, TransferSpeedType};

#[cfg(test)]
use rand as _;
#[cfg(test)]
use secp256k1 as _;
