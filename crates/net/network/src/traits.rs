//! Interfaces to the collaborators the networking core depends on.
//!
//! The networking core never touches storage, the transaction pool or the
//! discovery table directly; everything goes through the narrow traits in
//! this module so node assembly can wire in whatever backs them.

use alloy_consensus::{Header, ReceiptWithBloom};
use alloy_eips::BlockHashOrNumber;
use alloy_primitives::{Bytes, B256, U256};
use quartz_eth_wire::{
    AccountRangeMessage, Block, ByteCodesMessage, GetAccountRangeMessage, GetByteCodesMessage,
    GetStorageRangesMessage, GetTrieNodesMessage, PeerId, StorageRangesMessage,
    TransactionSigned, TrieNodesMessage,
};
use std::net::IpAddr;

/// The record of a known network node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    /// The node's public key.
    pub id: PeerId,
    /// The host the node is reachable at.
    pub address: IpAddr,
    /// The tcp port the node listens on.
    pub tcp_port: u16,
}

impl NodeRecord {
    /// Creates a new record.
    pub const fn new(id: PeerId, address: IpAddr, tcp_port: u16) -> Self {
        Self { id, address, tcp_port }
    }
}

/// Client trait for fetching headers for the eth request server.
pub trait HeaderReader: Send + Sync {
    /// Returns the hash of the block with the given number, if known.
    fn block_hash(&self, number: u64) -> Option<B256>;

    /// Returns the header identified by hash or number, if known.
    fn header_by_hash_or_number(&self, id: BlockHashOrNumber) -> Option<Header>;
}

/// Client trait for fetching block data for the eth request server.
pub trait BlockReader: HeaderReader {
    /// Returns the full block with the given hash, if known.
    fn block_by_hash(&self, hash: B256) -> Option<Block>;

    /// Returns the receipts of the block with the given hash, if known.
    fn receipts_by_block_hash(&self, hash: B256) -> Option<Vec<ReceiptWithBloom>>;

    /// Returns the state trie node or contract bytecode with the given hash,
    /// if known.
    fn trie_node(&self, hash: B256) -> Option<Bytes>;
}

/// Server side of the `snap/1` protocol: fulfills range requests against the
/// state snapshot. The protocol handler only frames messages; trie traversal
/// lives behind this trait.
pub trait SnapServer: Send + Sync {
    /// Serves an account range request.
    fn account_range(&self, request: &GetAccountRangeMessage) -> AccountRangeMessage;

    /// Serves a storage ranges request.
    fn storage_ranges(&self, request: &GetStorageRangesMessage) -> StorageRangesMessage;

    /// Serves a bytecode request.
    fn byte_codes(&self, request: &GetByteCodesMessage) -> ByteCodesMessage;

    /// Serves a trie nodes request.
    fn trie_nodes(&self, request: &GetTrieNodesMessage) -> TrieNodesMessage;
}

/// Access to the transaction pool for gossip ingestion.
pub trait TxPool: Send + Sync {
    /// Imports transactions received from the given peer.
    fn on_transactions(&self, peer_id: PeerId, transactions: Vec<TransactionSigned>);

    /// Returns the pooled transactions for the given hashes, for serving
    /// `GetPooledTransactions`.
    fn pooled_transactions(&self, hashes: &[B256]) -> Vec<TransactionSigned>;
}

/// Registry of peers usable by the sync pipeline.
pub trait SyncPeerPool: Send + Sync {
    /// Registers a new sync peer with its advertised best block and total
    /// difficulty.
    fn add_peer(&self, peer_id: PeerId, best_hash: B256, total_difficulty: U256);

    /// Removes a sync peer, e.g. because the session closed.
    fn remove_peer(&self, peer_id: PeerId);
}

/// Hook into the discovery subsystem.
pub trait Discovery: Send + Sync {
    /// Offers a node record to the discovery table, e.g. after learning a
    /// peer's advertised listen port.
    fn add_node(&self, record: NodeRecord);
}

/// Storage for node records so a restarted node can redial known-good peers.
pub trait NetworkStorage: Send + Sync {
    /// Persists the record together with its current reputation.
    fn persist(&self, record: NodeRecord, reputation: i64);
}

/// No-op implementations used in tests and for optional collaborators.
pub mod noop {
    use super::*;

    /// A [`TxPool`] that discards everything.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoopTxPool;

    impl TxPool for NoopTxPool {
        fn on_transactions(&self, _peer_id: PeerId, _transactions: Vec<TransactionSigned>) {}

        fn pooled_transactions(&self, _hashes: &[B256]) -> Vec<TransactionSigned> {
            Vec::new()
        }
    }

    /// A [`SyncPeerPool`] that ignores all peers.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoopSyncPeerPool;

    impl SyncPeerPool for NoopSyncPeerPool {
        fn add_peer(&self, _peer_id: PeerId, _best_hash: B256, _total_difficulty: U256) {}

        fn remove_peer(&self, _peer_id: PeerId) {}
    }

    /// A [`Discovery`] sink that drops all records.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoopDiscovery;

    impl Discovery for NoopDiscovery {
        fn add_node(&self, _record: NodeRecord) {}
    }

    /// A [`SnapServer`] that serves empty responses.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoopSnapServer;

    impl SnapServer for NoopSnapServer {
        fn account_range(&self, request: &GetAccountRangeMessage) -> AccountRangeMessage {
            AccountRangeMessage { request_id: request.request_id, ..Default::default() }
        }

        fn storage_ranges(&self, request: &GetStorageRangesMessage) -> StorageRangesMessage {
            StorageRangesMessage { request_id: request.request_id, ..Default::default() }
        }

        fn byte_codes(&self, request: &GetByteCodesMessage) -> ByteCodesMessage {
            ByteCodesMessage { request_id: request.request_id, ..Default::default() }
        }

        fn trie_nodes(&self, request: &GetTrieNodesMessage) -> TrieNodesMessage {
            TrieNodesMessage { request_id: request.request_id, ..Default::default() }
        }
    }
}
