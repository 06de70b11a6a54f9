//! Types for the `eth` state messages, removed from the protocol in `eth/67`.

use alloy_primitives::{Bytes, B256};
use alloy_rlp::{RlpDecodableWrapper, RlpEncodableWrapper};

/// A request for state tree nodes corresponding to the given hashes.
///
/// Introduced in `eth/63`.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct GetNodeData(
    /// The node hashes to request the state tree nodes for.
    pub Vec<B256>,
);

impl From<Vec<B256>> for GetNodeData {
    fn from(hashes: Vec<B256>) -> Self {
        Self(hashes)
    }
}

/// The response to [`GetNodeData`], containing the state tree nodes or contract bytecode
/// corresponding to the requested hashes.
///
/// Not all nodes are guaranteed to be returned by the peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct NodeData(
    /// The requested state tree nodes or bytecode.
    pub Vec<Bytes>,
);

impl From<Vec<Bytes>> for NodeData {
    fn from(nodes: Vec<Bytes>) -> Self {
        Self(nodes)
    }
}
