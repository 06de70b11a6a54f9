//! Types for the `eth` block-data messages.

use alloy_consensus::Header;
use alloy_eips::BlockHashOrNumber;
use alloy_primitives::B256;
use alloy_rlp::{RlpDecodable, RlpDecodableWrapper, RlpEncodable, RlpEncodableWrapper};

use crate::types::transactions::TransactionSigned;

/// A block body, as carried by the `BlockBodies` response.
pub type BlockBody = alloy_consensus::BlockBody<TransactionSigned>;

/// A request for a peer to return block headers starting at the requested block.
///
/// The peer must return at most `limit` headers. If `reverse` is `false`, the
/// numbers of the returned headers rise, otherwise they fall. `skip` headers
/// are omitted between each returned header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, RlpEncodable, RlpDecodable)]
pub struct GetBlockHeaders {
    /// The block number or hash that the peer should start returning headers from.
    pub start_block: BlockHashOrNumber,

    /// The maximum number of headers to return.
    pub limit: u64,

    /// The number of blocks that the node should skip while traversing and returning headers.
    pub skip: u32,

    /// Whether the headers should be returned in falling block-number order.
    pub reverse: bool,
}

/// The response to [`GetBlockHeaders`], containing headers if any headers were found.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct BlockHeaders(
    /// The requested headers.
    pub Vec<Header>,
);

impl From<Vec<Header>> for BlockHeaders {
    fn from(headers: Vec<Header>) -> Self {
        Self(headers)
    }
}

/// A request for a peer to return block bodies for the given block hashes.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct GetBlockBodies(
    /// The block hashes to request bodies for.
    pub Vec<B256>,
);

impl From<Vec<B256>> for GetBlockBodies {
    fn from(hashes: Vec<B256>) -> Self {
        Self(hashes)
    }
}

/// The response to [`GetBlockBodies`], containing the block bodies that the peer knows about.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct BlockBodies(
    /// The requested block bodies, each of which should correspond to a hash in the request.
    pub Vec<BlockBody>,
);

impl From<Vec<BlockBody>> for BlockBodies {
    fn from(bodies: Vec<BlockBody>) -> Self {
        Self(bodies)
    }
}

/// The direction of a headers request depending on the `reverse` field.
///
/// See also <https://github.com/ethereum/devp2p/blob/master/caps/eth.md#getblockheaders-0x03>
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeadersDirection {
    /// Rising block numbers.
    Rising,
    /// Falling block numbers.
    Falling,
}

impl HeadersDirection {
    /// Derives the direction from the request's `reverse` flag.
    pub const fn new(reverse: bool) -> Self {
        if reverse {
            Self::Falling
        } else {
            Self::Rising
        }
    }

    /// Returns whether this direction is falling.
    pub const fn is_falling(&self) -> bool {
        matches!(self, Self::Falling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;
    use alloy_rlp::{Decodable, Encodable};

    #[test]
    fn get_block_headers_round_trip() {
        for request in [
            GetBlockHeaders {
                start_block: BlockHashOrNumber::Number(100),
                limit: 5,
                skip: 0,
                reverse: false,
            },
            GetBlockHeaders {
                start_block: BlockHashOrNumber::Hash(b256!(
                    "00000000000000000000000000000000000000000000000000000000deadc0de"
                )),
                limit: 1024,
                skip: 3,
                reverse: true,
            },
        ] {
            let mut encoded = Vec::new();
            request.encode(&mut encoded);
            assert_eq!(encoded.len(), request.length());
            assert_eq!(GetBlockHeaders::decode(&mut &encoded[..]).unwrap(), request);
        }
    }

    #[test]
    fn block_headers_round_trip() {
        let headers = BlockHeaders(vec![Header::default(), Header::default()]);
        let mut encoded = Vec::new();
        headers.encode(&mut encoded);
        assert_eq!(BlockHeaders::decode(&mut &encoded[..]).unwrap(), headers);
    }

    #[test]
    fn empty_block_bodies_round_trip() {
        let bodies = BlockBodies::default();
        let mut encoded = Vec::new();
        bodies.encode(&mut encoded);
        assert_eq!(BlockBodies::decode(&mut &encoded[..]).unwrap(), bodies);
    }
}
