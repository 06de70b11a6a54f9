//! Types for the `eth` receipt messages.

use alloy_consensus::ReceiptWithBloom;
use alloy_primitives::B256;
use alloy_rlp::{RlpDecodableWrapper, RlpEncodableWrapper};

/// A request for transaction receipts from the given block hashes.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct GetReceipts(
    /// The block hashes to request receipts for.
    pub Vec<B256>,
);

impl From<Vec<B256>> for GetReceipts {
    fn from(hashes: Vec<B256>) -> Self {
        Self(hashes)
    }
}

/// The response to [`GetReceipts`], containing receipt lists that correspond to each block
/// requested.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct Receipts(
    /// Each receipt hash should correspond to a block hash in the request.
    pub Vec<Vec<ReceiptWithBloom>>,
);

impl From<Vec<Vec<ReceiptWithBloom>>> for Receipts {
    fn from(receipts: Vec<Vec<ReceiptWithBloom>>) -> Self {
        Self(receipts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_consensus::{Receipt, ReceiptWithBloom};
    use alloy_primitives::{Bloom, Log};
    use alloy_rlp::{Decodable, Encodable};

    #[test]
    fn receipts_round_trip() {
        let receipt = ReceiptWithBloom {
            receipt: Receipt::<Log> {
                status: true.into(),
                cumulative_gas_used: 21_000,
                logs: vec![],
            },
            logs_bloom: Bloom::default(),
        };
        let receipts = Receipts(vec![vec![receipt]]);

        let mut encoded = Vec::new();
        receipts.encode(&mut encoded);
        let decoded = Receipts::decode(&mut &encoded[..]).unwrap();
        assert_eq!(receipts, decoded);
    }
}
