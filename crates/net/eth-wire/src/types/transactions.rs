//! Types for the `eth` transaction messages.

use alloy_primitives::B256;
use alloy_rlp::{RlpDecodableWrapper, RlpEncodableWrapper};

/// A signed transaction as it is gossiped and served over the wire.
pub type TransactionSigned = alloy_consensus::TxEnvelope;

/// A list of transactions, as broadcast in a `Transactions` message.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct Transactions(
    /// New transactions for the peer to include in its mempool.
    pub Vec<TransactionSigned>,
);

impl From<Vec<TransactionSigned>> for Transactions {
    fn from(txs: Vec<TransactionSigned>) -> Self {
        Self(txs)
    }
}

/// A request for transactions from the peer's transaction pool, by hash.
///
/// Introduced in `eth/65`.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct GetPooledTransactions(
    /// The transaction hashes to request transaction bodies for.
    pub Vec<B256>,
);

impl From<Vec<B256>> for GetPooledTransactions {
    fn from(hashes: Vec<B256>) -> Self {
        Self(hashes)
    }
}

/// The response to [`GetPooledTransactions`], containing the requested
/// transactions that are present in the pool.
///
/// Introduced in `eth/65`.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct PooledTransactions(
    /// The transaction bodies, each of which should correspond to a requested hash.
    pub Vec<TransactionSigned>,
);

impl From<Vec<TransactionSigned>> for PooledTransactions {
    fn from(txs: Vec<TransactionSigned>) -> Self {
        Self(txs)
    }
}
