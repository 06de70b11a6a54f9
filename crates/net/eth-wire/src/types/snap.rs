//! Implements the `snap/1` message types.
//!
//! The snap protocol runs on top of `RLPx`, facilitating the exchange of
//! Ethereum state snapshots between peers.
//! Reference: [Ethereum Snapshot Protocol](https://github.com/ethereum/devp2p/blob/master/caps/snap.md#protocol-messages)

use alloy_primitives::{Bytes, B256};
use alloy_rlp::{Encodable, RlpDecodable, RlpEncodable};
use bytes::BufMut;

use crate::errors::EthMessageError;

/// Message IDs for the snap sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapMessageId {
    /// Requests an unknown number of accounts from a given account trie.
    GetAccountRange = 0x00,
    /// Response with the number of consecutive accounts and the Merkle proofs for the entire
    /// range.
    AccountRange = 0x01,
    /// Requests the storage slots of multiple accounts' storage tries.
    GetStorageRanges = 0x02,
    /// Response with the number of consecutive storage slots for the requested accounts.
    StorageRanges = 0x03,
    /// Requests a number of contract byte-codes by hash.
    GetByteCodes = 0x04,
    /// Response with the number of requested contract codes.
    ByteCodes = 0x05,
    /// Requests a number of state (either account or storage) Merkle trie nodes by path.
    GetTrieNodes = 0x06,
    /// Response with the number of requested state trie nodes.
    TrieNodes = 0x07,
}

impl TryFrom<u8> for SnapMessageId {
    type Error = EthMessageError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Ok(match id {
            0x00 => Self::GetAccountRange,
            0x01 => Self::AccountRange,
            0x02 => Self::GetStorageRanges,
            0x03 => Self::StorageRanges,
            0x04 => Self::GetByteCodes,
            0x05 => Self::ByteCodes,
            0x06 => Self::GetTrieNodes,
            0x07 => Self::TrieNodes,
            _ => return Err(EthMessageError::UnknownMessageId(id)),
        })
    }
}

/// Request for a range of accounts from the state trie.
// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#getaccountrange-0x00
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetAccountRangeMessage {
    /// Request ID to match up responses with
    pub request_id: u64,
    /// Root hash of the account trie to serve
    pub root_hash: B256,
    /// Account hash of the first to retrieve
    pub starting_hash: B256,
    /// Account hash after which to stop serving data
    pub limit_hash: B256,
    /// Soft limit at which to stop returning data
    pub response_bytes: u64,
}

/// Account data in the response.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct AccountData {
    /// Hash of the account address (trie path)
    pub hash: B256,
    /// Account body in slim format
    pub body: Bytes,
}

/// Response containing a number of consecutive accounts and the Merkle proofs for the entire range.
// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#accountrange-0x01
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct AccountRangeMessage {
    /// ID of the request this is a response for
    pub request_id: u64,
    /// List of consecutive accounts from the trie
    pub accounts: Vec<AccountData>,
    /// List of trie nodes proving the account range
    pub proof: Vec<Bytes>,
}

/// Request for the storage slots of multiple accounts' storage tries.
// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#getstorageranges-0x02
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetStorageRangesMessage {
    /// Request ID to match up responses with
    pub request_id: u64,
    /// Root hash of the account trie to serve
    pub root_hash: B256,
    /// Account hashes of the storage tries to serve
    pub account_hashes: Vec<B256>,
    /// Storage slot hash of the first to retrieve
    pub starting_hash: B256,
    /// Storage slot hash after which to stop serving
    pub limit_hash: B256,
    /// Soft limit at which to stop returning data
    pub response_bytes: u64,
}

/// Storage slot data in the response.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StorageData {
    /// Hash of the storage slot key (trie path)
    pub hash: B256,
    /// Data content of the slot
    pub data: Bytes,
}

/// Response containing a number of consecutive storage slots for the requested accounts,
/// and optionally the merkle proofs for the last range (boundary proofs) if it only partially
/// covers the storage trie.
// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#storageranges-0x03
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StorageRangesMessage {
    /// ID of the request this is a response for
    pub request_id: u64,
    /// List of lists of consecutive slots from the trie (one list per account)
    pub slots: Vec<Vec<StorageData>>,
    /// List of trie nodes proving the slot range (if partial)
    pub proof: Vec<Bytes>,
}

/// Request for a number of contract byte-codes by hash.
// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#getbytecodes-0x04
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetByteCodesMessage {
    /// Request ID to match up responses with
    pub request_id: u64,
    /// Code hashes to retrieve the code for
    pub hashes: Vec<B256>,
    /// Soft limit at which to stop returning data (in bytes)
    pub response_bytes: u64,
}

/// Response containing a number of requested contract codes.
// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#bytecodes-0x05
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ByteCodesMessage {
    /// ID of the request this is a response for
    pub request_id: u64,
    /// The requested bytecodes in order
    pub codes: Vec<Bytes>,
}

/// Path in the trie for an account and its storage.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TriePath {
    /// Path in the account trie
    pub account_path: Bytes,
    /// Paths in the storage trie
    pub slot_paths: Vec<Bytes>,
}

/// Request for a number of state (either account or storage) Merkle trie nodes by path.
// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#gettrienodes-0x06
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetTrieNodesMessage {
    /// Request ID to match up responses with
    pub request_id: u64,
    /// Root hash of the account trie to serve
    pub root_hash: B256,
    /// Trie paths to retrieve the nodes for, grouped by account
    pub paths: Vec<TriePath>,
    /// Soft limit at which to stop returning data (in bytes)
    pub response_bytes: u64,
}

/// Response containing a number of requested state trie nodes.
// https://github.com/ethereum/devp2p/blob/master/caps/snap.md#trienodes-0x07
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TrieNodesMessage {
    /// ID of the request this is a response for
    pub request_id: u64,
    /// The requested trie nodes in order
    pub nodes: Vec<Bytes>,
}

/// Represents all types of messages in the snap sync protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapProtocolMessage {
    /// Request for an account range - see [`GetAccountRangeMessage`]
    GetAccountRange(GetAccountRangeMessage),
    /// Response with accounts and proofs - see [`AccountRangeMessage`]
    AccountRange(AccountRangeMessage),
    /// Request for storage slots - see [`GetStorageRangesMessage`]
    GetStorageRanges(GetStorageRangesMessage),
    /// Response with storage slots - see [`StorageRangesMessage`]
    StorageRanges(StorageRangesMessage),
    /// Request for contract bytecodes - see [`GetByteCodesMessage`]
    GetByteCodes(GetByteCodesMessage),
    /// Response with contract codes - see [`ByteCodesMessage`]
    ByteCodes(ByteCodesMessage),
    /// Request for trie nodes - see [`GetTrieNodesMessage`]
    GetTrieNodes(GetTrieNodesMessage),
    /// Response with trie nodes - see [`TrieNodesMessage`]
    TrieNodes(TrieNodesMessage),
}

impl SnapProtocolMessage {
    /// Returns the protocol message ID for this message type.
    pub const fn message_id(&self) -> SnapMessageId {
        match self {
            Self::GetAccountRange(_) => SnapMessageId::GetAccountRange,
            Self::AccountRange(_) => SnapMessageId::AccountRange,
            Self::GetStorageRanges(_) => SnapMessageId::GetStorageRanges,
            Self::StorageRanges(_) => SnapMessageId::StorageRanges,
            Self::GetByteCodes(_) => SnapMessageId::GetByteCodes,
            Self::ByteCodes(_) => SnapMessageId::ByteCodes,
            Self::GetTrieNodes(_) => SnapMessageId::GetTrieNodes,
            Self::TrieNodes(_) => SnapMessageId::TrieNodes,
        }
    }

    /// Decodes the payload of the message with the given id.
    pub fn decode_payload(id: SnapMessageId, buf: &mut &[u8]) -> Result<Self, EthMessageError> {
        use alloy_rlp::Decodable;
        Ok(match id {
            SnapMessageId::GetAccountRange => {
                Self::GetAccountRange(GetAccountRangeMessage::decode(buf)?)
            }
            SnapMessageId::AccountRange => Self::AccountRange(AccountRangeMessage::decode(buf)?),
            SnapMessageId::GetStorageRanges => {
                Self::GetStorageRanges(GetStorageRangesMessage::decode(buf)?)
            }
            SnapMessageId::StorageRanges => Self::StorageRanges(StorageRangesMessage::decode(buf)?),
            SnapMessageId::GetByteCodes => Self::GetByteCodes(GetByteCodesMessage::decode(buf)?),
            SnapMessageId::ByteCodes => Self::ByteCodes(ByteCodesMessage::decode(buf)?),
            SnapMessageId::GetTrieNodes => Self::GetTrieNodes(GetTrieNodesMessage::decode(buf)?),
            SnapMessageId::TrieNodes => Self::TrieNodes(TrieNodesMessage::decode(buf)?),
        })
    }

    /// Encodes the payload of this message, without the message id.
    pub fn encode_payload(&self, out: &mut dyn BufMut) {
        match self {
            Self::GetAccountRange(msg) => msg.encode(out),
            Self::AccountRange(msg) => msg.encode(out),
            Self::GetStorageRanges(msg) => msg.encode(out),
            Self::StorageRanges(msg) => msg.encode(out),
            Self::GetByteCodes(msg) => msg.encode(out),
            Self::ByteCodes(msg) => msg.encode(out),
            Self::GetTrieNodes(msg) => msg.encode(out),
            Self::TrieNodes(msg) => msg.encode(out),
        }
    }

    /// The request id carried by the message.
    pub const fn request_id(&self) -> u64 {
        match self {
            Self::GetAccountRange(msg) => msg.request_id,
            Self::AccountRange(msg) => msg.request_id,
            Self::GetStorageRanges(msg) => msg.request_id,
            Self::StorageRanges(msg) => msg.request_id,
            Self::GetByteCodes(msg) => msg.request_id,
            Self::ByteCodes(msg) => msg.request_id,
            Self::GetTrieNodes(msg) => msg.request_id,
            Self::TrieNodes(msg) => msg.request_id,
        }
    }

    /// Returns `true` if this message is a response.
    pub const fn is_response(&self) -> bool {
        matches!(
            self,
            Self::AccountRange(_) | Self::StorageRanges(_) | Self::ByteCodes(_) | Self::TrieNodes(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_rlp::Decodable;

    #[test]
    fn account_range_round_trip() {
        let msg = AccountRangeMessage {
            request_id: 7,
            accounts: vec![AccountData {
                hash: B256::with_last_byte(1),
                body: Bytes::from_static(&[0x01, 0x02]),
            }],
            proof: vec![Bytes::from_static(&[0xde, 0xad])],
        };

        let mut encoded = Vec::new();
        msg.encode(&mut encoded);
        assert_eq!(AccountRangeMessage::decode(&mut &encoded[..]).unwrap(), msg);
    }

    #[test]
    fn get_account_range_payload_round_trip() {
        let msg = SnapProtocolMessage::GetAccountRange(GetAccountRangeMessage {
            request_id: 1,
            root_hash: B256::with_last_byte(9),
            starting_hash: B256::ZERO,
            limit_hash: B256::repeat_byte(0xff),
            response_bytes: 200_000,
        });

        let mut payload = Vec::new();
        msg.encode_payload(&mut payload);
        let decoded =
            SnapProtocolMessage::decode_payload(msg.message_id(), &mut &payload[..]).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.request_id(), 1);
        assert!(!decoded.is_response());
    }
}
