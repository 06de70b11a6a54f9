use crate::EthVersion;
use alloy_chains::{Chain, NamedChain};
use alloy_primitives::{hex, B256, U256};
use alloy_rlp::{BufMut, Encodable, RlpDecodable, RlpEncodable};
use core::fmt::{Debug, Display};
use quartz_ethereum_forks::{ForkHash, ForkId};

/// The status message is used in the eth protocol handshake to ensure that peers are on the same
/// network and are following the same fork.
///
/// This is the `eth/64+` variant which carries the fork id introduced by
/// [EIP-2364](https://eips.ethereum.org/EIPS/eip-2364).
///
/// When performing a handshake, the total difficulty is not guaranteed to correspond to the block
/// hash. This information should be treated as untrusted.
#[derive(Copy, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Status {
    /// The current protocol version. For example, peers running `eth/66` would have a version of
    /// 66.
    pub version: EthVersion,

    /// The chain id, as introduced in
    /// [EIP155](https://eips.ethereum.org/EIPS/eip-155#list-of-chain-ids).
    pub chain: Chain,

    /// Total difficulty of the best chain.
    pub total_difficulty: U256,

    /// The highest difficulty block hash the peer has seen
    pub blockhash: B256,

    /// The genesis hash of the peer's chain.
    pub genesis: B256,

    /// The fork identifier, a [CRC32
    /// checksum](https://en.wikipedia.org/wiki/Cyclic_redundancy_check#CRC-32_algorithm) for
    /// identifying the peer's fork as defined by
    /// [EIP-2124](https://github.com/ethereum/EIPs/blob/master/EIPS/eip-2124.md).
    pub forkid: ForkId,
}

impl Status {
    /// Helper for returning a builder for the status message.
    pub fn builder() -> StatusBuilder {
        Default::default()
    }

    /// Sets the [`EthVersion`] for the status.
    pub fn set_eth_version(&mut self, version: EthVersion) {
        self.version = version;
    }

    /// Converts this status into the legacy pre-fork-id variant used by
    /// `eth/62` and `eth/63`.
    pub const fn into_legacy(self) -> StatusLegacy {
        StatusLegacy {
            version: self.version,
            chain: self.chain,
            total_difficulty: self.total_difficulty,
            blockhash: self.blockhash,
            genesis: self.genesis,
        }
    }

    /// Returns the [`StatusMessage`] variant appropriate for the given
    /// negotiated version.
    pub fn message_for_version(mut self, version: EthVersion) -> StatusMessage {
        self.version = version;
        if version.carries_fork_id() {
            StatusMessage::ForkAware(self)
        } else {
            StatusMessage::Legacy(self.into_legacy())
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let hexed_blockhash = hex::encode(self.blockhash);
        let hexed_genesis = hex::encode(self.genesis);
        write!(
            f,
            "Status {{ version: {}, chain: {}, total_difficulty: {}, blockhash: {}, genesis: {}, forkid: {:X?} }}",
            self.version,
            self.chain,
            self.total_difficulty,
            hexed_blockhash,
            hexed_genesis,
            self.forkid
        )
    }
}

impl Debug for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let hexed_blockhash = hex::encode(self.blockhash);
        let hexed_genesis = hex::encode(self.genesis);
        write!(
            f,
            "Status {{ version: {:?}, chain: {:?}, total_difficulty: {:?}, blockhash: {}, genesis: {}, forkid: {:X?} }}",
            self.version,
            self.chain,
            self.total_difficulty,
            hexed_blockhash,
            hexed_genesis,
            self.forkid
        )
    }
}

// <https://etherscan.io/block/0>
impl Default for Status {
    fn default() -> Self {
        let mainnet_genesis: B256 =
            alloy_primitives::b256!("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3");
        Self {
            version: EthVersion::LATEST,
            chain: Chain::from_named(NamedChain::Mainnet),
            total_difficulty: U256::from(17_179_869_184u64),
            blockhash: mainnet_genesis,
            genesis: mainnet_genesis,
            forkid: ForkId { hash: ForkHash::from(mainnet_genesis), next: 1_150_000 },
        }
    }
}

/// The status message of `eth/62` and `eth/63`, which predates the fork id.
#[derive(Copy, Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct StatusLegacy {
    /// The eth protocol version.
    pub version: EthVersion,
    /// The chain id.
    pub chain: Chain,
    /// Total difficulty of the best chain.
    pub total_difficulty: U256,
    /// The highest difficulty block hash the peer has seen.
    pub blockhash: B256,
    /// The genesis hash of the peer's chain.
    pub genesis: B256,
}

/// A status message of any protocol version, fork-aware (`eth/64+`) or legacy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusMessage {
    /// The pre-fork-id status of `eth/62..63`.
    Legacy(StatusLegacy),
    /// The fork-aware status of `eth/64+`.
    ForkAware(Status),
}

impl StatusMessage {
    /// Returns the protocol version.
    pub const fn version(&self) -> EthVersion {
        match self {
            Self::Legacy(status) => status.version,
            Self::ForkAware(status) => status.version,
        }
    }

    /// Returns the chain identifier.
    pub const fn chain(&self) -> Chain {
        match self {
            Self::Legacy(status) => status.chain,
            Self::ForkAware(status) => status.chain,
        }
    }

    /// Returns the total difficulty.
    pub const fn total_difficulty(&self) -> U256 {
        match self {
            Self::Legacy(status) => status.total_difficulty,
            Self::ForkAware(status) => status.total_difficulty,
        }
    }

    /// Returns the genesis hash.
    pub const fn genesis(&self) -> B256 {
        match self {
            Self::Legacy(status) => status.genesis,
            Self::ForkAware(status) => status.genesis,
        }
    }

    /// Returns the best block hash the peer announced.
    pub const fn blockhash(&self) -> B256 {
        match self {
            Self::Legacy(status) => status.blockhash,
            Self::ForkAware(status) => status.blockhash,
        }
    }

    /// Returns the fork identifier, if the version carries one.
    pub const fn forkid(&self) -> Option<ForkId> {
        match self {
            Self::Legacy(_) => None,
            Self::ForkAware(status) => Some(status.forkid),
        }
    }
}

impl Encodable for StatusMessage {
    fn encode(&self, out: &mut dyn BufMut) {
        match self {
            Self::Legacy(status) => status.encode(out),
            Self::ForkAware(status) => status.encode(out),
        }
    }

    fn length(&self) -> usize {
        match self {
            Self::Legacy(status) => status.length(),
            Self::ForkAware(status) => status.length(),
        }
    }
}

/// Builder for [`Status`] messages.
#[derive(Debug, Default)]
pub struct StatusBuilder {
    status: Status,
}

impl StatusBuilder {
    /// Consumes the type and creates the actual [`Status`] message.
    pub const fn build(self) -> Status {
        self.status
    }

    /// Sets the protocol version.
    pub const fn version(mut self, version: EthVersion) -> Self {
        self.status.version = version;
        self
    }

    /// Sets the chain id.
    pub const fn chain(mut self, chain: Chain) -> Self {
        self.status.chain = chain;
        self
    }

    /// Sets the total difficulty.
    pub const fn total_difficulty(mut self, total_difficulty: U256) -> Self {
        self.status.total_difficulty = total_difficulty;
        self
    }

    /// Sets the block hash.
    pub const fn blockhash(mut self, blockhash: B256) -> Self {
        self.status.blockhash = blockhash;
        self
    }

    /// Sets the genesis hash.
    pub const fn genesis(mut self, genesis: B256) -> Self {
        self.status.genesis = genesis;
        self
    }

    /// Sets the fork id.
    pub const fn forkid(mut self, forkid: ForkId) -> Self {
        self.status.forkid = forkid;
        self
    }
}
