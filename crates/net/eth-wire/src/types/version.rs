//! Support for representing the version of the `eth` and `p2p` protocols.

use std::{fmt, str::FromStr};

use alloy_rlp::{Decodable, Encodable, Error as RlpError};
use bytes::BufMut;
use derive_more::Display;

/// Error thrown when failed to parse a valid [`EthVersion`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown eth protocol version: {0}")]
pub struct ParseVersionError(String);

/// The `eth` protocol version.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum EthVersion {
    /// The `eth` protocol version 62.
    Eth62 = 62,

    /// The `eth` protocol version 63.
    Eth63 = 63,

    /// The `eth` protocol version 64.
    Eth64 = 64,

    /// The `eth` protocol version 65.
    Eth65 = 65,

    /// The `eth` protocol version 66.
    Eth66 = 66,
}

impl EthVersion {
    /// The latest known eth version.
    pub const LATEST: Self = Self::Eth66;

    /// All versions this implementation can speak, latest first.
    pub const ALL_VERSIONS: &'static [Self] =
        &[Self::Eth66, Self::Eth65, Self::Eth64, Self::Eth63, Self::Eth62];

    /// Returns the total number of message ids the protocol version occupies.
    ///
    /// `eth/63` extended the id space for the state messages and `eth/65`
    /// filled the gap with the pooled transaction messages, so the occupied
    /// space is unchanged from 63 on.
    pub const fn total_messages(&self) -> u8 {
        match self {
            Self::Eth62 => 8,
            Self::Eth63 | Self::Eth64 | Self::Eth65 | Self::Eth66 => 17,
        }
    }

    /// Returns `true` if the status message of this version carries a fork id.
    pub const fn carries_fork_id(&self) -> bool {
        (*self as u8) >= 64
    }

    /// Returns `true` if this version announces pooled transactions.
    pub const fn has_pooled_transactions(&self) -> bool {
        (*self as u8) >= 65
    }

    /// Returns `true` if requests and responses of this version are wrapped
    /// in request-id envelopes.
    pub const fn has_request_ids(&self) -> bool {
        (*self as u8) >= 66
    }
}

impl TryFrom<&str> for EthVersion {
    type Error = ParseVersionError;

    #[inline]
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "62" => Ok(Self::Eth62),
            "63" => Ok(Self::Eth63),
            "64" => Ok(Self::Eth64),
            "65" => Ok(Self::Eth65),
            "66" => Ok(Self::Eth66),
            _ => Err(ParseVersionError(s.to_string())),
        }
    }
}

impl TryFrom<u8> for EthVersion {
    type Error = ParseVersionError;

    #[inline]
    fn try_from(u: u8) -> Result<Self, Self::Error> {
        match u {
            62 => Ok(Self::Eth62),
            63 => Ok(Self::Eth63),
            64 => Ok(Self::Eth64),
            65 => Ok(Self::Eth65),
            66 => Ok(Self::Eth66),
            _ => Err(ParseVersionError(u.to_string())),
        }
    }
}

impl FromStr for EthVersion {
    type Err = ParseVersionError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl From<EthVersion> for u8 {
    #[inline]
    fn from(v: EthVersion) -> Self {
        v as Self
    }
}

// The version is encoded as a single byte, e.g. in the status message.
impl Encodable for EthVersion {
    fn encode(&self, out: &mut dyn BufMut) {
        (*self as u8).encode(out)
    }

    fn length(&self) -> usize {
        (*self as u8).length()
    }
}

impl Decodable for EthVersion {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let version = u8::decode(buf)?;
        Self::try_from(version).map_err(|_| RlpError::Custom("unknown eth protocol version"))
    }
}

/// RLPx `p2p` protocol version.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// `p2p` version 4
    V4 = 4,
    /// `p2p` version 5
    #[default]
    V5 = 5,
}

impl ProtocolVersion {
    /// Returns `true` if this version compresses subprotocol payloads with
    /// snappy, per [EIP-706](https://eips.ethereum.org/EIPS/eip-706).
    pub const fn is_compressed(&self) -> bool {
        matches!(self, Self::V5)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", *self as u8)
    }
}

impl Encodable for ProtocolVersion {
    fn encode(&self, out: &mut dyn BufMut) {
        (*self as u8).encode(out)
    }

    fn length(&self) -> usize {
        // the version should be a single byte
        (*self as u8).length()
    }
}

impl Decodable for ProtocolVersion {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let version = u8::decode(buf)?;
        match version {
            4 => Ok(Self::V4),
            5 => Ok(Self::V5),
            _ => Err(RlpError::Custom("unknown p2p protocol version")),
        }
    }
}
