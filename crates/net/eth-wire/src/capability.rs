//! All capability related types.
//!
//! Capabilities are exchanged via the `p2p` `Hello` message as pairs of
//! `(name, version)`, see also
//! <https://github.com/ethereum/devp2p/blob/master/rlpx.md#capability-messaging>

use crate::{
    errors::{P2PHandshakeError, P2PStreamError},
    types::version::ParseVersionError,
    EthVersion,
};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use std::collections::{BTreeSet, HashMap};

/// The name of the `eth` capability.
pub const ETH_CAPABILITY_NAME: &str = "eth";

/// The name of the `snap` capability.
pub const SNAP_CAPABILITY_NAME: &str = "snap";

/// The version of the `snap/1` capability.
pub const SNAP_PROTOCOL_VERSION: u8 = 1;

/// Number of message ids the `snap/1` protocol occupies.
pub const SNAP_PROTOCOL_MESSAGES: u8 = 8;

/// The lowest message id available to subprotocols, everything below is
/// reserved for the `p2p` capability itself.
pub const MAX_RESERVED_MESSAGE_ID: u8 = 0x0f;

/// A Capability message consisting of the message-id and the payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawCapabilityMessage {
    /// Identifier of the message within its protocol space.
    pub id: usize,
    /// Actual payload
    pub payload: bytes::Bytes,
}

/// A single capability: a short ASCII protocol code and a version.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, RlpEncodable, RlpDecodable)]
pub struct Capability {
    /// The name of the subprotocol
    pub name: String,
    /// The version of the subprotocol
    pub version: usize,
}

impl Capability {
    /// Create a new `Capability` with the given name and version.
    pub const fn new(name: String, version: usize) -> Self {
        Self { name, version }
    }

    /// Create a new `eth` capability with the given version.
    pub fn eth(version: EthVersion) -> Self {
        Self::new(ETH_CAPABILITY_NAME.to_string(), version as usize)
    }

    /// Create a new `snap/1` capability.
    pub fn snap() -> Self {
        Self::new(SNAP_CAPABILITY_NAME.to_string(), SNAP_PROTOCOL_VERSION as usize)
    }

    /// Returns `true` if this is an `eth` capability of any version.
    pub fn is_eth(&self) -> bool {
        self.name == ETH_CAPABILITY_NAME
    }

    /// Returns `true` if this is the `snap/1` capability.
    pub fn is_snap(&self) -> bool {
        self.name == SNAP_CAPABILITY_NAME && self.version == SNAP_PROTOCOL_VERSION as usize
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Represents all capabilities a node announces.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Capabilities {
    /// All capabilities in announcement order.
    inner: Vec<Capability>,
}

impl Capabilities {
    /// Returns all capabilities.
    pub fn capabilities(&self) -> &[Capability] {
        &self.inner
    }

    /// Consumes the type and returns the all capabilities.
    pub fn into_inner(self) -> Vec<Capability> {
        self.inner
    }

    /// Whether the peer announced the given capability.
    pub fn contains(&self, cap: &Capability) -> bool {
        self.inner.contains(cap)
    }

    /// Whether this peer supports eth sub-protocol.
    pub fn supports_eth(&self) -> bool {
        self.inner.iter().any(Capability::is_eth)
    }

    /// Whether this peer supports the `snap/1` sub-protocol.
    pub fn supports_snap(&self) -> bool {
        self.inner.iter().any(Capability::is_snap)
    }
}

impl From<Vec<Capability>> for Capabilities {
    fn from(inner: Vec<Capability>) -> Self {
        Self { inner }
    }
}

/// A subprotocol as advertised together with the number of message ids it
/// occupies, which is what the shared message-id space is carved up by.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Protocol {
    /// The capability.
    pub cap: Capability,
    /// The number of message ids the protocol occupies.
    pub messages: u8,
}

impl Protocol {
    /// Create a new protocol.
    pub const fn new(cap: Capability, messages: u8) -> Self {
        Self { cap, messages }
    }

    /// The `eth` protocol for the given version.
    pub fn eth(version: EthVersion) -> Self {
        Self::new(Capability::eth(version), version.total_messages())
    }

    /// The `snap/1` protocol.
    pub fn snap() -> Self {
        Self::new(Capability::snap(), SNAP_PROTOCOL_MESSAGES)
    }
}

/// A shared capability: negotiated protocol, version and the message-id
/// offset its space starts at.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum SharedCapability {
    /// The `eth` capability.
    Eth {
        /// The negotiated eth version.
        version: EthVersion,
        /// The message-id offset the eth space starts at.
        offset: u8,
    },
    /// The `snap/1` capability.
    Snap {
        /// The message-id offset the snap space starts at.
        offset: u8,
    },
    /// Any other negotiated capability.
    UnknownCapability {
        /// The capability.
        cap: Capability,
        /// The message-id offset this protocol's space starts at.
        offset: u8,
        /// The number of message ids the protocol occupies.
        messages: u8,
    },
}

impl SharedCapability {
    /// Creates a new [`SharedCapability`] based on the given name, offset, version and message
    /// count.
    pub(crate) fn new(
        name: &str,
        version: u8,
        offset: u8,
        messages: u8,
    ) -> Result<Self, SharedCapabilityError> {
        if offset <= MAX_RESERVED_MESSAGE_ID {
            return Err(SharedCapabilityError::ReservedMessageIdOffset(offset))
        }

        match name {
            ETH_CAPABILITY_NAME => Ok(Self::Eth { version: EthVersion::try_from(version)?, offset }),
            SNAP_CAPABILITY_NAME => Ok(Self::Snap { offset }),
            _ => Ok(Self::UnknownCapability {
                cap: Capability::new(name.to_string(), version as usize),
                offset,
                messages,
            }),
        }
    }

    /// Returns the name of the capability.
    pub fn name(&self) -> &str {
        match self {
            Self::Eth { .. } => ETH_CAPABILITY_NAME,
            Self::Snap { .. } => SNAP_CAPABILITY_NAME,
            Self::UnknownCapability { cap, .. } => &cap.name,
        }
    }

    /// Returns the version of the capability.
    pub const fn version(&self) -> u8 {
        match self {
            Self::Eth { version, .. } => *version as u8,
            Self::Snap { .. } => SNAP_PROTOCOL_VERSION,
            Self::UnknownCapability { cap, .. } => cap.version as u8,
        }
    }

    /// Returns the eth version if it's the eth capability.
    pub const fn eth_version(&self) -> Option<EthVersion> {
        match self {
            Self::Eth { version, .. } => Some(*version),
            _ => None,
        }
    }

    /// Returns the message-id offset of this capability's space.
    pub const fn message_id_offset(&self) -> u8 {
        match self {
            Self::Eth { offset, .. } | Self::Snap { offset } => *offset,
            Self::UnknownCapability { offset, .. } => *offset,
        }
    }

    /// Returns the number of protocol messages supported by this capability.
    pub const fn num_messages(&self) -> u8 {
        match self {
            Self::Eth { version, .. } => version.total_messages(),
            Self::Snap { .. } => SNAP_PROTOCOL_MESSAGES,
            Self::UnknownCapability { messages, .. } => *messages,
        }
    }

    /// Returns `true` if the given relative-to-subprotocols message id falls
    /// into this capability's space.
    pub const fn contains_message_id(&self, id: u8) -> bool {
        let start = self.message_id_offset() - (MAX_RESERVED_MESSAGE_ID + 1);
        id >= start && id < start + self.num_messages()
    }
}

/// An error thrown when capabilities could not be shared.
#[derive(Debug, thiserror::Error)]
pub enum SharedCapabilityError {
    /// Unsupported `eth` version.
    #[error(transparent)]
    UnsupportedVersion(#[from] ParseVersionError),
    /// Thrown when no common capability was negotiated.
    #[error("no shared capabilities with the remote")]
    NoSharedCapabilities,
    /// Thrown when a capability offset would fall into the reserved `p2p` space.
    #[error("message id offset `{0}` is reserved for the p2p capability")]
    ReservedMessageIdOffset(u8),
}

/// The set of capabilities negotiated with a peer, ordered by the message-id
/// spaces assigned to each protocol.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SharedCapabilities(Vec<SharedCapability>);

impl SharedCapabilities {
    /// Computes the agreed set from our supported protocols and the
    /// capabilities the peer announced.
    ///
    /// For every protocol announced by both sides the highest common version
    /// wins. Message-id spaces are assigned in lexicographic protocol-code
    /// order, directly after the reserved `p2p` space.
    pub fn try_new(
        local_protocols: Vec<Protocol>,
        peer_capabilities: Vec<Capability>,
    ) -> Result<Self, P2PStreamError> {
        shared_capability_offsets(local_protocols, peer_capabilities).map(Self)
    }

    /// Iterates over the shared capabilities.
    pub fn iter_caps(&self) -> impl Iterator<Item = &SharedCapability> {
        self.0.iter()
    }

    /// Returns the number of shared capabilities.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no capabilities are shared.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the negotiated eth version, if any.
    pub fn eth_version(&self) -> Result<EthVersion, P2PStreamError> {
        self.0
            .iter()
            .find_map(SharedCapability::eth_version)
            .ok_or(P2PStreamError::CapabilityNotShared)
    }

    /// Returns the shared eth capability, if any.
    pub fn eth(&self) -> Option<&SharedCapability> {
        self.0.iter().find(|cap| cap.eth_version().is_some())
    }

    /// Returns the shared snap capability, if any.
    pub fn snap(&self) -> Option<&SharedCapability> {
        self.0.iter().find(|cap| matches!(cap, SharedCapability::Snap { .. }))
    }

    /// Returns the capability owning the given relative message id.
    pub fn find_by_relative_id(&self, id: u8) -> Option<&SharedCapability> {
        self.0.iter().find(|cap| cap.contains_message_id(id))
    }
}

/// Determines the offsets for each shared capability between the input list of
/// peer capabilities and the input list of locally supported [`Protocol`].
///
/// The `p2p` capability is implicit and occupies ids `0..=0x0f`.
pub fn shared_capability_offsets(
    local_protocols: Vec<Protocol>,
    peer_capabilities: Vec<Capability>,
) -> Result<Vec<SharedCapability>, P2PStreamError> {
    // per devp2p the intersection is computed per protocol code, keeping the
    // highest version supported by both sides
    let our_capabilities: HashMap<Capability, u8> =
        local_protocols.into_iter().map(|proto| (proto.cap, proto.messages)).collect();

    // map of highest shared version per protocol code, ordered
    // lexicographically for deterministic offset assignment
    let mut shared: BTreeSet<SharedCapabilityCandidate> = BTreeSet::new();
    for peer_cap in peer_capabilities {
        if let Some(messages) = our_capabilities.get(&peer_cap) {
            let candidate = SharedCapabilityCandidate {
                name: peer_cap.name.clone(),
                version: peer_cap.version as u8,
                messages: *messages,
            };
            // keep the highest version per name, ties resolved by the set order
            if let Some(existing) =
                shared.iter().find(|existing| existing.name == candidate.name).cloned()
            {
                if existing.version < candidate.version {
                    shared.remove(&existing);
                    shared.insert(candidate);
                }
            } else {
                shared.insert(candidate);
            }
        }
    }

    if shared.is_empty() {
        return Err(P2PStreamError::HandshakeError(P2PHandshakeError::NoSharedCapabilities))
    }

    // the first offset available to subprotocols directly follows the
    // reserved p2p space
    let mut offset = MAX_RESERVED_MESSAGE_ID + 1;
    let mut shared_with_offsets = Vec::with_capacity(shared.len());
    for candidate in shared {
        let shared_capability =
            SharedCapability::new(&candidate.name, candidate.version, offset, candidate.messages)?;
        offset += shared_capability.num_messages();
        shared_with_offsets.push(shared_capability);
    }

    Ok(shared_with_offsets)
}

/// Helper used while negotiating shared capabilities; the derived ordering
/// (name, then version) drives both the lexicographic protocol order and the
/// highest-version tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SharedCapabilityCandidate {
    name: String,
    version: u8,
    messages: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_eth_66() {
        let capability = SharedCapability::new("eth", 66, 16, 17).unwrap();

        assert_eq!(capability.name(), "eth");
        assert_eq!(capability.version(), 66);
        assert_eq!(capability, SharedCapability::Eth { version: EthVersion::Eth66, offset: 16 });
    }

    #[test]
    fn reserved_offset_rejected() {
        assert!(matches!(
            SharedCapability::new("eth", 66, 0, 17),
            Err(SharedCapabilityError::ReservedMessageIdOffset(0))
        ));
    }

    #[test]
    fn highest_common_eth_version_wins() {
        let local = vec![Protocol::eth(EthVersion::Eth66), Protocol::eth(EthVersion::Eth65)];
        let peer = vec![Capability::eth(EthVersion::Eth65), Capability::eth(EthVersion::Eth66)];

        let shared = shared_capability_offsets(local, peer).unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0], SharedCapability::Eth { version: EthVersion::Eth66, offset: 16 });
    }

    #[test]
    fn offsets_are_assigned_in_lexicographic_order() {
        let local = vec![Protocol::snap(), Protocol::eth(EthVersion::Eth66)];
        let peer = vec![Capability::snap(), Capability::eth(EthVersion::Eth66)];

        let shared = shared_capability_offsets(local, peer).unwrap();
        // `eth` sorts before `snap`, so eth occupies 16..33 and snap 33..41
        assert_eq!(shared[0], SharedCapability::Eth { version: EthVersion::Eth66, offset: 16 });
        assert_eq!(shared[1], SharedCapability::Snap { offset: 33 });
    }

    #[test]
    fn no_shared_capabilities_is_an_error() {
        let local = vec![Protocol::eth(EthVersion::Eth66)];
        let peer = vec![Capability::new("wit".to_string(), 0)];

        assert!(shared_capability_offsets(local, peer).is_err());
    }

    #[test]
    fn relative_message_id_lookup() {
        let shared = SharedCapabilities::try_new(
            vec![Protocol::eth(EthVersion::Eth66), Protocol::snap()],
            vec![Capability::eth(EthVersion::Eth66), Capability::snap()],
        )
        .unwrap();

        // relative id 0 is the first eth message, 17 the first snap message
        assert!(matches!(shared.find_by_relative_id(0), Some(SharedCapability::Eth { .. })));
        assert!(matches!(shared.find_by_relative_id(16), Some(SharedCapability::Eth { .. })));
        assert!(matches!(shared.find_by_relative_id(17), Some(SharedCapability::Snap { .. })));
        assert!(shared.find_by_relative_id(25).is_none());
    }
}
