use crate::{
    capability::{Capability, Protocol},
    EthVersion, ProtocolVersion,
};
use alloy_primitives::B512;
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// The default tcp port for p2p.
pub const DEFAULT_TCP_PORT: u16 = 30303;

/// A unique peer identifier: the 64-byte uncompressed secp256k1 public key of
/// the node.
pub type PeerId = B512;

/// Converts a secp256k1 public key to the peer id used on the wire.
pub fn pk2id(pk: &secp256k1::PublicKey) -> PeerId {
    PeerId::from_slice(&pk.serialize_uncompressed()[1..])
}

/// Raw rlpx protocol message used in the `p2p` handshake, containing the
/// client identity and the supported capability list.
///
/// This is the wire representation; locally the node keeps a
/// [`HelloMessageWithProtocols`] which additionally tracks the message-id
/// space each protocol occupies.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HelloMessage {
    /// The version of the `p2p` protocol.
    pub protocol_version: ProtocolVersion,
    /// Specifies the client software identity, as a human-readable string
    /// (e.g. "Ethereum(++)/1.0.0").
    pub client_version: String,
    /// The list of supported capabilities and their versions.
    pub capabilities: Vec<Capability>,
    /// The port that the client is listening on, zero indicates the client is
    /// not listening.
    pub port: u16,
    /// The secp256k1 public key corresponding to the node's private key.
    pub id: PeerId,
}

impl HelloMessage {
    /// Starts a new `HelloMessageProtocolsBuilder`
    ///
    /// ```
    /// use alloy_primitives::B512;
    /// use quartz_eth_wire::HelloMessage;
    ///
    /// let id = B512::ZERO;
    /// let status = HelloMessage::builder(id).build();
    /// ```
    pub fn builder(id: PeerId) -> HelloMessageBuilder {
        HelloMessageBuilder::new(id)
    }
}

/// A [`HelloMessage`] together with the full [`Protocol`] descriptors for the
/// advertised capabilities, which carry the message-id space sizes needed for
/// capability negotiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloMessageWithProtocols {
    /// The version of the `p2p` protocol.
    pub protocol_version: ProtocolVersion,
    /// Specifies the client software identity, as a human-readable string.
    pub client_version: String,
    /// The list of supported protocols.
    pub protocols: Vec<Protocol>,
    /// The port that the client is listening on, zero indicates the client is
    /// not listening.
    pub port: u16,
    /// The secp256k1 public key corresponding to the node's private key.
    pub id: PeerId,
}

impl HelloMessageWithProtocols {
    /// Starts a new `HelloMessageBuilder`
    pub fn builder(id: PeerId) -> HelloMessageBuilder {
        HelloMessageBuilder::new(id)
    }

    /// Returns the raw [`HelloMessage`] to send to the remote.
    pub fn message(&self) -> HelloMessage {
        HelloMessage {
            protocol_version: self.protocol_version,
            client_version: self.client_version.clone(),
            capabilities: self.protocols.iter().map(|proto| proto.cap.clone()).collect(),
            port: self.port,
            id: self.id,
        }
    }

    /// Returns `true` if the set of protocols contains the given protocol code.
    pub fn contains_protocol_code(&self, name: &str) -> bool {
        self.protocols.iter().any(|proto| proto.cap.name == name)
    }

    /// Adds a new protocol to the advertised set.
    ///
    /// Returns an error if the protocol code is already advertised.
    pub fn try_add_protocol(&mut self, protocol: Protocol) -> Result<(), Protocol> {
        if self.contains_protocol_code(&protocol.cap.name) {
            return Err(protocol)
        }
        self.protocols.push(protocol);
        Ok(())
    }
}

/// Builder for [`HelloMessageWithProtocols`].
#[derive(Debug)]
pub struct HelloMessageBuilder {
    /// The version of the `p2p` protocol.
    pub protocol_version: Option<ProtocolVersion>,
    /// Specifies the client software identity, as a human-readable string.
    pub client_version: Option<String>,
    /// The list of supported protocols.
    pub protocols: Option<Vec<Protocol>>,
    /// The port that the client is listening on.
    pub port: Option<u16>,
    /// The secp256k1 public key corresponding to the node's private key.
    pub id: PeerId,
}

// === impl HelloMessageBuilder ===

impl HelloMessageBuilder {
    /// Create a new builder to configure a [`HelloMessageWithProtocols`]
    pub const fn new(id: PeerId) -> Self {
        Self { protocol_version: None, client_version: None, protocols: None, port: None, id }
    }

    /// Sets the p2p protocol version.
    pub const fn protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.protocol_version = Some(protocol_version);
        self
    }

    /// Sets the client version.
    pub fn client_version(mut self, client_version: impl Into<String>) -> Self {
        self.client_version = Some(client_version.into());
        self
    }

    /// Adds a new protocol to the list.
    pub fn protocol(mut self, protocol: impl Into<Protocol>) -> Self {
        self.protocols.get_or_insert_with(Vec::new).push(protocol.into());
        self
    }

    /// Sets the protocols to announce.
    pub fn protocols(mut self, protocols: impl IntoIterator<Item = Protocol>) -> Self {
        self.protocols.get_or_insert_with(Vec::new).extend(protocols);
        self
    }

    /// Sets the listening port.
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Consumes the type and returns the [`HelloMessageWithProtocols`].
    ///
    /// Unset fields are replaced with their defaults: latest p2p version,
    /// `eth` at the latest version, the default tcp port.
    pub fn build(self) -> HelloMessageWithProtocols {
        let Self { protocol_version, client_version, protocols, port, id } = self;
        HelloMessageWithProtocols {
            protocol_version: protocol_version.unwrap_or_default(),
            client_version: client_version
                .unwrap_or_else(|| format!("quartz/v{}", env!("CARGO_PKG_VERSION"))),
            protocols: protocols.unwrap_or_else(|| vec![Protocol::eth(EthVersion::LATEST)]),
            port: port.unwrap_or(DEFAULT_TCP_PORT),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_rlp::{Decodable, Encodable};
    use secp256k1::{SecretKey, SECP256K1};

    #[test]
    fn hello_encoding_round_trip() {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let id = pk2id(&secret_key.public_key(SECP256K1));
        let hello = HelloMessage {
            protocol_version: ProtocolVersion::V5,
            client_version: "quartz/v0.1.0".to_string(),
            capabilities: vec![Capability::eth(EthVersion::Eth66)],
            port: DEFAULT_TCP_PORT,
            id,
        };

        let mut encoded = Vec::new();
        hello.encode(&mut encoded);
        assert_eq!(encoded.len(), hello.length());

        let decoded = HelloMessage::decode(&mut &encoded[..]).unwrap();
        assert_eq!(hello, decoded);
    }

    #[test]
    fn builder_defaults() {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let id = pk2id(&secret_key.public_key(SECP256K1));
        let hello = HelloMessageWithProtocols::builder(id).build();

        assert_eq!(hello.protocol_version, ProtocolVersion::V5);
        assert_eq!(hello.port, DEFAULT_TCP_PORT);
        assert_eq!(hello.protocols, vec![Protocol::eth(EthVersion::Eth66)]);
        assert!(hello.client_version.starts_with("quartz/"));
    }

    #[test]
    fn duplicate_protocol_codes_are_rejected() {
        let mut hello = HelloMessageWithProtocols::builder(PeerId::ZERO).build();
        assert!(hello.try_add_protocol(Protocol::snap()).is_ok());
        assert!(hello.try_add_protocol(Protocol::eth(EthVersion::Eth65)).is_err());
    }
}
