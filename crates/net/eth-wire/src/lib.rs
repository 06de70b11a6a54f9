//! Implements the `eth` wire protocol and the `snap/1` satellite protocol on
//! top of a devp2p `p2p` connection.
//!
//! This crate provides the message types for `eth/62` through `eth/66`, the
//! `p2p` hello/disconnect/ping layer with snappy compression, capability
//! negotiation with message-id space assignment, and the status handshake
//! including EIP-2124 fork-id validation.
//!
//! The RLPx transport itself (ECIES framing and encryption) is an external
//! collaborator: every stream in this crate is generic over a framed byte
//! transport.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod capability;
mod disconnect;
pub mod errors;
mod ethstream;
mod hello;
mod p2pstream;
mod pinger;
mod types;

pub use crate::{
    capability::{
        Capabilities, Capability, Protocol, RawCapabilityMessage, SharedCapabilities,
        SharedCapability, MAX_RESERVED_MESSAGE_ID,
    },
    disconnect::{DisconnectReason, UnknownDisconnectReason},
    ethstream::{EthStream, EthStreamFrame, UnauthedEthStream},
    hello::{
        pk2id, HelloMessage, HelloMessageBuilder, HelloMessageWithProtocols, PeerId,
        DEFAULT_TCP_PORT,
    },
    p2pstream::{P2PMessage, P2PMessageID, P2PStream, UnauthedP2PStream},
    types::*,
};

#[cfg(test)]
use rand as _;
