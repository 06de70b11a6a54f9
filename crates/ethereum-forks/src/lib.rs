//! Ethereum fork identity types.
//!
//! Implements the [EIP-2124](https://eips.ethereum.org/EIPS/eip-2124) fork
//! identifier: a rolling CRC32 checksum over the genesis hash and every fork
//! activation, advertised during the `eth` status handshake and validated
//! against remote peers to detect chain or software incompatibilities early.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod forkid;
mod head;

pub use forkid::{ForkFilter, ForkFilterKey, ForkHash, ForkId, ForkTransition, ValidationError};
pub use head::Head;
