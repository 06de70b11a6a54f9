//! Engine API capability negotiation with the consensus client.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod capabilities;

pub use capabilities::{EngineCapabilities, CAPABILITIES};
