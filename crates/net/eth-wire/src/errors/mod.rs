//! Error types for stream variants

mod eth;
mod p2p;

pub use eth::*;
pub use p2p::*;
