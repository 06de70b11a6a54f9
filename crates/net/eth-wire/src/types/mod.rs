//! Types for the eth wire protocol.

mod blocks;
mod broadcast;
mod message;
mod receipts;
mod snap;
mod state;
mod status;
mod transactions;
pub mod version;

pub use blocks::*;
pub use broadcast::*;
pub use message::*;
pub use receipts::*;
pub use snap::*;
pub use state::*;
pub use status::*;
pub use transactions::*;
pub use version::{EthVersion, ParseVersionError, ProtocolVersion};
