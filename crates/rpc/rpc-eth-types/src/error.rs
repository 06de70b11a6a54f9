//! Error variants for the `eth` namespace services.

/// Errors that can occur when interacting with the `eth` namespace services.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EthApiError {
    /// The chain has no head block, e.g. while the node is still syncing from
    /// scratch.
    #[error("unknown head block")]
    UnknownHeadBlock,
    /// A block expected to exist could not be found.
    #[error("unknown block {0}")]
    UnknownBlock(u64),
}
