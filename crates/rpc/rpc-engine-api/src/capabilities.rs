use std::collections::HashMap;
use tracing::warn;

/// The engine API methods this node supports and exposes by default.
pub const CAPABILITIES: &[&str] = &[
    "engine_forkchoiceUpdatedV1",
    "engine_forkchoiceUpdatedV2",
    "engine_forkchoiceUpdatedV3",
    "engine_exchangeTransitionConfigurationV1",
    "engine_getPayloadV1",
    "engine_getPayloadV2",
    "engine_getPayloadV3",
    "engine_getPayloadV4",
    "engine_newPayloadV1",
    "engine_newPayloadV2",
    "engine_newPayloadV3",
    "engine_newPayloadV4",
    "engine_getPayloadBodiesByHashV1",
    "engine_getPayloadBodiesByRangeV1",
    "engine_getClientVersionV1",
];

/// The capability table of the local engine API: method name to active flag.
///
/// Exchanged with the consensus client via `engine_exchangeCapabilities`. The
/// exchange is purely advisory; a missing capability on either side never
/// disconnects anything.
#[derive(Debug, Clone)]
pub struct EngineCapabilities {
    capabilities: HashMap<String, bool>,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self::new(CAPABILITIES.iter().copied())
    }
}

impl EngineCapabilities {
    /// Creates the table with the given methods active.
    pub fn new(capabilities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            capabilities: capabilities.into_iter().map(|cap| (cap.into(), true)).collect(),
        }
    }

    /// Marks a method as inactive, e.g. because the chain configuration never
    /// activates the fork it belongs to.
    pub fn disable(&mut self, method: &str) {
        if let Some(active) = self.capabilities.get_mut(method) {
            *active = false;
        }
    }

    /// Returns the names of all active methods.
    pub fn list(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter_map(|(cap, active)| active.then(|| cap.clone()))
            .collect()
    }

    /// Handles an `engine_exchangeCapabilities` request: returns our active
    /// methods, and warns about every locally-active method the consensus
    /// client did not announce.
    pub fn exchange(&self, peer_capabilities: &[String]) -> Vec<String> {
        for (cap, active) in &self.capabilities {
            if *active && !peer_capabilities.iter().any(|peer_cap| peer_cap == cap) {
                warn!(
                    target: "rpc::engine",
                    method = %cap,
                    "consensus client does not support required engine method"
                );
            }
        }

        self.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_returns_active_methods() {
        let mut capabilities = EngineCapabilities::new(["engine_newPayloadV3", "engine_getPayloadV3"]);
        capabilities.disable("engine_getPayloadV3");

        let ours = capabilities.exchange(&["engine_newPayloadV3".to_string()]);
        assert_eq!(ours, vec!["engine_newPayloadV3".to_string()]);
    }

    #[test]
    fn exchange_is_advisory_for_missing_methods() {
        let capabilities = EngineCapabilities::default();
        // a peer announcing nothing still gets our full list back
        let ours = capabilities.exchange(&[]);
        assert_eq!(ours.len(), CAPABILITIES.len());
    }

    #[test]
    fn disabling_unknown_methods_is_a_noop() {
        let mut capabilities = EngineCapabilities::default();
        capabilities.disable("engine_doesNotExist");
        assert_eq!(capabilities.list().len(), CAPABILITIES.len());
    }
}
