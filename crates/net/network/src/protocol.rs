//! Support for additional RLPx-based application-level protocols beyond
//! `eth`, e.g. `snap/1` or experimental satellite protocols.
//!
//! Protocols are installed into an open registry keyed by their protocol
//! code. For every session that negotiates the capability, the registered
//! factory builds a per-session handler which the session routes the
//! protocol's frames to.

use crate::session::{Direction, SessionCommand, SessionId};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use quartz_eth_wire::{Capability, PeerId, Protocol};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::mpsc;

/// Context handed to a protocol factory when a session negotiated the
/// capability.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// The internal id of the session.
    pub session_id: SessionId,
    /// The remote peer.
    pub peer_id: PeerId,
    /// Whether the session is inbound or outbound.
    pub direction: Direction,
    /// The negotiated version of the capability.
    pub version: u8,
    /// Command channel into the owning session, e.g. for sending frames from
    /// a protocol client handle. Handlers never hold the session itself.
    pub to_session: mpsc::Sender<SessionCommand>,
}

/// A frame of a satellite protocol: a message id relative to the protocol's
/// own space, and the rlp payload.
#[derive(Debug, Clone)]
pub struct SatelliteFrame {
    /// Message id, relative to the protocol's message-id space.
    pub id: u8,
    /// The rlp encoded payload.
    pub payload: Bytes,
}

/// Error returned by a [`SessionProtocolHandler`].
///
/// A failing handler tears the session down; the error is logged and never
/// propagated past the session.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProtocolHandlerError(pub String);

/// A per-session handler for one subprotocol.
///
/// Exactly one handler exists per `(session, protocol code)` pair. Handlers
/// are installed when the session reaches its initialized state and disposed
/// on disconnect.
pub trait SessionProtocolHandler: Send + fmt::Debug {
    /// The protocol this handler speaks.
    fn protocol(&self) -> Protocol;

    /// Handles an incoming frame of this protocol. Returned frames are
    /// written back to the peer in order.
    fn on_message(
        &mut self,
        id: u8,
        payload: BytesMut,
    ) -> Result<Vec<SatelliteFrame>, ProtocolHandlerError>;

    /// Invoked once when the session disconnects. No frames can be sent from
    /// here.
    fn on_disconnect(&mut self) {}
}

/// Builds [`SessionProtocolHandler`]s for sessions that agreed on the
/// protocol's capability.
pub trait ProtocolFactory: Send + Sync {
    /// The protocol this factory can build handlers for.
    fn protocol(&self) -> Protocol;

    /// Builds the handler for a new session.
    fn create_handler(&self, ctx: &SessionContext) -> Box<dyn SessionProtocolHandler>;
}

/// Error returned when registering a protocol whose code is already present.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol `{0}` is already registered")]
pub struct DuplicateProtocolError(pub String);

/// An open registry of satellite protocol factories, keyed by protocol code.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ProtocolFactory>>>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a factory for the given protocol code.
    ///
    /// Fails if a factory for the code is already present.
    pub fn register(
        &self,
        factory: Arc<dyn ProtocolFactory>,
    ) -> Result<(), DuplicateProtocolError> {
        let code = factory.protocol().cap.name.clone();
        let mut factories = self.factories.write();
        if factories.contains_key(&code) {
            return Err(DuplicateProtocolError(code))
        }
        factories.insert(code, factory);
        Ok(())
    }

    /// Returns the factory registered for the given protocol code.
    pub fn get(&self, code: &str) -> Option<Arc<dyn ProtocolFactory>> {
        self.factories.read().get(code).cloned()
    }

    /// Returns the protocols of all registered factories.
    pub fn protocols(&self) -> Vec<Protocol> {
        self.factories.read().values().map(|factory| factory.protocol()).collect()
    }

    /// Builds a handler for the given negotiated capability, if a factory is
    /// registered for it.
    pub fn create_handler(
        &self,
        cap: &Capability,
        ctx: &SessionContext,
    ) -> Option<Box<dyn SessionProtocolHandler>> {
        let factory = self.get(&cap.name)?;
        Some(factory.create_handler(ctx))
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<String> = self.factories.read().keys().cloned().collect();
        f.debug_struct("ProtocolRegistry").field("protocols", &codes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_eth_wire::Capability;

    #[derive(Debug)]
    struct EchoHandler(Protocol);

    impl SessionProtocolHandler for EchoHandler {
        fn protocol(&self) -> Protocol {
            self.0.clone()
        }

        fn on_message(
            &mut self,
            id: u8,
            payload: BytesMut,
        ) -> Result<Vec<SatelliteFrame>, ProtocolHandlerError> {
            Ok(vec![SatelliteFrame { id, payload: payload.freeze() }])
        }
    }

    struct EchoFactory;

    impl ProtocolFactory for EchoFactory {
        fn protocol(&self) -> Protocol {
            Protocol::new(Capability::new("wit".to_string(), 0), 4)
        }

        fn create_handler(&self, _ctx: &SessionContext) -> Box<dyn SessionProtocolHandler> {
            Box::new(EchoHandler(self.protocol()))
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ProtocolRegistry::new();
        registry.register(Arc::new(EchoFactory)).unwrap();
        assert_eq!(
            registry.register(Arc::new(EchoFactory)),
            Err(DuplicateProtocolError("wit".to_string()))
        );
    }

    #[test]
    fn handler_created_per_capability() {
        let registry = ProtocolRegistry::new();
        registry.register(Arc::new(EchoFactory)).unwrap();

        let (to_session, _commands) = mpsc::channel(1);
        let ctx = SessionContext {
            session_id: SessionId(0),
            peer_id: PeerId::ZERO,
            direction: Direction::Incoming,
            version: 0,
            to_session,
        };
        assert!(registry.create_handler(&Capability::new("wit".to_string(), 0), &ctx).is_some());
        assert!(registry.create_handler(&Capability::new("les".to_string(), 4), &ctx).is_none());
    }
}
