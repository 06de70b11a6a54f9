//! Support for handling peer sessions.
//!
//! The [`SessionManager`] owns every live session: it spawns pending sessions
//! that run the `p2p` and `eth` handshakes, promotes them to active sessions,
//! routes commands in and events out, applies the reconnection throttle
//! before dialing, and records connection events into the per-peer
//! statistics.

use crate::{
    error::{NetworkError, PendingSessionHandshakeError},
    eth_requests::IncomingEthRequest,
    message::PeerMessage,
    metrics::{DisconnectMetrics, NetworkMetrics, SessionMetrics},
    protocol::{ProtocolRegistry, SessionContext},
    session::{
        active::{ActiveSession, InstalledSatellite},
        correlator::MessageCorrelator,
        worker::SessionWorker,
    },
    stats::{DisconnectSide, NodeStats, PeerEventKind},
    traits::{Discovery, NodeRecord, SyncPeerPool},
};
use alloy_primitives::bytes::{Bytes, BytesMut};
use futures::{Sink, Stream, StreamExt};
use quartz_eth_wire::{
    Capabilities, Capability, DisconnectReason, EthStream, EthVersion,
    HelloMessageWithProtocols, P2PStream, PeerId, Protocol, Status, UnauthedEthStream,
    UnauthedP2PStream, MAX_RESERVED_MESSAGE_ID,
};
use quartz_ethereum_forks::ForkFilter;
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;
use tracing::{debug, trace};

mod active;
mod config;
mod correlator;
mod handle;
mod state;
mod worker;

pub use config::{SessionsConfig, INITIAL_REQUEST_TIMEOUT, PROTOCOL_BREACH_REQUEST_TIMEOUT};
pub use handle::{
    ActiveSessionHandle, ActiveSessionMessage, PendingSessionEvent, PendingSessionHandle,
    SessionCommand,
};
pub use state::{InvalidStateTransition, SessionState, SessionStateTracker};

use crate::error::SessionError;

/// Internal identifier for active sessions.
#[derive(Debug, Clone, Copy, PartialOrd, PartialEq, Eq, Hash)]
pub struct SessionId(pub usize);

/// The direction of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Incoming connection.
    Incoming,
    /// Outgoing connection to a specific node.
    Outgoing(PeerId),
}

impl Direction {
    /// Returns `true` if this is an incoming connection.
    pub const fn is_incoming(&self) -> bool {
        matches!(self, Self::Incoming)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing(_) => write!(f, "outgoing"),
        }
    }
}

/// A framed byte transport produced by the RLPx layer below this crate.
///
/// The actual encryption and frame integrity live in that layer; sessions
/// only require ordered framed bytes.
pub trait RlpxTransport:
    Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Send
{
}

impl<T> RlpxTransport for T where
    T: Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Send
{
}

/// A type-erased [`RlpxTransport`].
pub type BoxRlpxTransport = Pin<Box<dyn RlpxTransport>>;

/// The connection of an established session.
pub type EthRlpxConnection = EthStream<P2PStream<BoxRlpxTransport>>;

/// Events produced by the [`SessionManager`].
#[derive(Debug)]
pub enum SessionEvent {
    /// A new session was successfully authenticated.
    SessionEstablished {
        /// The remote node's public key.
        peer_id: PeerId,
        /// The remote node's socket address.
        remote_addr: SocketAddr,
        /// The user agent of the remote node.
        client_version: Arc<str>,
        /// The capabilities the remote node announced.
        capabilities: Arc<Capabilities>,
        /// The negotiated eth version.
        version: EthVersion,
        /// The direction of the session.
        direction: Direction,
    },
    /// An active session was gracefully closed.
    SessionClosed {
        /// The remote node's public key.
        peer_id: PeerId,
        /// The remote node's socket address.
        remote_addr: SocketAddr,
    },
    /// An active session was closed on an error.
    SessionClosedOnConnectionError {
        /// The remote node's public key.
        peer_id: PeerId,
        /// The remote node's socket address.
        remote_addr: SocketAddr,
        /// The error that closed the session.
        error: SessionError,
    },
    /// A pending session failed during authentication.
    PendingSessionClosed {
        /// The remote node's socket address.
        remote_addr: SocketAddr,
        /// The direction of the attempted session.
        direction: Direction,
        /// The handshake error, if the session failed with one.
        error: Option<PendingSessionHandshakeError>,
    },
    /// A valid gossip message was received from a peer.
    Message {
        /// The remote node's public key.
        peer_id: PeerId,
        /// The received message.
        message: PeerMessage,
    },
    /// A peer sent a malformed or unexpected message.
    BadMessage {
        /// The remote node's public key.
        peer_id: PeerId,
    },
    /// A peer exceeded the protocol-breach request window.
    ProtocolBreach {
        /// The remote node's public key.
        peer_id: PeerId,
    },
}

/// Manages a set of peer sessions.
#[must_use = "Manager does nothing unless polled"]
pub struct SessionManager {
    /// Tracks the identifier for the next session.
    next_id: usize,
    /// Configuration for sessions.
    config: SessionsConfig,
    /// The hello message to send during the `p2p` handshake.
    hello: HelloMessageWithProtocols,
    /// The status message template for the `eth` handshake.
    status: Status,
    /// Used to validate the remote's fork id during the handshake.
    fork_filter: ForkFilter,
    /// The open registry of satellite protocol factories.
    registry: Arc<ProtocolRegistry>,
    /// Per-peer statistics, persistent across sessions.
    stats: Arc<NodeStats>,
    /// Channel to the eth request server, cloned into the session workers.
    eth_requests: mpsc::UnboundedSender<IncomingEthRequest>,
    /// Discovery hook for learned listen ports.
    discovery: Arc<dyn Discovery>,
    /// The sync peer registry fed by session lifecycle events.
    sync_peers: Arc<dyn SyncPeerPool>,
    /// All sessions that are still authenticating.
    pending_sessions: HashMap<SessionId, PendingSessionHandle>,
    /// All active sessions, keyed by the remote's public key.
    active_sessions: HashMap<PeerId, ActiveSessionHandle>,
    /// Sender half used by pending session tasks.
    pending_sessions_tx: mpsc::Sender<PendingSessionEvent>,
    /// Receiver for events produced by pending session tasks.
    pending_session_rx: ReceiverStream<PendingSessionEvent>,
    /// Sender half used by active session tasks.
    active_session_tx: mpsc::Sender<ActiveSessionMessage>,
    /// Receiver for messages produced by active session tasks.
    active_session_rx: ReceiverStream<ActiveSessionMessage>,
    /// Network wide metrics.
    metrics: NetworkMetrics,
    /// Counters per disconnect reason.
    disconnect_metrics: DisconnectMetrics,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("next_id", &self.next_id)
            .field("pending_sessions", &self.pending_sessions.len())
            .field("active_sessions", &self.active_sessions.len())
            .finish_non_exhaustive()
    }
}

// === impl SessionManager ===

impl SessionManager {
    /// Creates a new empty [`SessionManager`].
    pub fn new(
        hello: HelloMessageWithProtocols,
        status: Status,
        fork_filter: ForkFilter,
        config: SessionsConfig,
        eth_requests: mpsc::UnboundedSender<IncomingEthRequest>,
        discovery: Arc<dyn Discovery>,
        sync_peers: Arc<dyn SyncPeerPool>,
    ) -> Self {
        let (pending_sessions_tx, pending_sessions_rx) = mpsc::channel(config.session_event_buffer);
        let (active_session_tx, active_session_rx) = mpsc::channel(config.session_event_buffer);

        Self {
            next_id: 0,
            config,
            hello,
            status,
            fork_filter,
            registry: Arc::new(ProtocolRegistry::new()),
            stats: Arc::new(NodeStats::default()),
            eth_requests,
            discovery,
            sync_peers,
            pending_sessions: HashMap::new(),
            active_sessions: HashMap::new(),
            pending_sessions_tx,
            pending_session_rx: ReceiverStream::new(pending_sessions_rx),
            active_session_tx,
            active_session_rx: ReceiverStream::new(active_session_rx),
            metrics: NetworkMetrics::default(),
            disconnect_metrics: DisconnectMetrics::default(),
        }
    }

    /// Returns the next session id.
    fn next_id(&mut self) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        SessionId(id)
    }

    /// Returns the per-peer statistics map.
    pub fn node_stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    /// Returns the protocol registry for satellite protocols.
    pub fn protocol_registry(&self) -> Arc<ProtocolRegistry> {
        Arc::clone(&self.registry)
    }

    /// Returns the handle of the active session with the given peer, if one
    /// exists.
    pub fn active_session(&self, peer_id: &PeerId) -> Option<&ActiveSessionHandle> {
        self.active_sessions.get(peer_id)
    }

    /// Returns an iterator over all active session handles.
    pub fn active_sessions(&self) -> impl Iterator<Item = &ActiveSessionHandle> {
        self.active_sessions.values()
    }

    /// Adds a capability to the set advertised in future handshakes.
    ///
    /// Fails if the protocol code is already advertised.
    pub fn add_supported_capability(&mut self, protocol: Protocol) -> Result<(), Protocol> {
        self.hello.try_add_protocol(protocol)
    }

    /// Broadcasts an add-capability announcement to every live session that
    /// has not already agreed the capability during its handshake.
    pub fn send_new_capability(&mut self, cap: Capability) {
        for handle in self.active_sessions.values() {
            if handle.capabilities.contains(&cap) {
                continue
            }
            let _ = handle
                .commands_to_session
                .clone()
                .try_send(SessionCommand::AddCapability(cap.clone()));
        }
    }

    /// Updates the status template and fork filter for new sessions after the
    /// chain advanced.
    pub fn on_new_head(&mut self, head: quartz_ethereum_forks::Head) {
        self.status.blockhash = head.hash;
        self.status.total_difficulty = head.total_difficulty;
        self.fork_filter.set_head(head);
        self.status.forkid = self.fork_filter.current();
    }

    /// An incoming TCP connection was received, spawns the authentication
    /// task.
    pub fn on_incoming(&mut self, transport: BoxRlpxTransport, remote_addr: SocketAddr) -> SessionId {
        self.metrics.total_incoming_connections.increment(1);
        self.spawn_pending(transport, remote_addr, Direction::Incoming)
    }

    /// Dials the peer over the given transport.
    ///
    /// Fails if the peer's reconnection throttle window has not elapsed, or a
    /// session already exists.
    pub fn dial(
        &mut self,
        transport: BoxRlpxTransport,
        peer_id: PeerId,
        remote_addr: SocketAddr,
    ) -> Result<SessionId, NetworkError> {
        if self.active_sessions.contains_key(&peer_id) {
            return Err(NetworkError::AlreadyConnected)
        }

        if let Some(stats) = self.stats.get(&peer_id) {
            let (delayed, cause) = stats.is_connection_delayed();
            if delayed {
                trace!(target: "net::session", ?peer_id, ?cause, "dial attempt throttled");
                self.metrics.throttled_dials.increment(1);
                return Err(NetworkError::DelayedPeer)
            }
        }

        self.stats.peer(peer_id).add_event(PeerEventKind::Connecting);
        self.metrics.total_outgoing_connections.increment(1);
        Ok(self.spawn_pending(transport, remote_addr, Direction::Outgoing(peer_id)))
    }

    /// Reports that an outgoing connection attempt failed before a transport
    /// existed, so the throttle covers unreachable peers too.
    pub fn on_outgoing_connection_failure(&self, peer_id: PeerId, unreachable: bool) {
        let kind = if unreachable {
            PeerEventKind::ConnectionFailedTargetUnreachable
        } else {
            PeerEventKind::ConnectionFailed
        };
        self.stats.peer(peer_id).add_event(kind);
    }

    /// Sends a disconnect command to the session with the given peer.
    pub fn disconnect(&mut self, peer_id: PeerId, reason: Option<DisconnectReason>) {
        if let Some(handle) = self.active_sessions.get_mut(&peer_id) {
            let _ = handle.state.advance(SessionState::DisconnectRequested);
            handle.requested_disconnect = reason.or(Some(DisconnectReason::DisconnectRequested));
            handle.disconnect(reason);
        }
    }

    fn spawn_pending(
        &mut self,
        transport: BoxRlpxTransport,
        remote_addr: SocketAddr,
        direction: Direction,
    ) -> SessionId {
        let session_id = self.next_id();
        let (disconnect_tx, disconnect_rx) = oneshot::channel();

        let events = self.pending_sessions_tx.clone();
        let hello = self.hello.clone();
        let status = self.status;
        let fork_filter = self.fork_filter.clone();

        tokio::spawn(pending_session_task(
            disconnect_rx,
            events,
            session_id,
            remote_addr,
            direction,
            transport,
            hello,
            status,
            fork_filter,
        ));

        self.pending_sessions.insert(
            session_id,
            PendingSessionHandle { disconnect_tx: Some(disconnect_tx), direction },
        );
        session_id
    }

    /// Promotes a successfully authenticated pending session to an active
    /// session.
    #[allow(clippy::too_many_arguments)]
    fn on_session_established(
        &mut self,
        session_id: SessionId,
        remote_addr: SocketAddr,
        peer_id: PeerId,
        capabilities: Arc<Capabilities>,
        status: Box<quartz_eth_wire::StatusMessage>,
        conn: EthRlpxConnection,
        direction: Direction,
        client_id: String,
        listen_port: u16,
    ) -> Option<SessionEvent> {
        self.pending_sessions.remove(&session_id);

        if self.active_sessions.contains_key(&peer_id) {
            debug!(target: "net::session", ?peer_id, "duplicate session, disconnecting");
            tokio::spawn(async move {
                let _ =
                    conn.into_inner().disconnect(DisconnectReason::AlreadyConnected).await;
            });
            self.disconnect_metrics.increment(DisconnectReason::AlreadyConnected);
            return None
        }

        let version = conn.version();
        let p2p_version = conn.inner().p2p_version();
        let stats = self.stats.peer(peer_id);

        // listen-port discovery: an inbound peer connects from an ephemeral
        // port but may advertise where it actually listens
        if direction.is_incoming() && listen_port != 0 && listen_port != remote_addr.port() {
            self.discovery.add_node(NodeRecord::new(peer_id, remote_addr.ip(), listen_port));
        }

        let (commands_to_session, commands_rx) =
            mpsc::channel(self.config.session_command_buffer);
        let (heavy_tx, heavy_rx) = mpsc::channel(self.config.heavy_message_queue_capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.config.session_command_buffer);
        let correlator = Arc::new(MessageCorrelator::new(version));

        let protocol_ctx = SessionContext {
            session_id,
            peer_id,
            direction,
            version: version as u8,
            to_session: commands_to_session.clone(),
        };

        // exactly one handler per negotiated satellite capability
        let mut satellites = Vec::new();
        for shared in conn.inner().shared_capabilities().iter_caps() {
            if shared.eth_version().is_some() {
                continue
            }
            let cap = Capability::new(shared.name().to_string(), shared.version() as usize);
            let mut ctx = protocol_ctx.clone();
            ctx.version = shared.version();
            if let Some(handler) = self.registry.create_handler(&cap, &ctx) {
                satellites.push(InstalledSatellite {
                    code: cap.name,
                    start: shared.message_id_offset() - MAX_RESERVED_MESSAGE_ID - 1,
                    messages: shared.num_messages(),
                    handler,
                });
            }
        }

        let heavy_rx = Arc::new(tokio::sync::Mutex::new(heavy_rx));
        let worker_metrics = Arc::new(crate::metrics::MessageMetrics::default());
        for _ in 0..self.config.session_workers {
            let worker = SessionWorker {
                version,
                peer_id,
                heavy_rx: Arc::clone(&heavy_rx),
                correlator: Arc::clone(&correlator),
                stats: Arc::clone(&stats),
                eth_requests: self.eth_requests.clone(),
                outgoing: outgoing_tx.clone(),
                to_manager: self.active_session_tx.clone(),
                metrics: Arc::clone(&worker_metrics),
            };
            tokio::spawn(worker.run());
        }

        let session = ActiveSession {
            conn,
            remote_peer_id: peer_id,
            remote_addr,
            session_id,
            version,
            commands_rx: ReceiverStream::new(commands_rx),
            to_manager: PollSender::new(self.active_session_tx.clone()),
            pending_message_to_manager: None,
            correlator,
            heavy_tx,
            outgoing_rx: ReceiverStream::new(outgoing_rx),
            queued_outgoing: Default::default(),
            satellites,
            registry: Arc::clone(&self.registry),
            protocol_ctx,
            stats,
            request_timeout: self.config.request_timeout,
            protocol_breach_request_timeout: self.config.protocol_breach_request_timeout,
            timeout_interval: tokio::time::interval(self.config.request_timeout),
            terminate_message: None,
            metrics: SessionMetrics::default(),
        };
        tokio::spawn(session);

        let mut state = SessionStateTracker::new();
        let _ = state.advance(SessionState::HandshakeComplete);
        let _ = state.advance(SessionState::Initialized);

        let client_version: Arc<str> = client_id.into();
        self.sync_peers.add_peer(peer_id, status.blockhash(), status.total_difficulty());

        self.active_sessions.insert(
            peer_id,
            ActiveSessionHandle {
                direction,
                session_id,
                version,
                p2p_version,
                remote_id: peer_id,
                established: Instant::now(),
                capabilities: Arc::clone(&capabilities),
                commands_to_session,
                client_version: Arc::clone(&client_version),
                remote_addr,
                status: Arc::new(*status),
                state,
                requested_disconnect: None,
            },
        );

        Some(SessionEvent::SessionEstablished {
            peer_id,
            remote_addr,
            client_version,
            capabilities,
            version,
            direction,
        })
    }

    /// Removes the active session and records the disconnect in the peer's
    /// statistics.
    fn on_session_closed(
        &mut self,
        peer_id: PeerId,
        side: DisconnectSide,
        reason: DisconnectReason,
    ) {
        if let Some(mut handle) = self.active_sessions.remove(&peer_id) {
            let _ = handle.state.advance(SessionState::Disconnected);
        }
        self.stats.peer(peer_id).add_disconnect(side, reason);
        self.disconnect_metrics.increment(reason);
        self.metrics.closed_sessions.increment(1);
        self.sync_peers.remove_peer(peer_id);
    }

    /// Advances the manager, producing the next session event.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<SessionEvent> {
        loop {
            // messages from active sessions first, they are the hot path
            match self.active_session_rx.poll_next_unpin(cx) {
                Poll::Pending => {}
                Poll::Ready(None) => unreachable!("manager holds a sender half"),
                Poll::Ready(Some(message)) => match message {
                    ActiveSessionMessage::Disconnected { peer_id, remote_addr } => {
                        let (side, reason) = match self
                            .active_sessions
                            .get(&peer_id)
                            .and_then(|handle| handle.requested_disconnect)
                        {
                            Some(reason) => (DisconnectSide::Local, reason),
                            None => (DisconnectSide::Remote, DisconnectReason::DisconnectRequested),
                        };
                        self.on_session_closed(peer_id, side, reason);
                        return Poll::Ready(SessionEvent::SessionClosed { peer_id, remote_addr })
                    }
                    ActiveSessionMessage::ClosedOnConnectionError {
                        peer_id,
                        remote_addr,
                        error,
                    } => {
                        // a disconnect message from the remote also surfaces
                        // as a stream error, attribute it to the right side
                        let (side, reason) = match &error {
                            SessionError::Stream(err) => match err.as_disconnected() {
                                Some(reason) => (DisconnectSide::Remote, reason),
                                None => (DisconnectSide::Local, error.disconnect_reason()),
                            },
                            _ => (DisconnectSide::Local, error.disconnect_reason()),
                        };
                        self.on_session_closed(peer_id, side, reason);
                        return Poll::Ready(SessionEvent::SessionClosedOnConnectionError {
                            peer_id,
                            remote_addr,
                            error,
                        })
                    }
                    ActiveSessionMessage::ValidMessage { peer_id, message } => {
                        return Poll::Ready(SessionEvent::Message { peer_id, message })
                    }
                    ActiveSessionMessage::BadMessage { peer_id } => {
                        return Poll::Ready(SessionEvent::BadMessage { peer_id })
                    }
                    ActiveSessionMessage::ProtocolBreach { peer_id } => {
                        self.disconnect(peer_id, Some(DisconnectReason::ProtocolBreach));
                        return Poll::Ready(SessionEvent::ProtocolBreach { peer_id })
                    }
                },
            }

            match self.pending_session_rx.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => unreachable!("manager holds a sender half"),
                Poll::Ready(Some(event)) => match event {
                    PendingSessionEvent::Established {
                        session_id,
                        remote_addr,
                        peer_id,
                        capabilities,
                        status,
                        conn,
                        direction,
                        client_id,
                        p2p_version: _,
                        listen_port,
                    } => {
                        if let Some(established) = self.on_session_established(
                            session_id,
                            remote_addr,
                            peer_id,
                            capabilities,
                            status,
                            *conn,
                            direction,
                            client_id,
                            listen_port,
                        ) {
                            return Poll::Ready(established)
                        }
                    }
                    PendingSessionEvent::Disconnected {
                        remote_addr,
                        session_id,
                        direction,
                        error,
                    } => {
                        self.pending_sessions.remove(&session_id);
                        self.metrics.pending_session_failures.increment(1);

                        // record the failure so the reconnection throttle
                        // holds the peer back
                        if let Direction::Outgoing(peer_id) = direction {
                            let stats = self.stats.peer(peer_id);
                            match error.as_ref().and_then(|err| err.as_chain_mismatch()) {
                                Some(_) => {
                                    stats.add_disconnect(
                                        DisconnectSide::Local,
                                        DisconnectReason::UselessPeer,
                                    );
                                    self.disconnect_metrics
                                        .increment(DisconnectReason::UselessPeer);
                                }
                                None => stats.add_event(PeerEventKind::ConnectionFailed),
                            }
                        }

                        return Poll::Ready(SessionEvent::PendingSessionClosed {
                            remote_addr,
                            direction,
                            error,
                        })
                    }
                },
            }
        }
    }
}

/// Runs the authentication of a pending session: the `p2p` hello exchange
/// followed by the `eth` status exchange with fork-id validation.
#[allow(clippy::too_many_arguments)]
async fn pending_session_task(
    disconnect_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<PendingSessionEvent>,
    session_id: SessionId,
    remote_addr: SocketAddr,
    direction: Direction,
    transport: BoxRlpxTransport,
    hello: HelloMessageWithProtocols,
    status: Status,
    fork_filter: ForkFilter,
) {
    let authenticate = authenticate(
        session_id,
        remote_addr,
        direction,
        transport,
        hello,
        status,
        fork_filter,
    );

    tokio::select! {
        _ = disconnect_rx => {
            let _ = events
                .send(PendingSessionEvent::Disconnected {
                    remote_addr,
                    session_id,
                    direction,
                    error: None,
                })
                .await;
        }
        event = authenticate => {
            let _ = events.send(event).await;
        }
    }
}

async fn authenticate(
    session_id: SessionId,
    remote_addr: SocketAddr,
    direction: Direction,
    transport: BoxRlpxTransport,
    hello: HelloMessageWithProtocols,
    mut status: Status,
    fork_filter: ForkFilter,
) -> PendingSessionEvent {
    macro_rules! fail {
        ($err:expr) => {
            return PendingSessionEvent::Disconnected {
                remote_addr,
                session_id,
                direction,
                error: Some(PendingSessionHandshakeError::Eth($err)),
            }
        };
    }

    // conduct the p2p handshake and return the authenticated stream
    let unauthed = UnauthedP2PStream::new(transport);
    let (p2p_stream, their_hello) = match unauthed.handshake(hello).await {
        Ok(stream_res) => stream_res,
        Err(err) => fail!(err.into()),
    };

    // if this is an outgoing connection the remote must be who we dialed
    if let Direction::Outgoing(expected_peer) = direction {
        if their_hello.id != expected_peer {
            let mut p2p_stream = p2p_stream;
            let _ = p2p_stream.start_disconnect(DisconnectReason::UnexpectedHandshakeIdentity);
            return PendingSessionEvent::Disconnected {
                remote_addr,
                session_id,
                direction,
                error: Some(PendingSessionHandshakeError::UnexpectedIdentity {
                    got: their_hello.id,
                    expected: expected_peer,
                }),
            }
        }
    }

    // ensure the mandatory eth protocol was negotiated
    let eth_version = match p2p_stream.shared_capabilities().eth_version() {
        Ok(version) => version,
        Err(err) => fail!(err.into()),
    };
    let eth_offset = p2p_stream
        .shared_capabilities()
        .eth()
        .map(|shared| shared.message_id_offset() - MAX_RESERVED_MESSAGE_ID - 1)
        .unwrap_or_default();
    let p2p_version = p2p_stream.p2p_version();

    // set up the negotiated version for the status handshake
    status.set_eth_version(eth_version);
    let eth_unauthed = UnauthedEthStream::new_with_offset(p2p_stream, eth_offset);
    let (conn, their_status) = match eth_unauthed.handshake(status, fork_filter).await {
        Ok(stream_res) => stream_res,
        Err(err) => fail!(err),
    };

    PendingSessionEvent::Established {
        session_id,
        remote_addr,
        peer_id: their_hello.id,
        capabilities: Arc::new(Capabilities::from(their_hello.capabilities)),
        status: Box::new(their_status),
        conn: Box::new(conn),
        direction,
        client_id: their_hello.client_version,
        p2p_version,
        listen_port: their_hello.port,
    }
}
