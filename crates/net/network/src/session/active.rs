//! Represents an established session.

use crate::{
    error::SessionError,
    message::{PeerMessage, PeerRequest, RequestError},
    metrics::SessionMetrics,
    protocol::{SatelliteFrame, SessionContext, SessionProtocolHandler},
    session::{
        correlator::MessageCorrelator,
        handle::{ActiveSessionMessage, SessionCommand},
        EthRlpxConnection, SessionId,
    },
    stats::PeerStats,
    ProtocolRegistry,
};
use alloy_primitives::bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use quartz_eth_wire::{
    errors::{EthHandshakeError, EthStreamError},
    Capability, EthMessage, EthMessageID, EthStreamFrame, EthVersion, PeerId,
};
use std::{
    collections::VecDeque,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, time::Interval};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;
use tracing::{debug, trace, warn};

/// A raw frame handed to the session workers for decoding and handling.
#[derive(Debug)]
pub(crate) struct RawEthFrame {
    /// The eth message id.
    pub(crate) id: EthMessageID,
    /// The undecoded payload.
    pub(crate) payload: BytesMut,
}

/// A frame queued for sending to the peer.
#[derive(Debug)]
pub(crate) enum OutgoingFrame {
    /// An eth protocol message.
    Eth(EthMessage),
    /// A frame of a satellite protocol.
    Satellite {
        /// The protocol code of the owning handler.
        protocol: String,
        /// The frame, with the id relative to the protocol's space.
        frame: SatelliteFrame,
    },
}

/// A satellite protocol handler installed into the session, together with the
/// message-id space it owns.
pub(crate) struct InstalledSatellite {
    /// The protocol code.
    pub(crate) code: String,
    /// Start of the protocol's space, relative to the shared subprotocol
    /// space.
    pub(crate) start: u8,
    /// Number of message ids the protocol occupies.
    pub(crate) messages: u8,
    /// The handler instance, exactly one per `(session, protocol)`.
    pub(crate) handler: Box<dyn SessionProtocolHandler>,
}

impl InstalledSatellite {
    const fn contains(&self, relative_id: u8) -> bool {
        relative_id >= self.start && relative_id < self.start + self.messages
    }
}

impl std::fmt::Debug for InstalledSatellite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledSatellite")
            .field("code", &self.code)
            .field("start", &self.start)
            .field("messages", &self.messages)
            .finish()
    }
}

/// The type that advances an established session by listening for incoming
/// messages (from local node or read from connection) and emitting events
/// back to the [`SessionManager`](crate::session::SessionManager).
///
/// It listens for
///    - incoming commands from the manager
///    - responses produced by the session's message workers
///    - incoming frames from the remote via the connection
///
/// Heavy messages are not decoded here: they enter the bounded queue towards
/// the two worker tasks, so a slow deserialization can never hold the socket.
/// If the queue is full the session disconnects instead of blocking.
pub(crate) struct ActiveSession {
    /// The underlying connection.
    pub(crate) conn: EthRlpxConnection,
    /// Identifier of the node we're connected to.
    pub(crate) remote_peer_id: PeerId,
    /// The address we're connected to.
    pub(crate) remote_addr: SocketAddr,
    /// Internal identifier of this session
    pub(crate) session_id: SessionId,
    /// The negotiated eth version.
    pub(crate) version: EthVersion,
    /// Incoming commands from the manager
    pub(crate) commands_rx: ReceiverStream<SessionCommand>,
    /// Sink to send messages to the session manager.
    pub(crate) to_manager: PollSender<ActiveSessionMessage>,
    /// A message that needs to be delivered to the session manager
    pub(crate) pending_message_to_manager: Option<ActiveSessionMessage>,
    /// Correlates requests we sent with their responses.
    pub(crate) correlator: Arc<MessageCorrelator>,
    /// Producer half of the bounded queue towards the message workers.
    pub(crate) heavy_tx: mpsc::Sender<RawEthFrame>,
    /// Frames queued by the workers, mostly responses to remote requests.
    pub(crate) outgoing_rx: ReceiverStream<OutgoingFrame>,
    /// Buffered messages that should be sent to the peer.
    pub(crate) queued_outgoing: VecDeque<OutgoingFrame>,
    /// The satellite protocol handlers installed into this session.
    pub(crate) satellites: Vec<InstalledSatellite>,
    /// Registry used to lazily instantiate handlers for dynamically added
    /// capabilities.
    pub(crate) registry: Arc<ProtocolRegistry>,
    /// Context cloned into newly created satellite handlers.
    pub(crate) protocol_ctx: SessionContext,
    /// Transfer-speed and event statistics of the remote peer.
    pub(crate) stats: Arc<PeerStats>,
    /// The maximum time we wait for a response from the peer.
    pub(crate) request_timeout: Duration,
    /// If the session does not receive a response at all within this duration
    /// then it is considered a protocol violation and the session will close.
    pub(crate) protocol_breach_request_timeout: Duration,
    /// Interval when to check for timed out requests.
    pub(crate) timeout_interval: Interval,
    /// Used to reserve a slot to guarantee that the termination message is delivered
    pub(crate) terminate_message: Option<(PollSender<ActiveSessionMessage>, ActiveSessionMessage)>,
    /// Session related metrics.
    pub(crate) metrics: SessionMetrics,
}

impl ActiveSession {
    /// Returns `true` if the session is currently in the process of disconnecting
    fn is_disconnecting(&self) -> bool {
        self.conn.inner().is_disconnecting()
    }

    /// Installs a handler for a capability that was agreed after the
    /// handshake, appending its message-id space after the installed ones.
    ///
    /// Installation is idempotent per protocol code.
    fn install_satellite(&mut self, cap: Capability) {
        if self.satellites.iter().any(|satellite| satellite.code == cap.name) {
            return
        }
        let mut ctx = self.protocol_ctx.clone();
        ctx.version = cap.version as u8;
        let Some(handler) = self.registry.create_handler(&cap, &ctx) else {
            debug!(target: "net::session", %cap, "no registered factory for added capability");
            return
        };

        let protocol = handler.protocol();
        let start = self
            .satellites
            .iter()
            .map(|satellite| satellite.start + satellite.messages)
            .max()
            .unwrap_or_else(|| self.version.total_messages());

        trace!(target: "net::session", %cap, start, "installing satellite protocol handler");
        self.satellites.push(InstalledSatellite {
            code: cap.name,
            start,
            messages: protocol.messages,
            handler,
        });
    }

    /// Handle an internal peer request that will be sent to the remote.
    fn on_internal_peer_request(&mut self, request: PeerRequest) {
        let msg = self.correlator.create(request, self.request_timeout);
        self.queued_outgoing.push_back(OutgoingFrame::Eth(msg));
    }

    /// Handle a command received from the manager.
    ///
    /// Returns the disconnect reason if the command requests a disconnect.
    fn on_command(&mut self, cmd: SessionCommand) -> Option<quartz_eth_wire::DisconnectReason> {
        match cmd {
            SessionCommand::Disconnect { reason } => {
                debug!(
                    target: "net::session",
                    ?reason,
                    remote_peer_id=?self.remote_peer_id,
                    "received disconnect command for session"
                );
                return Some(
                    reason.unwrap_or(quartz_eth_wire::DisconnectReason::DisconnectRequested),
                )
            }
            SessionCommand::Message(msg) => {
                self.queued_outgoing.push_back(OutgoingFrame::Eth(msg));
            }
            SessionCommand::Request(request) => {
                self.on_internal_peer_request(request);
            }
            SessionCommand::Satellite { protocol, frame } => {
                self.queued_outgoing.push_back(OutgoingFrame::Satellite { protocol, frame });
            }
            SessionCommand::AddCapability(cap) => {
                self.conn.inner_mut().queue_add_capability(&cap);
                self.install_satellite(cap);
            }
        }
        None
    }

    /// Handle a frame read from the connection.
    ///
    /// Returns an error if the frame puts the session into a state where it
    /// must close.
    fn on_incoming_frame(&mut self, frame: EthStreamFrame) -> Result<(), SessionError> {
        match frame {
            EthStreamFrame::Eth { id, payload } => {
                if id.is_correlated() {
                    // heavy message: decoded and handled by the workers
                    match self.heavy_tx.try_send(RawEthFrame { id, payload }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(
                                target: "net::session",
                                remote_peer_id=?self.remote_peer_id,
                                ?id,
                                "incoming message queue full, dropping session"
                            );
                            self.metrics.incoming_queue_full.increment(1);
                            return Err(SessionError::IncomingQueueFull)
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            return Err(SessionError::IncomingQueueFull)
                        }
                    }
                    Ok(())
                } else {
                    self.on_light_message(id, payload)
                }
            }
            EthStreamFrame::Satellite { relative_id, payload } => {
                self.on_satellite_frame(relative_id, payload)
            }
        }
    }

    /// Decodes and handles a gossip message inline. These are cheap to decode
    /// and never enter the worker queue.
    fn on_light_message(&mut self, id: EthMessageID, payload: BytesMut) -> Result<(), SessionError> {
        let message = match EthMessage::decode_payload(id, self.version, &mut payload.as_ref()) {
            Ok(message) => message,
            Err(err) => {
                debug!(target: "net::session", %err, ?id, "failed to decode gossip message");
                self.on_bad_message();
                return Ok(())
            }
        };

        let peer_message = match message {
            EthMessage::Status(_) => {
                return Err(SessionError::Stream(EthStreamError::EthHandshakeError(
                    EthHandshakeError::StatusNotInHandshake,
                )))
            }
            EthMessage::NewBlockHashes(msg) => PeerMessage::NewBlockHashes(msg),
            EthMessage::NewBlock(msg) => {
                let hash = msg.block.header.hash_slow();
                PeerMessage::NewBlock(crate::message::NewBlockMessage {
                    hash,
                    block: Arc::new(*msg),
                })
            }
            EthMessage::Transactions(msg) => PeerMessage::ReceivedTransaction(msg),
            EthMessage::NewPooledTransactionHashes(msg) => {
                PeerMessage::PooledTransactionHashes(msg)
            }
            message => {
                // correlated messages never take this path
                debug!(target: "net::session", ?message, "unexpected message routed inline");
                return Ok(())
            }
        };

        self.try_emit_message(peer_message);
        Ok(())
    }

    /// Routes a satellite frame to the handler owning its message-id space.
    fn on_satellite_frame(
        &mut self,
        relative_id: u8,
        payload: BytesMut,
    ) -> Result<(), SessionError> {
        let Some(satellite) =
            self.satellites.iter_mut().find(|satellite| satellite.contains(relative_id))
        else {
            debug!(
                target: "net::session",
                relative_id,
                remote_peer_id=?self.remote_peer_id,
                "frame for unknown subprotocol space"
            );
            self.on_bad_message();
            return Ok(())
        };

        match satellite.handler.on_message(relative_id - satellite.start, payload) {
            Ok(frames) => {
                let protocol = satellite.code.clone();
                for frame in frames {
                    self.queued_outgoing
                        .push_back(OutgoingFrame::Satellite { protocol: protocol.clone(), frame });
                }
                Ok(())
            }
            Err(err) => {
                // the handler error is logged but never propagated above the session
                warn!(
                    target: "net::session",
                    protocol=%satellite.code,
                    %err,
                    remote_peer_id=?self.remote_peer_id,
                    "subprotocol handler failed, closing session"
                );
                Err(SessionError::ProtocolHandler {
                    protocol: satellite.code.clone(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Sends a gossip message to the manager, buffering it if the channel is
    /// currently full.
    fn try_emit_message(&mut self, message: PeerMessage) {
        let Some(sender) = self.to_manager.get_ref() else { return };
        let message =
            ActiveSessionMessage::ValidMessage { peer_id: self.remote_peer_id, message };
        match sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                trace!(target: "net::session", "no capacity for incoming gossip message");
                self.pending_message_to_manager = Some(message);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Notify the manager that the peer sent a bad message
    fn on_bad_message(&self) {
        let Some(sender) = self.to_manager.get_ref() else { return };
        let _ = sender.try_send(ActiveSessionMessage::BadMessage { peer_id: self.remote_peer_id });
    }

    /// Report back that this session has been closed.
    fn emit_disconnect(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        trace!(target: "net::session", remote_peer_id=?self.remote_peer_id, "emitting disconnect");
        let msg = ActiveSessionMessage::Disconnected {
            peer_id: self.remote_peer_id,
            remote_addr: self.remote_addr,
        };

        self.terminate_message = Some((self.to_manager.clone(), msg));
        self.poll_terminate_message(cx).expect("message is set")
    }

    /// Report back that this session has been closed due to an error
    fn close_on_error(&mut self, error: SessionError, cx: &mut Context<'_>) -> Poll<()> {
        // try to tell the peer why we are dropping it, best effort
        let _ = self.conn.inner_mut().start_disconnect(error.disconnect_reason());
        let msg = ActiveSessionMessage::ClosedOnConnectionError {
            peer_id: self.remote_peer_id,
            remote_addr: self.remote_addr,
            error,
        };
        self.terminate_message = Some((self.to_manager.clone(), msg));
        self.poll_terminate_message(cx).expect("message is set")
    }

    /// Starts the disconnect process
    fn start_disconnect(
        &mut self,
        reason: quartz_eth_wire::DisconnectReason,
    ) -> Result<(), EthStreamError> {
        self.conn.inner_mut().start_disconnect(reason).map_err(Into::into)
    }

    /// Flushes the disconnect message and emits the corresponding message
    fn poll_disconnect(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        debug_assert!(self.is_disconnecting(), "not disconnecting");

        // try to close to flush out the remaining disconnect message
        let _ = ready!(self.conn.poll_close_unpin(cx));
        self.emit_disconnect(cx)
    }

    /// Attempts to disconnect by sending the given disconnect reason
    fn try_disconnect(
        &mut self,
        reason: quartz_eth_wire::DisconnectReason,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        match self.start_disconnect(reason) {
            Ok(()) => {
                // we're done
                self.poll_disconnect(cx)
            }
            Err(err) => {
                debug!(target: "net::session", %err, remote_peer_id=?self.remote_peer_id, "could not send disconnect");
                self.close_on_error(SessionError::Stream(err), cx)
            }
        }
    }

    /// If a termination message is queued this will try to send it
    fn poll_terminate_message(&mut self, cx: &mut Context<'_>) -> Option<Poll<()>> {
        let (mut tx, msg) = self.terminate_message.take()?;
        match tx.poll_reserve(cx) {
            Poll::Pending => {
                self.terminate_message = Some((tx, msg));
                return Some(Poll::Pending)
            }
            Poll::Ready(Ok(())) => {
                let _ = tx.send_item(msg);
            }
            Poll::Ready(Err(_)) => {
                // channel closed
            }
        }
        // terminate the task
        Some(Poll::Ready(()))
    }
}

impl Future for ActiveSession {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // if the session is terminating we have to send the termination message before we can
        // close
        if let Some(terminate) = this.poll_terminate_message(cx) {
            return terminate
        }

        if this.is_disconnecting() {
            return this.poll_disconnect(cx)
        }

        // The receive loop can be CPU intensive, so we limit the amount of work per poll and
        // yield back to the scheduler when the budget is exhausted.
        let mut budget = 4;

        'main: loop {
            let mut progress = false;

            // we prioritize incoming commands sent from the session manager
            loop {
                match this.commands_rx.poll_next_unpin(cx) {
                    Poll::Pending => break,
                    Poll::Ready(None) => {
                        // this is only possible when the manager was dropped, in which case we
                        // also terminate this session
                        return Poll::Ready(())
                    }
                    Poll::Ready(Some(cmd)) => {
                        progress = true;
                        if let Some(reason) = this.on_command(cmd) {
                            return this.try_disconnect(reason, cx)
                        }
                    }
                }
            }

            // frames produced by the workers, mostly responses to requests from the remote
            while let Poll::Ready(Some(frame)) = this.outgoing_rx.poll_next_unpin(cx) {
                progress = true;
                this.queued_outgoing.push_back(frame);
            }

            // install handlers for capabilities the peer announced dynamically
            for cap in this.conn.inner_mut().take_added_capabilities() {
                this.install_satellite(cap);
            }

            // Send messages by advancing the sink and queuing in buffered messages
            while this.conn.poll_ready_unpin(cx).is_ready() {
                let Some(frame) = this.queued_outgoing.pop_front() else { break };
                progress = true;
                let res = match frame {
                    OutgoingFrame::Eth(msg) => this.conn.start_send_unpin(msg),
                    OutgoingFrame::Satellite { protocol, frame } => {
                        match this
                            .satellites
                            .iter()
                            .find(|satellite| satellite.code == protocol)
                        {
                            Some(satellite) => this
                                .conn
                                .start_send_satellite(satellite.start + frame.id, &frame.payload),
                            None => {
                                debug!(
                                    target: "net::session",
                                    %protocol,
                                    "dropping frame for uninstalled subprotocol"
                                );
                                Ok(())
                            }
                        }
                    }
                };
                if let Err(err) = res {
                    debug!(target: "net::session", %err, remote_peer_id=?this.remote_peer_id, "failed to send message");
                    // notify the manager
                    return this.close_on_error(SessionError::Stream(err), cx)
                }
            }
            let _ = this.conn.poll_flush_unpin(cx);

            // read incoming frames from the wire
            'receive: loop {
                // ensure we still have enough budget for another iteration
                budget -= 1;
                if budget == 0 {
                    // make sure we're woken up again
                    cx.waker().wake_by_ref();
                    break 'main
                }

                // try to resend a gossip message that we could not deliver because the channel
                // was full
                if let Some(msg) = this.pending_message_to_manager.take() {
                    match this.to_manager.poll_reserve(cx) {
                        Poll::Ready(Ok(())) => {
                            let _ = this.to_manager.send_item(msg);
                        }
                        Poll::Ready(Err(_)) => return Poll::Ready(()),
                        Poll::Pending => {
                            this.pending_message_to_manager = Some(msg);
                            break 'receive
                        }
                    };
                }

                match this.conn.poll_next_unpin(cx) {
                    Poll::Pending => break,
                    Poll::Ready(None) => {
                        if this.is_disconnecting() {
                            break
                        }
                        debug!(target: "net::session", remote_peer_id=?this.remote_peer_id, "eth stream completed");
                        return this.emit_disconnect(cx)
                    }
                    Poll::Ready(Some(res)) => match res {
                        Ok(frame) => {
                            progress = true;
                            if let Err(err) = this.on_incoming_frame(frame) {
                                return this.close_on_error(err, cx)
                            }
                        }
                        Err(err) => {
                            debug!(target: "net::session", %err, remote_peer_id=?this.remote_peer_id, "failed to receive message");
                            return this.close_on_error(SessionError::Stream(err), cx)
                        }
                    },
                }
            }

            if !progress {
                break 'main
            }
        }

        while this.timeout_interval.poll_tick(cx).is_ready() {
            let (timed_out, breached) = this
                .correlator
                .check_timed_out(Instant::now(), this.protocol_breach_request_timeout);

            // a timed out request counts as observed idle time, penalizing
            // the peer in future peer selection
            for kind in timed_out {
                this.stats.add_transfer_speed(kind, 0);
            }

            if breached {
                if let Poll::Ready(Ok(())) = this.to_manager.poll_reserve(cx) {
                    let msg =
                        ActiveSessionMessage::ProtocolBreach { peer_id: this.remote_peer_id };
                    this.pending_message_to_manager = Some(msg);
                }
            }
        }

        Poll::Pending
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        // every outstanding request terminates with a cancellation error and
        // every handler is disposed exactly once
        self.correlator.drain(RequestError::ConnectionDropped);
        for satellite in &mut self.satellites {
            satellite.handler.on_disconnect();
        }
    }
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("session_id", &self.session_id)
            .field("remote_peer_id", &self.remote_peer_id)
            .field("remote_addr", &self.remote_addr)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
