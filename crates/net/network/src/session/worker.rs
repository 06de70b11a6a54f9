//! The message workers of a session.
//!
//! Exactly two workers drain the bounded heavy-message queue of each session.
//! All payload decoding happens here, off the socket task: a message that is
//! expensive to deserialize delays other heavy messages of the same peer, but
//! never network IO.

use crate::{
    eth_requests::IncomingEthRequest,
    metrics::MessageMetrics,
    session::{
        active::{OutgoingFrame, RawEthFrame},
        correlator::{MessageCorrelator, ResponseOutcome},
        handle::ActiveSessionMessage,
    },
    stats::{PeerStats, TransferSpeedType},
};
use quartz_eth_wire::{EthMessage, EthVersion, PeerId, RequestPair};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

/// A worker task draining the session's heavy message queue.
///
/// The queue receiver is shared between the workers; messages of different
/// types can therefore complete out of arrival order, but every response is
/// still matched to its request unambiguously by the correlator.
pub(crate) struct SessionWorker {
    /// The negotiated eth version, needed for decoding.
    pub(crate) version: EthVersion,
    /// The remote peer.
    pub(crate) peer_id: PeerId,
    /// Consumer half of the heavy message queue, shared with the sibling
    /// worker.
    pub(crate) heavy_rx: Arc<Mutex<mpsc::Receiver<RawEthFrame>>>,
    /// Correlates responses with the requests the session sent.
    pub(crate) correlator: Arc<MessageCorrelator>,
    /// Transfer-speed statistics of the remote peer.
    pub(crate) stats: Arc<PeerStats>,
    /// Channel to the eth request server fulfilling requests from the remote.
    pub(crate) eth_requests: mpsc::UnboundedSender<IncomingEthRequest>,
    /// Channel back into the session for frames to send to the peer.
    pub(crate) outgoing: mpsc::Sender<OutgoingFrame>,
    /// Channel to the manager for reporting bad messages.
    pub(crate) to_manager: mpsc::Sender<ActiveSessionMessage>,
    /// Per-message-kind counters.
    pub(crate) metrics: Arc<MessageMetrics>,
}

impl SessionWorker {
    /// Runs until the session closes the queue.
    pub(crate) async fn run(mut self) {
        loop {
            let frame = { self.heavy_rx.lock().await.recv().await };
            let Some(frame) = frame else { return };
            self.on_frame(frame).await;
        }
    }

    async fn on_frame(&mut self, frame: RawEthFrame) {
        let payload_len = frame.payload.len();
        let message =
            match EthMessage::decode_payload(frame.id, self.version, &mut frame.payload.as_ref()) {
                Ok(message) => message,
                Err(err) => {
                    debug!(
                        target: "net::session",
                        %err,
                        id=?frame.id,
                        peer_id=?self.peer_id,
                        "failed to decode message"
                    );
                    let _ = self
                        .to_manager
                        .try_send(ActiveSessionMessage::BadMessage { peer_id: self.peer_id });
                    return
                }
            };

        self.metrics.record_received(frame.id);

        /// Forwards a request from the remote to the request server and
        /// queues the produced response, keyed with the remote's request id.
        macro_rules! on_request {
            ($pair:ident, $req_variant:ident, $resp_variant:ident) => {{
                let RequestPair { request_id, message: request } = $pair;
                let (tx, rx) = oneshot::channel();
                let sent = self.eth_requests.send(IncomingEthRequest::$req_variant {
                    peer_id: self.peer_id,
                    request,
                    response: tx,
                });
                if sent.is_err() {
                    trace!(target: "net::session", "eth request server unavailable");
                    return
                }
                match rx.await {
                    Ok(Ok(response)) => {
                        let msg =
                            EthMessage::$resp_variant(RequestPair::new(request_id, response));
                        let _ = self.outgoing.send(OutgoingFrame::Eth(msg)).await;
                    }
                    Ok(Err(err)) => {
                        debug!(target: "net::session", %err, "failed to serve request");
                    }
                    Err(_) => {
                        debug!(target: "net::session", "request server dropped the response");
                    }
                }
            }};
        }

        match message {
            EthMessage::GetBlockHeaders(pair) => on_request!(pair, GetBlockHeaders, BlockHeaders),
            EthMessage::GetBlockBodies(pair) => on_request!(pair, GetBlockBodies, BlockBodies),
            EthMessage::GetPooledTransactions(pair) => {
                on_request!(pair, GetPooledTransactions, PooledTransactions)
            }
            EthMessage::GetNodeData(pair) => on_request!(pair, GetNodeData, NodeData),
            EthMessage::GetReceipts(pair) => on_request!(pair, GetReceipts, Receipts),
            message => self.on_response(message, payload_len),
        }
    }

    /// Feeds a response into the correlator and records the transfer speed of
    /// the completed request.
    fn on_response(&self, message: EthMessage, payload_len: usize) {
        match self.correlator.on_response(message) {
            ResponseOutcome::Matched { kind, elapsed } => {
                let elapsed_ms = elapsed.as_millis().max(1) as u64;
                let sample = match kind {
                    TransferSpeedType::Latency => elapsed_ms,
                    _ => payload_len as u64 / elapsed_ms,
                };
                self.stats.add_transfer_speed(kind, sample);
            }
            ResponseOutcome::Late { .. } => {
                trace!(target: "net::session", peer_id=?self.peer_id, "response to timed out request");
            }
            ResponseOutcome::Mismatched => {
                let _ = self
                    .to_manager
                    .try_send(ActiveSessionMessage::BadMessage { peer_id: self.peer_id });
            }
            ResponseOutcome::Unknown => {
                debug!(
                    target: "net::session",
                    peer_id=?self.peer_id,
                    "dropping response with unknown request id"
                );
            }
        }
    }
}
