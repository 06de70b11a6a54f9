//! Correlates outbound requests with inbound responses.
//!
//! From `eth/66` on every request carries a fresh 64-bit request id, assigned
//! monotonically per session and never zero. Responses are matched strictly
//! by id: an unknown or already-consumed id is dropped and logged, never
//! matched to a different request. On earlier versions the protocol has no
//! ids and responses are matched to the oldest outstanding request of the
//! same kind.

use crate::{
    message::{PeerRequest, RequestError},
    stats::TransferSpeedType,
};
use parking_lot::Mutex;
use quartz_eth_wire::{EthMessage, EthVersion};
use rustc_hash::FxHashMap;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tracing::debug;

/// The outcome of feeding a response into the correlator.
#[derive(Debug)]
pub(crate) enum ResponseOutcome {
    /// The response completed a pending request.
    Matched {
        /// The transfer-speed bucket of the request kind.
        kind: TransferSpeedType,
        /// Time between request issuance and response arrival.
        elapsed: Duration,
    },
    /// The id matched a pending request of a different kind; the request was
    /// failed with a bad-response error.
    Mismatched,
    /// The request had already been timed out internally; the late response
    /// is discarded but still updates the round-trip measurement.
    Late {
        /// Time between request issuance and response arrival.
        elapsed: Duration,
    },
    /// No pending request matches; duplicate or unknown id.
    Unknown,
}

/// A request sent to the peer, waiting for its response.
#[derive(Debug)]
struct InflightRequest {
    /// The request and its internal response channel, or the timed-out
    /// marker.
    state: RequestState,
    /// When the request was written to the session.
    timestamp: Instant,
    /// When the request times out.
    deadline: Instant,
}

#[derive(Debug)]
enum RequestState {
    /// Waiting for the response.
    Waiting(PeerRequest),
    /// Request already timed out internally, the entry only remains to absorb
    /// a late response.
    TimedOut,
}

impl InflightRequest {
    const fn is_waiting(&self) -> bool {
        matches!(self.state, RequestState::Waiting(_))
    }
}

/// Tracks all requests currently awaiting a response from the peer.
#[derive(Debug)]
pub(crate) struct MessageCorrelator {
    /// Whether the negotiated version carries request ids on the wire.
    has_request_ids: bool,
    /// The next request id; ids are monotonic per session and skip zero.
    next_id: AtomicU64,
    /// All requests we sent to the remote peer and are waiting on a response for.
    inflight: Mutex<FxHashMap<u64, InflightRequest>>,
}

impl MessageCorrelator {
    /// Creates a new correlator for the negotiated version.
    pub(crate) fn new(version: EthVersion) -> Self {
        Self {
            has_request_ids: version.has_request_ids(),
            next_id: AtomicU64::new(1),
            inflight: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of outstanding requests.
    pub(crate) fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Registers the request and returns the wire message carrying the
    /// assigned request id.
    pub(crate) fn create(&self, request: PeerRequest, timeout: Duration) -> EthMessage {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = request.create_request_message(request_id);
        let now = Instant::now();
        self.inflight.lock().insert(
            request_id,
            InflightRequest {
                state: RequestState::Waiting(request),
                timestamp: now,
                deadline: now + timeout,
            },
        );
        message
    }

    /// Feeds a decoded response message into the correlator.
    pub(crate) fn on_response(&self, message: EthMessage) -> ResponseOutcome {
        let Some(request_id) = message.request_id() else { return ResponseOutcome::Unknown };

        let mut inflight = self.inflight.lock();

        let request_id = if self.has_request_ids {
            request_id
        } else {
            // no ids on the wire: the response matches the oldest pending
            // request of the same kind
            let wanted = message.message_id();
            let Some(oldest) = inflight
                .iter()
                .filter(|(_, req)| {
                    matches!(
                        &req.state,
                        RequestState::Waiting(pending)
                            if pending.message_id().response_id() == Some(wanted)
                    )
                })
                .min_by_key(|(_, req)| req.timestamp)
                .map(|(id, _)| *id)
            else {
                return ResponseOutcome::Unknown
            };
            oldest
        };

        let Some(entry) = inflight.remove(&request_id) else {
            debug!(request_id, "received response for unknown or duplicate request id");
            return ResponseOutcome::Unknown
        };

        let elapsed = entry.timestamp.elapsed();
        match entry.state {
            RequestState::Waiting(request) => match Self::complete(request, message) {
                Ok(kind) => ResponseOutcome::Matched { kind, elapsed },
                Err(()) => ResponseOutcome::Mismatched,
            },
            RequestState::TimedOut => ResponseOutcome::Late { elapsed },
        }
    }

    /// Completes a pending request with the response message. Returns the
    /// transfer-speed kind on success, or fails the request if the response
    /// type does not match the request.
    fn complete(request: PeerRequest, message: EthMessage) -> Result<TransferSpeedType, ()> {
        let kind = request.transfer_speed_type();
        match (request, message) {
            (PeerRequest::GetBlockHeaders { response, .. }, EthMessage::BlockHeaders(pair)) => {
                let _ = response.send(Ok(pair.message));
            }
            (PeerRequest::GetBlockBodies { response, .. }, EthMessage::BlockBodies(pair)) => {
                let _ = response.send(Ok(pair.message));
            }
            (
                PeerRequest::GetPooledTransactions { response, .. },
                EthMessage::PooledTransactions(pair),
            ) => {
                let _ = response.send(Ok(pair.message));
            }
            (PeerRequest::GetNodeData { response, .. }, EthMessage::NodeData(pair)) => {
                let _ = response.send(Ok(pair.message));
            }
            (PeerRequest::GetReceipts { response, .. }, EthMessage::Receipts(pair)) => {
                let _ = response.send(Ok(pair.message));
            }
            (request, message) => {
                debug!(?message, "response type does not match pending request");
                request.send_bad_response();
                return Err(())
            }
        }
        Ok(kind)
    }

    /// Times out every request whose deadline passed, failing it with a
    /// timeout error. Returns the transfer-speed kinds of newly timed out
    /// requests, and whether any request exceeded the protocol breach window.
    pub(crate) fn check_timed_out(
        &self,
        now: Instant,
        protocol_breach_timeout: Duration,
    ) -> (Vec<TransferSpeedType>, bool) {
        let mut timed_out = Vec::new();
        let mut breached = false;

        let mut inflight = self.inflight.lock();
        for (id, entry) in inflight.iter_mut() {
            if now <= entry.deadline {
                continue
            }
            if entry.is_waiting() {
                debug!(request_id = id, "timed out outgoing request");
                let mut state = RequestState::TimedOut;
                std::mem::swap(&mut entry.state, &mut state);
                if let RequestState::Waiting(request) = state {
                    timed_out.push(request.transfer_speed_type());
                    request.send_err_response(RequestError::Timeout);
                }
            } else if now.saturating_duration_since(entry.timestamp) > protocol_breach_timeout {
                breached = true;
            }
        }

        (timed_out, breached)
    }

    /// Fails every outstanding request with the given error. Invoked on
    /// session teardown.
    pub(crate) fn drain(&self, err: RequestError) {
        let inflight = std::mem::take(&mut *self.inflight.lock());
        for (_, entry) in inflight {
            if let RequestState::Waiting(request) = entry.state {
                request.send_err_response(err.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_eth_wire::{BlockHeaders, GetBlockHeaders, RequestPair};
    use alloy_eips::BlockHashOrNumber;
    use tokio::sync::oneshot;

    fn headers_request() -> (PeerRequest, oneshot::Receiver<crate::message::RequestResult<BlockHeaders>>) {
        let (tx, rx) = oneshot::channel();
        (
            PeerRequest::GetBlockHeaders {
                request: GetBlockHeaders {
                    start_block: BlockHashOrNumber::Number(100),
                    limit: 5,
                    skip: 0,
                    reverse: false,
                },
                response: tx,
            },
            rx,
        )
    }

    #[test]
    fn ids_are_monotonic_and_skip_zero() {
        let correlator = MessageCorrelator::new(EthVersion::Eth66);
        let (request, _rx) = headers_request();
        let message = correlator.create(request, Duration::from_secs(5));
        assert_eq!(message.request_id(), Some(1));

        let (request, _rx2) = headers_request();
        let message = correlator.create(request, Duration::from_secs(5));
        assert_eq!(message.request_id(), Some(2));
    }

    #[tokio::test]
    async fn response_completes_pending_request() {
        let correlator = MessageCorrelator::new(EthVersion::Eth66);
        let (request, rx) = headers_request();
        let message = correlator.create(request, Duration::from_secs(5));
        let id = message.request_id().unwrap();

        let response = EthMessage::BlockHeaders(RequestPair::new(id, BlockHeaders::default()));
        assert!(matches!(
            correlator.on_response(response),
            ResponseOutcome::Matched { kind: TransferSpeedType::Headers, .. }
        ));
        assert_eq!(rx.await.unwrap().unwrap(), BlockHeaders::default());
        assert_eq!(correlator.len(), 0);
    }

    #[test]
    fn unknown_and_duplicate_ids_are_dropped() {
        let correlator = MessageCorrelator::new(EthVersion::Eth66);
        let (request, _rx) = headers_request();
        let message = correlator.create(request, Duration::from_secs(5));
        let id = message.request_id().unwrap();

        // unknown id
        let response = EthMessage::BlockHeaders(RequestPair::new(id + 1, BlockHeaders::default()));
        assert!(matches!(correlator.on_response(response), ResponseOutcome::Unknown));

        // consume, then replay the same id
        let response = EthMessage::BlockHeaders(RequestPair::new(id, BlockHeaders::default()));
        assert!(matches!(correlator.on_response(response), ResponseOutcome::Matched { .. }));
        let replay = EthMessage::BlockHeaders(RequestPair::new(id, BlockHeaders::default()));
        assert!(matches!(correlator.on_response(replay), ResponseOutcome::Unknown));
    }

    #[tokio::test]
    async fn mismatched_response_type_fails_request() {
        let correlator = MessageCorrelator::new(EthVersion::Eth66);
        let (request, rx) = headers_request();
        let message = correlator.create(request, Duration::from_secs(5));
        let id = message.request_id().unwrap();

        let response = EthMessage::BlockBodies(RequestPair::new(id, Default::default()));
        assert!(matches!(correlator.on_response(response), ResponseOutcome::Mismatched));
        assert_eq!(rx.await.unwrap().unwrap_err(), RequestError::BadResponse);
    }

    #[tokio::test]
    async fn timeouts_fail_requests() {
        let correlator = MessageCorrelator::new(EthVersion::Eth66);
        let (request, rx) = headers_request();
        let _ = correlator.create(request, Duration::from_millis(0));

        let (timed_out, breached) = correlator.check_timed_out(
            Instant::now() + Duration::from_millis(10),
            Duration::from_secs(60),
        );
        assert_eq!(timed_out, vec![TransferSpeedType::Headers]);
        assert!(!breached);
        assert_eq!(rx.await.unwrap().unwrap_err(), RequestError::Timeout);
    }

    #[tokio::test]
    async fn drain_fails_all_outstanding() {
        let correlator = MessageCorrelator::new(EthVersion::Eth66);
        let (request, rx1) = headers_request();
        let _ = correlator.create(request, Duration::from_secs(5));
        let (request, rx2) = headers_request();
        let _ = correlator.create(request, Duration::from_secs(5));

        correlator.drain(RequestError::ConnectionDropped);
        assert_eq!(rx1.await.unwrap().unwrap_err(), RequestError::ConnectionDropped);
        assert_eq!(rx2.await.unwrap().unwrap_err(), RequestError::ConnectionDropped);
        assert_eq!(correlator.len(), 0);
    }

    #[tokio::test]
    async fn fifo_matching_without_request_ids() {
        let correlator = MessageCorrelator::new(EthVersion::Eth63);
        let (request, rx1) = headers_request();
        let _ = correlator.create(request, Duration::from_secs(5));
        let (request, _rx2) = headers_request();
        let _ = correlator.create(request, Duration::from_secs(5));

        // a response without an id resolves the oldest pending request
        let response = EthMessage::BlockHeaders(RequestPair::bare(BlockHeaders::default()));
        assert!(matches!(correlator.on_response(response), ResponseOutcome::Matched { .. }));
        assert_eq!(rx1.await.unwrap().unwrap(), BlockHeaders::default());
        assert_eq!(correlator.len(), 1);
    }
}
