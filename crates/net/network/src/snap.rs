//! The `snap/1` protocol handler: state-range fetching with an adaptive byte
//! budget, and serving of range requests against the local snapshot.
//!
//! The byte budget every request advertises adapts to the peer's observed
//! latency: fast responses double it, slow responses halve it, failures reset
//! it. Adjustments are computed against the budget captured when the request
//! was issued, so concurrent requests never compound.

use crate::{
    message::{RequestError, RequestResult},
    protocol::{
        ProtocolFactory, ProtocolHandlerError, SatelliteFrame, SessionContext,
        SessionProtocolHandler,
    },
    session::SessionCommand,
    stats::{NodeStats, PeerStats, TransferSpeedType},
    traits::SnapServer,
};
use alloy_primitives::{bytes::BytesMut, B256};
use parking_lot::Mutex;
use quartz_eth_wire::{
    AccountRangeMessage, ByteCodesMessage, GetAccountRangeMessage, GetByteCodesMessage,
    GetStorageRangesMessage, GetTrieNodesMessage, PeerId, Protocol, SnapMessageId,
    SnapProtocolMessage, StorageRangesMessage, TrieNodesMessage,
};
use rustc_hash::FxHashMap;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Smallest byte budget a request may advertise.
pub const MIN_RESPONSE_BYTES: u64 = 20_000;

/// Largest byte budget a request may advertise.
pub const MAX_RESPONSE_BYTES: u64 = 2_000_000;

/// Responses faster than this double the budget.
const LOWER_LATENCY: Duration = Duration::from_secs(1);

/// Responses slower than this halve the budget.
const UPPER_LATENCY: Duration = Duration::from_secs(2);

/// Computes the byte budget to use after a request completed.
///
/// `start_limit` is the budget captured when the request was issued, not the
/// current one.
pub(crate) fn next_bytes_limit(start_limit: u64, elapsed: Duration, failed: bool) -> u64 {
    if failed {
        return MIN_RESPONSE_BYTES
    }
    if elapsed < LOWER_LATENCY {
        (start_limit * 2).min(MAX_RESPONSE_BYTES)
    } else if elapsed > UPPER_LATENCY && start_limit > MIN_RESPONSE_BYTES {
        (start_limit / 2).max(MIN_RESPONSE_BYTES)
    } else {
        start_limit
    }
}

/// A request awaiting its response, kept in issue order per request kind.
#[derive(Debug)]
struct PendingSnapRequest {
    /// The request id sent on the wire, used as a consistency check only;
    /// matching is in issue order.
    request_id: u64,
    /// When the request was issued.
    started: Instant,
    /// The byte budget captured at issuance.
    start_limit: u64,
    /// Completion slot.
    tx: oneshot::Sender<RequestResult<SnapProtocolMessage>>,
}

/// Client state shared between the per-session handler and its
/// [`SnapClient`] handles.
#[derive(Debug)]
pub struct SnapRequestState {
    /// The current byte budget advertised in requests.
    bytes_limit: AtomicU64,
    /// The next request id.
    next_request_id: AtomicU64,
    /// Outstanding requests, one FIFO queue per request kind.
    pending: Mutex<FxHashMap<u8, VecDeque<PendingSnapRequest>>>,
}

impl Default for SnapRequestState {
    fn default() -> Self {
        Self {
            bytes_limit: AtomicU64::new(MIN_RESPONSE_BYTES),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(FxHashMap::default()),
        }
    }
}

impl SnapRequestState {
    /// The current byte budget.
    pub fn bytes_limit(&self) -> u64 {
        self.bytes_limit.load(Ordering::Relaxed)
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push_pending(
        &self,
        request_kind: SnapMessageId,
        request_id: u64,
    ) -> oneshot::Receiver<RequestResult<SnapProtocolMessage>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().entry(request_kind as u8).or_default().push_back(
            PendingSnapRequest {
                request_id,
                started: Instant::now(),
                start_limit: self.bytes_limit(),
                tx,
            },
        );
        rx
    }

    /// Completes the oldest pending request of the kind that produced the
    /// given response. Returns the response payload round-trip time, or
    /// `None` if no request was pending.
    fn complete(&self, request_kind: SnapMessageId, response: SnapProtocolMessage) -> Option<Duration> {
        let pending = self.pending.lock().get_mut(&(request_kind as u8))?.pop_front();
        let Some(pending) = pending else { return None };

        if pending.request_id != response.request_id() {
            debug!(
                target: "net::snap",
                expected = pending.request_id,
                got = response.request_id(),
                "snap response id does not match issue order"
            );
        }

        let elapsed = pending.started.elapsed();
        self.bytes_limit
            .store(next_bytes_limit(pending.start_limit, elapsed, false), Ordering::Relaxed);
        let _ = pending.tx.send(Ok(response));
        Some(elapsed)
    }

    /// Fails every outstanding request and resets the budget.
    fn fail_all(&self, err: RequestError) {
        self.bytes_limit.store(MIN_RESPONSE_BYTES, Ordering::Relaxed);
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, queue) in pending {
            for request in queue {
                let _ = request.tx.send(Err(err.clone()));
            }
        }
    }
}

/// A handle for issuing `snap/1` requests on a session.
#[derive(Debug, Clone)]
pub struct SnapClient {
    peer_id: PeerId,
    state: Arc<SnapRequestState>,
    to_session: mpsc::Sender<SessionCommand>,
}

impl SnapClient {
    /// The peer this client sends requests to.
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The byte budget the next request will advertise.
    pub fn bytes_limit(&self) -> u64 {
        self.state.bytes_limit()
    }

    /// Requests an account range below the given state root.
    pub async fn get_account_range(
        &self,
        root_hash: B256,
        starting_hash: B256,
        limit_hash: B256,
    ) -> RequestResult<AccountRangeMessage> {
        let request = GetAccountRangeMessage {
            request_id: self.state.next_request_id(),
            root_hash,
            starting_hash,
            limit_hash,
            response_bytes: self.state.bytes_limit(),
        };
        let response = self
            .request(SnapMessageId::GetAccountRange, SnapProtocolMessage::GetAccountRange(request))
            .await?;
        match response {
            SnapProtocolMessage::AccountRange(message) => Ok(message),
            _ => Err(RequestError::BadResponse),
        }
    }

    /// Requests storage ranges for the given accounts below the state root.
    pub async fn get_storage_ranges(
        &self,
        root_hash: B256,
        account_hashes: Vec<B256>,
        starting_hash: B256,
        limit_hash: B256,
    ) -> RequestResult<StorageRangesMessage> {
        let request = GetStorageRangesMessage {
            request_id: self.state.next_request_id(),
            root_hash,
            account_hashes,
            starting_hash,
            limit_hash,
            response_bytes: self.state.bytes_limit(),
        };
        let response = self
            .request(
                SnapMessageId::GetStorageRanges,
                SnapProtocolMessage::GetStorageRanges(request),
            )
            .await?;
        match response {
            SnapProtocolMessage::StorageRanges(message) => Ok(message),
            _ => Err(RequestError::BadResponse),
        }
    }

    /// Requests contract bytecodes by hash.
    pub async fn get_byte_codes(&self, hashes: Vec<B256>) -> RequestResult<ByteCodesMessage> {
        let request = GetByteCodesMessage {
            request_id: self.state.next_request_id(),
            hashes,
            response_bytes: self.state.bytes_limit(),
        };
        let response = self
            .request(SnapMessageId::GetByteCodes, SnapProtocolMessage::GetByteCodes(request))
            .await?;
        match response {
            SnapProtocolMessage::ByteCodes(message) => Ok(message),
            _ => Err(RequestError::BadResponse),
        }
    }

    /// Requests trie nodes by path, refreshing stale parts of the trie.
    pub async fn get_trie_nodes(
        &self,
        root_hash: B256,
        paths: Vec<quartz_eth_wire::TriePath>,
    ) -> RequestResult<TrieNodesMessage> {
        let request = GetTrieNodesMessage {
            request_id: self.state.next_request_id(),
            root_hash,
            paths,
            response_bytes: self.state.bytes_limit(),
        };
        let response = self
            .request(SnapMessageId::GetTrieNodes, SnapProtocolMessage::GetTrieNodes(request))
            .await?;
        match response {
            SnapProtocolMessage::TrieNodes(message) => Ok(message),
            _ => Err(RequestError::BadResponse),
        }
    }

    async fn request(
        &self,
        kind: SnapMessageId,
        message: SnapProtocolMessage,
    ) -> RequestResult<SnapProtocolMessage> {
        let rx = self.state.push_pending(kind, message.request_id());

        let mut payload = BytesMut::new();
        message.encode_payload(&mut payload);
        let frame =
            SatelliteFrame { id: message.message_id() as u8, payload: payload.freeze().into() };

        if self
            .to_session
            .send(SessionCommand::Satellite { protocol: "snap".to_string(), frame })
            .await
            .is_err()
        {
            // session is gone, fail the request and reset the budget
            self.state.fail_all(RequestError::ConnectionDropped);
            return Err(RequestError::ConnectionDropped)
        }

        rx.await.map_err(|_| RequestError::ConnectionDropped)?
    }
}

/// The per-session `snap/1` handler: serves incoming range requests through
/// the [`SnapServer`] and matches incoming responses to the session's
/// [`SnapClient`] requests.
pub struct SnapProtocolHandler {
    peer_id: PeerId,
    server: Arc<dyn SnapServer>,
    state: Arc<SnapRequestState>,
    stats: Arc<PeerStats>,
    clients: Arc<Mutex<HashMap<PeerId, SnapClient>>>,
}

impl SnapProtocolHandler {
    fn respond(&self, message: SnapProtocolMessage) -> SatelliteFrame {
        let mut payload = BytesMut::new();
        message.encode_payload(&mut payload);
        SatelliteFrame { id: message.message_id() as u8, payload: payload.freeze().into() }
    }

    /// Completes a client request with the response and records the snap
    /// transfer speed.
    fn on_response(
        &self,
        request_kind: SnapMessageId,
        response: SnapProtocolMessage,
        payload_len: usize,
    ) {
        match self.state.complete(request_kind, response) {
            Some(elapsed) => {
                let elapsed_ms = elapsed.as_millis().max(1) as u64;
                self.stats
                    .add_transfer_speed(TransferSpeedType::SnapRanges, payload_len as u64 / elapsed_ms);
            }
            None => {
                trace!(target: "net::snap", peer_id=?self.peer_id, "unsolicited snap response");
            }
        }
    }
}

impl std::fmt::Debug for SnapProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapProtocolHandler")
            .field("peer_id", &self.peer_id)
            .field("bytes_limit", &self.state.bytes_limit())
            .finish_non_exhaustive()
    }
}

impl SessionProtocolHandler for SnapProtocolHandler {
    fn protocol(&self) -> Protocol {
        Protocol::snap()
    }

    fn on_message(
        &mut self,
        id: u8,
        payload: BytesMut,
    ) -> Result<Vec<SatelliteFrame>, ProtocolHandlerError> {
        let id = SnapMessageId::try_from(id)
            .map_err(|err| ProtocolHandlerError(err.to_string()))?;
        let payload_len = payload.len();
        let message = SnapProtocolMessage::decode_payload(id, &mut payload.as_ref())
            .map_err(|err| ProtocolHandlerError(err.to_string()))?;

        let frames = match message {
            SnapProtocolMessage::GetAccountRange(request) => {
                vec![self.respond(SnapProtocolMessage::AccountRange(
                    self.server.account_range(&request),
                ))]
            }
            SnapProtocolMessage::GetStorageRanges(request) => {
                vec![self.respond(SnapProtocolMessage::StorageRanges(
                    self.server.storage_ranges(&request),
                ))]
            }
            SnapProtocolMessage::GetByteCodes(request) => {
                vec![self
                    .respond(SnapProtocolMessage::ByteCodes(self.server.byte_codes(&request)))]
            }
            SnapProtocolMessage::GetTrieNodes(request) => {
                vec![self
                    .respond(SnapProtocolMessage::TrieNodes(self.server.trie_nodes(&request)))]
            }
            response @ SnapProtocolMessage::AccountRange(_) => {
                self.on_response(SnapMessageId::GetAccountRange, response, payload_len);
                Vec::new()
            }
            response @ SnapProtocolMessage::StorageRanges(_) => {
                self.on_response(SnapMessageId::GetStorageRanges, response, payload_len);
                Vec::new()
            }
            response @ SnapProtocolMessage::ByteCodes(_) => {
                self.on_response(SnapMessageId::GetByteCodes, response, payload_len);
                Vec::new()
            }
            response @ SnapProtocolMessage::TrieNodes(_) => {
                self.on_response(SnapMessageId::GetTrieNodes, response, payload_len);
                Vec::new()
            }
        };

        Ok(frames)
    }

    fn on_disconnect(&mut self) {
        self.clients.lock().remove(&self.peer_id);
        self.state.fail_all(RequestError::ConnectionDropped);
    }
}

/// Builds a [`SnapProtocolHandler`] for every session that negotiated
/// `snap/1`, and hands out [`SnapClient`]s for issuing requests.
pub struct SnapProtocolFactory {
    server: Arc<dyn SnapServer>,
    stats: Arc<NodeStats>,
    clients: Arc<Mutex<HashMap<PeerId, SnapClient>>>,
}

impl SnapProtocolFactory {
    /// Creates a new factory serving requests from the given server.
    pub fn new(server: Arc<dyn SnapServer>, stats: Arc<NodeStats>) -> Self {
        Self { server, stats, clients: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Returns the client for the given peer, if a session with a negotiated
    /// `snap/1` capability exists.
    pub fn client(&self, peer_id: &PeerId) -> Option<SnapClient> {
        self.clients.lock().get(peer_id).cloned()
    }
}

impl std::fmt::Debug for SnapProtocolFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapProtocolFactory").finish_non_exhaustive()
    }
}

impl ProtocolFactory for SnapProtocolFactory {
    fn protocol(&self) -> Protocol {
        Protocol::snap()
    }

    fn create_handler(&self, ctx: &SessionContext) -> Box<dyn SessionProtocolHandler> {
        let state = Arc::new(SnapRequestState::default());
        let client = SnapClient {
            peer_id: ctx.peer_id,
            state: Arc::clone(&state),
            to_session: ctx.to_session.clone(),
        };
        self.clients.lock().insert(ctx.peer_id, client);

        Box::new(SnapProtocolHandler {
            peer_id: ctx.peer_id,
            server: Arc::clone(&self.server),
            state,
            stats: self.stats.peer(ctx.peer_id),
            clients: Arc::clone(&self.clients),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{session::Direction, session::SessionId, traits::noop::NoopSnapServer};
    use quartz_eth_wire::AccountData;

    #[test]
    fn budget_doubles_on_fast_response() {
        assert_eq!(next_bytes_limit(100_000, Duration::from_millis(500), false), 200_000);
    }

    #[test]
    fn budget_resets_on_failure() {
        assert_eq!(next_bytes_limit(1_500_000, Duration::from_millis(500), true), MIN_RESPONSE_BYTES);
    }

    #[test]
    fn budget_halves_on_slow_response() {
        assert_eq!(next_bytes_limit(100_000, Duration::from_secs(3), false), 50_000);
        // already at the floor, stays there
        assert_eq!(
            next_bytes_limit(MIN_RESPONSE_BYTES, Duration::from_secs(3), false),
            MIN_RESPONSE_BYTES
        );
    }

    #[test]
    fn budget_unchanged_in_band() {
        assert_eq!(next_bytes_limit(100_000, Duration::from_millis(1500), false), 100_000);
    }

    #[test]
    fn budget_saturates_at_max() {
        let mut limit = MIN_RESPONSE_BYTES;
        for _ in 0..10 {
            limit = next_bytes_limit(limit, Duration::from_millis(500), false);
        }
        assert_eq!(limit, MAX_RESPONSE_BYTES);
    }

    #[test]
    fn budget_invariant_holds() {
        for start in [MIN_RESPONSE_BYTES, 100_000, MAX_RESPONSE_BYTES] {
            for elapsed in [Duration::ZERO, Duration::from_millis(1500), Duration::from_secs(10)] {
                for failed in [false, true] {
                    let next = next_bytes_limit(start, elapsed, failed);
                    assert!((MIN_RESPONSE_BYTES..=MAX_RESPONSE_BYTES).contains(&next));
                }
            }
        }
    }

    fn test_handler_and_client() -> (Box<dyn SessionProtocolHandler>, SnapClient, SnapProtocolFactory, mpsc::Receiver<SessionCommand>)
    {
        let factory =
            SnapProtocolFactory::new(Arc::new(NoopSnapServer), Arc::new(NodeStats::default()));
        let (to_session, commands_rx) = mpsc::channel(8);
        let ctx = SessionContext {
            session_id: SessionId(0),
            peer_id: PeerId::with_last_byte(1),
            direction: Direction::Incoming,
            version: 1,
            to_session,
        };
        let handler = factory.create_handler(&ctx);
        let client = factory.client(&ctx.peer_id).unwrap();
        (handler, client, factory, commands_rx)
    }

    #[tokio::test]
    async fn responses_match_fifo_and_adjust_budget() {
        let (mut handler, client, _factory, mut commands_rx) = test_handler_and_client();
        assert_eq!(client.bytes_limit(), MIN_RESPONSE_BYTES);

        let request_task = tokio::spawn(async move {
            client.get_account_range(B256::ZERO, B256::ZERO, B256::repeat_byte(0xff)).await
        });

        // the request frame arrives at the session command channel
        let cmd = commands_rx.recv().await.unwrap();
        let SessionCommand::Satellite { protocol, frame } = cmd else {
            panic!("expected satellite frame")
        };
        assert_eq!(protocol, "snap");
        assert_eq!(frame.id, SnapMessageId::GetAccountRange as u8);

        // feed the response into the handler, fast enough to double the budget
        let response = SnapProtocolMessage::AccountRange(AccountRangeMessage {
            request_id: 1,
            accounts: vec![AccountData {
                hash: B256::with_last_byte(1),
                body: alloy_primitives::Bytes::from_static(&[0x01]),
            }],
            proof: Vec::new(),
        });
        let mut payload = BytesMut::new();
        response.encode_payload(&mut payload);
        let frames = handler.on_message(SnapMessageId::AccountRange as u8, payload).unwrap();
        assert!(frames.is_empty());

        let message = request_task.await.unwrap().unwrap();
        assert_eq!(message.accounts.len(), 1);
    }

    #[tokio::test]
    async fn requests_are_served() {
        let (mut handler, _client, _factory, _commands_rx) = test_handler_and_client();

        let request = SnapProtocolMessage::GetAccountRange(GetAccountRangeMessage {
            request_id: 9,
            root_hash: B256::ZERO,
            starting_hash: B256::ZERO,
            limit_hash: B256::repeat_byte(0xff),
            response_bytes: MIN_RESPONSE_BYTES,
        });
        let mut payload = BytesMut::new();
        request.encode_payload(&mut payload);

        let frames = handler.on_message(SnapMessageId::GetAccountRange as u8, payload).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, SnapMessageId::AccountRange as u8);

        let response =
            SnapProtocolMessage::decode_payload(SnapMessageId::AccountRange, &mut &frames[0].payload[..])
                .unwrap();
        assert_eq!(response.request_id(), 9);
    }

    #[tokio::test]
    async fn disconnect_fails_pending_and_resets_budget() {
        let (mut handler, client, factory, mut commands_rx) = test_handler_and_client();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.get_byte_codes(vec![B256::ZERO]).await }
        });
        let _ = commands_rx.recv().await.unwrap();

        handler.on_disconnect();
        assert_eq!(pending.await.unwrap().unwrap_err(), RequestError::ConnectionDropped);
        assert_eq!(client.bytes_limit(), MIN_RESPONSE_BYTES);
        // the client registry no longer hands out the peer
        assert!(factory.client(&client.peer_id()).is_none());
    }
}
