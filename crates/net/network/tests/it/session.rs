//! End-to-end session tests over in-memory transports.

use alloy_consensus::Header;
use alloy_eips::BlockHashOrNumber;
use alloy_primitives::{Bytes, B256, U256};
use futures::{future::poll_fn, SinkExt};
use quartz_eth_wire::{
    pk2id, Block, BlockHeaders, DisconnectReason, EthMessage, EthStream, EthVersion,
    GetBlockHeaders, HelloMessageWithProtocols, P2PStream, PeerId, Protocol, RequestPair, Status,
    UnauthedEthStream, UnauthedP2PStream,
};
use quartz_ethereum_forks::{ForkFilter, ForkHash, ForkId, Head};
use quartz_network::{
    error::SessionError,
    eth_requests::{EthRequestHandler, IncomingEthRequest},
    message::PeerRequest,
    session::{BoxRlpxTransport, SessionEvent, SessionManager},
    traits::{
        noop::{NoopDiscovery, NoopSyncPeerPool, NoopTxPool},
        BlockReader, HeaderReader,
    },
    NetworkError, SessionsConfig, TransferSpeedType,
};
use parking_lot::RwLock;
use secp256k1::{SecretKey, SECP256K1};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// An in-memory chain of empty blocks.
#[derive(Debug, Default)]
struct MockChain {
    by_hash: RwLock<HashMap<B256, Block>>,
    by_number: RwLock<HashMap<u64, B256>>,
}

impl MockChain {
    fn with_blocks(count: u64) -> Self {
        let chain = Self::default();
        let mut parent_hash = B256::ZERO;
        for number in 0..count {
            let header = Header { number, parent_hash, ..Default::default() };
            let hash = header.hash_slow();
            chain.by_hash.write().insert(hash, Block::new(header, Default::default()));
            chain.by_number.write().insert(number, hash);
            parent_hash = hash;
        }
        chain
    }
}

impl HeaderReader for MockChain {
    fn block_hash(&self, number: u64) -> Option<B256> {
        self.by_number.read().get(&number).copied()
    }

    fn header_by_hash_or_number(&self, id: BlockHashOrNumber) -> Option<Header> {
        let hash = match id {
            BlockHashOrNumber::Hash(hash) => hash,
            BlockHashOrNumber::Number(number) => self.block_hash(number)?,
        };
        self.by_hash.read().get(&hash).map(|block| block.header.clone())
    }
}

impl BlockReader for MockChain {
    fn block_by_hash(&self, hash: B256) -> Option<Block> {
        self.by_hash.read().get(&hash).cloned()
    }

    fn receipts_by_block_hash(
        &self,
        _hash: B256,
    ) -> Option<Vec<alloy_consensus::ReceiptWithBloom>> {
        Some(Vec::new())
    }

    fn trie_node(&self, _hash: B256) -> Option<Bytes> {
        None
    }
}

fn test_chain_status() -> (Status, ForkFilter) {
    let genesis = B256::with_last_byte(0xaa);
    let fork_filter = ForkFilter::new(Head::default(), genesis, 0, Vec::new());
    let status = Status::builder()
        .version(EthVersion::Eth66)
        .genesis(genesis)
        .total_difficulty(U256::from(100))
        .forkid(fork_filter.current())
        .build();
    (status, fork_filter)
}

struct Peer {
    manager: SessionManager,
    peer_id: PeerId,
    requests_rx: Option<mpsc::UnboundedReceiver<IncomingEthRequest>>,
}

/// Builds a manager with a fresh identity on the test chain.
fn test_peer() -> Peer {
    let key = SecretKey::new(&mut rand::thread_rng());
    let peer_id = pk2id(&key.public_key(SECP256K1));
    let hello = HelloMessageWithProtocols::builder(peer_id)
        .protocol(Protocol::eth(EthVersion::Eth66))
        .build();
    let (status, fork_filter) = test_chain_status();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();

    let manager = SessionManager::new(
        hello,
        status,
        fork_filter,
        SessionsConfig::default(),
        requests_tx,
        Arc::new(NoopDiscovery),
        Arc::new(NoopSyncPeerPool),
    );
    Peer { manager, peer_id, requests_rx: Some(requests_rx) }
}

/// Serves this peer's eth requests from an in-memory chain.
fn serve_chain(peer: &mut Peer, blocks: u64) -> Arc<MockChain> {
    let chain = Arc::new(MockChain::with_blocks(blocks));
    let handler = EthRequestHandler::new(
        Arc::clone(&chain),
        Arc::new(NoopTxPool),
        peer.requests_rx.take().expect("requests receiver already taken"),
    );
    tokio::spawn(handler);
    chain
}

fn duplex_transports() -> (BoxRlpxTransport, BoxRlpxTransport) {
    let (left, right) = tokio::io::duplex(1024 * 1024);
    (
        Box::pin(Framed::new(left, LengthDelimitedCodec::new())) as BoxRlpxTransport,
        Box::pin(Framed::new(right, LengthDelimitedCodec::new())) as BoxRlpxTransport,
    )
}

fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn next_event(manager: &mut SessionManager) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), poll_fn(|cx| manager.poll(cx)))
        .await
        .expect("no session event within timeout")
}

/// A raw peer side: performs the handshakes over the transport without a
/// manager, mimicking a remote client.
async fn raw_peer(
    transport: BoxRlpxTransport,
    status: Status,
    fork_filter: ForkFilter,
) -> EthStream<P2PStream<BoxRlpxTransport>> {
    let key = SecretKey::new(&mut rand::thread_rng());
    let hello = HelloMessageWithProtocols::builder(pk2id(&key.public_key(SECP256K1)))
        .protocol(Protocol::eth(EthVersion::Eth66))
        .build();
    let (p2p_stream, _) = UnauthedP2PStream::new(transport).handshake(hello).await.unwrap();
    let (eth_stream, _) =
        UnauthedEthStream::new(p2p_stream).handshake(status, fork_filter).await.unwrap();
    eth_stream
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_header_fetch() {
    let mut alice = test_peer();
    let mut bob = test_peer();
    serve_chain(&mut bob, 128);

    let (alice_transport, bob_transport) = duplex_transports();
    alice.manager.dial(alice_transport, bob.peer_id, test_addr(30311)).unwrap();
    bob.manager.on_incoming(bob_transport, test_addr(40404));

    // both sides authenticate
    let established = next_event(&mut alice.manager).await;
    match established {
        SessionEvent::SessionEstablished { peer_id, version, .. } => {
            assert_eq!(peer_id, bob.peer_id);
            assert_eq!(version, EthVersion::Eth66);
        }
        event => panic!("unexpected event: {event:?}"),
    }
    match next_event(&mut bob.manager).await {
        SessionEvent::SessionEstablished { peer_id, .. } => assert_eq!(peer_id, alice.peer_id),
        event => panic!("unexpected event: {event:?}"),
    }

    // fetch headers [100..104] from bob, twice so the rolling average warms up
    for _ in 0..2 {
        let handle = alice.manager.active_session(&bob.peer_id).unwrap();
        let (tx, rx) = oneshot::channel();
        handle.send_request(PeerRequest::GetBlockHeaders {
            request: GetBlockHeaders {
                start_block: BlockHashOrNumber::Number(100),
                limit: 5,
                skip: 0,
                reverse: false,
            },
            response: tx,
        });

        let headers: BlockHeaders =
            tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap().unwrap();
        assert_eq!(headers.0.len(), 5);
        assert_eq!(headers.0.first().unwrap().number, 100);
        assert_eq!(headers.0.last().unwrap().number, 104);
    }

    // the correlator recorded header transfer-speed samples
    let stats = alice.manager.node_stats().peer(bob.peer_id);
    assert!(stats.average_transfer_speed(TransferSpeedType::Headers).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn spammy_peer_is_disconnected_on_queue_overflow() {
    // the peer's request server is wired up but never polled, so the session
    // workers block on it and the heavy queue fills up
    let mut alice = test_peer();
    let _requests_rx = alice.requests_rx.take();

    let (alice_transport, remote_transport) = duplex_transports();
    alice.manager.on_incoming(alice_transport, test_addr(40405));

    let (status, fork_filter) = test_chain_status();
    let mut remote = raw_peer(remote_transport, status, fork_filter).await;

    match next_event(&mut alice.manager).await {
        SessionEvent::SessionEstablished { .. } => {}
        event => panic!("unexpected event: {event:?}"),
    }

    // flood the session with more requests than queue capacity + workers
    for id in 0..64u64 {
        let message = EthMessage::GetBlockHeaders(RequestPair::new(
            id + 1,
            GetBlockHeaders {
                start_block: BlockHashOrNumber::Number(0),
                limit: 1,
                skip: 0,
                reverse: false,
            },
        ));
        if remote.send(message).await.is_err() {
            // session already started tearing down
            break
        }
    }

    // the session must drop the peer rather than stall the socket
    loop {
        match next_event(&mut alice.manager).await {
            SessionEvent::SessionClosedOnConnectionError { error, .. } => {
                assert!(matches!(error, SessionError::IncomingQueueFull));
                break
            }
            SessionEvent::BadMessage { .. } | SessionEvent::Message { .. } => {}
            event => panic!("unexpected event: {event:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fork_divergence_disconnects_and_throttles_redial() {
    let mut alice = test_peer();

    // a peer on the same chain but with a fork id that appears in no fork
    // table, announced under a known identity so alice can dial it
    let remote_key = SecretKey::new(&mut rand::thread_rng());
    let remote_peer_id = pk2id(&remote_key.public_key(SECP256K1));

    let (alice_transport, remote_transport) = duplex_transports();
    let remote = tokio::spawn(async move {
        let genesis = B256::with_last_byte(0xaa);
        let fork_filter = ForkFilter::new(Head::default(), genesis, 0, Vec::new());
        let status = Status::builder()
            .version(EthVersion::Eth66)
            .genesis(genesis)
            .total_difficulty(U256::from(100))
            .forkid(ForkId { hash: ForkHash([0xde, 0xad, 0xbe, 0xef]), next: 0 })
            .build();
        let hello = HelloMessageWithProtocols::builder(remote_peer_id)
            .protocol(Protocol::eth(EthVersion::Eth66))
            .build();

        let (p2p_stream, _) =
            UnauthedP2PStream::new(remote_transport).handshake(hello).await.unwrap();
        // alice's fork validation rejects this status
        let _ = UnauthedEthStream::new(p2p_stream).handshake(status, fork_filter).await;
    });

    alice.manager.dial(alice_transport, remote_peer_id, test_addr(30312)).unwrap();

    match next_event(&mut alice.manager).await {
        SessionEvent::PendingSessionClosed { error, .. } => {
            let error = error.expect("handshake error");
            assert!(error.as_chain_mismatch().is_some(), "expected fork validation failure");
        }
        event => panic!("unexpected event: {event:?}"),
    }
    remote.await.unwrap();

    // the divergence was recorded and holds the peer back
    let stats = alice.manager.node_stats().peer(remote_peer_id);
    let (delayed, cause) = stats.is_connection_delayed();
    assert!(delayed);
    assert!(cause.is_some());

    // a dial attempt inside the window is rejected
    let (transport, _other) = duplex_transports();
    let err = alice.manager.dial(transport, remote_peer_id, test_addr(30312)).unwrap_err();
    assert!(matches!(err, NetworkError::DelayedPeer));
}

#[tokio::test(flavor = "multi_thread")]
async fn gossip_messages_reach_the_manager() {
    let mut alice = test_peer();
    serve_chain(&mut alice, 4);

    let (alice_transport, remote_transport) = duplex_transports();
    alice.manager.on_incoming(alice_transport, test_addr(40407));

    let (status, fork_filter) = test_chain_status();
    let mut remote = raw_peer(remote_transport, status, fork_filter).await;

    match next_event(&mut alice.manager).await {
        SessionEvent::SessionEstablished { .. } => {}
        event => panic!("unexpected event: {event:?}"),
    }

    remote
        .send(EthMessage::NewPooledTransactionHashes(
            vec![B256::with_last_byte(0x42)].into(),
        ))
        .await
        .unwrap();

    match next_event(&mut alice.manager).await {
        SessionEvent::Message { message, .. } => match message {
            quartz_network::PeerMessage::PooledTransactionHashes(hashes) => {
                assert_eq!(hashes.0, vec![B256::with_last_byte(0x42)]);
            }
            message => panic!("unexpected message: {message:?}"),
        },
        event => panic!("unexpected event: {event:?}"),
    }

    // a graceful disconnect from the remote closes the session
    remote.into_inner().disconnect(DisconnectReason::ClientQuitting).await.unwrap();
    loop {
        match next_event(&mut alice.manager).await {
            SessionEvent::SessionClosed { .. } |
            SessionEvent::SessionClosedOnConnectionError { .. } => break,
            SessionEvent::Message { .. } | SessionEvent::BadMessage { .. } => {}
            event => panic!("unexpected event: {event:?}"),
        }
    }
}
