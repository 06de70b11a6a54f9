//! Transaction gossip handling.
//!
//! Full transaction broadcasts go straight into the pool. Pooled-hash
//! announcements (`eth/65+`) fan out to a requestor that fetches the bodies
//! before importing them. Block gossip is accepted off the wire but dropped:
//! after the merge, blocks come from the consensus client.

use crate::{
    message::{PeerMessage, PeerRequest},
    session::SessionCommand,
    traits::TxPool,
};
use quartz_eth_wire::{EthVersion, GetPooledTransactions, PeerId};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// A peer participating in transaction gossip.
#[derive(Debug)]
struct TxPeer {
    /// Command channel into the peer's session.
    to_session: mpsc::Sender<SessionCommand>,
    /// Whether the peer takes part in pooled transaction exchange.
    include_in_tx_pool: bool,
}

/// Manages transaction propagation to and from connected peers.
#[derive(Debug)]
pub struct TransactionsManager<P> {
    /// The transaction pool imports go into.
    pool: Arc<P>,
    /// All peers currently participating in gossip.
    peers: FxHashMap<PeerId, TxPeer>,
}

// === impl TransactionsManager ===

impl<P> TransactionsManager<P>
where
    P: TxPool + 'static,
{
    /// Creates a new manager importing into the given pool.
    pub fn new(pool: Arc<P>) -> Self {
        Self { pool, peers: FxHashMap::default() }
    }

    /// Number of peers in the broadcast set.
    pub fn broadcast_peers(&self) -> usize {
        self.peers.values().filter(|peer| peer.include_in_tx_pool).count()
    }

    /// Invoked when a new session was established.
    ///
    /// The peer joins the pooled-transaction broadcast set iff the negotiated
    /// version announces pooled transactions.
    pub fn on_session_established(
        &mut self,
        peer_id: PeerId,
        version: EthVersion,
        to_session: mpsc::Sender<SessionCommand>,
    ) {
        let include_in_tx_pool = version.has_pooled_transactions();
        trace!(target: "net::tx", ?peer_id, %version, include_in_tx_pool, "adding peer to tx gossip");
        self.peers.insert(peer_id, TxPeer { to_session, include_in_tx_pool });
    }

    /// Invoked when a session closed.
    pub fn on_session_closed(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    /// Handles a gossip message received from the peer.
    pub fn on_message(&mut self, peer_id: PeerId, message: PeerMessage) {
        match message {
            PeerMessage::ReceivedTransaction(transactions) => {
                self.pool.on_transactions(peer_id, transactions.0);
            }
            PeerMessage::PooledTransactionHashes(hashes) => {
                self.on_pooled_hashes(peer_id, hashes.0);
            }
            PeerMessage::NewBlock(_) | PeerMessage::NewBlockHashes(_) => {
                // block gossip is ignored, the consensus client drives the chain
                trace!(target: "net::tx", ?peer_id, "ignoring block gossip");
            }
        }
    }

    /// Requests the announced transactions from the peer and imports them
    /// once they arrive.
    fn on_pooled_hashes(&mut self, peer_id: PeerId, hashes: Vec<alloy_primitives::B256>) {
        if hashes.is_empty() {
            return
        }
        let Some(peer) = self.peers.get(&peer_id) else { return };

        let (tx, rx) = oneshot::channel();
        let request = PeerRequest::GetPooledTransactions {
            request: GetPooledTransactions(hashes),
            response: tx,
        };
        if peer.to_session.try_send(SessionCommand::Request(request)).is_err() {
            debug!(target: "net::tx", ?peer_id, "failed to request announced transactions");
            return
        }

        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(transactions)) => {
                    pool.on_transactions(peer_id, transactions.0);
                }
                Ok(Err(err)) => {
                    debug!(target: "net::tx", ?peer_id, %err, "pooled transactions request failed");
                }
                Err(_) => {}
            }
        });
    }

    /// Broadcasts the given transactions to every peer in the broadcast set.
    pub fn propagate_transactions(
        &mut self,
        transactions: Vec<quartz_eth_wire::TransactionSigned>,
    ) {
        if transactions.is_empty() {
            return
        }
        for (peer_id, peer) in
            self.peers.iter().filter(|(_, peer)| peer.include_in_tx_pool)
        {
            let message = quartz_eth_wire::EthMessage::Transactions(
                quartz_eth_wire::Transactions(transactions.clone()),
            );
            if peer.to_session.try_send(SessionCommand::Message(message)).is_err() {
                trace!(target: "net::tx", ?peer_id, "failed to propagate transactions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::noop::NoopTxPool;
    use quartz_eth_wire::{NewPooledTransactionHashes, Transactions};
    use alloy_primitives::B256;

    fn peer_channel() -> (mpsc::Sender<SessionCommand>, mpsc::Receiver<SessionCommand>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn broadcast_set_follows_protocol_version() {
        let mut manager = TransactionsManager::new(Arc::new(NoopTxPool));

        let (tx65, _rx65) = peer_channel();
        let (tx64, _rx64) = peer_channel();
        manager.on_session_established(PeerId::with_last_byte(1), EthVersion::Eth66, tx65);
        manager.on_session_established(PeerId::with_last_byte(2), EthVersion::Eth64, tx64);

        assert_eq!(manager.broadcast_peers(), 1);

        manager.on_session_closed(&PeerId::with_last_byte(1));
        assert_eq!(manager.broadcast_peers(), 0);
    }

    #[tokio::test]
    async fn pooled_hash_announcement_triggers_request() {
        let mut manager = TransactionsManager::new(Arc::new(NoopTxPool));
        let peer_id = PeerId::with_last_byte(1);
        let (tx, mut rx) = peer_channel();
        manager.on_session_established(peer_id, EthVersion::Eth66, tx);

        manager.on_message(
            peer_id,
            PeerMessage::PooledTransactionHashes(NewPooledTransactionHashes(vec![
                B256::with_last_byte(9),
            ])),
        );

        let command = rx.recv().await.unwrap();
        match command {
            SessionCommand::Request(PeerRequest::GetPooledTransactions { request, .. }) => {
                assert_eq!(request.0, vec![B256::with_last_byte(9)]);
            }
            command => panic!("unexpected command: {command:?}"),
        }
    }

    #[tokio::test]
    async fn block_gossip_is_dropped() {
        let mut manager = TransactionsManager::new(Arc::new(NoopTxPool));
        let peer_id = PeerId::with_last_byte(1);
        let (tx, mut rx) = peer_channel();
        manager.on_session_established(peer_id, EthVersion::Eth66, tx);

        manager.on_message(peer_id, PeerMessage::NewBlockHashes(Default::default()));
        manager.on_message(
            peer_id,
            PeerMessage::ReceivedTransaction(Transactions(Vec::new())),
        );

        // neither message produced an outgoing command
        assert!(rx.try_recv().is_err());
    }
}
