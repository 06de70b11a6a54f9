//! Serves `eth` requests received from connected peers.

use crate::{
    message::RequestResult,
    traits::{BlockReader, TxPool},
};
use alloy_eips::BlockHashOrNumber;
use alloy_primitives::B256;
use futures::StreamExt;
use quartz_eth_wire::{
    BlockBodies, BlockBody, BlockHeaders, GetBlockBodies, GetBlockHeaders, GetNodeData,
    GetPooledTransactions, GetReceipts, HeadersDirection, NodeData, PeerId, PooledTransactions,
    Receipts,
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

// Limits: <https://github.com/ethereum/go-ethereum/blob/b0d44338bbcefee044f1f635a84487cbbd8f0538/eth/protocols/eth/handler.go#L34-L56>

/// Maximum number of block headers to serve.
///
/// Used to limit lookups.
const MAX_HEADERS_SERVE: usize = 1024;

/// Maximum number of block bodies to serve.
///
/// Used to limit lookups. With 24KB block sizes nowadays, the practical limit will always be
/// `SOFT_RESPONSE_LIMIT`.
const MAX_BODIES_SERVE: usize = 1024;

/// Maximum number of receipt lists to serve.
const MAX_RECEIPTS_SERVE: usize = 1024;

/// Maximum number of state tree nodes to serve.
const MAX_NODE_DATA_SERVE: usize = 1024;

/// Estimated size in bytes of an RLP encoded body.
const APPROX_BODY_SIZE: usize = 24 * 1024;

/// Maximum size of replies to data retrievals.
const SOFT_RESPONSE_LIMIT: usize = 2 * 1024 * 1024;

/// Estimated size in bytes of an RLP encoded header.
const APPROX_HEADER_SIZE: usize = 500;

/// Manages eth related requests on top of the p2p network.
///
/// This can be spawned to another task and is supposed to be run as background service.
#[derive(Debug)]
#[must_use = "Manager does nothing unless polled."]
pub struct EthRequestHandler<C, P> {
    /// The client type that can interact with the chain.
    client: Arc<C>,
    /// The transaction pool serving pooled transaction lookups.
    pool: Arc<P>,
    /// Incoming requests, read off the wire by the session workers.
    incoming_requests: UnboundedReceiverStream<IncomingEthRequest>,
}

// === impl EthRequestHandler ===

impl<C, P> EthRequestHandler<C, P>
where
    C: BlockReader,
    P: TxPool,
{
    /// Create a new instance
    pub fn new(client: Arc<C>, pool: Arc<P>, incoming: UnboundedReceiver<IncomingEthRequest>) -> Self {
        Self { client, pool, incoming_requests: UnboundedReceiverStream::new(incoming) }
    }

    /// Returns the list of requested headers
    fn get_headers_response(&self, request: GetBlockHeaders) -> Vec<alloy_consensus::Header> {
        let GetBlockHeaders { start_block, limit, skip, reverse } = request;

        let direction = HeadersDirection::new(reverse);
        let mut headers = Vec::new();

        let mut block: BlockHashOrNumber = match start_block {
            BlockHashOrNumber::Hash(start) => start.into(),
            BlockHashOrNumber::Number(num) => {
                let Some(hash) = self.client.block_hash(num) else { return headers };
                hash.into()
            }
        };

        let skip = skip as u64;
        let mut total_bytes = 0;

        for _ in 0..limit {
            let Some(header) = self.client.header_by_hash_or_number(block) else { break };

            match direction {
                HeadersDirection::Rising => {
                    if let Some(next) = (header.number + 1).checked_add(skip) {
                        block = next.into()
                    } else {
                        break
                    }
                }
                HeadersDirection::Falling => {
                    if skip > 0 {
                        // prevent under flows for block.number == 0 and `block.number - skip < 0`
                        if let Some(next) =
                            header.number.checked_sub(1).and_then(|num| num.checked_sub(skip))
                        {
                            block = next.into()
                        } else {
                            break
                        }
                    } else {
                        block = header.parent_hash.into()
                    }
                }
            }

            headers.push(header);

            if headers.len() >= MAX_HEADERS_SERVE {
                break
            }

            total_bytes += APPROX_HEADER_SIZE;
            if total_bytes > SOFT_RESPONSE_LIMIT {
                break
            }
        }

        headers
    }

    fn on_headers_request(
        &self,
        _peer_id: PeerId,
        request: GetBlockHeaders,
        response: oneshot::Sender<RequestResult<BlockHeaders>>,
    ) {
        let headers = self.get_headers_response(request);
        let _ = response.send(Ok(BlockHeaders(headers)));
    }

    fn on_bodies_request(
        &self,
        _peer_id: PeerId,
        request: GetBlockBodies,
        response: oneshot::Sender<RequestResult<BlockBodies>>,
    ) {
        let mut bodies = Vec::new();
        let mut total_bytes = 0;

        for hash in request.0 {
            let Some(block) = self.client.block_by_hash(hash) else { break };

            let body = BlockBody {
                transactions: block.body.transactions,
                ommers: block.body.ommers,
                withdrawals: block.body.withdrawals,
            };
            bodies.push(body);

            total_bytes += APPROX_BODY_SIZE;
            if total_bytes > SOFT_RESPONSE_LIMIT {
                break
            }

            if bodies.len() >= MAX_BODIES_SERVE {
                break
            }
        }

        let _ = response.send(Ok(BlockBodies(bodies)));
    }

    fn on_receipts_request(
        &self,
        _peer_id: PeerId,
        request: GetReceipts,
        response: oneshot::Sender<RequestResult<Receipts>>,
    ) {
        let mut receipts = Vec::new();

        for hash in request.0 {
            let Some(receipts_by_block) = self.client.receipts_by_block_hash(hash) else { break };

            receipts.push(receipts_by_block);

            if receipts.len() >= MAX_RECEIPTS_SERVE {
                break
            }
        }

        let _ = response.send(Ok(Receipts(receipts)));
    }

    fn on_node_data_request(
        &self,
        _peer_id: PeerId,
        request: GetNodeData,
        response: oneshot::Sender<RequestResult<NodeData>>,
    ) {
        let mut nodes = Vec::new();
        let mut total_bytes = 0;

        for hash in request.0 {
            let Some(node) = self.client.trie_node(hash) else { continue };

            total_bytes += node.len();
            nodes.push(node);

            if nodes.len() >= MAX_NODE_DATA_SERVE || total_bytes > SOFT_RESPONSE_LIMIT {
                break
            }
        }

        let _ = response.send(Ok(NodeData(nodes)));
    }

    fn on_pooled_transactions_request(
        &self,
        _peer_id: PeerId,
        request: GetPooledTransactions,
        response: oneshot::Sender<RequestResult<PooledTransactions>>,
    ) {
        let transactions = self.pool.pooled_transactions(&request.0);
        let _ = response.send(Ok(PooledTransactions(transactions)));
    }
}

/// An endless future.
///
/// This should be spawned or used as part of `tokio::select!`.
impl<C, P> Future for EthRequestHandler<C, P>
where
    C: BlockReader + Unpin,
    P: TxPool + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match this.incoming_requests.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Ready(Some(incoming)) => match incoming {
                    IncomingEthRequest::GetBlockHeaders { peer_id, request, response } => {
                        this.on_headers_request(peer_id, request, response)
                    }
                    IncomingEthRequest::GetBlockBodies { peer_id, request, response } => {
                        this.on_bodies_request(peer_id, request, response)
                    }
                    IncomingEthRequest::GetReceipts { peer_id, request, response } => {
                        this.on_receipts_request(peer_id, request, response)
                    }
                    IncomingEthRequest::GetNodeData { peer_id, request, response } => {
                        this.on_node_data_request(peer_id, request, response)
                    }
                    IncomingEthRequest::GetPooledTransactions { peer_id, request, response } => {
                        this.on_pooled_transactions_request(peer_id, request, response)
                    }
                },
            }
        }
    }
}

/// All `eth` requests related to blocks delegated by the network.
#[derive(Debug)]
pub enum IncomingEthRequest {
    /// Request block headers from the peer, the response should be sent
    /// through the channel.
    GetBlockHeaders {
        /// The remote peer that sent the request.
        peer_id: PeerId,
        /// The request.
        request: GetBlockHeaders,
        /// The channel the response is sent through.
        response: oneshot::Sender<RequestResult<BlockHeaders>>,
    },
    /// Request block bodies from the peer.
    GetBlockBodies {
        /// The remote peer that sent the request.
        peer_id: PeerId,
        /// The request.
        request: GetBlockBodies,
        /// The channel the response is sent through.
        response: oneshot::Sender<RequestResult<BlockBodies>>,
    },
    /// Request receipts from the peer.
    GetReceipts {
        /// The remote peer that sent the request.
        peer_id: PeerId,
        /// The request.
        request: GetReceipts,
        /// The channel the response is sent through.
        response: oneshot::Sender<RequestResult<Receipts>>,
    },
    /// Request state tree nodes from the peer.
    GetNodeData {
        /// The remote peer that sent the request.
        peer_id: PeerId,
        /// The request.
        request: GetNodeData,
        /// The channel the response is sent through.
        response: oneshot::Sender<RequestResult<NodeData>>,
    },
    /// Request pooled transactions from the peer.
    GetPooledTransactions {
        /// The remote peer that sent the request.
        peer_id: PeerId,
        /// The request.
        request: GetPooledTransactions,
        /// The channel the response is sent through.
        response: oneshot::Sender<RequestResult<PooledTransactions>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{noop::NoopTxPool, HeaderReader};
    use alloy_consensus::Header;
    use alloy_primitives::Bytes;
    use parking_lot::RwLock;
    use quartz_eth_wire::Block;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    /// An in-memory chain of empty blocks.
    #[derive(Debug, Default)]
    struct MockChain {
        by_hash: RwLock<HashMap<B256, Block>>,
        by_number: RwLock<HashMap<u64, B256>>,
    }

    impl MockChain {
        fn extend(&self, count: u64) {
            let mut parent_hash = B256::ZERO;
            for number in 0..count {
                let header = Header { number, parent_hash, ..Default::default() };
                let hash = header.hash_slow();
                let block = Block::new(header, Default::default());
                self.by_hash.write().insert(hash, block);
                self.by_number.write().insert(number, hash);
                parent_hash = hash;
            }
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

        fn receipts_by_block_hash(&self, _hash: B256) -> Option<Vec<alloy_consensus::ReceiptWithBloom>> {
            Some(Vec::new())
        }

        fn trie_node(&self, _hash: B256) -> Option<Bytes> {
            None
        }
    }

    #[tokio::test]
    async fn serves_header_request_rising() {
        let chain = Arc::new(MockChain::default());
        chain.extend(32);

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = EthRequestHandler::new(chain, Arc::new(NoopTxPool), rx);
        tokio::spawn(handler);

        let (response_tx, response_rx) = oneshot::channel();
        tx.send(IncomingEthRequest::GetBlockHeaders {
            peer_id: PeerId::ZERO,
            request: GetBlockHeaders {
                start_block: BlockHashOrNumber::Number(10),
                limit: 5,
                skip: 0,
                reverse: false,
            },
            response: response_tx,
        })
        .unwrap();

        let headers = response_rx.await.unwrap().unwrap().0;
        assert_eq!(headers.len(), 5);
        assert_eq!(headers.first().unwrap().number, 10);
        assert_eq!(headers.last().unwrap().number, 14);
    }

    #[tokio::test]
    async fn header_request_for_unknown_block_is_empty() {
        let chain = Arc::new(MockChain::default());
        chain.extend(4);

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = EthRequestHandler::new(chain, Arc::new(NoopTxPool), rx);
        tokio::spawn(handler);

        let (response_tx, response_rx) = oneshot::channel();
        tx.send(IncomingEthRequest::GetBlockHeaders {
            peer_id: PeerId::ZERO,
            request: GetBlockHeaders {
                start_block: BlockHashOrNumber::Number(100),
                limit: 5,
                skip: 0,
                reverse: false,
            },
            response: response_tx,
        })
        .unwrap();

        assert!(response_rx.await.unwrap().unwrap().0.is_empty());
    }
}
