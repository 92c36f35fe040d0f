//! Typed request channel to the remote node.
//!
//! The engine never speaks a wire protocol. Whenever it needs remote data it
//! sends a [`FetchRequest`] carrying a [`tokio::sync::oneshot::Sender`] for
//! the reply over an unbounded channel. Whoever services that channel plays
//! the node: the embedder's RPC client in production, a scripted task in
//! tests. The node's last known chain height travels the other way on a
//! [`tokio::sync::watch`] channel, which doubles as the height-update
//! observer hook.

use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::error::NodeError;
use crate::primitives::Hash;

/// A raw block entry as returned by the node: the block blob plus the blobs
/// of its user transactions.
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Serialized block, including the miner transaction.
    pub block: Vec<u8>,
    /// Serialized user transactions in block order.
    pub transactions: Vec<Vec<u8>>,
}

/// Response to [`FetchRequest::NewBlocks`].
#[derive(Debug, Clone)]
pub struct NewBlocksResponse {
    /// Height of the first returned block.
    pub start_height: u64,
    /// Raw blocks following the common ancestor, lowest first.
    pub blocks: Vec<RawBlock>,
}

/// Fetch requests are sent to the node-facing task whenever the engine needs
/// remote data.
///
/// Each variant includes a [`tokio::sync::oneshot::Sender`] for returning the
/// fetched data to the requester.
#[derive(Debug)]
pub enum FetchRequest {
    /// Gets the run of blocks following the most recent hash in the supplied
    /// sparse history that the node recognizes.
    NewBlocks(
        oneshot::Sender<Result<NewBlocksResponse, NodeError>>,
        Vec<Hash>,
    ),
    /// Gets the global output indices for every output of the given
    /// transaction.
    TransactionGlobalIndices(oneshot::Sender<Result<Vec<u64>, NodeError>>, Hash),
}

/// Gets the next run of blocks after the common ancestor located via
/// `known_hashes`.
///
/// Requires the node-facing task to be running concurrently, connected via
/// the `fetch_request` channel.
pub(crate) async fn get_new_blocks(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    known_hashes: Vec<Hash>,
) -> Result<NewBlocksResponse, NodeError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::NewBlocks(reply_sender, known_hashes))
        .map_err(|_| NodeError::Dropped)?;

    reply_receiver.await.map_err(|_| NodeError::Dropped)?
}

/// Gets the global output indices of a transaction's outputs.
///
/// Requires the node-facing task to be running concurrently, connected via
/// the `fetch_request` channel.
pub(crate) async fn get_transaction_global_indices(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    transaction_hash: Hash,
) -> Result<Vec<u64>, NodeError> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::TransactionGlobalIndices(
            reply_sender,
            transaction_hash,
        ))
        .map_err(|_| NodeError::Dropped)?;

    reply_receiver.await.map_err(|_| NodeError::Dropped)?
}
