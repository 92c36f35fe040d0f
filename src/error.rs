//! Error types for the sync engine.

use crate::primitives::Hash;

/// Top level error for a synchronization pass.
///
/// Carried by [`crate::sync::SyncUpdate`] progress events, so it is cheap to
/// clone; io errors live in [`StorageError`] instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Node error.
    #[error("node error. {0}")]
    Node(#[from] NodeError),
    /// Block parse error.
    #[error("failed to parse block at height {height}. {source}")]
    BlockParse {
        /// Height of the block that failed to parse.
        height: u64,
        /// Parser error.
        #[source]
        source: BlockParseError,
    },
    /// The node could not provide global output indices for a transaction.
    #[error("failed to fetch global output indices for transaction {transaction_hash}. {source}")]
    GlobalIndices {
        /// Transaction the indices were requested for.
        transaction_hash: Hash,
        /// Node error.
        #[source]
        source: NodeError,
    },
    /// Synchronization state error.
    #[error("synchronization state error. {0}")]
    State(#[from] StateError),
    /// The pass was interrupted by shutdown.
    #[error("synchronization pass was cancelled")]
    Cancelled,
}

/// Errors surfaced by whoever services the node request channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// The request reached the node but failed.
    #[error("node request failed. {0}")]
    RequestFailed(String),
    /// The node answered with data the engine cannot use.
    #[error("node returned an invalid response. {0}")]
    InvalidResponse(String),
    /// The node-facing task was dropped.
    #[error("node request channel was dropped.")]
    Dropped,
}

/// A block or transaction blob the external parser rejected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct BlockParseError(pub String);

/// Violations of the per-consumer chain-prefix bookkeeping.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    /// Appended blocks must directly follow the known chain prefix.
    #[error(
        "blocks starting at height {start_height} are not contiguous with known chain height {known_height}"
    )]
    NonContiguousBlocks {
        /// Height of the first block in the rejected append.
        start_height: u64,
        /// Height of the last known block.
        known_height: u64,
    },
}

/// Errors loading or saving persisted state.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Persisted state belongs to a chain with a different genesis.
    #[error("genesis block hash does not match stored state")]
    GenesisMismatch,
    /// Persisted state was written by a newer revision.
    #[error("unsupported storage version {0}")]
    UnsupportedVersion(u32),
    /// Persisted state is structurally invalid.
    #[error("invalid stored data. {0}")]
    InvalidData(String),
    /// Underlying stream error.
    #[error("storage io error. {0}")]
    Io(#[from] std::io::Error),
}
