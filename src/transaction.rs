//! Interfaces consumed from the block parsing and cryptography layers.
//!
//! The engine never decodes wire bytes or performs curve arithmetic itself;
//! the embedder supplies these seams. Parsed transactions are shared between
//! consumers, so readers are handed around as `Arc<dyn TransactionReader>`.

use std::sync::Arc;

use crate::error::BlockParseError;
use crate::primitives::{AccountAddress, AccountKeys, BlockInfo, Hash, KeyImage, PublicKey, SecretKey};

/// A transaction input, as exposed by the external parser.
///
/// Input kinds the wallet does not track have no variant here; the reader
/// returns `None` for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionInput {
    /// Ring input spending a key output; carries the published key image.
    Key {
        /// Amount being spent.
        amount: u64,
        /// Key image of the output being spent.
        key_image: KeyImage,
    },
    /// Multisignature input referencing an output by amount and global index.
    Multisignature {
        /// Amount being spent.
        amount: u64,
        /// Global index of the referenced output.
        output_index: u64,
    },
}

/// A transaction output, as exposed by the external parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutput {
    /// One-time stealth key output.
    Key {
        /// Output amount.
        amount: u64,
        /// One-time output key.
        output_key: PublicKey,
    },
    /// Multisignature output.
    Multisignature {
        /// Output amount.
        amount: u64,
        /// Signatures required to spend.
        required_signatures: u32,
    },
}

/// Read access to one parsed transaction.
///
/// Implemented by the embedder's parsing layer. `find_outputs_to_account`
/// performs the stealth-address trial scan and is the only method that touches
/// key material.
pub trait TransactionReader: Send + Sync {
    /// The transaction's hash.
    fn transaction_hash(&self) -> Hash;

    /// The transaction's public key.
    fn transaction_public_key(&self) -> PublicKey;

    /// Raw unlock time: a block index below the currency's maximum block
    /// height, a unix timestamp otherwise.
    fn unlock_time(&self) -> u64;

    /// The transaction's payment id, if it carries one.
    fn payment_id(&self) -> Option<Hash>;

    /// Number of inputs.
    fn input_count(&self) -> usize;

    /// The input at `index`, or `None` for input kinds the wallet does not
    /// track.
    fn input(&self, index: usize) -> Option<TransactionInput>;

    /// Number of outputs.
    fn output_count(&self) -> usize;

    /// The output at `index`, or `None` for output kinds the wallet does not
    /// track.
    fn output(&self, index: usize) -> Option<TransactionOutput>;

    /// Trial-scans the outputs against an account, returning
    /// `(output index, amount)` for every output addressed to it.
    fn find_outputs_to_account(
        &self,
        address: &AccountAddress,
        view_secret_key: &SecretKey,
    ) -> Vec<(u64, u64)>;
}

/// Key image derivation seam.
pub trait KeyImageDeriver: Send + Sync {
    /// Derives the one-time ephemeral public key and key image for the output
    /// at `output_index` of a transaction with the given public key.
    ///
    /// The returned ephemeral key must equal the output's one-time key; the
    /// engine treats a mismatch as a fatal protocol violation.
    fn derive_key_image(
        &self,
        keys: &AccountKeys,
        transaction_public_key: &PublicKey,
        output_index: u64,
    ) -> (PublicKey, KeyImage);
}

/// Block parsing seam.
pub trait BlockParser: Send + Sync {
    /// Parses a raw block blob into its header data and miner transaction.
    fn parse_block(&self, blob: &[u8]) -> Result<ParsedBlock, BlockParseError>;

    /// Parses a raw transaction blob.
    fn parse_transaction(&self, blob: &[u8]) -> Result<Arc<dyn TransactionReader>, BlockParseError>;
}

/// The parts of a parsed block header the engine needs, plus the miner
/// transaction embedded in the block itself.
pub struct ParsedBlock {
    /// The block's hash.
    pub hash: Hash,
    /// The block's timestamp.
    pub timestamp: u64,
    /// The block's miner transaction.
    pub miner_transaction: Arc<dyn TransactionReader>,
}

/// A fully parsed block ready for consumer fan-out.
#[derive(Clone)]
pub struct CompleteBlock {
    /// The block's hash.
    pub block_hash: Hash,
    /// Height and timestamp of the block.
    pub info: BlockInfo,
    /// Miner transaction first, then user transactions in block order.
    pub transactions: Vec<Arc<dyn TransactionReader>>,
}
