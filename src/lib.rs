#![warn(missing_docs)]
#![doc = r#"
# Cinder Sync

## Overview
Cinder-sync is the wallet-side transfer synchronization engine for
CryptoNote-style chains. It follows the chain advertised by a remote node,
pulls new blocks into memory, feeds every transaction through per-account
detectors and maintains, for each subscribed account, an indexed and
persistable set of the outputs it owns, which of those have been spent, and
whether each output is currently spendable under the protocol's time and
height based lock rules.

- Multi-account fan-out: one blockchain fetch serves any number of account
  subscriptions, each with its own resumable cursor.
- Reorg safe: forks are detected against a sparse short history, consumers are
  detached before new blocks are delivered, and rolled-back spends revert to
  the owned set.
- Parallel scanning: each block batch is processed by a pool of workers over a
  bounded queue, sized to the host's parallelism.
- Versioned persistence: every component serializes to a compact little-endian
  binary form and rejects state written by newer revisions.

The node transport, block and transaction parsing, and the stealth-address
cryptography stay outside the crate: the engine talks to the node through the
[`client::FetchRequest`] channel and to the parser and key-image math through
the seams in [`transaction`].

## Terminology
- Known height - the remote node's local chain height, delivered on a watch
  channel.
- Short history - the sparse doubling-gap back-walk of known block hashes sent
  to the node to locate a common ancestor.
- Detach - the reaction to a reorg: discard records at or above the fork
  height and resume sync from there.
- Key image - the published image of a spent key output, used to detect spends
  without revealing which output is being spent.
- Spendable age - minimum confirmation depth before an owned output is
  considered fully unlocked.
- Soft lock - an output past its unlock time but not yet past the spendable
  age.

## Dataflow
1. The [`sync::BlockchainSynchronizer`] computes the short history of the
   consumer furthest behind and requests the next run of blocks.
2. Fetched blobs are parsed into complete blocks; each consumer's
   [`sync::state::SynchronizationState`] decides between detach and append.
3. Each [`TransfersConsumer`] scans the batch in a worker pool, detecting
   owned outputs and deriving their key images, and records outputs and
   spends in its [`TransfersContainer`].
4. Observers receive progress updates per pass and transfer events per
   relevant transaction.

The [`TransfersSynchronizer`] façade owns the subscriptions and routes
whole-wallet save and load.
"#]

pub mod client;
pub mod error;
pub mod primitives;
mod serialization;
pub mod sync;
pub mod transaction;
pub mod transfers;

pub use sync::state::SynchronizationState;
pub use sync::{BlockchainConsumer, BlockchainSynchronizer, CancelToken, SyncUpdate};
pub use transfers::TransfersSynchronizer;
pub use transfers::consumer::{TransferEvent, TransfersConsumer};
pub use transfers::container::{TransferFlags, TransfersContainer};
