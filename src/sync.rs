//! Blockchain synchronizer: drives the sync loop against the remote node and
//! fans fetched blocks out to registered consumers.
//!
//! One background task owns the loop. A pass fetches the run of blocks after
//! the common ancestor of the slowest consumer, parses them, and walks the
//! consumer registry: detach notifications always precede block delivery for
//! the same consumer, and the registry lock is never held across a consumer
//! callback. Passes repeat until no consumer accepts new blocks and the node
//! reports nothing further, then the task idles until the node's known height
//! changes.

use std::io::{Read, Write};
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{self, FetchRequest, NewBlocksResponse};
use crate::error::{StorageError, SyncError};
use crate::primitives::{BlockInfo, Hash};
use crate::transaction::{BlockParser, CompleteBlock};

pub mod state;

use state::{BlockchainInterval, SynchronizationState};

/// Cooperative cancellation token shared between the synchronizer and
/// consumer workers.
///
/// Checked between batches in the sync loop and between transactions in
/// consumer workers; cancellation never tears a transaction mid-apply.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Constructs a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, atomic::Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(atomic::Ordering::Acquire)
    }
}

/// A consumer of blockchain events, registered with the
/// [`BlockchainSynchronizer`].
#[async_trait]
pub trait BlockchainConsumer: Send + Sync {
    /// The chain reorganized; discard all records at or above `height`.
    async fn on_blockchain_detach(&self, height: u64);

    /// Process `blocks`, the first of which sits at `start_height`.
    ///
    /// An error ends the current pass without advancing this consumer's
    /// synchronization state.
    async fn on_new_blocks(
        &self,
        blocks: &[CompleteBlock],
        start_height: u64,
        cancel: &CancelToken,
    ) -> Result<(), SyncError>;
}

/// Progress event emitted after every processing pass and on every node
/// error.
#[derive(Debug, Clone)]
pub struct SyncUpdate {
    /// Height the engine has processed up to.
    pub processed_height: u64,
    /// The node's last known chain height at the time of the event.
    pub known_height: u64,
    /// Set when the pass ended in an error.
    pub error: Option<SyncError>,
}

#[derive(Clone)]
struct ConsumerEntry {
    consumer: Arc<dyn BlockchainConsumer>,
    state: Arc<Mutex<SynchronizationState>>,
}

struct SyncInner {
    genesis_block_hash: Hash,
    parser: Arc<dyn BlockParser>,
    fetch_request_sender: UnboundedSender<FetchRequest>,
    last_known_height: watch::Receiver<u64>,
    consumers: Mutex<Vec<(usize, ConsumerEntry)>>,
    observers: Mutex<Vec<UnboundedSender<SyncUpdate>>>,
}

#[derive(Default)]
struct Lifecycle {
    cancel: CancelToken,
    shutdown_sender: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Pulls blocks from the remote node and fans them out to consumers.
pub struct BlockchainSynchronizer {
    inner: Arc<SyncInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl BlockchainSynchronizer {
    /// Constructs a synchronizer for the chain rooted at
    /// `genesis_block_hash`.
    ///
    /// `last_known_height` carries the node's local block height; every
    /// change triggers a sync pass while the synchronizer is running.
    pub fn new(
        genesis_block_hash: Hash,
        parser: Arc<dyn BlockParser>,
        fetch_request_sender: UnboundedSender<FetchRequest>,
        last_known_height: watch::Receiver<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                genesis_block_hash,
                parser,
                fetch_request_sender,
                last_known_height,
                consumers: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Registers a consumer with a fresh synchronization state seeded with
    /// the configured genesis hash. Re-registering a consumer is a no-op.
    pub fn add_consumer(&self, consumer: Arc<dyn BlockchainConsumer>) {
        let key = consumer_key(&consumer);
        let mut consumers = self.inner.lock_consumers();
        if consumers.iter().any(|(existing, _)| *existing == key) {
            return;
        }
        consumers.push((
            key,
            ConsumerEntry {
                consumer,
                state: Arc::new(Mutex::new(SynchronizationState::new(
                    self.inner.genesis_block_hash,
                ))),
            },
        ));
    }

    /// Unregisters a consumer, returning whether it was present.
    pub fn remove_consumer(&self, consumer: &Arc<dyn BlockchainConsumer>) -> bool {
        let key = consumer_key(consumer);
        let mut consumers = self.inner.lock_consumers();
        let before = consumers.len();
        consumers.retain(|(existing, _)| *existing != key);

        consumers.len() != before
    }

    /// Serializes a registered consumer's synchronization state.
    pub fn save_consumer_state<W: Write>(
        &self,
        consumer: &Arc<dyn BlockchainConsumer>,
        writer: W,
    ) -> Result<(), StorageError> {
        let state = self
            .consumer_state(consumer)
            .ok_or_else(|| StorageError::InvalidData("consumer is not registered".to_string()))?;
        let state = state.lock().expect("state lock poisoned");
        state.save(writer)
    }

    /// Replaces a registered consumer's synchronization state with a
    /// previously saved one.
    ///
    /// Fails with [`StorageError::GenesisMismatch`] if the stored state was
    /// seeded from a different genesis.
    pub fn load_consumer_state<R: Read>(
        &self,
        consumer: &Arc<dyn BlockchainConsumer>,
        reader: R,
    ) -> Result<(), StorageError> {
        let state = self
            .consumer_state(consumer)
            .ok_or_else(|| StorageError::InvalidData("consumer is not registered".to_string()))?;
        let loaded = SynchronizationState::load(reader)?;
        if loaded.genesis_block_hash() != self.inner.genesis_block_hash {
            return Err(StorageError::GenesisMismatch);
        }
        *state.lock().expect("state lock poisoned") = loaded;

        Ok(())
    }

    /// Registers an observer for progress events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncUpdate> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .observers
            .lock()
            .expect("observer registry lock poisoned")
            .push(sender);

        receiver
    }

    /// Starts the sync task. Idempotent; a running synchronizer is left
    /// untouched.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
        if lifecycle.handle.is_some() {
            return;
        }

        let (shutdown_sender, mut shutdown_receiver) = mpsc::channel::<()>(1);
        let cancel = CancelToken::new();
        lifecycle.cancel = cancel.clone();
        lifecycle.shutdown_sender = Some(shutdown_sender);

        let inner = self.inner.clone();
        let mut last_known_height = self.inner.last_known_height.clone();
        lifecycle.handle = Some(tokio::spawn(async move {
            tracing::info!("blockchain synchronizer started");
            loop {
                run_sync_session(&inner, &cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_receiver.recv() => break,
                    changed = last_known_height.changed() => {
                        if changed.is_err() {
                            // node side is gone; nothing left to sync against
                            break;
                        }
                    }
                }
            }
            tracing::info!("blockchain synchronizer shut down");
        }));
    }

    /// Stops the sync task, waiting for an in-flight pass to wind down.
    /// Idempotent.
    pub async fn stop(&self) {
        let handle = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            lifecycle.cancel.cancel();
            lifecycle.shutdown_sender = None;
            lifecycle.handle.take()
        };
        if let Some(handle) = handle {
            handle.await.expect("sync task panicked");
        }
    }

    /// Writes the configured genesis hash as the storage header.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<(), StorageError> {
        self.inner.genesis_block_hash.write(&mut writer)?;

        Ok(())
    }

    /// Reads a storage header and verifies it against the configured genesis
    /// hash.
    pub fn load<R: Read>(&self, mut reader: R) -> Result<(), StorageError> {
        let stored = Hash::read(&mut reader)?;
        if stored != self.inner.genesis_block_hash {
            return Err(StorageError::GenesisMismatch);
        }

        Ok(())
    }

    fn consumer_state(
        &self,
        consumer: &Arc<dyn BlockchainConsumer>,
    ) -> Option<Arc<Mutex<SynchronizationState>>> {
        let key = consumer_key(consumer);
        self.inner
            .lock_consumers()
            .iter()
            .find(|(existing, _)| *existing == key)
            .map(|(_, entry)| entry.state.clone())
    }
}

fn consumer_key(consumer: &Arc<dyn BlockchainConsumer>) -> usize {
    Arc::as_ptr(consumer) as *const () as usize
}

/// Drives passes until the chain is drained, a pass fails, or cancellation is
/// requested.
async fn run_sync_session(inner: &Arc<SyncInner>, cancel: &CancelToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let Some(history) = inner.common_short_history() else {
            // no consumers registered
            return;
        };
        let response = match client::get_new_blocks(&inner.fetch_request_sender, history).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!("block fetch failed. {error}");
                inner.notify_progress(
                    inner.lowest_consumer_height(),
                    inner.last_known_height(),
                    Some(error.into()),
                );
                return;
            }
        };
        if !inner.process_blocks(response, cancel).await {
            return;
        }
    }
}

impl SyncInner {
    fn lock_consumers(&self) -> MutexGuard<'_, Vec<(usize, ConsumerEntry)>> {
        self.consumers.lock().expect("consumer registry lock poisoned")
    }

    fn last_known_height(&self) -> u64 {
        *self.last_known_height.borrow()
    }

    /// Short history of the consumer furthest behind; the node answers from
    /// the first common ancestor, so advancing the slowest consumer each
    /// round lets every consumer reach the tip.
    fn common_short_history(&self) -> Option<Vec<Hash>> {
        let consumers = self.lock_consumers();
        consumers
            .iter()
            .min_by_key(|(_, entry)| entry.state.lock().expect("state lock poisoned").height())
            .map(|(_, entry)| {
                entry
                    .state
                    .lock()
                    .expect("state lock poisoned")
                    .short_history()
            })
    }

    fn lowest_consumer_height(&self) -> u64 {
        self.lock_consumers()
            .iter()
            .map(|(_, entry)| entry.state.lock().expect("state lock poisoned").height())
            .min()
            .unwrap_or(0)
    }

    /// Parses a fetched batch and hands it to the consumers. Returns whether
    /// another pass should follow.
    async fn process_blocks(&self, response: NewBlocksResponse, cancel: &CancelToken) -> bool {
        let new_height = response.start_height + response.blocks.len() as u64;
        let mut interval = BlockchainInterval {
            start_height: response.start_height,
            block_hashes: Vec::with_capacity(response.blocks.len()),
        };
        let mut blocks = Vec::with_capacity(response.blocks.len());

        for (i, raw) in response.blocks.iter().enumerate() {
            let height = response.start_height + i as u64;
            let parsed = match self.parser.parse_block(&raw.block) {
                Ok(parsed) => parsed,
                Err(source) => {
                    return self.abort_pass(SyncError::BlockParse { height, source });
                }
            };
            let mut transactions = Vec::with_capacity(raw.transactions.len() + 1);
            transactions.push(parsed.miner_transaction);
            for blob in &raw.transactions {
                match self.parser.parse_transaction(blob) {
                    Ok(transaction) => transactions.push(transaction),
                    Err(source) => {
                        return self.abort_pass(SyncError::BlockParse { height, source });
                    }
                }
            }
            interval.block_hashes.push(parsed.hash);
            blocks.push(CompleteBlock {
                block_hash: parsed.hash,
                info: BlockInfo {
                    height,
                    timestamp: parsed.timestamp,
                },
                transactions,
            });
        }

        let blocks_added = match self.update_consumers(&interval, &blocks, cancel).await {
            Ok(blocks_added) => blocks_added,
            Err(SyncError::Cancelled) => return false,
            Err(error) => return self.abort_pass(error),
        };

        self.notify_progress(new_height, self.last_known_height(), None);

        blocks_added || self.last_known_height() > new_height
    }

    /// Reconciles the fetched interval with every consumer, in registration
    /// order, detach before append.
    async fn update_consumers(
        &self,
        interval: &BlockchainInterval,
        blocks: &[CompleteBlock],
        cancel: &CancelToken,
    ) -> Result<bool, SyncError> {
        // snapshot so consumer callbacks run without the registry lock
        let snapshot: Vec<ConsumerEntry> = self
            .lock_consumers()
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect();

        let mut blocks_added = false;
        for entry in snapshot {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let check = entry
                .state
                .lock()
                .expect("state lock poisoned")
                .check_interval(interval);
            if check.detach_required {
                tracing::info!("chain reorganization detected at height {}", check.detach_height);
                entry.consumer.on_blockchain_detach(check.detach_height).await;
                entry
                    .state
                    .lock()
                    .expect("state lock poisoned")
                    .detach(check.detach_height);
            }
            if check.has_new_blocks {
                let offset = (check.new_block_height - interval.start_height) as usize;
                entry
                    .consumer
                    .on_new_blocks(&blocks[offset..], check.new_block_height, cancel)
                    .await?;
                entry
                    .state
                    .lock()
                    .expect("state lock poisoned")
                    .add_blocks(&interval.block_hashes[offset..], check.new_block_height)?;
                blocks_added = true;
            }
        }

        Ok(blocks_added)
    }

    fn abort_pass(&self, error: SyncError) -> bool {
        tracing::warn!("aborting sync pass. {error}");
        self.notify_progress(
            self.lowest_consumer_height(),
            self.last_known_height(),
            Some(error),
        );

        false
    }

    fn notify_progress(&self, processed_height: u64, known_height: u64, error: Option<SyncError>) {
        let mut observers = self
            .observers
            .lock()
            .expect("observer registry lock poisoned");
        observers.retain(|observer| {
            observer
                .send(SyncUpdate {
                    processed_height,
                    known_height,
                    error: error.clone(),
                })
                .is_ok()
        });
    }
}
