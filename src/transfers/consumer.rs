//! Per-account block processor.
//!
//! Scans every transaction of a block batch for outputs owned by the
//! subscribed account and for inputs spending them, deriving key images for
//! owned key outputs, and drives the account's [`TransfersContainer`].

use std::sync::{Arc, Mutex};
use std::thread;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::client::{self, FetchRequest};
use crate::error::{NodeError, SyncError};
use crate::primitives::{AccountAddress, AccountSubscription, BlockInfo, Currency, Hash};
use crate::sync::{BlockchainConsumer, CancelToken};
use crate::transaction::{CompleteBlock, KeyImageDeriver, TransactionOutput, TransactionReader};
use crate::transfers::container::{
    DetectedOutput, OutputDetails, TransactionOutputInformation, TransfersContainer,
};

/// Emitted whenever a processed transaction moves funds for the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    /// The subscribed account.
    pub address: AccountAddress,
    /// The transaction that moved funds.
    pub transaction_hash: Hash,
    /// Amount received by the account.
    pub amount_in: u64,
    /// Amount spent by the account.
    pub amount_out: u64,
}

/// Tracks one account's transfers by consuming blockchain events.
pub struct TransfersConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    subscription: AccountSubscription,
    deriver: Arc<dyn KeyImageDeriver>,
    fetch_request_sender: UnboundedSender<FetchRequest>,
    container: TransfersContainer,
    observers: Mutex<Vec<UnboundedSender<TransferEvent>>>,
}

impl TransfersConsumer {
    /// Constructs a consumer for `subscription` with an empty container.
    pub fn new(
        currency: Currency,
        subscription: AccountSubscription,
        deriver: Arc<dyn KeyImageDeriver>,
        fetch_request_sender: UnboundedSender<FetchRequest>,
    ) -> Self {
        let container = TransfersContainer::new(currency, subscription.transaction_spendable_age);

        Self {
            inner: Arc::new(ConsumerInner {
                subscription,
                deriver,
                fetch_request_sender,
                container,
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The subscribed account's address.
    pub fn address(&self) -> AccountAddress {
        self.inner.subscription.keys.address
    }

    /// The account's transfers container.
    pub fn container(&self) -> &TransfersContainer {
        &self.inner.container
    }

    /// Registers an observer for this account's transfer events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .observers
            .lock()
            .expect("observer registry lock poisoned")
            .push(sender);

        receiver
    }
}

#[async_trait]
impl BlockchainConsumer for TransfersConsumer {
    async fn on_blockchain_detach(&self, height: u64) {
        self.inner.container.detach(height);
    }

    async fn on_new_blocks(
        &self,
        blocks: &[CompleteBlock],
        start_height: u64,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        let new_height = start_height + blocks.len() as u64;
        let workers = worker_count();
        let (transaction_sender, transaction_receiver) =
            mpsc::channel::<(BlockInfo, Arc<dyn TransactionReader>)>(workers * 2);
        let transaction_receiver = Arc::new(tokio::sync::Mutex::new(transaction_receiver));

        let mut handles: Vec<JoinHandle<Result<(), SyncError>>> = Vec::with_capacity(workers);
        for _ in 0..workers {
            let inner = self.inner.clone();
            let receiver = transaction_receiver.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut first_error: Option<SyncError> = None;
                loop {
                    let item = receiver.lock().await.recv().await;
                    let Some((block_info, transaction)) = item else {
                        break;
                    };
                    if cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    if let Err(e) = inner
                        .process_transaction(block_info, transaction.as_ref())
                        .await
                    {
                        tracing::warn!(
                            "skipping transaction {}. {e}",
                            transaction.transaction_hash()
                        );
                        first_error.get_or_insert(e);
                    }
                }
                match first_error {
                    Some(error) => Err(error),
                    None => Ok(()),
                }
            }));
        }
        // only workers hold the queue from here; the producer's send fails
        // instead of blocking once they have all exited
        drop(transaction_receiver);

        let mut cancelled = false;
        'producer: for block in blocks {
            for transaction in &block.transactions {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'producer;
                }
                if transaction_sender
                    .send((block.info, transaction.clone()))
                    .await
                    .is_err()
                {
                    // all workers are gone; the join below surfaces the cause
                    break 'producer;
                }
            }
        }
        drop(transaction_sender);

        let mut result = if cancelled {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        };
        for join_result in join_all(handles).await {
            let worker_result = join_result.expect("transfer worker panicked");
            if result.is_ok() {
                result = worker_result;
            }
        }
        result?;

        self.inner.container.update_height(new_height);

        Ok(())
    }
}

impl ConsumerInner {
    async fn process_transaction(
        &self,
        block_info: BlockInfo,
        transaction: &dyn TransactionReader,
    ) -> Result<(), SyncError> {
        let detected = self.detect_outputs(transaction).await?;
        let (amount_in, amount_out) =
            self.container
                .add_transaction(block_info, transaction, &detected);

        if amount_in > 0 || amount_out > 0 {
            self.notify_transfer(TransferEvent {
                address: self.subscription.keys.address,
                transaction_hash: transaction.transaction_hash(),
                amount_in,
                amount_out,
            });
        }

        Ok(())
    }

    async fn detect_outputs(
        &self,
        transaction: &dyn TransactionReader,
    ) -> Result<Vec<DetectedOutput>, SyncError> {
        let keys = &self.subscription.keys;
        let owned = transaction.find_outputs_to_account(&keys.address, &keys.view_secret_key);
        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let transaction_hash = transaction.transaction_hash();
        let transaction_public_key = transaction.transaction_public_key();
        let global_indices =
            client::get_transaction_global_indices(&self.fetch_request_sender, transaction_hash)
                .await
                .map_err(|source| SyncError::GlobalIndices {
                    transaction_hash,
                    source,
                })?;

        let mut detected = Vec::with_capacity(owned.len());
        for (index, _amount) in owned {
            let global_output_index = *global_indices.get(index as usize).ok_or_else(|| {
                SyncError::GlobalIndices {
                    transaction_hash,
                    source: NodeError::InvalidResponse(format!(
                        "missing global index for output {index}"
                    )),
                }
            })?;

            match transaction.output(index as usize) {
                Some(TransactionOutput::Key { amount, output_key }) => {
                    let (ephemeral_public_key, key_image) =
                        self.deriver
                            .derive_key_image(keys, &transaction_public_key, index);
                    assert_eq!(
                        ephemeral_public_key, output_key,
                        "derived ephemeral key does not match the key of output {index} in transaction {transaction_hash}",
                    );

                    detected.push(DetectedOutput {
                        information: TransactionOutputInformation {
                            amount,
                            global_output_index,
                            output_in_transaction: index,
                            transaction_public_key,
                            details: OutputDetails::Key { output_key },
                        },
                        key_image: Some(key_image),
                    });
                }
                Some(TransactionOutput::Multisignature {
                    amount,
                    required_signatures,
                }) => {
                    detected.push(DetectedOutput {
                        information: TransactionOutputInformation {
                            amount,
                            global_output_index,
                            output_in_transaction: index,
                            transaction_public_key,
                            details: OutputDetails::Multisignature {
                                required_signatures,
                            },
                        },
                        key_image: None,
                    });
                }
                None => {}
            }
        }

        Ok(detected)
    }

    fn notify_transfer(&self, event: TransferEvent) {
        let mut observers = self
            .observers
            .lock()
            .expect("observer registry lock poisoned");
        observers.retain(|observer| observer.send(event).is_ok());
    }
}

fn worker_count() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(2)
        .max(2)
}
