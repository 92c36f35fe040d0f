//! Transfers synchronizer: owns the per-account consumers and routes
//! whole-wallet persistence.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::client::FetchRequest;
use crate::error::StorageError;
use crate::primitives::{AccountAddress, AccountSubscription, Currency, Hash};
use crate::serialization::{read_blob, read_varint, write_blob, write_varint};
use crate::sync::{BlockchainConsumer, BlockchainSynchronizer};
use crate::transaction::{BlockParser, KeyImageDeriver};
use crate::transfers::consumer::TransfersConsumer;

pub mod consumer;
pub mod container;

const STORAGE_VERSION: u32 = 0;

/// Owns one [`TransfersConsumer`] per subscribed account and the
/// [`BlockchainSynchronizer`] feeding them.
pub struct TransfersSynchronizer {
    currency: Currency,
    deriver: Arc<dyn KeyImageDeriver>,
    fetch_request_sender: UnboundedSender<FetchRequest>,
    synchronizer: BlockchainSynchronizer,
    subscriptions: BTreeMap<AccountAddress, Arc<TransfersConsumer>>,
}

impl TransfersSynchronizer {
    /// Constructs a transfers synchronizer with no subscriptions.
    pub fn new(
        currency: Currency,
        genesis_block_hash: Hash,
        parser: Arc<dyn BlockParser>,
        deriver: Arc<dyn KeyImageDeriver>,
        fetch_request_sender: UnboundedSender<FetchRequest>,
        last_known_height: watch::Receiver<u64>,
    ) -> Self {
        let synchronizer = BlockchainSynchronizer::new(
            genesis_block_hash,
            parser,
            fetch_request_sender.clone(),
            last_known_height,
        );

        Self {
            currency,
            deriver,
            fetch_request_sender,
            synchronizer,
            subscriptions: BTreeMap::new(),
        }
    }

    /// The blockchain synchronizer feeding the subscriptions; start, stop and
    /// progress observation happen here.
    pub fn synchronizer(&self) -> &BlockchainSynchronizer {
        &self.synchronizer
    }

    /// Subscribes an account, registering its consumer with the blockchain
    /// synchronizer. Idempotent on address: an existing consumer is returned
    /// unchanged.
    pub fn add_subscription(&mut self, subscription: AccountSubscription) -> Arc<TransfersConsumer> {
        let address = subscription.keys.address;
        if let Some(consumer) = self.subscriptions.get(&address) {
            return consumer.clone();
        }

        let consumer = Arc::new(TransfersConsumer::new(
            self.currency,
            subscription,
            self.deriver.clone(),
            self.fetch_request_sender.clone(),
        ));
        self.synchronizer.add_consumer(consumer.clone());
        self.subscriptions.insert(address, consumer.clone());

        consumer
    }

    /// Unsubscribes an account, unregistering its consumer. Returns whether
    /// the account was subscribed.
    pub fn remove_subscription(&mut self, address: &AccountAddress) -> bool {
        match self.subscriptions.remove(address) {
            Some(consumer) => {
                let handle: Arc<dyn BlockchainConsumer> = consumer;
                self.synchronizer.remove_consumer(&handle);
                true
            }
            None => false,
        }
    }

    /// The consumer tracking `address`, if subscribed.
    pub fn subscription(&self, address: &AccountAddress) -> Option<&Arc<TransfersConsumer>> {
        self.subscriptions.get(address)
    }

    /// Addresses of all subscribed accounts.
    pub fn subscriptions(&self) -> Vec<AccountAddress> {
        self.subscriptions.keys().copied().collect()
    }

    /// Serializes the synchronizer header and every subscription's state into
    /// `writer`.
    ///
    /// Each subscription is stored as its address followed by an opaque blob
    /// holding the synchronization state and the transfers container, so a
    /// loader can skip accounts it does not know.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<(), StorageError> {
        self.synchronizer.save(&mut writer)?;
        writer.write_u32::<LittleEndian>(STORAGE_VERSION)?;
        write_varint(&mut writer, self.subscriptions.len() as u64)?;

        for (address, consumer) in &self.subscriptions {
            address.write(&mut writer)?;

            let mut blob = Vec::new();
            let handle: Arc<dyn BlockchainConsumer> = consumer.clone();
            self.synchronizer.save_consumer_state(&handle, &mut blob)?;
            consumer.container().save(&mut blob)?;
            write_blob(&mut writer, &blob)?;
        }

        Ok(())
    }

    /// Restores subscription state saved by [`Self::save`].
    ///
    /// Fails with [`StorageError::GenesisMismatch`] when the stored header
    /// belongs to a different chain. Stored accounts that are not currently
    /// subscribed are skipped.
    pub fn load<R: Read>(&self, mut reader: R) -> Result<(), StorageError> {
        self.synchronizer.load(&mut reader)?;
        let version = reader.read_u32::<LittleEndian>()?;
        if version > STORAGE_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }

        let count = read_varint(&mut reader)?;
        for _ in 0..count {
            let address = AccountAddress::read(&mut reader)?;
            let blob = read_blob(&mut reader)?;
            let Some(consumer) = self.subscriptions.get(&address) else {
                continue;
            };

            let mut cursor = blob.as_slice();
            let handle: Arc<dyn BlockchainConsumer> = consumer.clone();
            self.synchronizer.load_consumer_state(&handle, &mut cursor)?;
            consumer.container().load(&mut cursor)?;
        }

        Ok(())
    }
}
