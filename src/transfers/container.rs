//! Multi-indexed store of one account's owned outputs, spends and
//! transactions.
//!
//! Records live in a slot arena ordered by insertion, with auxiliary
//! `key image -> slot` and `transaction hash -> slots` maps kept in sync on
//! every insert and erase. All operations take the container lock; queries
//! filter by [`TransferFlags`].

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::StorageError;
use crate::primitives::{BlockInfo, Currency, Hash, KeyImage, PublicKey};
use crate::serialization::{read_vec, write_vec};
use crate::transaction::{TransactionInput, TransactionReader};

const STORAGE_VERSION: u32 = 0;

bitflags! {
    /// Filter over owned outputs combining lock state and output type.
    ///
    /// An output is included iff at least one selected type bit matches its
    /// type and at least one selected state bit matches its state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferFlags: u32 {
        /// Time-unlocked and past the subscription's spendable age.
        const STATE_UNLOCKED = 0x0001;
        /// Not yet time-unlocked.
        const STATE_LOCKED = 0x0002;
        /// Time-unlocked but not yet past the spendable age.
        const STATE_SOFT_LOCKED = 0x0004;
        /// Any lock state.
        const STATE_ALL = Self::STATE_UNLOCKED.bits()
            | Self::STATE_LOCKED.bits()
            | Self::STATE_SOFT_LOCKED.bits();
        /// Key outputs.
        const TYPE_KEY = 0x0100;
        /// Multisignature outputs.
        const TYPE_MULTISIGNATURE = 0x0200;
        /// Any output type.
        const TYPE_ALL = Self::TYPE_KEY.bits() | Self::TYPE_MULTISIGNATURE.bits();
        /// Spendable key outputs.
        const DEFAULT = Self::TYPE_KEY.bits() | Self::STATE_UNLOCKED.bits();
        /// Everything the account owns.
        const ALL = Self::TYPE_ALL.bits() | Self::STATE_ALL.bits();
    }
}

/// Details of one recorded transaction relevant to the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInformation {
    /// The transaction's hash.
    pub transaction_hash: Hash,
    /// The transaction's public key.
    pub public_key: PublicKey,
    /// Height of the block the transaction was observed in.
    pub block_height: u64,
    /// Timestamp of that block.
    pub timestamp: u64,
    /// Raw unlock time.
    pub unlock_time: u64,
    /// Zero-filled when the transaction carries no payment id.
    pub payment_id: Hash,
}

/// Per-type payload of an owned output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDetails {
    /// One-time stealth key output.
    Key {
        /// One-time output key.
        output_key: PublicKey,
    },
    /// Multisignature output.
    Multisignature {
        /// Signatures required to spend.
        required_signatures: u32,
    },
}

/// An owned output, as reported by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOutputInformation {
    /// Output amount.
    pub amount: u64,
    /// Network-wide ordinal of the output among outputs of its amount.
    pub global_output_index: u64,
    /// Position of the output within its transaction.
    pub output_in_transaction: u64,
    /// Public key of the owning transaction.
    pub transaction_public_key: PublicKey,
    /// Per-type payload.
    pub details: OutputDetails,
}

/// An output detected by the consumer, ready to be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedOutput {
    /// The detected output.
    pub information: TransactionOutputInformation,
    /// Derived key image; present for key outputs only.
    pub key_image: Option<KeyImage>,
}

/// The stored extended record: a detected output plus its chain placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferOutput {
    pub(crate) information: TransactionOutputInformation,
    pub(crate) key_image: Option<KeyImage>,
    pub(crate) unlock_time: u64,
    pub(crate) block_height: u64,
    pub(crate) transaction_hash: Hash,
}

/// An owned output that has been observed spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpentTransferOutput {
    pub(crate) output: TransferOutput,
    pub(crate) spending_block: BlockInfo,
    pub(crate) spending_transaction_hash: Hash,
    pub(crate) input_in_transaction: u64,
}

/// The authoritative in-memory store of owned outputs, spends and
/// transactions for one account.
pub struct TransfersContainer {
    inner: Mutex<ContainerInner>,
}

struct ContainerInner {
    currency: Currency,
    transaction_spendable_age: u64,
    current_height: u64,
    next_slot: u64,
    transactions: HashMap<Hash, TransactionInformation>,
    outputs: BTreeMap<u64, TransferOutput>,
    by_key_image: HashMap<KeyImage, u64>,
    by_transaction_hash: HashMap<Hash, Vec<u64>>,
    spent_outputs: Vec<SpentTransferOutput>,
}

impl TransfersContainer {
    /// Constructs an empty container for an account with the given spendable
    /// age.
    pub fn new(currency: Currency, transaction_spendable_age: u64) -> Self {
        Self {
            inner: Mutex::new(ContainerInner {
                currency,
                transaction_spendable_age,
                current_height: 0,
                next_slot: 0,
                transactions: HashMap::new(),
                outputs: BTreeMap::new(),
                by_key_image: HashMap::new(),
                by_transaction_hash: HashMap::new(),
                spent_outputs: Vec::new(),
            }),
        }
    }

    /// Records the detected outputs of a transaction and scans its inputs for
    /// spends in one lock acquisition, returning `(amount in, amount out)`.
    pub(crate) fn add_transaction(
        &self,
        block: BlockInfo,
        transaction: &dyn TransactionReader,
        detected: &[DetectedOutput],
    ) -> (u64, u64) {
        let mut inner = self.lock();
        let amount_in = if detected.is_empty() {
            0
        } else {
            inner.add_transaction_outputs(block, transaction, detected)
        };
        let amount_out = inner.add_transaction_inputs(block, transaction);

        (amount_in, amount_out)
    }

    /// Records detected outputs as owned, recording the parent transaction if
    /// new. Returns the summed amount.
    pub fn add_transaction_outputs(
        &self,
        block: BlockInfo,
        transaction: &dyn TransactionReader,
        detected: &[DetectedOutput],
    ) -> u64 {
        self.lock().add_transaction_outputs(block, transaction, detected)
    }

    /// Scans the transaction's inputs for spends of owned outputs, moving
    /// matches to the spent set. The parent transaction is recorded iff at
    /// least one input matched. Returns the summed matched amount.
    pub fn add_transaction_inputs(
        &self,
        block: BlockInfo,
        transaction: &dyn TransactionReader,
    ) -> u64 {
        self.lock().add_transaction_inputs(block, transaction)
    }

    /// Discards every record at or above `height` and reverts spends whose
    /// spending block is at or above it.
    pub fn detach(&self, height: u64) {
        let mut inner = self.lock();
        inner.detach(height);
    }

    /// Sets the current height. No other mutation.
    pub fn update_height(&self, height: u64) {
        self.lock().current_height = height;
    }

    /// Number of owned plus spent outputs.
    pub fn transfers_count(&self) -> usize {
        let inner = self.lock();
        inner.outputs.len() + inner.spent_outputs.len()
    }

    /// Number of distinct recorded transactions.
    pub fn transactions_count(&self) -> usize {
        self.lock().transactions.len()
    }

    /// Summed amount of owned outputs passing the filter.
    pub fn balance(&self, flags: TransferFlags) -> u64 {
        let inner = self.lock();
        inner
            .outputs
            .values()
            .filter(|output| inner.is_included(output, flags))
            .map(|output| output.information.amount)
            .sum()
    }

    /// Owned outputs passing the filter, in insertion order.
    pub fn outputs(&self, flags: TransferFlags) -> Vec<TransactionOutputInformation> {
        let inner = self.lock();
        inner
            .outputs
            .values()
            .filter(|output| inner.is_included(output, flags))
            .map(|output| output.information)
            .collect()
    }

    /// Owned outputs of one transaction passing the filter.
    pub fn transaction_outputs(
        &self,
        transaction_hash: &Hash,
        flags: TransferFlags,
    ) -> Vec<TransactionOutputInformation> {
        let inner = self.lock();
        let Some(slots) = inner.by_transaction_hash.get(transaction_hash) else {
            return Vec::new();
        };
        slots
            .iter()
            .map(|slot| &inner.outputs[slot])
            .filter(|output| inner.is_included(output, flags))
            .map(|output| output.information)
            .collect()
    }

    /// Looks up a recorded transaction by hash.
    pub fn transaction_information(
        &self,
        transaction_hash: &Hash,
    ) -> Option<TransactionInformation> {
        self.lock().transactions.get(transaction_hash).copied()
    }

    /// Serialize into `writer`.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<(), StorageError> {
        let inner = self.lock();
        writer.write_u32::<LittleEndian>(STORAGE_VERSION)?;
        writer.write_u64::<LittleEndian>(inner.current_height)?;

        // sorted by hash so identical state always yields identical bytes
        let mut transactions: Vec<&TransactionInformation> = inner.transactions.values().collect();
        transactions.sort_by_key(|info| info.transaction_hash);
        write_vec(&mut writer, &transactions, |w, info| info.write(w))?;

        let outputs: Vec<&TransferOutput> = inner.outputs.values().collect();
        write_vec(&mut writer, &outputs, |w, output| output.write(w))?;
        write_vec(&mut writer, &inner.spent_outputs, |w, spent| spent.write(w))?;

        Ok(())
    }

    /// Deserialize from `reader`, replacing the container's records.
    ///
    /// Fails with [`StorageError::UnsupportedVersion`] on state written by a
    /// newer revision; the container is untouched on any failure.
    pub fn load<R: Read>(&self, mut reader: R) -> Result<(), StorageError> {
        let version = reader.read_u32::<LittleEndian>()?;
        if version > STORAGE_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }
        let current_height = reader.read_u64::<LittleEndian>()?;
        let transactions = read_vec(&mut reader, |r| TransactionInformation::read(r))?;
        let outputs = read_vec(&mut reader, |r| TransferOutput::read(r))?;
        let spent_outputs = read_vec(&mut reader, |r| SpentTransferOutput::read(r))?;

        let mut inner = self.lock();
        inner.current_height = current_height;
        inner.next_slot = 0;
        inner.transactions = transactions
            .into_iter()
            .map(|info| (info.transaction_hash, info))
            .collect();
        inner.outputs.clear();
        inner.by_key_image.clear();
        inner.by_transaction_hash.clear();
        for output in outputs {
            inner.insert_output(output);
        }
        inner.spent_outputs = spent_outputs;

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContainerInner> {
        self.inner.lock().expect("container lock poisoned")
    }
}

impl ContainerInner {
    fn add_transaction_outputs(
        &mut self,
        block: BlockInfo,
        transaction: &dyn TransactionReader,
        detected: &[DetectedOutput],
    ) -> u64 {
        let transaction_hash = transaction.transaction_hash();
        let unlock_time = transaction.unlock_time();
        let mut amount = 0;

        for output in detected {
            debug_assert_eq!(
                output.key_image.is_some(),
                matches!(output.information.details, OutputDetails::Key { .. }),
                "key image must be present exactly for key outputs",
            );
            // an aborted pass is re-delivered in full on the next trigger;
            // outputs already recorded as owned or spent are not re-added
            if self.is_recorded(&transaction_hash, output.information.output_in_transaction) {
                continue;
            }
            self.insert_output(TransferOutput {
                information: output.information,
                key_image: output.key_image,
                unlock_time,
                block_height: block.height,
                transaction_hash,
            });
            amount += output.information.amount;
        }

        self.record_transaction(block, transaction);

        amount
    }

    fn add_transaction_inputs(
        &mut self,
        block: BlockInfo,
        transaction: &dyn TransactionReader,
    ) -> u64 {
        let mut amount = 0;

        for index in 0..transaction.input_count() {
            match transaction.input(index) {
                Some(TransactionInput::Key {
                    amount: input_amount,
                    key_image,
                }) => {
                    if let Some(&slot) = self.by_key_image.get(&key_image) {
                        self.move_to_spent(slot, block, transaction, index as u64);
                        amount += input_amount;
                    }
                }
                Some(TransactionInput::Multisignature {
                    amount: input_amount,
                    output_index,
                }) => {
                    let matched = self
                        .outputs
                        .iter()
                        .find(|(_, output)| {
                            matches!(
                                output.information.details,
                                OutputDetails::Multisignature { .. }
                            ) && output.information.amount == input_amount
                                && output.information.global_output_index == output_index
                        })
                        .map(|(&slot, _)| slot);
                    if let Some(slot) = matched {
                        self.move_to_spent(slot, block, transaction, index as u64);
                        amount += input_amount;
                    }
                }
                None => {}
            }
        }

        if amount > 0 {
            self.record_transaction(block, transaction);
        }

        amount
    }

    fn detach(&mut self, height: u64) {
        // spends rolled back by the reorg revert to owned before the
        // new-output sweep, so their key images re-enter the index
        let mut reverted = Vec::new();
        self.spent_outputs.retain(|spent| {
            if spent.spending_block.height >= height {
                if spent.output.block_height < height {
                    reverted.push(spent.output);
                }
                false
            } else {
                true
            }
        });
        let reverted_count = reverted.len();
        for output in reverted {
            self.insert_output(output);
        }

        let detached: Vec<u64> = self
            .outputs
            .iter()
            .filter(|(_, output)| output.block_height >= height)
            .map(|(&slot, _)| slot)
            .collect();
        let detached_count = detached.len();
        for slot in detached {
            self.remove_output(slot);
        }

        self.transactions.retain(|_, info| info.block_height < height);
        self.current_height = height;

        tracing::debug!(
            "detached at height {height}: {detached_count} outputs removed, {reverted_count} spends reverted"
        );
    }

    fn is_recorded(&self, transaction_hash: &Hash, output_in_transaction: u64) -> bool {
        let owned = self
            .by_transaction_hash
            .get(transaction_hash)
            .is_some_and(|slots| {
                slots.iter().any(|slot| {
                    self.outputs[slot].information.output_in_transaction == output_in_transaction
                })
            });

        owned
            || self.spent_outputs.iter().any(|spent| {
                spent.output.transaction_hash == *transaction_hash
                    && spent.output.information.output_in_transaction == output_in_transaction
            })
    }

    fn insert_output(&mut self, output: TransferOutput) {
        let slot = self.next_slot;
        self.next_slot += 1;
        if let Some(key_image) = output.key_image {
            let previous = self.by_key_image.insert(key_image, slot);
            debug_assert!(previous.is_none(), "key image already in the owned set");
        }
        self.by_transaction_hash
            .entry(output.transaction_hash)
            .or_default()
            .push(slot);
        self.outputs.insert(slot, output);
    }

    fn remove_output(&mut self, slot: u64) -> TransferOutput {
        let output = self
            .outputs
            .remove(&slot)
            .expect("slot is present in the arena");
        if let Some(key_image) = output.key_image {
            self.by_key_image.remove(&key_image);
        }
        if let Some(slots) = self.by_transaction_hash.get_mut(&output.transaction_hash) {
            slots.retain(|&s| s != slot);
            if slots.is_empty() {
                self.by_transaction_hash.remove(&output.transaction_hash);
            }
        }

        output
    }

    fn move_to_spent(
        &mut self,
        slot: u64,
        block: BlockInfo,
        transaction: &dyn TransactionReader,
        input_in_transaction: u64,
    ) {
        let output = self.remove_output(slot);
        self.spent_outputs.push(SpentTransferOutput {
            output,
            spending_block: block,
            spending_transaction_hash: transaction.transaction_hash(),
            input_in_transaction,
        });
    }

    fn record_transaction(&mut self, block: BlockInfo, transaction: &dyn TransactionReader) {
        let transaction_hash = transaction.transaction_hash();
        self.transactions
            .entry(transaction_hash)
            .or_insert_with(|| TransactionInformation {
                transaction_hash,
                public_key: transaction.transaction_public_key(),
                block_height: block.height,
                timestamp: block.timestamp,
                unlock_time: transaction.unlock_time(),
                payment_id: transaction.payment_id().unwrap_or_default(),
            });
    }

    fn is_spend_time_unlocked(&self, unlock_time: u64) -> bool {
        if unlock_time < self.currency.max_block_height {
            // interpreted as a block index
            self.current_height.saturating_sub(1) + self.currency.locked_tx_allowed_delta_blocks
                >= unlock_time
        } else {
            // interpreted as a unix timestamp
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock is past the unix epoch")
                .as_secs();
            now + self.currency.locked_tx_allowed_delta_seconds >= unlock_time
        }
    }

    fn is_included(&self, output: &TransferOutput, flags: TransferFlags) -> bool {
        let time_unlocked = self.is_spend_time_unlocked(output.unlock_time);
        let past_spendable_age =
            self.current_height > output.block_height + self.transaction_spendable_age;

        let type_matches = match output.information.details {
            OutputDetails::Key { .. } => flags.contains(TransferFlags::TYPE_KEY),
            OutputDetails::Multisignature { .. } => {
                flags.contains(TransferFlags::TYPE_MULTISIGNATURE)
            }
        };
        let state_matches = (flags.contains(TransferFlags::STATE_LOCKED) && !time_unlocked)
            || (flags.contains(TransferFlags::STATE_UNLOCKED)
                && time_unlocked
                && past_spendable_age)
            || (flags.contains(TransferFlags::STATE_SOFT_LOCKED)
                && time_unlocked
                && !past_spendable_age);

        type_matches && state_matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{AccountAddress, SecretKey};

    struct StubTransaction {
        hash: Hash,
        public_key: PublicKey,
        unlock_time: u64,
        payment_id: Option<Hash>,
        inputs: Vec<TransactionInput>,
    }

    impl StubTransaction {
        fn paying(hash_byte: u8) -> Self {
            Self {
                hash: hash(hash_byte),
                public_key: PublicKey([hash_byte; 32]),
                unlock_time: 0,
                payment_id: None,
                inputs: Vec::new(),
            }
        }

        fn spending(hash_byte: u8, inputs: Vec<TransactionInput>) -> Self {
            Self {
                inputs,
                ..Self::paying(hash_byte)
            }
        }
    }

    impl TransactionReader for StubTransaction {
        fn transaction_hash(&self) -> Hash {
            self.hash
        }

        fn transaction_public_key(&self) -> PublicKey {
            self.public_key
        }

        fn unlock_time(&self) -> u64 {
            self.unlock_time
        }

        fn payment_id(&self) -> Option<Hash> {
            self.payment_id
        }

        fn input_count(&self) -> usize {
            self.inputs.len()
        }

        fn input(&self, index: usize) -> Option<TransactionInput> {
            self.inputs.get(index).copied()
        }

        fn output_count(&self) -> usize {
            0
        }

        fn output(&self, _index: usize) -> Option<crate::transaction::TransactionOutput> {
            None
        }

        fn find_outputs_to_account(
            &self,
            _address: &AccountAddress,
            _view_secret_key: &SecretKey,
        ) -> Vec<(u64, u64)> {
            Vec::new()
        }
    }

    fn hash(byte: u8) -> Hash {
        Hash([byte; 32])
    }

    fn key_image(byte: u8) -> KeyImage {
        KeyImage([byte; 32])
    }

    fn key_output(amount: u64, global_index: u64, image: KeyImage) -> DetectedOutput {
        DetectedOutput {
            information: TransactionOutputInformation {
                amount,
                global_output_index: global_index,
                output_in_transaction: 0,
                transaction_public_key: PublicKey([7; 32]),
                details: OutputDetails::Key {
                    output_key: PublicKey([8; 32]),
                },
            },
            key_image: Some(image),
        }
    }

    fn multisignature_output(amount: u64, global_index: u64) -> DetectedOutput {
        DetectedOutput {
            information: TransactionOutputInformation {
                amount,
                global_output_index: global_index,
                output_in_transaction: 0,
                transaction_public_key: PublicKey([7; 32]),
                details: OutputDetails::Multisignature {
                    required_signatures: 2,
                },
            },
            key_image: None,
        }
    }

    fn container() -> TransfersContainer {
        TransfersContainer::new(Currency::default(), 0)
    }

    fn block(height: u64) -> BlockInfo {
        BlockInfo {
            height,
            timestamp: 1_700_000_000 + height,
        }
    }

    fn seed_three_payments(container: &TransfersContainer) {
        for (i, amount) in [(1u8, 100u64), (2, 200), (3, 300)] {
            let transaction = StubTransaction::paying(i);
            container.add_transaction_outputs(
                block(i as u64),
                &transaction,
                &[key_output(amount, i as u64, key_image(i))],
            );
        }
        container.update_height(4);
    }

    #[test]
    fn records_outputs_and_transactions() {
        let container = container();
        seed_three_payments(&container);

        assert_eq!(container.balance(TransferFlags::ALL), 600);
        assert_eq!(container.transfers_count(), 3);
        assert_eq!(container.transactions_count(), 3);

        let info = container.transaction_information(&hash(2)).unwrap();
        assert_eq!(info.block_height, 2);
        assert_eq!(info.payment_id, Hash::default());
        assert_eq!(container.transaction_information(&hash(9)), None);
    }

    #[test]
    fn key_input_moves_output_to_spent() {
        let container = container();
        seed_three_payments(&container);

        let spend = StubTransaction::spending(
            4,
            vec![TransactionInput::Key {
                amount: 100,
                key_image: key_image(1),
            }],
        );
        let amount = container.add_transaction_inputs(block(4), &spend);

        assert_eq!(amount, 100);
        assert_eq!(container.balance(TransferFlags::ALL), 500);
        assert_eq!(container.transfers_count(), 3);
        assert_eq!(container.transactions_count(), 4);

        // the key image left the owned set; spending it again matches nothing
        assert_eq!(container.add_transaction_inputs(block(5), &spend), 0);
    }

    #[test]
    fn unknown_key_image_leaves_transaction_unrecorded() {
        let container = container();
        seed_three_payments(&container);

        let spend = StubTransaction::spending(
            4,
            vec![TransactionInput::Key {
                amount: 50,
                key_image: key_image(99),
            }],
        );
        assert_eq!(container.add_transaction_inputs(block(4), &spend), 0);
        assert_eq!(container.transactions_count(), 3);
    }

    #[test]
    fn multisignature_input_matches_by_amount_and_global_index() {
        let container = container();
        let transaction = StubTransaction::paying(1);
        container.add_transaction_outputs(
            block(1),
            &transaction,
            &[multisignature_output(250, 17)],
        );
        container.update_height(2);

        let miss = StubTransaction::spending(
            2,
            vec![TransactionInput::Multisignature {
                amount: 250,
                output_index: 18,
            }],
        );
        assert_eq!(container.add_transaction_inputs(block(2), &miss), 0);

        let spend = StubTransaction::spending(
            3,
            vec![TransactionInput::Multisignature {
                amount: 250,
                output_index: 17,
            }],
        );
        assert_eq!(container.add_transaction_inputs(block(3), &spend), 250);
        assert_eq!(container.balance(TransferFlags::ALL), 0);
    }

    #[test]
    fn redelivered_outputs_are_recorded_once() {
        let container = container();
        let transaction = StubTransaction::paying(1);
        let detected = [key_output(100, 1, key_image(1))];

        assert_eq!(
            container.add_transaction_outputs(block(1), &transaction, &detected),
            100
        );
        assert_eq!(
            container.add_transaction_outputs(block(1), &transaction, &detected),
            0
        );
        container.update_height(2);

        assert_eq!(container.balance(TransferFlags::ALL), 100);
        assert_eq!(container.transfers_count(), 1);

        // a re-delivery does not resurrect a spent output either
        let spend = StubTransaction::spending(
            2,
            vec![TransactionInput::Key {
                amount: 100,
                key_image: key_image(1),
            }],
        );
        container.add_transaction_inputs(block(2), &spend);
        assert_eq!(
            container.add_transaction_outputs(block(1), &transaction, &detected),
            0
        );

        assert_eq!(container.transfers_count(), 1);
        assert_eq!(container.balance(TransferFlags::ALL), 0);
    }

    #[test]
    fn detach_erases_new_outputs_and_reverts_spends() {
        let container = container();
        seed_three_payments(&container);

        let spend = StubTransaction::spending(
            4,
            vec![TransactionInput::Key {
                amount: 100,
                key_image: key_image(1),
            }],
        );
        container.add_transaction_inputs(block(4), &spend);
        container.update_height(5);

        container.detach(2);

        // outputs from heights 2 and 3 are gone, the reverted spend is back
        assert_eq!(container.balance(TransferFlags::ALL), 100);
        assert_eq!(container.transfers_count(), 1);
        assert_eq!(container.transactions_count(), 1);
        assert_eq!(container.transaction_information(&hash(4)), None);

        // the reverted output is spendable again
        container.update_height(5);
        assert_eq!(container.add_transaction_inputs(block(4), &spend), 100);
    }

    #[test]
    fn detach_drops_spent_record_created_above_fork() {
        let container = container();
        let transaction = StubTransaction::paying(1);
        container.add_transaction_outputs(
            block(3),
            &transaction,
            &[key_output(100, 1, key_image(1))],
        );
        let spend = StubTransaction::spending(
            2,
            vec![TransactionInput::Key {
                amount: 100,
                key_image: key_image(1),
            }],
        );
        container.add_transaction_inputs(block(4), &spend);

        container.detach(3);

        assert_eq!(container.transfers_count(), 0);
        assert_eq!(container.balance(TransferFlags::ALL), 0);
    }

    #[test]
    fn spendable_age_soft_locks_fresh_outputs() {
        let container = TransfersContainer::new(Currency::default(), 10);
        let transaction = StubTransaction::paying(1);
        container.add_transaction_outputs(
            block(5),
            &transaction,
            &[key_output(100, 1, key_image(1))],
        );
        container.update_height(5);

        assert_eq!(container.balance(TransferFlags::DEFAULT), 0);
        assert_eq!(
            container.balance(TransferFlags::TYPE_KEY | TransferFlags::STATE_SOFT_LOCKED),
            100
        );

        container.update_height(16);
        assert_eq!(container.balance(TransferFlags::DEFAULT), 100);
        assert_eq!(
            container.balance(TransferFlags::TYPE_KEY | TransferFlags::STATE_SOFT_LOCKED),
            0
        );
    }

    #[test]
    fn unlock_time_in_the_future_locks_output() {
        let container = container();
        let mut transaction = StubTransaction::paying(1);
        transaction.unlock_time = 1_000;
        container.add_transaction_outputs(
            block(1),
            &transaction,
            &[key_output(100, 1, key_image(1))],
        );
        container.update_height(2);

        assert_eq!(container.balance(TransferFlags::DEFAULT), 0);
        assert_eq!(
            container.balance(TransferFlags::TYPE_KEY | TransferFlags::STATE_LOCKED),
            100
        );

        container.update_height(1_001);
        assert_eq!(container.balance(TransferFlags::DEFAULT), 100);
    }

    #[test]
    fn balance_filters_by_type() {
        let container = container();
        let transaction = StubTransaction::paying(1);
        container.add_transaction_outputs(
            block(1),
            &transaction,
            &[
                key_output(100, 1, key_image(1)),
                multisignature_output(40, 2),
            ],
        );
        container.update_height(2);

        assert_eq!(container.balance(TransferFlags::ALL), 140);
        assert_eq!(
            container.balance(TransferFlags::TYPE_KEY | TransferFlags::STATE_ALL),
            100
        );
        assert_eq!(
            container.balance(TransferFlags::TYPE_MULTISIGNATURE | TransferFlags::STATE_ALL),
            40
        );

        let outputs = container.outputs(TransferFlags::ALL);
        assert_eq!(outputs.len(), 2);
        assert_eq!(
            container.balance(TransferFlags::ALL),
            outputs.iter().map(|output| output.amount).sum::<u64>()
        );
    }

    #[test]
    fn transaction_outputs_filters_by_transaction() {
        let container = container();
        seed_three_payments(&container);

        let outputs = container.transaction_outputs(&hash(2), TransferFlags::ALL);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].amount, 200);
        assert!(
            container
                .transaction_outputs(&hash(9), TransferFlags::ALL)
                .is_empty()
        );
    }

    #[test]
    fn save_load_round_trips() {
        let container = container();
        seed_three_payments(&container);
        let spend = StubTransaction::spending(
            4,
            vec![TransactionInput::Key {
                amount: 100,
                key_image: key_image(1),
            }],
        );
        container.add_transaction_inputs(block(4), &spend);

        let mut blob = Vec::new();
        container.save(&mut blob).unwrap();

        let restored = TransfersContainer::new(Currency::default(), 0);
        restored.load(&mut blob.as_slice()).unwrap();

        assert_eq!(restored.balance(TransferFlags::ALL), 500);
        assert_eq!(restored.transfers_count(), 3);
        assert_eq!(restored.transactions_count(), 4);

        let mut round_tripped = Vec::new();
        restored.save(&mut round_tripped).unwrap();
        assert_eq!(round_tripped, blob);
    }

    #[test]
    fn load_rejects_newer_version() {
        let container = container();
        seed_three_payments(&container);

        let mut blob = Vec::new();
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&0u64.to_le_bytes());

        assert!(matches!(
            container.load(&mut blob.as_slice()),
            Err(StorageError::UnsupportedVersion(1))
        ));
        // container state is untouched by the failed load
        assert_eq!(container.balance(TransferFlags::ALL), 600);
        assert_eq!(container.transfers_count(), 3);
    }
}
