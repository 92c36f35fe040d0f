//! Per-consumer synchronization state: the chain prefix a consumer has
//! already observed, and the reconciliation of freshly fetched intervals
//! against it.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{StateError, StorageError};
use crate::primitives::Hash;
use crate::serialization::{read_vec, write_vec};

/// Number of most recent hashes included in the short history at unit step,
/// before the gap starts doubling.
const SHORT_HISTORY_DENSE_ENTRIES: usize = 10;

const STORAGE_VERSION: u32 = 0;

/// A run of consecutive block hashes as advertised by the node.
#[derive(Debug, Clone)]
pub struct BlockchainInterval {
    /// Height of the first hash.
    pub start_height: u64,
    /// Hashes of consecutive blocks from `start_height`.
    pub block_hashes: Vec<Hash>,
}

/// Result of reconciling a fetched interval against the known prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalCheck {
    /// The interval forks off the known prefix.
    pub detach_required: bool,
    /// First height at which the fork diverges.
    pub detach_height: u64,
    /// The interval extends past the known prefix.
    pub has_new_blocks: bool,
    /// First height not already known.
    pub new_block_height: u64,
}

/// The chain prefix a consumer has observed: one hash per height starting at
/// the genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizationState {
    block_hashes: Vec<Hash>,
}

impl SynchronizationState {
    /// Constructs a state that knows only the genesis block.
    pub fn new(genesis_block_hash: Hash) -> Self {
        Self {
            block_hashes: vec![genesis_block_hash],
        }
    }

    /// Height of the last known block; 0 when only the genesis is known.
    pub fn height(&self) -> u64 {
        self.block_hashes.len() as u64 - 1
    }

    /// The genesis hash this state was seeded with.
    pub fn genesis_block_hash(&self) -> Hash {
        self.block_hashes[0]
    }

    /// Produces the sparse back-walk sent to the node to locate a common
    /// ancestor: the most recent [`SHORT_HISTORY_DENSE_ENTRIES`] hashes at
    /// unit step, then gaps doubling, always ending with the genesis.
    ///
    /// Pure function of the recorded hashes.
    pub fn short_history(&self) -> Vec<Hash> {
        let mut history = Vec::new();
        let mut back_offset = 1usize;
        let mut entries = 0usize;
        while back_offset < self.block_hashes.len() {
            history.push(self.block_hashes[self.block_hashes.len() - back_offset]);
            if entries < SHORT_HISTORY_DENSE_ENTRIES {
                back_offset += 1;
            } else {
                back_offset += 1 << (entries - SHORT_HISTORY_DENSE_ENTRIES + 1);
            }
            entries += 1;
        }
        history.push(self.block_hashes[0]);

        history
    }

    /// Finds the longest prefix of `interval` agreeing with the known hashes
    /// and reports whether a detach is required and where new territory
    /// starts.
    pub fn check_interval(&self, interval: &BlockchainInterval) -> IntervalCheck {
        let mut result = IntervalCheck::default();
        for (i, hash) in interval.block_hashes.iter().enumerate() {
            let height = interval.start_height + i as u64;
            match self.block_hashes.get(height as usize) {
                None => {
                    result.has_new_blocks = true;
                    result.new_block_height = height;
                    break;
                }
                Some(known) if known != hash => {
                    result.detach_required = true;
                    result.detach_height = height;
                    result.has_new_blocks = true;
                    result.new_block_height = height;
                    break;
                }
                Some(_) => {}
            }
        }

        result
    }

    /// Truncates so that no recorded hash has height >= `height`. The genesis
    /// entry is never removed.
    pub fn detach(&mut self, height: u64) {
        self.block_hashes.truncate(height.max(1) as usize);
    }

    /// Appends hashes directly following the known prefix.
    pub fn add_blocks(&mut self, hashes: &[Hash], start_height: u64) -> Result<(), StateError> {
        if start_height != self.block_hashes.len() as u64 {
            return Err(StateError::NonContiguousBlocks {
                start_height,
                known_height: self.height(),
            });
        }
        self.block_hashes.extend_from_slice(hashes);

        Ok(())
    }

    /// Serialize into `writer`.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<(), StorageError> {
        writer.write_u32::<LittleEndian>(STORAGE_VERSION)?;
        write_vec(&mut writer, &self.block_hashes, |w, hash| hash.write(w))?;

        Ok(())
    }

    /// Deserialize from `reader`.
    pub fn load<R: Read>(mut reader: R) -> Result<Self, StorageError> {
        let version = reader.read_u32::<LittleEndian>()?;
        if version > STORAGE_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }
        let block_hashes = read_vec(&mut reader, |r| Hash::read(r))?;
        if block_hashes.is_empty() {
            return Err(StorageError::InvalidData(
                "synchronization state must contain the genesis hash".to_string(),
            ));
        }

        Ok(Self { block_hashes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> Hash {
        Hash([byte; 32])
    }

    fn state_with_blocks(count: u8) -> SynchronizationState {
        let mut state = SynchronizationState::new(hash(0));
        let hashes: Vec<Hash> = (1..=count).map(hash).collect();
        state.add_blocks(&hashes, 1).unwrap();
        state
    }

    #[test]
    fn genesis_only_state() {
        let state = SynchronizationState::new(hash(0));
        assert_eq!(state.height(), 0);
        assert_eq!(state.short_history(), vec![hash(0)]);
    }

    #[test]
    fn short_history_of_three_blocks() {
        let state = state_with_blocks(3);
        assert_eq!(
            state.short_history(),
            vec![hash(3), hash(2), hash(1), hash(0)]
        );
    }

    #[test]
    fn short_history_gaps_double_after_dense_run() {
        let mut state = SynchronizationState::new(hash(0));
        let hashes: Vec<Hash> = (1..=39).map(hash).collect();
        state.add_blocks(&hashes, 1).unwrap();

        let expected: Vec<Hash> = [39, 38, 37, 36, 35, 34, 33, 32, 31, 30, 29, 27, 23, 15, 0]
            .into_iter()
            .map(hash)
            .collect();
        assert_eq!(state.short_history(), expected);
    }

    #[test]
    fn short_history_is_deterministic() {
        let state = state_with_blocks(25);
        assert_eq!(state.short_history(), state.short_history());
    }

    #[test]
    fn check_interval_detects_new_territory() {
        let state = state_with_blocks(3);
        let interval = BlockchainInterval {
            start_height: 4,
            block_hashes: vec![hash(4), hash(5)],
        };

        let check = state.check_interval(&interval);
        assert!(!check.detach_required);
        assert!(check.has_new_blocks);
        assert_eq!(check.new_block_height, 4);
    }

    #[test]
    fn check_interval_detects_fork() {
        let state = state_with_blocks(3);
        let interval = BlockchainInterval {
            start_height: 2,
            block_hashes: vec![hash(0x22), hash(0x33), hash(0x44)],
        };

        let check = state.check_interval(&interval);
        assert!(check.detach_required);
        assert_eq!(check.detach_height, 2);
        assert!(check.has_new_blocks);
        assert_eq!(check.new_block_height, 2);
    }

    #[test]
    fn check_interval_ignores_fully_known_interval() {
        let state = state_with_blocks(3);
        let interval = BlockchainInterval {
            start_height: 1,
            block_hashes: vec![hash(1), hash(2), hash(3)],
        };

        assert_eq!(state.check_interval(&interval), IntervalCheck::default());
    }

    #[test]
    fn check_interval_skips_matching_prefix() {
        let state = state_with_blocks(3);
        let interval = BlockchainInterval {
            start_height: 2,
            block_hashes: vec![hash(2), hash(3), hash(4)],
        };

        let check = state.check_interval(&interval);
        assert!(!check.detach_required);
        assert!(check.has_new_blocks);
        assert_eq!(check.new_block_height, 4);
    }

    #[test]
    fn add_blocks_requires_contiguity() {
        let mut state = state_with_blocks(3);
        let result = state.add_blocks(&[hash(9)], 6);
        assert!(matches!(
            result,
            Err(StateError::NonContiguousBlocks {
                start_height: 6,
                known_height: 3,
            })
        ));
    }

    #[test]
    fn detach_truncates_but_keeps_genesis() {
        let mut state = state_with_blocks(3);
        state.detach(2);
        assert_eq!(state.height(), 1);

        state.detach(0);
        assert_eq!(state.height(), 0);
        assert_eq!(state.genesis_block_hash(), hash(0));
    }

    #[test]
    fn save_load_round_trips() {
        let state = state_with_blocks(17);
        let mut buffer = Vec::new();
        state.save(&mut buffer).unwrap();

        let loaded = SynchronizationState::load(&mut buffer.as_slice()).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_rejects_newer_version() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            SynchronizationState::load(&mut buffer.as_slice()),
            Err(StorageError::UnsupportedVersion(1))
        ));
    }
}
