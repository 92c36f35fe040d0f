//! Protocol primitives treated opaquely by the sync engine.

use std::fmt;
use std::io::{self, Read, Write};

macro_rules! fixed_bytes {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Deserialize from `reader`.
            pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
                let mut bytes = [0u8; 32];
                reader.read_exact(&mut bytes)?;
                Ok(Self(bytes))
            }

            /// Serialize into `writer`.
            pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
                writer.write_all(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }
    };
}

fixed_bytes!(
    /// A block or transaction hash.
    Hash
);

fixed_bytes!(
    /// A curve point in its compressed wire form.
    PublicKey
);

fixed_bytes!(
    /// A scalar in its wire form. Never logged or displayed beyond hex on demand.
    SecretKey
);

fixed_bytes!(
    /// The published image of a spent key output, used to detect spends without
    /// revealing which output is being spent.
    KeyImage
);

/// The public half of an account: the pair of keys payments are addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountAddress {
    /// Spend public key.
    pub spend_public_key: PublicKey,
    /// View public key.
    pub view_public_key: PublicKey,
}

impl AccountAddress {
    /// Deserialize from `reader`.
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let spend_public_key = PublicKey::read(&mut reader)?;
        let view_public_key = PublicKey::read(&mut reader)?;

        Ok(Self {
            spend_public_key,
            view_public_key,
        })
    }

    /// Serialize into `writer`.
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.spend_public_key.write(&mut writer)?;
        self.view_public_key.write(&mut writer)
    }
}

/// Full key material of an account.
///
/// The view secret is required for output detection; the spend secret
/// participates in key image derivation.
#[derive(Debug, Clone)]
pub struct AccountKeys {
    /// The account's address.
    pub address: AccountAddress,
    /// View secret key.
    pub view_secret_key: SecretKey,
    /// Spend secret key.
    pub spend_secret_key: SecretKey,
}

/// Everything needed to track one account.
#[derive(Debug, Clone)]
pub struct AccountSubscription {
    /// The account's key material.
    pub keys: AccountKeys,
    /// Unix time the account was created.
    pub account_creation_time: u64,
    /// Minimum confirmation depth before an owned output is considered fully
    /// unlocked for spending.
    pub transaction_spendable_age: u64,
}

/// Height and timestamp of the block a record was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo {
    /// Block height.
    pub height: u64,
    /// Block timestamp.
    pub timestamp: u64,
}

/// Chain constants consumed by the lock-state rules.
#[derive(Debug, Clone, Copy)]
pub struct Currency {
    /// Unlock times below this value are block indices; at or above it they
    /// are unix timestamps.
    pub max_block_height: u64,
    /// Slack in blocks when comparing an index-form unlock time against the
    /// current height.
    pub locked_tx_allowed_delta_blocks: u64,
    /// Slack in seconds when comparing a timestamp-form unlock time against
    /// the wall clock.
    pub locked_tx_allowed_delta_seconds: u64,
}

impl Default for Currency {
    fn default() -> Self {
        Self {
            max_block_height: 500_000_000,
            locked_tx_allowed_delta_blocks: 1,
            locked_tx_allowed_delta_seconds: 86_400,
        }
    }
}
