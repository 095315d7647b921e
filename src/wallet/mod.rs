//! Wallet versions and identities
//!
//! Each version carries exactly the fields its signing path needs.

mod hashmap;
pub mod message;

pub use message::{
    ExternalMessage, InternalMessage, OutAction, ParsedWalletBody, StateInit, WalletBody,
};

use crate::cell::{Address, Cell, CellBuilder, TonCellError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Subwallet id used by wallet contracts unless configured otherwise
pub const DEFAULT_SUBWALLET_ID: u32 = 698_983_191;

pub const STANDARD_WALLET_MAX_MESSAGES: usize = 4;
pub const HIGHLOAD_WALLET_MAX_MESSAGES: usize = 254;

/// Distinct query ids a highload v3 wallet can track: 8192 shifts of 1023 bits
pub const HIGHLOAD_V3_QUERY_SPACE: u64 = 8192 * 1023;

fn default_subwallet() -> u32 {
    DEFAULT_SUBWALLET_ID
}

fn default_message_ttl() -> u64 {
    60
}

fn default_highload_timeout() -> u32 {
    120
}

fn default_created_at_offset() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WalletVersion {
    V3R2 {
        #[serde(default = "default_subwallet")]
        subwallet_id: u32,
        #[serde(default = "default_message_ttl")]
        message_ttl_secs: u64,
    },
    V4R2 {
        #[serde(default = "default_subwallet")]
        subwallet_id: u32,
        #[serde(default = "default_message_ttl")]
        message_ttl_secs: u64,
    },
    HighloadV2 {
        #[serde(default = "default_subwallet")]
        subwallet_id: u32,
        #[serde(default = "default_message_ttl")]
        message_ttl_secs: u64,
    },
    HighloadV3 {
        #[serde(default = "default_subwallet")]
        subwallet_id: u32,
        /// On-chain `timeout` field (22 bits)
        #[serde(default = "default_highload_timeout")]
        timeout_secs: u32,
        /// `created_at` is stamped this many seconds in the past
        #[serde(default = "default_created_at_offset")]
        created_at_offset_secs: u64,
    },
}

impl WalletVersion {
    pub fn v3r2() -> Self {
        WalletVersion::V3R2 {
            subwallet_id: DEFAULT_SUBWALLET_ID,
            message_ttl_secs: default_message_ttl(),
        }
    }

    pub fn highload_v3() -> Self {
        WalletVersion::HighloadV3 {
            subwallet_id: DEFAULT_SUBWALLET_ID,
            timeout_secs: default_highload_timeout(),
            created_at_offset_secs: default_created_at_offset(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WalletVersion::V3R2 { .. } => "V3R2",
            WalletVersion::V4R2 { .. } => "V4R2",
            WalletVersion::HighloadV2 { .. } => "HighloadV2",
            WalletVersion::HighloadV3 { .. } => "HighloadV3",
        }
    }

    /// Actions one external message may carry
    pub fn max_messages(&self) -> usize {
        if self.is_highload() {
            HIGHLOAD_WALLET_MAX_MESSAGES
        } else {
            STANDARD_WALLET_MAX_MESSAGES
        }
    }

    /// Highload wallets replay-protect with query ids instead of a seqno
    pub fn is_highload(&self) -> bool {
        matches!(
            self,
            WalletVersion::HighloadV2 { .. } | WalletVersion::HighloadV3 { .. }
        )
    }

    pub fn subwallet_id(&self) -> u32 {
        match self {
            WalletVersion::V3R2 { subwallet_id, .. }
            | WalletVersion::V4R2 { subwallet_id, .. }
            | WalletVersion::HighloadV2 { subwallet_id, .. }
            | WalletVersion::HighloadV3 { subwallet_id, .. } => *subwallet_id,
        }
    }

    /// Seconds an external message stays acceptable after it is built
    pub fn validity_secs(&self) -> u64 {
        match self {
            WalletVersion::V3R2 {
                message_ttl_secs, ..
            }
            | WalletVersion::V4R2 {
                message_ttl_secs, ..
            }
            | WalletVersion::HighloadV2 {
                message_ttl_secs, ..
            } => *message_ttl_secs,
            WalletVersion::HighloadV3 {
                timeout_secs,
                created_at_offset_secs,
                ..
            } => (*timeout_secs as u64).saturating_sub(*created_at_offset_secs),
        }
    }

    /// First local sequence number for a highload wallet; standard wallets read it from the node
    pub fn initial_highload_seq(&self, now_secs: u64) -> u64 {
        match self {
            WalletVersion::HighloadV3 { .. } => now_secs % HIGHLOAD_V3_QUERY_SPACE,
            _ => now_secs % (u32::MAX as u64),
        }
    }

    /// Persistent data of a freshly deployed wallet owned by `public_key`
    pub fn initial_data(&self, public_key: &[u8; 32]) -> Result<Cell, TonCellError> {
        let mut b = CellBuilder::new();
        match self {
            WalletVersion::V3R2 { subwallet_id, .. } => {
                b.store_u32(32, 0)?
                    .store_u32(32, *subwallet_id)?
                    .store_slice(public_key)?;
            }
            WalletVersion::V4R2 { subwallet_id, .. } => {
                b.store_u32(32, 0)?
                    .store_u32(32, *subwallet_id)?
                    .store_slice(public_key)?
                    .store_bit(false)?;
            }
            WalletVersion::HighloadV2 { subwallet_id, .. } => {
                b.store_u32(32, *subwallet_id)?
                    .store_u64(64, 0)?
                    .store_slice(public_key)?
                    .store_bit(false)?;
            }
            WalletVersion::HighloadV3 {
                subwallet_id,
                timeout_secs,
                ..
            } => {
                b.store_slice(public_key)?
                    .store_u32(32, *subwallet_id)?
                    .store_bit(false)?
                    .store_bit(false)?
                    .store_u64(64, 0)?
                    .store_u32(22, *timeout_secs)?;
            }
        }
        b.build()
    }

    /// Query id a highload wallet stores for `seq`
    pub fn query_id(&self, seq: u64, valid_until: u32) -> u64 {
        match self {
            WalletVersion::HighloadV2 { .. } => ((valid_until as u64) << 32) | (seq & 0xffff_ffff),
            WalletVersion::HighloadV3 { .. } => {
                let seq = seq % HIGHLOAD_V3_QUERY_SPACE;
                let shift = seq / 1023;
                let bit_number = seq % 1023;
                (shift << 10) | bit_number
            }
            _ => seq,
        }
    }
}

impl fmt::Display for WalletVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A sending wallet: its address, signing key and protocol flavor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletIdentity {
    pub address: Address,
    /// Hex Ed25519 public key, used as the keystore key id
    pub public_key: String,
    pub version: WalletVersion,
}

impl WalletIdentity {
    pub fn new(address: Address, public_key: impl Into<String>, version: WalletVersion) -> Self {
        Self {
            address,
            public_key: public_key.into(),
            version,
        }
    }

    pub fn workchain(&self) -> i32 {
        self.address.workchain
    }
}

impl fmt::Display for WalletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.version, self.address)
    }
}
