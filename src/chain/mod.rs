//! Node access
//!
//! This module provides:
//! - The `NodeClient` trait every node backend implements (tip passed explicitly)
//! - Account, transaction and message views returned by the node
//! - A toncenter v3 HTTP client with multi-endpoint failover
//! - TVM exit codes and compiled-contract loading

pub mod compiled;
pub mod exit_code;
pub mod provider;

pub use compiled::CompiledContract;
pub use exit_code::ExitCode;
pub use provider::ToncenterClient;

use crate::cell::{Address, ArcCell};
use crate::error::TxmResult;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Masterchain block the node answers against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub workchain: i32,
    pub shard: i64,
    pub seqno: u32,
}

impl BlockRef {
    pub fn masterchain(seqno: u32) -> Self {
        Self {
            workchain: -1,
            shard: i64::MIN,
            seqno,
        }
    }
}

/// Account view at a given tip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: u128,
    /// Wallet seqno; zero for uninitialized wallets
    pub seqno: u32,
    pub is_active: bool,
    pub last_tx_lt: u64,
    pub last_tx_hash: [u8; 32],
}

/// TVM stack value passed to and returned from get-methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEntry {
    Int(i128),
    Cell(ArcCell),
    Slice(ArcCell),
    Null,
}

impl StackEntry {
    pub fn as_int(&self) -> Option<i128> {
        match self {
            StackEntry::Int(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ExternalIn,
    Internal,
    ExternalOut,
}

/// A message as recorded in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// Representation hash of the whole message cell
    pub hash: [u8; 32],
    pub kind: MessageKind,
    pub src: Option<Address>,
    pub dst: Option<Address>,
    pub value: u128,
    pub fwd_fee: u128,
    pub import_fee: u128,
    pub created_lt: u64,
    pub created_at: u32,
    pub bounce: bool,
    pub bounced: bool,
    pub body: Option<ArcCell>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputePhase {
    pub skipped: bool,
    pub success: bool,
    pub exit_code: i32,
    pub gas_fees: u128,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPhase {
    pub success: bool,
    pub result_code: i32,
    /// Forward fees retained by the network, excluding each message's own `fwd_fee`
    pub total_action_fees: u128,
    pub total_fwd_fees: u128,
}

/// An ordinary transaction of one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub account: Address,
    pub hash: [u8; 32],
    pub lt: u64,
    pub now: u32,
    pub in_msg: Option<MessageInfo>,
    pub out_msgs: Vec<MessageInfo>,
    pub total_fees: u128,
    pub storage_fees: u128,
    pub compute: ComputePhase,
    pub action: Option<ActionPhase>,
    pub bounce_emitted: bool,
    pub aborted: bool,
    /// `balance_after - balance_before` when the node reports both
    pub balance_delta: Option<i128>,
}

impl Transaction {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Inbound external message hash, if this transaction was started by one
    pub fn external_in_hash(&self) -> Option<[u8; 32]> {
        self.in_msg
            .as_ref()
            .filter(|m| m.kind == MessageKind::ExternalIn)
            .map(|m| m.hash)
    }
}

/// Node RPC surface the transaction manager consumes
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Latest masterchain block
    async fn current_tip(&self) -> TxmResult<BlockRef>;

    async fn get_account(&self, tip: &BlockRef, address: &Address) -> TxmResult<AccountState>;

    async fn run_get_method(
        &self,
        tip: &BlockRef,
        address: &Address,
        method: &str,
        args: Vec<StackEntry>,
    ) -> TxmResult<Vec<StackEntry>>;

    /// Submit a serialized external message; returns its hash
    async fn send_external_message(&self, boc: &[u8]) -> TxmResult<[u8; 32]>;

    async fn get_transaction(
        &self,
        address: &Address,
        lt: u64,
        hash: &[u8; 32],
    ) -> TxmResult<Option<Transaction>>;

    /// Newest first; `before` pages backwards from the given (lt, hash) exclusive
    async fn list_transactions(
        &self,
        address: &Address,
        limit: usize,
        before: Option<(u64, [u8; 32])>,
    ) -> TxmResult<Vec<Transaction>>;

    /// Block until the masterchain reaches `seqno`
    async fn wait_for_block(&self, seqno: u32) -> TxmResult<BlockRef>;
}
