//! In-process chain for end-to-end tests
//!
//! Processes each accepted external message immediately, including every internal
//! message it causes. Wallets check signature, seqno or query id and validity like the
//! real contracts; counters apply `CounterMessage` and may notify a second account.

use crate::bindings::counter::{CounterIncreased, CounterMessage, CounterStorage};
use crate::cell::{from_boc, Address, ArcCell, CellCodec, CellExt};
use crate::chain::{
    AccountState, ActionPhase, BlockRef, ComputePhase, MessageInfo, MessageKind, NodeClient,
    StackEntry, Transaction,
};
use crate::error::{TxmError, TxmResult};
use crate::keystore::{public_key_bytes, InMemoryKeystore};
use crate::txm::unix_now;
use crate::wallet::message::SEND_MODE_PAY_FEES_SEPARATELY;
use crate::wallet::{
    ExternalMessage, InternalMessage, ParsedWalletBody, WalletIdentity, WalletVersion,
};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const IMPORT_FEE: u128 = 100_000;
pub(crate) const WALLET_GAS: u128 = 3_000_000;
pub(crate) const COUNTER_GAS: u128 = 2_000_000;
pub(crate) const STORAGE_FEE: u128 = 1_000;
/// Forward fee share carried on each message
pub(crate) const FWD_FEE: u128 = 666_667;
/// Forward fee share retained by the network per message
pub(crate) const ACTION_FEE: u128 = 333_333;
pub(crate) const NOTIFY_VALUE: u128 = 10_000_000;
pub(crate) const EXIT_UNKNOWN_OP: i32 = 0xffff;

enum Contract {
    Wallet {
        version: WalletVersion,
        key: VerifyingKey,
        seqno: u32,
        processed: HashSet<u64>,
    },
    Counter {
        storage: CounterStorage,
        notify: Option<Address>,
    },
    Sink,
}

struct Account {
    contract: Contract,
    balance: u128,
    /// Oldest first
    txs: Vec<Transaction>,
}

#[derive(Default)]
struct Chain {
    accounts: HashMap<Address, Account>,
    lt: u64,
    block: u32,
    /// Seqno or query id of every accepted external message, per wallet
    included: HashMap<Address, Vec<u64>>,
}

impl Chain {
    fn next_lt(&mut self) -> u64 {
        self.lt += 1;
        self.lt
    }
}

/// An emitted message waiting for its destination transaction
struct InFlight {
    info: MessageInfo,
    body: Option<ArcCell>,
}

struct Emitted {
    infos: Vec<MessageInfo>,
    value: u128,
    fwd: u128,
    action: u128,
}

#[derive(Default)]
pub(crate) struct SimNode {
    chain: Mutex<Chain>,
    fail_next_sends: AtomicU32,
    send_attempts: AtomicU32,
    blackhole: AtomicBool,
}

fn rejected(message: impl Into<String>) -> TxmError {
    TxmError::Rejected {
        message: message.into(),
    }
}

impl SimNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a deployed wallet whose key lives in `keystore`
    pub fn add_wallet(
        &self,
        version: WalletVersion,
        keystore: &InMemoryKeystore,
        seed: u8,
    ) -> WalletIdentity {
        let key_id = keystore.add_seed([seed; 32]);
        let key_bytes = public_key_bytes(&key_id).unwrap();
        let key = VerifyingKey::from_bytes(&key_bytes).unwrap();
        let address = Address::new(0, key_bytes);
        self.chain.lock().unwrap().accounts.insert(
            address,
            Account {
                contract: Contract::Wallet {
                    version: version.clone(),
                    key,
                    seqno: 0,
                    processed: HashSet::new(),
                },
                balance: 1_000_000_000_000,
                txs: Vec::new(),
            },
        );
        WalletIdentity::new(address, key_id, version)
    }

    pub fn add_counter(&self, id: u32, notify: Option<Address>) -> Address {
        let address = Address::new(0, [0xc0 ^ id as u8; 32]);
        self.chain.lock().unwrap().accounts.insert(
            address,
            Account {
                contract: Contract::Counter {
                    storage: CounterStorage { id, value: 0 },
                    notify,
                },
                balance: 0,
                txs: Vec::new(),
            },
        );
        address
    }

    pub fn add_sink(&self, tag: u8) -> Address {
        let address = Address::new(0, [tag; 32]);
        self.chain.lock().unwrap().accounts.insert(
            address,
            Account {
                contract: Contract::Sink,
                balance: 0,
                txs: Vec::new(),
            },
        );
        address
    }

    pub fn counter_value(&self, address: &Address) -> Option<u32> {
        match self.chain.lock().unwrap().accounts.get(address).map(|a| &a.contract) {
            Some(Contract::Counter { storage, .. }) => Some(storage.value),
            _ => None,
        }
    }

    /// The next `n` sends fail with a transport error
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_next_sends.store(n, Ordering::SeqCst);
    }

    /// Every `send_external_message` call so far, failed ones included
    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Accept external messages but never include them
    pub fn set_blackhole(&self, on: bool) {
        self.blackhole.store(on, Ordering::SeqCst);
    }

    pub fn included(&self, wallet: &Address) -> Vec<u64> {
        self.chain
            .lock()
            .unwrap()
            .included
            .get(wallet)
            .cloned()
            .unwrap_or_default()
    }

    pub fn transactions(&self, address: &Address) -> Vec<Transaction> {
        self.chain
            .lock()
            .unwrap()
            .accounts
            .get(address)
            .map(|a| a.txs.clone())
            .unwrap_or_default()
    }

    fn accept_external(&self, boc: &[u8]) -> TxmResult<[u8; 32]> {
        let root = from_boc(boc).map_err(|e| rejected(e.to_string()))?;
        let hash = root.repr_hash();
        let external = ExternalMessage::from_cell(&root).map_err(|e| rejected(e.to_string()))?;
        if self.blackhole.load(Ordering::SeqCst) {
            return Ok(hash);
        }

        let mut chain = self.chain.lock().unwrap();
        let now = unix_now();
        let wallet = external.dst;
        let lt = chain.next_lt();

        let account = chain
            .accounts
            .get_mut(&wallet)
            .ok_or_else(|| rejected("no such account"))?;
        let Contract::Wallet {
            version,
            key,
            seqno,
            processed,
        } = &mut account.contract
        else {
            return Err(rejected("not a wallet"));
        };

        let parsed = ParsedWalletBody::parse(version, &wallet, &external.body)
            .map_err(|e| rejected(format!("malformed body: {}", e)))?;
        key.verify(&parsed.signed_hash, &Signature::from_bytes(&parsed.signature))
            .map_err(|_| rejected("bad signature"))?;
        if parsed.subwallet_id != version.subwallet_id() {
            return Err(rejected("wrong subwallet"));
        }
        if (parsed.valid_until as u64) < now {
            return Err(rejected("message expired"));
        }
        let marker = match (parsed.seqno, parsed.query_id) {
            (Some(s), _) => {
                if s != *seqno {
                    return Err(rejected(format!("seqno {} expected {}", s, seqno)));
                }
                *seqno += 1;
                s as u64
            }
            (None, Some(q)) => {
                if !processed.insert(q) {
                    return Err(rejected(format!("query {} already processed", q)));
                }
                q
            }
            (None, None) => return Err(rejected("no replay protection")),
        };

        let mut outgoing = Vec::new();
        for action in &parsed.actions {
            let mut msg = InternalMessage::from_cell(&action.message)
                .map_err(|e| rejected(format!("bad action: {}", e)))?;
            if action.mode & SEND_MODE_PAY_FEES_SEPARATELY == 0 {
                msg.value = msg.value.saturating_sub(FWD_FEE + ACTION_FEE);
            }
            outgoing.push(msg);
        }

        chain.block += 1;
        chain.included.entry(wallet).or_default().push(marker);

        let in_msg = MessageInfo {
            hash,
            kind: MessageKind::ExternalIn,
            src: None,
            dst: Some(wallet),
            value: 0,
            fwd_fee: 0,
            import_fee: IMPORT_FEE,
            created_lt: 0,
            created_at: now as u32,
            bounce: false,
            bounced: false,
            body: Some(external.body.clone()),
        };
        let mut queue = VecDeque::new();
        let emitted = emit(&mut chain, wallet, outgoing, now, &mut queue);
        let fees = IMPORT_FEE + WALLET_GAS + STORAGE_FEE + emitted.action;
        let delta = -((fees + emitted.fwd + emitted.value) as i128);
        record(
            &mut chain,
            Transaction {
                account: wallet,
                hash: tx_hash(&wallet, lt),
                lt,
                now: now as u32,
                in_msg: Some(in_msg),
                out_msgs: emitted.infos,
                total_fees: fees,
                storage_fees: STORAGE_FEE,
                compute: ComputePhase {
                    skipped: false,
                    success: true,
                    exit_code: 0,
                    gas_fees: WALLET_GAS,
                },
                action: Some(ActionPhase {
                    success: true,
                    result_code: 0,
                    total_action_fees: emitted.action,
                    total_fwd_fees: emitted.action + emitted.fwd,
                }),
                bounce_emitted: false,
                aborted: false,
                balance_delta: Some(delta),
            },
        );

        while let Some(next) = queue.pop_front() {
            deliver_internal(&mut chain, next, now, &mut queue);
        }
        Ok(hash)
    }
}

fn tx_hash(account: &Address, lt: u64) -> [u8; 32] {
    let mut hash = account.hash;
    hash[..8].copy_from_slice(&lt.to_be_bytes());
    hash[8] ^= 0x5a;
    hash
}

fn record(chain: &mut Chain, tx: Transaction) {
    if let Some(account) = chain.accounts.get_mut(&tx.account) {
        let delta = tx.balance_delta.unwrap_or(0);
        account.balance = (account.balance as i128 + delta).max(0) as u128;
        account.txs.push(tx);
    }
}

/// Stamp outgoing messages from `src` and queue them for delivery
fn emit(
    chain: &mut Chain,
    src: Address,
    messages: Vec<InternalMessage>,
    now: u64,
    queue: &mut VecDeque<InFlight>,
) -> Emitted {
    let mut emitted = Emitted {
        infos: Vec::new(),
        value: 0,
        fwd: 0,
        action: 0,
    };
    for mut msg in messages {
        msg.src = Some(src);
        msg.created_lt = chain.next_lt();
        msg.created_at = now as u32;
        msg.fwd_fee = FWD_FEE;
        let hash = msg.to_cell().map(|c| c.repr_hash()).unwrap_or([0; 32]);
        let info = MessageInfo {
            hash,
            kind: MessageKind::Internal,
            src: Some(src),
            dst: Some(msg.dst),
            value: msg.value,
            fwd_fee: FWD_FEE,
            import_fee: 0,
            created_lt: msg.created_lt,
            created_at: msg.created_at,
            bounce: msg.bounce,
            bounced: msg.bounced,
            body: msg.body.clone(),
        };
        emitted.value += msg.value;
        emitted.fwd += FWD_FEE;
        emitted.action += ACTION_FEE;
        emitted.infos.push(info.clone());
        queue.push_back(InFlight {
            info,
            body: msg.body,
        });
    }
    emitted
}

fn deliver_internal(chain: &mut Chain, msg: InFlight, now: u64, queue: &mut VecDeque<InFlight>) {
    let Some(dst) = msg.info.dst else {
        return;
    };
    let lt = chain.next_lt();
    let amount = msg.info.value;

    // (compute success, exit code, gas, messages to send)
    let outcome = match chain.accounts.get_mut(&dst).map(|a| &mut a.contract) {
        Some(Contract::Counter { storage, notify }) => {
            let parsed = msg
                .body
                .as_ref()
                .ok_or(())
                .and_then(|b| CounterMessage::parse(b).map_err(|_| ()));
            match parsed {
                Ok(message) => {
                    storage.value = message.apply(storage.value);
                    let mut out = Vec::new();
                    let notify = notify.as_ref();
                    if let (CounterMessage::Increase(_), Some(notify)) = (message, notify) {
                        let event = CounterIncreased {
                            id: storage.id as u64,
                            counter: storage.value as u64,
                        };
                        if let Ok(body) = event.to_cell() {
                            out.push(
                                InternalMessage::new(*notify, NOTIFY_VALUE, false)
                                    .with_body(Arc::new(body)),
                            );
                        }
                    }
                    (true, 0, COUNTER_GAS, out)
                }
                Err(()) => (false, EXIT_UNKNOWN_OP, COUNTER_GAS, Vec::new()),
            }
        }
        Some(Contract::Wallet { .. }) | Some(Contract::Sink) | None => (true, 0, 0, Vec::new()),
    };
    let (success, exit_code, gas, out) = outcome;

    let mut bounce_emitted = false;
    let emitted = if success {
        emit(chain, dst, out, now, queue)
    } else if msg.info.bounce {
        bounce_emitted = true;
        let src = msg.info.src.unwrap_or(dst);
        let back_value = amount.saturating_sub(STORAGE_FEE + gas + FWD_FEE);
        let mut bounce = InternalMessage::new(src, back_value, false);
        bounce.bounced = true;
        let mut e = emit(chain, dst, vec![bounce], now, queue);
        // Bounce fees are paid from the bounced value, no action phase
        e.action = 0;
        e
    } else {
        Emitted {
            infos: Vec::new(),
            value: 0,
            fwd: 0,
            action: 0,
        }
    };

    let total_fees = STORAGE_FEE + gas + emitted.action;
    let delta = amount as i128
        - STORAGE_FEE as i128
        - gas as i128
        - emitted.action as i128
        - emitted.fwd as i128
        - emitted.value as i128;
    let tx = Transaction {
        account: dst,
        hash: tx_hash(&dst, lt),
        lt,
        now: now as u32,
        in_msg: Some(msg.info),
        out_msgs: emitted.infos,
        total_fees,
        storage_fees: STORAGE_FEE,
        compute: ComputePhase {
            skipped: false,
            success,
            exit_code,
            gas_fees: gas,
        },
        action: success.then(|| ActionPhase {
            success: true,
            result_code: 0,
            total_action_fees: emitted.action,
            total_fwd_fees: emitted.action + emitted.fwd,
        }),
        bounce_emitted,
        aborted: !success,
        balance_delta: Some(delta),
    };

    if !chain.accounts.contains_key(&dst) {
        chain.accounts.insert(
            dst,
            Account {
                contract: Contract::Sink,
                balance: 0,
                txs: Vec::new(),
            },
        );
    }
    record(chain, tx);
}

#[async_trait]
impl NodeClient for SimNode {
    async fn current_tip(&self) -> TxmResult<BlockRef> {
        Ok(BlockRef::masterchain(self.chain.lock().unwrap().block))
    }

    async fn get_account(&self, _tip: &BlockRef, address: &Address) -> TxmResult<AccountState> {
        let chain = self.chain.lock().unwrap();
        let Some(account) = chain.accounts.get(address) else {
            return Ok(AccountState::default());
        };
        let seqno = match &account.contract {
            Contract::Wallet { seqno, .. } => *seqno,
            _ => 0,
        };
        let last = account.txs.last();
        Ok(AccountState {
            balance: account.balance,
            seqno,
            is_active: true,
            last_tx_lt: last.map_or(0, |t| t.lt),
            last_tx_hash: last.map_or([0; 32], |t| t.hash),
        })
    }

    async fn run_get_method(
        &self,
        _tip: &BlockRef,
        address: &Address,
        method: &str,
        args: Vec<StackEntry>,
    ) -> TxmResult<Vec<StackEntry>> {
        let chain = self.chain.lock().unwrap();
        let contract = chain
            .accounts
            .get(address)
            .map(|a| &a.contract)
            .ok_or_else(|| TxmError::Contract(format!("{} is not deployed", address)))?;
        match (method, contract) {
            ("seqno", Contract::Wallet { seqno, .. }) => Ok(vec![StackEntry::Int(*seqno as i128)]),
            ("processed?", Contract::Wallet { processed, .. }) => {
                let query_id = args
                    .first()
                    .and_then(StackEntry::as_int)
                    .ok_or_else(|| TxmError::Contract("processed? needs a query id".into()))?;
                let done = processed.contains(&(query_id as u64));
                Ok(vec![StackEntry::Int(if done { -1 } else { 0 })])
            }
            ("get_counter", Contract::Counter { storage, .. }) => {
                Ok(vec![StackEntry::Int(storage.value as i128)])
            }
            _ => Err(TxmError::Contract(format!("no get-method {} on {}", method, address))),
        }
    }

    async fn send_external_message(&self, boc: &[u8]) -> TxmResult<[u8; 32]> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TxmError::Node {
                message: "simulated outage".into(),
            });
        }
        self.accept_external(boc)
    }

    async fn get_transaction(
        &self,
        address: &Address,
        lt: u64,
        hash: &[u8; 32],
    ) -> TxmResult<Option<Transaction>> {
        let chain = self.chain.lock().unwrap();
        Ok(chain
            .accounts
            .get(address)
            .and_then(|a| a.txs.iter().find(|t| t.lt == lt && &t.hash == hash).cloned()))
    }

    async fn list_transactions(
        &self,
        address: &Address,
        limit: usize,
        before: Option<(u64, [u8; 32])>,
    ) -> TxmResult<Vec<Transaction>> {
        let chain = self.chain.lock().unwrap();
        Ok(chain
            .accounts
            .get(address)
            .map(|a| {
                a.txs
                    .iter()
                    .rev()
                    .filter(|t| before.map_or(true, |(lt, _)| t.lt < lt))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn wait_for_block(&self, seqno: u32) -> TxmResult<BlockRef> {
        let current = self.chain.lock().unwrap().block;
        if seqno <= current {
            Ok(BlockRef::masterchain(current))
        } else {
            Err(TxmError::Timeout {
                operation: format!("block {}", seqno),
            })
        }
    }
}
