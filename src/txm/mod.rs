//! Transaction manager
//!
//! Accepts requests from many producers, batches them per sender wallet, broadcasts them
//! and tracks every batch until it is terminal. One worker task runs per sender and one
//! confirmation task is shared by all of them.

pub mod confirm;
pub mod request;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod sim;

pub use request::{
    ConfirmationLevel, PaymentMode, Request, RequestHandle, RequestState, TxOutcome,
    MAX_BODY_CELLS, MAX_BODY_DEPTH,
};
pub use store::RequestStatus;

use crate::cell::{Address, ArcCell};
use crate::chain::NodeClient;
use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};
use crate::keystore::Keystore;
use crate::trace::TraceTracker;
use crate::tx::{FeeEstimator, RetryPolicy, SignedApiClient};
use crate::wallet::WalletIdentity;

use confirm::{ConfirmJob, ConfirmLoop};
use store::RequestStore;
use worker::{Worker, WorkerContext};

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "TonTxm";

/// Pages of account history searched per lookup
const LOOKUP_PAGES: usize = 5;

pub(crate) fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Receivers handed to the tasks on `start`
struct Pending {
    requests: HashMap<Address, mpsc::Receiver<Request>>,
    jobs: mpsc::UnboundedReceiver<ConfirmJob>,
}

/// Transaction manager over a fixed set of sender wallets
pub struct Txm {
    config: Arc<TxmConfig>,
    wallets: HashMap<Address, WalletIdentity>,
    node: Arc<dyn NodeClient>,
    keystore: Arc<dyn Keystore>,
    fees: Arc<dyn FeeEstimator>,
    store: Arc<RequestStore>,
    queues: HashMap<Address, mpsc::Sender<Request>>,
    jobs: mpsc::UnboundedSender<ConfirmJob>,
    pending: Mutex<Option<Pending>>,
    wallet_code: HashMap<Address, ArcCell>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
    confirm_alive: Arc<AtomicBool>,
}

impl Txm {
    pub fn new(
        config: TxmConfig,
        wallets: Vec<WalletIdentity>,
        node: Arc<dyn NodeClient>,
        keystore: Arc<dyn Keystore>,
        fees: Arc<dyn FeeEstimator>,
    ) -> TxmResult<Self> {
        if wallets.is_empty() {
            return Err(TxmError::Config("no sender wallets".into()));
        }

        let mut by_address = HashMap::new();
        let mut queues = HashMap::new();
        let mut receivers = HashMap::new();
        for wallet in wallets {
            let address = wallet.address;
            if by_address.insert(address, wallet).is_some() {
                return Err(TxmError::Config(format!("wallet {} listed twice", address)));
            }
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            queues.insert(address, tx);
            receivers.insert(address, rx);
        }

        let store = Arc::new(RequestStore::new(by_address.keys()));
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            wallets: by_address,
            node,
            keystore,
            fees,
            store,
            queues,
            jobs,
            pending: Mutex::new(Some(Pending {
                requests: receivers,
                jobs: jobs_rx,
            })),
            wallet_code: HashMap::new(),
            stop,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            confirm_alive: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Wallet code attached as state init while `sender` is undeployed
    pub fn with_deploy_code(mut self, sender: Address, code: ArcCell) -> Self {
        self.wallet_code.insert(sender, code);
        self
    }

    /// Spawn the workers and the confirmation loop
    pub async fn start(&self) -> TxmResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TxmError::Shutdown);
        }

        let accounts = self.keystore.accounts().await?;
        for wallet in self.wallets.values() {
            if !accounts.iter().any(|a| a.eq_ignore_ascii_case(&wallet.public_key)) {
                return Err(TxmError::Keystore(format!(
                    "no key {} for sender {}",
                    wallet.public_key, wallet
                )));
            }
        }

        let Some(pending) = self.pending.lock().await.take() else {
            return Err(TxmError::Internal("transaction manager already started".into()));
        };

        let retry = RetryPolicy {
            max_attempts: self.config.max_broadcast_retries,
            base_delay: self.config.broadcast_retry_delay(),
        };
        let ctx = WorkerContext {
            config: self.config.clone(),
            node: self.node.clone(),
            fees: self.fees.clone(),
            store: self.store.clone(),
            confirm: self.jobs.clone(),
            stop: self.stop.subscribe(),
        };

        let mut tasks = self.tasks.lock().await;
        let mut settlements = HashMap::new();
        for (address, requests) in pending.requests {
            let Some(wallet) = self.wallets.get(&address) else {
                continue;
            };
            let client = SignedApiClient::new(
                wallet.clone(),
                self.keystore.clone(),
                self.node.clone(),
                retry,
            )
            .with_wallet_code(self.wallet_code.get(&address).cloned());
            let (settle_tx, settle_rx) = mpsc::unbounded_channel();
            settlements.insert(address, settle_tx);

            let worker = Worker::new(client, ctx.clone(), requests, settle_rx);
            tasks.push(tokio::spawn(worker.run()));
        }

        let tracker =
            TraceTracker::new(self.node.clone(), self.config.list_batch_size, LOOKUP_PAGES);
        let confirm = ConfirmLoop::new(
            self.config.clone(),
            tracker,
            self.store.clone(),
            self.wallets.clone(),
            settlements,
            pending.jobs,
            self.stop.subscribe(),
            self.confirm_alive.clone(),
        );
        self.confirm_alive.store(true, Ordering::Release);
        tasks.push(tokio::spawn(confirm.run()));

        self.started.store(true, Ordering::Release);
        info!("{} started with {} senders", SERVICE_NAME, self.wallets.len());
        Ok(())
    }

    /// Accept a request into its sender's queue. Never waits.
    pub fn enqueue(&self, request: Request) -> TxmResult<RequestHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TxmError::Shutdown);
        }
        let sender = request.from.address;
        let queue = self
            .queues
            .get(&sender)
            .ok_or_else(|| TxmError::UnknownSender(sender.to_string()))?;
        if self.wallets.get(&sender) != Some(&request.from) {
            return Err(TxmError::Validation(format!(
                "sender {} does not match the managed wallet",
                request.from
            )));
        }
        request.validate()?;

        let key = request.key();
        let handle = self.store.admit(&key, &sender)?;
        match queue.try_send(request) {
            Ok(()) => {
                crate::metrics::record_enqueued(&sender);
                Ok(handle)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.store.rollback(&key);
                Err(TxmError::QueueFull {
                    sender: sender.to_string(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.store.rollback(&key);
                Err(TxmError::Shutdown)
            }
        }
    }

    /// (queued, unconfirmed) across all senders
    pub fn inflight_count(&self) -> (usize, usize) {
        self.store.inflight_count()
    }

    pub fn sender_inflight(&self, sender: &Address) -> Option<(usize, usize)> {
        self.store.sender_inflight(sender)
    }

    pub fn request_state(&self, key: &str) -> Option<RequestStatus> {
        self.store.status(key)
    }

    pub fn senders(&self) -> Vec<Address> {
        let mut senders: Vec<Address> = self.wallets.keys().copied().collect();
        senders.sort();
        senders
    }

    pub fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    pub fn ready(&self) -> bool {
        self.started.load(Ordering::Acquire)
            && !self.closed.load(Ordering::Acquire)
            && self.confirm_alive.load(Ordering::Acquire)
    }

    /// Component name to error, `None` when healthy
    pub fn health_report(&self) -> BTreeMap<String, Option<String>> {
        let problem = if self.closed.load(Ordering::Acquire) {
            Some("closed".to_string())
        } else if !self.started.load(Ordering::Acquire) {
            Some("not started".to_string())
        } else if !self.confirm_alive.load(Ordering::Acquire) {
            Some("confirmation loop stopped".to_string())
        } else {
            None
        };
        let mut report = BTreeMap::new();
        report.insert(SERVICE_NAME.to_string(), problem);
        report
    }

    /// Stop the loops, cancel whatever is not terminal and close the fee estimator
    pub async fn close(&self) -> TxmResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("{} shutdown initiated", SERVICE_NAME);
        self.stop.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        match tokio::time::timeout(self.config.close_grace(), join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("Task panicked before shutdown: {}", e);
                        }
                    }
                }
            }
            Err(_) => {
                warn!("Tasks did not stop within {:?}; aborting", self.config.close_grace());
                aborts.iter().for_each(|a| a.abort());
            }
        }

        let canceled = self.store.cancel_all();
        if canceled > 0 {
            info!("Canceled {} requests on shutdown", canceled);
        }
        self.fees.close().await?;
        info!("{} stopped", SERVICE_NAME);
        Ok(())
    }
}
