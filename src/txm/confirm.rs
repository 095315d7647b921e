//! Confirmation loop shared by all senders
//!
//! Broadcast batches enter as `ConfirmJob::Track` and move through
//! inclusion poll, root lookup and (when requested) the trace walk, one step per tick.
//! Batches that failed before reaching the chain enter already settled so their
//! results still come out in dispatch order.
//!
//! Each sender has a lane ordered by dispatch ordinal. A batch's results are released
//! once every earlier batch of the same sender has been released.

use crate::cell::Address;
use crate::config::TxmConfig;
use crate::trace::{Inclusion, MessageReceived, TraceTracker, TraceWalk, WalkLimits, WalkStep};
use crate::tx::SignedMessage;
use crate::txm::store::RequestStore;
use crate::txm::{unix_now, RequestState, TxOutcome};
use crate::wallet::WalletIdentity;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Budget released back to a sender's worker
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settlement {
    pub ordinal: u64,
    pub state: RequestState,
}

/// A batch on its way to the chain
#[derive(Debug)]
pub(crate) struct TrackedBatch {
    pub sender: Address,
    pub ordinal: u64,
    pub batch_id: Uuid,
    pub keys: Vec<String>,
    pub message: SignedMessage,
    pub full_trace: bool,
    pub broadcast_at: Instant,
}

#[derive(Debug)]
pub(crate) enum ConfirmJob {
    Track(TrackedBatch),
    /// Failed before broadcast; released in order with the rest
    Settled {
        sender: Address,
        ordinal: u64,
        batch_id: Uuid,
        keys: Vec<String>,
        seqno: Option<u64>,
        state: RequestState,
        error: String,
    },
}

struct Verdict {
    state: RequestState,
    trace: Option<Arc<MessageReceived>>,
    error: Option<String>,
}

enum Phase {
    Pending,
    Included { misses: u32 },
    Walking(TraceWalk),
    Done(Verdict),
}

struct Entry {
    batch_id: Uuid,
    keys: Vec<String>,
    seqno: Option<u64>,
    message: Option<SignedMessage>,
    full_trace: bool,
    broadcast_at: Option<Instant>,
    phase: Phase,
}

impl Entry {
    fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done(_))
    }
}

pub(crate) struct ConfirmLoop {
    config: Arc<TxmConfig>,
    tracker: TraceTracker,
    store: Arc<RequestStore>,
    wallets: HashMap<Address, WalletIdentity>,
    settlements: HashMap<Address, mpsc::UnboundedSender<Settlement>>,
    jobs: mpsc::UnboundedReceiver<ConfirmJob>,
    stop: watch::Receiver<bool>,
    lanes: HashMap<Address, BTreeMap<u64, Entry>>,
    alive: Arc<AtomicBool>,
}

impl ConfirmLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<TxmConfig>,
        tracker: TraceTracker,
        store: Arc<RequestStore>,
        wallets: HashMap<Address, WalletIdentity>,
        settlements: HashMap<Address, mpsc::UnboundedSender<Settlement>>,
        jobs: mpsc::UnboundedReceiver<ConfirmJob>,
        stop: watch::Receiver<bool>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            tracker,
            store,
            wallets,
            settlements,
            jobs,
            stop,
            lanes: HashMap::new(),
            alive,
        }
    }

    /// Main confirmation loop
    pub async fn run(mut self) {
        let mut poll = interval(self.config.confirm_poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Prune terminal records
        let mut cleanup = interval(Duration::from_secs(60));

        self.alive.store(true, Ordering::Release);
        info!("Confirmation loop started");

        loop {
            if *self.stop.borrow() {
                break;
            }

            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                job = self.jobs.recv() => match job {
                    Some(job) => self.accept(job),
                    None => break,
                },

                _ = poll.tick() => self.poll_all().await,

                _ = cleanup.tick() => {
                    let retention = Duration::from_secs(self.config.terminal_retention_secs);
                    let pruned = self.store.prune(retention);
                    if pruned > 0 {
                        debug!("Pruned {} terminal requests", pruned);
                    }
                }
            }
        }

        self.alive.store(false, Ordering::Release);
        let open: usize = self.lanes.values().map(|l| l.len()).sum();
        info!("Confirmation loop stopped with {} batches open", open);
    }

    fn accept(&mut self, job: ConfirmJob) {
        match job {
            ConfirmJob::Track(batch) => {
                debug!(
                    "Tracking batch {} (ordinal {}, seqno {}) for {}",
                    batch.batch_id, batch.ordinal, batch.message.seqno, batch.sender
                );
                let entry = Entry {
                    batch_id: batch.batch_id,
                    keys: batch.keys,
                    seqno: Some(batch.message.seqno),
                    full_trace: batch.full_trace,
                    broadcast_at: Some(batch.broadcast_at),
                    message: Some(batch.message),
                    phase: Phase::Pending,
                };
                self.lanes
                    .entry(batch.sender)
                    .or_default()
                    .insert(batch.ordinal, entry);
            }
            ConfirmJob::Settled {
                sender,
                ordinal,
                batch_id,
                keys,
                seqno,
                state,
                error,
            } => {
                let entry = Entry {
                    batch_id,
                    keys,
                    seqno,
                    message: None,
                    full_trace: false,
                    broadcast_at: None,
                    phase: Phase::Done(Verdict {
                        state,
                        trace: None,
                        error: Some(error),
                    }),
                };
                self.lanes.entry(sender).or_default().insert(ordinal, entry);
                self.release(&sender);
            }
        }
    }

    async fn poll_all(&mut self) {
        let now_secs = unix_now();
        let limits = WalkLimits {
            max_depth: self.config.max_trace_depth,
            max_nodes: self.config.max_trace_nodes,
            max_attempts: self.config.root_lookup_retries,
        };
        let senders: Vec<Address> = self.lanes.keys().copied().collect();

        for sender in senders {
            let Some(wallet) = self.wallets.get(&sender) else {
                error!("Open batches for unmanaged sender {}", sender);
                continue;
            };
            let ctx = Context {
                tracker: &self.tracker,
                store: &self.store,
                config: &self.config,
                limits,
                now_secs,
            };
            if let Some(lane) = self.lanes.get_mut(&sender) {
                for (ordinal, entry) in lane.iter_mut() {
                    if entry.is_done() {
                        continue;
                    }
                    advance(&ctx, wallet, entry).await;

                    if let Phase::Done(verdict) = &entry.phase {
                        let settlement = Settlement {
                            ordinal: *ordinal,
                            state: verdict.state,
                        };
                        if let Some(tx) = self.settlements.get(&sender) {
                            if tx.send(settlement).is_err() {
                                debug!("Worker for {} is gone", sender);
                            }
                        }
                    }
                }
            }
            self.release(&sender);
        }
    }

    /// Deliver done batches from the head of the lane
    fn release(&mut self, sender: &Address) {
        let Some(lane) = self.lanes.get_mut(sender) else {
            return;
        };
        while let Some(head) = lane.first_entry() {
            if !head.get().is_done() {
                break;
            }
            deliver(&self.store, sender, head.remove());
        }
    }
}

fn set_state(store: &RequestStore, keys: &[String], state: RequestState) {
    for key in keys {
        if let Err(e) = store.transition(key, state) {
            warn!("Request {} not moved to {}: {}", key, state, e);
        }
    }
}

/// What `advance` reads for one tick
struct Context<'a> {
    tracker: &'a TraceTracker,
    store: &'a RequestStore,
    config: &'a TxmConfig,
    limits: WalkLimits,
    now_secs: u64,
}

/// Count a failed root lookup; the batch fails once the budget is spent
fn root_missed(batch_id: Uuid, misses: &mut u32, budget: u32) -> Option<Phase> {
    *misses += 1;
    if *misses < budget {
        return None;
    }
    warn!(
        "Root transaction of batch {} not found after {} lookups",
        batch_id, misses
    );
    Some(Phase::Done(Verdict {
        state: RequestState::Failed,
        trace: None,
        error: Some("root missing".into()),
    }))
}

/// Move one batch as far as the node allows this tick
async fn advance(ctx: &Context<'_>, wallet: &WalletIdentity, entry: &mut Entry) {
    let Some(message) = entry.message.as_ref() else {
        return;
    };
    let (tracker, store) = (ctx.tracker, ctx.store);
    let budget = ctx.config.root_lookup_retries;

    loop {
        let (next, again) = match &mut entry.phase {
            Phase::Pending => match tracker.inclusion(wallet, message, ctx.now_secs).await {
                Ok(Inclusion::Included) => {
                    debug!("Batch {} seqno {} included", entry.batch_id, message.seqno);
                    set_state(store, &entry.keys, RequestState::Included);
                    (Some(Phase::Included { misses: 0 }), true)
                }
                Ok(Inclusion::Expired) => {
                    warn!(
                        "Batch {} seqno {} for {} expired before inclusion",
                        entry.batch_id, message.seqno, wallet
                    );
                    let verdict = Verdict {
                        state: RequestState::Expired,
                        trace: None,
                        error: Some(format!("not included before {}", message.valid_until)),
                    };
                    (Some(Phase::Done(verdict)), false)
                }
                Ok(Inclusion::Pending) => (None, false),
                Err(e) => {
                    if e.should_alert() {
                        error!("Inclusion check for batch {} failed: {}", entry.batch_id, e);
                    } else {
                        debug!("Inclusion check for batch {} deferred: {}", entry.batch_id, e);
                    }
                    (None, false)
                }
            },

            Phase::Included { misses } => match tracker
                .find_root(&wallet.address, &message.hash)
                .await
            {
                Ok(Some(tx)) if entry.full_trace => {
                    set_state(store, &entry.keys, RequestState::TraceWalking);
                    (Some(Phase::Walking(TraceWalk::new(&tx, ctx.limits))), true)
                }
                Ok(Some(tx)) => {
                    let root = MessageReceived::from_transaction(&tx);
                    inspect_fees(&root);
                    let verdict = Verdict {
                        state: RequestState::Final,
                        trace: Some(Arc::new(root)),
                        error: None,
                    };
                    (Some(Phase::Done(verdict)), false)
                }
                Ok(None) => (root_missed(entry.batch_id, misses, budget), false),
                Err(e) if e.is_retryable() => {
                    debug!("Root lookup for batch {} deferred: {}", entry.batch_id, e);
                    (None, false)
                }
                Err(e) => {
                    warn!("Root lookup for batch {} failed: {}", entry.batch_id, e);
                    (root_missed(entry.batch_id, misses, budget), false)
                }
            },

            Phase::Walking(walk) => match walk.poll(tracker).await {
                WalkStep::Progress => (None, false),
                WalkStep::Done => {
                    let trace = walk.assemble();
                    if walk.truncated() {
                        debug!(
                            "Trace of batch {} truncated at {} nodes",
                            entry.batch_id,
                            trace.node_count()
                        );
                    }
                    inspect_fees(&trace);
                    let verdict = Verdict {
                        state: RequestState::Final,
                        trace: Some(Arc::new(trace)),
                        error: None,
                    };
                    (Some(Phase::Done(verdict)), false)
                }
                WalkStep::Failed(reason) => {
                    let partial = walk.assemble();
                    warn!(
                        "Trace walk of batch {} failed: {}\n{}",
                        entry.batch_id, reason, partial
                    );
                    let verdict = Verdict {
                        state: RequestState::Failed,
                        trace: Some(Arc::new(partial)),
                        error: Some(reason),
                    };
                    (Some(Phase::Done(verdict)), false)
                }
            },

            Phase::Done(_) => (None, false),
        };

        if let Some(next) = next {
            entry.phase = next;
        }
        if !again {
            return;
        }
    }
}

/// Hops whose fee breakdown does not add up
fn unbalanced_hops(msg: &MessageReceived) -> usize {
    if msg.magic_fee != 0 {
        debug!(
            "Unexplained balance change of {} on {} (tx {})",
            msg.magic_fee,
            msg.account,
            msg.hash_hex()
        );
    }
    let own = usize::from(msg.fee_identity_residual() != 0);
    own + msg.outgoing_received.iter().map(unbalanced_hops).sum::<usize>()
}

fn inspect_fees(trace: &MessageReceived) {
    let unbalanced = unbalanced_hops(trace);
    if unbalanced > 0 {
        warn!(
            "Fee breakdown of {} hops in trace {} does not add up:\n{}",
            unbalanced,
            trace.hash_hex(),
            trace
        );
    } else if !trace.trace_succeeded() {
        debug!("Trace {} has a failed hop:\n{}", trace.hash_hex(), trace);
    }
}

fn deliver(store: &RequestStore, sender: &Address, entry: Entry) {
    let Phase::Done(verdict) = entry.phase else {
        return;
    };
    if let Some(at) = entry.broadcast_at {
        crate::metrics::record_confirm_latency(sender, at.elapsed().as_secs_f64());
    }
    info!(
        "Batch {} seqno {:?} for {} settled as {} ({} requests)",
        entry.batch_id,
        entry.seqno,
        sender,
        verdict.state,
        entry.keys.len()
    );

    let external_hash = entry.message.as_ref().map(|m| m.hash_hex());
    for (index, key) in entry.keys.into_iter().enumerate() {
        store.finish(TxOutcome {
            key,
            state: verdict.state,
            seqno: entry.seqno,
            index,
            external_hash: external_hash.clone(),
            trace: verdict.trace.clone(),
            error: verdict.error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MessageKind;
    use crate::trace::message::tests::info;
    use crate::trace::tests::ScriptedNode;
    use crate::txm::RequestHandle;
    use crate::wallet::WalletVersion;

    struct Lane {
        node: Arc<ScriptedNode>,
        store: Arc<RequestStore>,
        confirm: ConfirmLoop,
        settled: mpsc::UnboundedReceiver<Settlement>,
        wallet: WalletIdentity,
    }

    fn lane(version: WalletVersion, root_lookup_retries: u32) -> Lane {
        let node = Arc::new(ScriptedNode::default());
        let wallet = WalletIdentity::new(Address::new(0, [1; 32]), "00".repeat(32), version);
        let store = Arc::new(RequestStore::new([wallet.address].iter()));
        let config = Arc::new(TxmConfig {
            root_lookup_retries,
            ..TxmConfig::default()
        });
        let (settle_tx, settled) = mpsc::unbounded_channel();
        let (_jobs_tx, jobs) = mpsc::unbounded_channel();
        let (_stop_tx, stop) = watch::channel(false);
        let confirm = ConfirmLoop::new(
            config,
            TraceTracker::new(node.clone(), 16, 2),
            store.clone(),
            HashMap::from([(wallet.address, wallet.clone())]),
            HashMap::from([(wallet.address, settle_tx)]),
            jobs,
            stop,
            Arc::new(AtomicBool::new(false)),
        );
        Lane {
            node,
            store,
            confirm,
            settled,
            wallet,
        }
    }

    impl Lane {
        /// Admit `key` and mark it broadcast under `seqno`
        fn admit(&self, key: &str, seqno: u64) -> RequestHandle {
            let handle = self.store.admit(key, &self.wallet.address).unwrap();
            self.store.mark_broadcast(&[key.to_string()], seqno);
            handle
        }

        /// Broadcast batch whose external message hash is `[tag; 32]`
        fn track(&mut self, ordinal: u64, key: &str, tag: u8) {
            let seqno = ordinal;
            self.confirm.accept(ConfirmJob::Track(TrackedBatch {
                sender: self.wallet.address,
                ordinal,
                batch_id: Uuid::new_v4(),
                keys: vec![key.to_string()],
                message: SignedMessage {
                    seqno,
                    valid_until: u32::MAX,
                    query_id: Some(100 + seqno),
                    hash: [tag; 32],
                    boc: Vec::new(),
                    deploys_wallet: false,
                },
                full_trace: false,
                broadcast_at: Instant::now(),
            }));
        }

        /// The wallet processed query `100 + seqno` in the transaction at `lt`
        fn land(&self, seqno: u64, lt: u64) {
            let wallet = self.wallet.address;
            self.node.mark_processed(wallet, 100 + seqno);
            let external = info(MessageKind::ExternalIn, None, wallet, 0, 0, lt);
            self.node.push(ScriptedNode::tx(wallet, lt, Some(external), vec![]));
        }

        fn state(&self, key: &str) -> RequestState {
            self.store.status(key).unwrap().state
        }
    }

    #[tokio::test]
    async fn test_results_released_in_dispatch_order() {
        let mut lane = lane(WalletVersion::highload_v3(), 5);
        let first = lane.admit("first", 0);
        let second = lane.admit("second", 1);
        lane.track(0, "first", 30);
        lane.track(1, "second", 31);

        // Ordinal 1 lands first and settles, but waits behind ordinal 0
        lane.land(1, 31);
        lane.confirm.poll_all().await;
        let settlement = lane.settled.try_recv().unwrap();
        assert_eq!(settlement.ordinal, 1);
        assert_eq!(settlement.state, RequestState::Final);
        assert_eq!(lane.state("second"), RequestState::Included);
        assert_eq!(lane.state("first"), RequestState::Pending);

        lane.land(0, 30);
        lane.confirm.poll_all().await;
        assert_eq!(lane.settled.try_recv().unwrap().ordinal, 0);
        assert_eq!(lane.state("first"), RequestState::Final);
        assert_eq!(lane.state("second"), RequestState::Final);

        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();
        assert_eq!(first.seqno, Some(0));
        assert_eq!(second.seqno, Some(1));
        assert_eq!(second.trace.unwrap().lt, 31);
        assert!(lane.confirm.lanes[&lane.wallet.address].is_empty());
        assert_eq!(lane.store.inflight_count(), (0, 0));
    }

    #[tokio::test]
    async fn test_settled_batch_waits_behind_open_batch() {
        let mut lane = lane(WalletVersion::highload_v3(), 5);
        let open = lane.admit("open", 0);
        let dropped = lane.admit("dropped", 1);
        lane.track(0, "open", 40);
        lane.confirm.accept(ConfirmJob::Settled {
            sender: lane.wallet.address,
            ordinal: 1,
            batch_id: Uuid::new_v4(),
            keys: vec!["dropped".to_string()],
            seqno: Some(1),
            state: RequestState::Failed,
            error: "broadcast failed".into(),
        });
        assert_eq!(lane.state("dropped"), RequestState::Pending);

        lane.confirm.poll_all().await;
        assert_eq!(lane.state("dropped"), RequestState::Pending);

        lane.land(0, 40);
        lane.confirm.poll_all().await;
        assert_eq!(open.wait().await.unwrap().state, RequestState::Final);
        let dropped = dropped.wait().await.unwrap();
        assert_eq!(dropped.state, RequestState::Failed);
        assert_eq!(dropped.error.as_deref(), Some("broadcast failed"));
    }

    #[tokio::test]
    async fn test_refused_root_lookups_spend_the_budget() {
        let mut lane = lane(WalletVersion::v3r2(), 3);
        let handle = lane.admit("k", 0);
        lane.track(0, "k", 50);
        lane.node.set_seqno(lane.wallet.address, 1);
        lane.node.reject_history();

        for _ in 0..2 {
            lane.confirm.poll_all().await;
            assert_eq!(lane.state("k"), RequestState::Included);
        }
        lane.confirm.poll_all().await;

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, RequestState::Failed);
        assert_eq!(outcome.error.as_deref(), Some("root missing"));
        assert!(outcome.trace.is_none());
        assert_eq!(lane.settled.try_recv().unwrap().state, RequestState::Failed);
        assert_eq!(lane.store.inflight_count(), (0, 0));
    }
}
