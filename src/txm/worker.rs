//! Per-sender dispatch worker
//!
//! Handles:
//! - Collecting requests into batches within the wallet limit
//! - Deadline and fee-cap gating before a batch is built
//! - Seqno assignment, signing and broadcast with retry
//! - Inflight budget, released by settlements from the confirmation loop

use crate::chain::NodeClient;
use crate::config::TxmConfig;
use crate::error::TxmResult;
use crate::tx::{FeeEstimator, SeqnoTracker, SignedApiClient};
use crate::txm::confirm::{ConfirmJob, Settlement, TrackedBatch};
use crate::txm::store::RequestStore;
use crate::txm::{unix_now, ConfirmationLevel, Request, RequestState, TxOutcome};
use crate::wallet::WalletIdentity;

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators every worker shares
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub config: Arc<TxmConfig>,
    pub node: Arc<dyn NodeClient>,
    pub fees: Arc<dyn FeeEstimator>,
    pub store: Arc<RequestStore>,
    pub confirm: mpsc::UnboundedSender<ConfirmJob>,
    pub stop: watch::Receiver<bool>,
}

pub(crate) struct Worker {
    wallet: WalletIdentity,
    client: SignedApiClient,
    ctx: WorkerContext,
    seqno: SeqnoTracker,
    requests: mpsc::Receiver<Request>,
    settlements: mpsc::UnboundedReceiver<Settlement>,
    /// Requests taken off the queue but not yet dispatched
    carry: VecDeque<Request>,
    inflight: usize,
    next_ordinal: u64,
}

impl Worker {
    pub fn new(
        client: SignedApiClient,
        ctx: WorkerContext,
        requests: mpsc::Receiver<Request>,
        settlements: mpsc::UnboundedReceiver<Settlement>,
    ) -> Self {
        let wallet = client.wallet().clone();
        Self {
            seqno: SeqnoTracker::new(wallet.clone()),
            wallet,
            client,
            ctx,
            requests,
            settlements,
            carry: VecDeque::new(),
            inflight: 0,
            next_ordinal: 0,
        }
    }

    /// Main dispatch loop
    pub async fn run(mut self) {
        let limit = self.ctx.config.batch_limit(&self.wallet.version);
        let max_wait = self.ctx.config.batch_max_wait();
        let max_inflight = self.ctx.config.max_inflight_batches;

        if let Err(e) = self.seqno.sync(self.ctx.node.as_ref(), unix_now()).await {
            warn!("Initial seqno sync for {} failed: {}", self.wallet, e);
        }
        info!("Worker for {} started (batch limit {})", self.wallet, limit);

        loop {
            if *self.ctx.stop.borrow() {
                break;
            }

            let blocked =
                self.inflight >= max_inflight || (self.seqno.needs_resync() && self.inflight > 0);
            if blocked {
                tokio::select! {
                    changed = self.ctx.stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    settled = self.settlements.recv() => match settled {
                        Some(settlement) => self.on_settled(settlement),
                        None => break,
                    },
                }
                continue;
            }

            tokio::select! {
                changed = self.ctx.stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                Some(settlement) = self.settlements.recv() => self.on_settled(settlement),

                open = fill(&mut self.requests, &mut self.carry, limit, max_wait) => {
                    if !open {
                        break;
                    }
                    let take = self.carry.len().min(limit);
                    let batch: Vec<Request> = self.carry.drain(..take).collect();
                    self.dispatch(batch).await;
                }
            }
        }

        info!(
            "Worker for {} stopped ({} undispatched, {} batches inflight)",
            self.wallet,
            self.carry.len(),
            self.inflight
        );
    }

    fn on_settled(&mut self, settlement: Settlement) {
        self.inflight = self.inflight.saturating_sub(1);
        debug!(
            "Batch {} of {} settled as {} ({} inflight)",
            settlement.ordinal, self.wallet, settlement.state, self.inflight
        );
        if matches!(
            settlement.state,
            RequestState::Expired | RequestState::Failed | RequestState::Canceled
        ) {
            self.seqno.mark_resync();
        }
    }

    /// Gate, sign and broadcast one batch
    async fn dispatch(&mut self, batch: Vec<Request>) {
        let ready = self.gate(batch).await;
        if ready.is_empty() {
            return;
        }

        if self.seqno.needs_resync() {
            if let Err(e) = self.seqno.sync(self.ctx.node.as_ref(), unix_now()).await {
                warn!("Seqno sync for {} failed: {}", self.wallet, e);
                for request in ready.into_iter().rev() {
                    self.carry.push_front(request);
                }
                self.pause().await;
                return;
            }
        }

        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        let batch_id = Uuid::new_v4();
        let keys: Vec<String> = ready.iter().map(Request::key).collect();
        let full_trace = ready
            .iter()
            .any(|r| r.confirmation == ConfirmationLevel::FullTrace);

        let seqno = match self.seqno.current() {
            Ok(seqno) => seqno,
            Err(e) => {
                self.settle_locally(ordinal, batch_id, keys, None, e.to_string());
                return;
            }
        };

        let actions = match ready.iter().map(Request::to_action).collect::<TxmResult<Vec<_>>>() {
            Ok(actions) => actions,
            Err(e) => {
                error!("Batch {} for {} cannot be built: {}", batch_id, self.wallet, e);
                self.seqno.mark_resync();
                self.settle_locally(ordinal, batch_id, keys, Some(seqno), e.to_string());
                return;
            }
        };

        let deploy = self.seqno.is_undeployed();
        let message = match self.client.build(seqno, &actions, unix_now(), deploy).await {
            Ok(message) => message,
            Err(e) => {
                error!("Signing batch {} for {} failed: {}", batch_id, self.wallet, e);
                // Structural failures leave the chain untouched
                if !e.is_structural() {
                    self.seqno.mark_resync();
                }
                self.settle_locally(ordinal, batch_id, keys, Some(seqno), e.to_string());
                return;
            }
        };

        match self.client.broadcast_with_retry(&message).await {
            Ok(attempts) => {
                self.ctx.store.mark_broadcast(&keys, seqno);
                self.seqno.advance();
                self.inflight += 1;
                crate::metrics::record_broadcast(&self.wallet.address, keys.len());
                info!(
                    "Broadcast batch {} seqno {} for {} with {} messages (attempt {})",
                    batch_id,
                    seqno,
                    self.wallet,
                    keys.len(),
                    attempts
                );

                let job = ConfirmJob::Track(TrackedBatch {
                    sender: self.wallet.address,
                    ordinal,
                    batch_id,
                    keys,
                    message,
                    full_trace,
                    broadcast_at: Instant::now(),
                });
                if self.ctx.confirm.send(job).is_err() {
                    error!("Confirmation loop is gone; batch {} is untracked", batch_id);
                }
            }
            Err(e) => {
                if e.should_alert() {
                    error!("Broadcast of batch {} for {} failed: {}", batch_id, self.wallet, e);
                } else {
                    warn!("Broadcast of batch {} for {} failed: {}", batch_id, self.wallet, e);
                }
                self.seqno.mark_resync();
                self.settle_locally(ordinal, batch_id, keys, Some(seqno), e.to_string());
            }
        }
    }

    /// Fail requests whose deadline passed or whose fees are out of bounds
    async fn gate(&self, batch: Vec<Request>) -> Vec<Request> {
        let now = Utc::now();
        let mut ready = Vec::with_capacity(batch.len());

        for request in batch {
            let key = request.key();
            if request.deadline_passed(now) {
                warn!("Request {} missed its deadline before broadcast", key);
                self.ctx
                    .store
                    .finish(TxOutcome::failed(key, "deadline passed before broadcast"));
                continue;
            }

            match self.ctx.fees.estimate(&request).await {
                Ok(estimate) => match estimate.check(&request) {
                    Some(reason) => {
                        warn!("Request {} rejected: {}", key, reason);
                        self.ctx.store.finish(TxOutcome::failed(key, reason));
                    }
                    None => ready.push(request),
                },
                Err(e) => {
                    warn!("Fee estimate for request {} failed: {}", key, e);
                    self.ctx.store.finish(TxOutcome::failed(key, e.to_string()));
                }
            }
        }
        ready
    }

    fn settle_locally(
        &self,
        ordinal: u64,
        batch_id: Uuid,
        keys: Vec<String>,
        seqno: Option<u64>,
        error: String,
    ) {
        let job = ConfirmJob::Settled {
            sender: self.wallet.address,
            ordinal,
            batch_id,
            keys,
            seqno,
            state: RequestState::Failed,
            error,
        };
        if let Err(mpsc::error::SendError(job)) = self.ctx.confirm.send(job) {
            // No loop to order against; deliver directly
            if let ConfirmJob::Settled { keys, error, .. } = job {
                for key in keys {
                    self.ctx.store.finish(TxOutcome::failed(key, error.clone()));
                }
            }
        }
    }

    async fn pause(&mut self) {
        let delay = self.ctx.config.confirm_poll_interval();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.ctx.stop.changed() => {}
        }
    }
}

/// Top up `carry` to `limit`, waiting up to `max_wait` for stragglers.
///
/// Returns false once the queue is closed and nothing is left to send.
async fn fill(
    requests: &mut mpsc::Receiver<Request>,
    carry: &mut VecDeque<Request>,
    limit: usize,
    max_wait: Duration,
) -> bool {
    if carry.is_empty() {
        match requests.recv().await {
            Some(request) => carry.push_back(request),
            None => return false,
        }
    }
    while carry.len() < limit {
        match requests.try_recv() {
            Ok(request) => carry.push_back(request),
            Err(_) => break,
        }
    }
    if carry.len() >= limit || max_wait.is_zero() || urgent(carry, max_wait) {
        return true;
    }

    let flush_at = tokio::time::Instant::now() + max_wait;
    while carry.len() < limit {
        tokio::select! {
            _ = tokio::time::sleep_until(flush_at) => break,
            next = requests.recv() => match next {
                Some(request) => {
                    carry.push_back(request);
                    if urgent(carry, max_wait) {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    true
}

/// A request's deadline falls inside the fill window
fn urgent(carry: &VecDeque<Request>, max_wait: Duration) -> bool {
    let window = ChronoDuration::from_std(max_wait).unwrap_or_else(|_| ChronoDuration::zero());
    let horizon = Utc::now() + window;
    carry
        .iter()
        .any(|r| r.deadline.map_or(false, |d| d < horizon))
}
