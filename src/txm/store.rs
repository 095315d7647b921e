//! Request records, result sinks and the queued/unconfirmed counters
//!
//! Every state change of an accepted request goes through this store, which keeps the
//! counters in step with the records:
//! - `queued` counts accepted requests that have not been broadcast
//! - `unconfirmed` counts broadcast requests that are not terminal
//!
//! A request moving from queued to unconfirmed is counted as unconfirmed before it stops
//! being queued, and a finished request is delivered before it leaves either counter. A
//! reader that sees both counters at zero therefore never misses a live request.

use crate::cell::Address;
use crate::error::{TxmError, TxmResult};
use crate::txm::{RequestHandle, RequestState, TxOutcome};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub(crate) struct SenderCounters {
    queued: AtomicUsize,
    unconfirmed: AtomicUsize,
}

impl SenderCounters {
    fn snapshot(&self) -> (usize, usize) {
        (
            self.queued.load(Ordering::SeqCst),
            self.unconfirmed.load(Ordering::SeqCst),
        )
    }
}

struct Record {
    sender: Address,
    state: RequestState,
    waiter: Option<oneshot::Sender<TxOutcome>>,
    seqno: Option<u64>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Point-in-time view of one request
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    pub key: String,
    pub sender: Address,
    pub state: RequestState,
    pub seqno: Option<u64>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) struct RequestStore {
    records: DashMap<String, Record>,
    counters: HashMap<Address, Arc<SenderCounters>>,
}

impl RequestStore {
    pub fn new<'a>(senders: impl IntoIterator<Item = &'a Address>) -> Self {
        Self {
            records: DashMap::new(),
            counters: senders
                .into_iter()
                .map(|a| (*a, Arc::new(SenderCounters::default())))
                .collect(),
        }
    }

    fn counters(&self, sender: &Address) -> TxmResult<&Arc<SenderCounters>> {
        self.counters
            .get(sender)
            .ok_or_else(|| TxmError::UnknownSender(sender.to_string()))
    }

    fn publish(&self, sender: &Address) {
        if let Some(c) = self.counters.get(sender) {
            let (queued, unconfirmed) = c.snapshot();
            crate::metrics::record_queue_depth(sender, queued, unconfirmed);
        }
    }

    /// Register a new request as queued. A key still in flight is rejected.
    pub fn admit(&self, key: &str, sender: &Address) -> TxmResult<RequestHandle> {
        let counters = self.counters(sender)?;
        let (tx, rx) = oneshot::channel();
        let record = Record {
            sender: *sender,
            state: RequestState::Queued,
            waiter: Some(tx),
            seqno: None,
            error: None,
            updated_at: Utc::now(),
        };

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if !e.get().state.is_terminal() {
                    return Err(TxmError::DuplicateRequest {
                        key: key.to_string(),
                    });
                }
                e.insert(record);
            }
            Entry::Vacant(e) => {
                e.insert(record);
            }
        }
        counters.queued.fetch_add(1, Ordering::SeqCst);
        self.publish(sender);
        Ok(RequestHandle::new(key.to_string(), rx))
    }

    /// Undo `admit` for a request that never reached its queue
    pub fn rollback(&self, key: &str) {
        if let Some((_, record)) = self
            .records
            .remove_if(key, |_, r| r.state == RequestState::Queued)
        {
            if let Some(c) = self.counters.get(&record.sender) {
                c.queued.fetch_sub(1, Ordering::SeqCst);
            }
            self.publish(&record.sender);
        }
    }

    /// Queued requests went out in the external message carrying `seqno`
    pub fn mark_broadcast(&self, keys: &[String], seqno: u64) {
        for key in keys {
            let Some(mut record) = self.records.get_mut(key) else {
                warn!("Broadcast of unknown request {}", key);
                continue;
            };
            if record.state != RequestState::Queued {
                warn!("Request {} broadcast from state {}", key, record.state);
                continue;
            }
            if let Some(c) = self.counters.get(&record.sender) {
                c.unconfirmed.fetch_add(1, Ordering::SeqCst);
                c.queued.fetch_sub(1, Ordering::SeqCst);
            }
            record.state = RequestState::Pending;
            record.seqno = Some(seqno);
            record.updated_at = Utc::now();
            let sender = record.sender;
            drop(record);
            self.publish(&sender);
        }
    }

    /// Non-terminal forward move
    pub fn transition(&self, key: &str, next: RequestState) -> TxmResult<()> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| TxmError::Internal(format!("no record for {}", key)))?;
        if next.is_terminal() || !record.state.can_transition_to(next) {
            return Err(TxmError::InvalidStateTransition {
                from: record.state.to_string(),
                to: next.to_string(),
            });
        }
        record.state = next;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Deliver a terminal outcome. Returns false if the request was already terminal.
    pub fn finish(&self, outcome: TxOutcome) -> bool {
        let Some(mut record) = self.records.get_mut(&outcome.key) else {
            warn!("Outcome for unknown request {}", outcome.key);
            return false;
        };
        if !record.state.can_transition_to(outcome.state) || !outcome.state.is_terminal() {
            debug!(
                "Ignoring {} outcome for request {} in state {}",
                outcome.state, outcome.key, record.state
            );
            return false;
        }

        let previous = record.state;
        let sender = record.sender;
        record.state = outcome.state;
        record.error = outcome.error.clone();
        if outcome.seqno.is_some() {
            record.seqno = outcome.seqno;
        }
        record.updated_at = Utc::now();
        let state = outcome.state;
        if let Some(waiter) = record.waiter.take() {
            if let Err(lost) = waiter.send(outcome) {
                debug!("Waiter for request {} is gone", lost.key);
            }
        }
        drop(record);

        if let Some(c) = self.counters.get(&sender) {
            if previous == RequestState::Queued {
                c.queued.fetch_sub(1, Ordering::SeqCst);
            } else {
                c.unconfirmed.fetch_sub(1, Ordering::SeqCst);
            }
        }
        crate::metrics::record_outcome(&sender, state);
        self.publish(&sender);
        true
    }

    /// Cancel every non-terminal request; returns how many were canceled
    pub fn cancel_all(&self) -> usize {
        let open: Vec<String> = self
            .records
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.key().clone())
            .collect();
        open.into_iter()
            .filter(|key| self.finish(TxOutcome::canceled(key.clone())))
            .count()
    }

    pub fn status(&self, key: &str) -> Option<RequestStatus> {
        self.records.get(key).map(|r| RequestStatus {
            key: key.to_string(),
            sender: r.sender,
            state: r.state,
            seqno: r.seqno,
            error: r.error.clone(),
            updated_at: r.updated_at,
        })
    }

    /// Totals across senders
    pub fn inflight_count(&self) -> (usize, usize) {
        self.counters
            .values()
            .map(|c| c.snapshot())
            .fold((0, 0), |(q, u), (dq, du)| (q + dq, u + du))
    }

    pub fn sender_inflight(&self, sender: &Address) -> Option<(usize, usize)> {
        self.counters.get(sender).map(|c| c.snapshot())
    }

    /// Drop terminal records older than `retention`
    pub fn prune(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(retention).unwrap_or_else(|_| ChronoDuration::days(1));
        let before = self.records.len();
        self.records
            .retain(|_, r| !(r.state.is_terminal() && r.updated_at < cutoff));
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Address {
        Address::new(0, [3; 32])
    }

    #[test]
    fn test_counters_follow_lifecycle() {
        let store = RequestStore::new([sender()].iter());
        let _a = store.admit("a", &sender()).unwrap();
        let _b = store.admit("b", &sender()).unwrap();
        assert_eq!(store.inflight_count(), (2, 0));

        store.mark_broadcast(&["a".to_string()], 7);
        assert_eq!(store.inflight_count(), (1, 1));
        store.transition("a", RequestState::Included).unwrap();
        assert_eq!(store.status("a").unwrap().seqno, Some(7));

        let mut done = TxOutcome::failed("a".into(), "x");
        done.state = RequestState::Final;
        done.error = None;
        assert!(store.finish(done));
        assert!(store.finish(TxOutcome::failed("b".into(), "too late")));
        assert_eq!(store.inflight_count(), (0, 0));
    }

    #[tokio::test]
    async fn test_outcome_delivered_once() {
        let store = RequestStore::new([sender()].iter());
        let handle = store.admit("k", &sender()).unwrap();
        assert!(store.finish(TxOutcome::failed("k".into(), "first")));
        assert!(!store.finish(TxOutcome::canceled("k".into())));

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, RequestState::Failed);
        assert_eq!(outcome.error.as_deref(), Some("first"));
        assert_eq!(store.inflight_count(), (0, 0));
    }

    #[test]
    fn test_duplicate_key_rejected_until_terminal() {
        let store = RequestStore::new([sender()].iter());
        let _h = store.admit("k", &sender()).unwrap();
        assert!(matches!(
            store.admit("k", &sender()),
            Err(TxmError::DuplicateRequest { .. })
        ));
        store.finish(TxOutcome::failed("k".into(), "done"));
        assert!(store.admit("k", &sender()).is_ok());
        assert!(matches!(
            store.admit("z", &Address::new(0, [9; 32])),
            Err(TxmError::UnknownSender(_))
        ));
    }

    #[test]
    fn test_rollback_and_cancel_all() {
        let store = RequestStore::new([sender()].iter());
        let _a = store.admit("a", &sender()).unwrap();
        store.rollback("a");
        assert!(store.status("a").is_none());
        assert_eq!(store.inflight_count(), (0, 0));

        let _b = store.admit("b", &sender()).unwrap();
        let _c = store.admit("c", &sender()).unwrap();
        store.mark_broadcast(&["c".to_string()], 1);
        assert_eq!(store.cancel_all(), 2);
        assert_eq!(store.inflight_count(), (0, 0));
        assert_eq!(store.status("c").unwrap().state, RequestState::Canceled);
    }

    #[test]
    fn test_terminal_state_never_moves() {
        let store = RequestStore::new([sender()].iter());
        let _a = store.admit("a", &sender()).unwrap();
        store.finish(TxOutcome::canceled("a".into()));
        assert!(store.transition("a", RequestState::Pending).is_err());
        assert_eq!(store.prune(Duration::from_secs(3600)), 0);
        assert_eq!(store.prune(Duration::ZERO), 1);
    }
}
