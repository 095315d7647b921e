//! Requests, result handles and confirmation states

use crate::cell::{Address, ArcCell, CellExt, EMPTY_CELL_HASH};
use crate::error::{TxmError, TxmResult};
use crate::trace::MessageReceived;
use crate::wallet::message::{SEND_MODE_IGNORE_ERRORS, SEND_MODE_PAY_FEES_SEPARATELY};
use crate::wallet::{InternalMessage, OutAction, StateInit, WalletIdentity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Largest body a request may carry, in cells
pub const MAX_BODY_CELLS: usize = 1024;
/// Deepest body a request may carry
pub const MAX_BODY_DEPTH: usize = 256;

/// Who pays the forward fees of the outgoing message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    /// The wallet pays fees on top of `amount`
    #[default]
    PayFeesSeparately,
    /// Fees come out of `amount`
    DeductFromValue,
}

impl PaymentMode {
    pub fn send_mode(&self) -> u8 {
        match self {
            PaymentMode::PayFeesSeparately => {
                SEND_MODE_PAY_FEES_SEPARATELY | SEND_MODE_IGNORE_ERRORS
            }
            PaymentMode::DeductFromValue => SEND_MODE_IGNORE_ERRORS,
        }
    }
}

/// How far confirmation follows the message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationLevel {
    /// Done once the wallet transaction is found
    #[default]
    Root,
    /// Done once every hop of the trace is found
    FullTrace,
}

/// One message to send from a managed wallet
#[derive(Debug, Clone)]
pub struct Request {
    pub from: WalletIdentity,
    pub to: Address,
    pub amount: u128,
    pub body: Option<ArcCell>,
    pub state_init: Option<StateInit>,
    pub bounce: bool,
    pub payment: PaymentMode,
    pub deadline: Option<DateTime<Utc>>,
    /// Upper bound on the estimated fees
    pub fee_cap: Option<u128>,
    pub confirmation: ConfirmationLevel,
    pub idempotency_key: Option<String>,
}

impl Request {
    pub fn new(from: WalletIdentity, to: Address, amount: u128) -> Self {
        Self {
            from,
            to,
            amount,
            body: None,
            state_init: None,
            bounce: true,
            payment: PaymentMode::default(),
            deadline: None,
            fee_cap: None,
            confirmation: ConfirmationLevel::default(),
            idempotency_key: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<ArcCell>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_state_init(mut self, init: StateInit) -> Self {
        self.state_init = Some(init);
        self
    }

    pub fn with_bounce(mut self, bounce: bool) -> Self {
        self.bounce = bounce;
        self
    }

    pub fn with_payment(mut self, payment: PaymentMode) -> Self {
        self.payment = payment;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_fee_cap(mut self, cap: u128) -> Self {
        self.fee_cap = Some(cap);
        self
    }

    pub fn with_confirmation(mut self, level: ConfirmationLevel) -> Self {
        self.confirmation = level;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Idempotency key, or the hex hash of the body
    pub fn key(&self) -> String {
        match &self.idempotency_key {
            Some(key) => key.clone(),
            None => match &self.body {
                Some(body) => body.hash_hex(),
                None => EMPTY_CELL_HASH.to_string(),
            },
        }
    }

    /// Checks that do not need the node
    pub fn validate(&self) -> TxmResult<()> {
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() {
                return Err(TxmError::Validation("empty idempotency key".into()));
            }
        }
        if let Some(body) = &self.body {
            let (cells, depth) = (body.count_cells(), body.tree_depth());
            if depth > MAX_BODY_DEPTH || cells > MAX_BODY_CELLS {
                return Err(TxmError::Validation(format!(
                    "body of {} cells at depth {} is too large",
                    cells, depth
                )));
            }
        }
        Ok(())
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |d| d <= now)
    }

    pub(crate) fn to_action(&self) -> TxmResult<OutAction> {
        let mut msg = InternalMessage::new(self.to, self.amount, self.bounce);
        if let Some(body) = &self.body {
            msg = msg.with_body(body.clone());
        }
        if let Some(init) = &self.state_init {
            msg = msg.with_state_init(init.clone());
        }
        Ok(OutAction::new(self.payment.send_mode(), &msg)?)
    }
}

/// Lifecycle of an accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Queued,
    Pending,
    Included,
    TraceWalking,
    Final,
    Expired,
    Failed,
    Canceled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Final
                | RequestState::Expired
                | RequestState::Failed
                | RequestState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Queued => "queued",
            RequestState::Pending => "pending",
            RequestState::Included => "included",
            RequestState::TraceWalking => "trace_walking",
            RequestState::Final => "final",
            RequestState::Expired => "expired",
            RequestState::Failed => "failed",
            RequestState::Canceled => "canceled",
        }
    }

    /// Forward moves only; terminal states never move
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        self.rank() < next.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            RequestState::Queued => 0,
            RequestState::Pending => 1,
            RequestState::Included => 2,
            RequestState::TraceWalking => 3,
            _ => 4,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result delivered to the request's waiter
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub key: String,
    pub state: RequestState,
    /// Wallet seqno or highload sequence the request was sent with
    pub seqno: Option<u64>,
    /// Position within its batch
    pub index: usize,
    /// Hex hash of the external message
    pub external_hash: Option<String>,
    /// Trace of the whole batch, rooted at the wallet transaction
    pub trace: Option<Arc<MessageReceived>>,
    pub error: Option<String>,
}

impl TxOutcome {
    pub(crate) fn failed(key: String, error: impl Into<String>) -> Self {
        Self {
            key,
            state: RequestState::Failed,
            seqno: None,
            index: 0,
            external_hash: None,
            trace: None,
            error: Some(error.into()),
        }
    }

    pub(crate) fn canceled(key: String) -> Self {
        Self {
            key,
            state: RequestState::Canceled,
            seqno: None,
            index: 0,
            external_hash: None,
            trace: None,
            error: Some("transaction manager closed".into()),
        }
    }

    pub fn is_final(&self) -> bool {
        self.state == RequestState::Final
    }
}

/// Returned by `enqueue`; resolves once the request is terminal
#[derive(Debug)]
pub struct RequestHandle {
    key: String,
    rx: oneshot::Receiver<TxOutcome>,
}

impl RequestHandle {
    pub(crate) fn new(key: String, rx: oneshot::Receiver<TxOutcome>) -> Self {
        Self { key, rx }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn wait(self) -> TxmResult<TxOutcome> {
        self.rx
            .await
            .map_err(|_| TxmError::Internal(format!("result for {} was dropped", self.key)))
    }
}
