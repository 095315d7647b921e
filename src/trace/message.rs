//! One hop of a trace and its fee breakdown

use crate::cell::{Address, ArcCell};
use crate::chain::{ExitCode, MessageInfo, MessageKind, Transaction};

use std::fmt;

/// How far the walk has progressed below a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    /// Has outgoing messages, none located yet
    Received,
    /// Some outgoing messages located
    Cascading,
    /// Every outgoing message located, or there were none
    Finalized,
}

/// An internal message emitted by a hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub hash: [u8; 32],
    pub src: Option<Address>,
    pub dst: Address,
    pub amount: u128,
    /// Paid by the sender
    pub fwd_fee: u128,
    pub created_lt: u64,
    pub bounce: bool,
    pub bounced: bool,
}

impl SentMessage {
    fn from_info(msg: &MessageInfo, dst: Address) -> Self {
        Self {
            hash: msg.hash,
            src: msg.src,
            dst,
            amount: msg.value,
            fwd_fee: msg.fwd_fee,
            created_lt: msg.created_lt,
            bounce: msg.bounce,
            bounced: msg.bounced,
        }
    }

    /// Whether `incoming` is this message arriving at its destination
    pub fn matches(&self, incoming: &MessageInfo) -> bool {
        if incoming.kind != MessageKind::Internal {
            return false;
        }
        if incoming.hash == self.hash {
            return true;
        }
        incoming.src == self.src
            && incoming.dst == Some(self.dst)
            && incoming.created_lt == self.created_lt
    }
}

/// External-out message (event) emitted by a hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingExternalMessage {
    pub created_at: u32,
    pub lt: u64,
    pub body: Option<ArcCell>,
}

/// An on-chain transaction within a trace.
///
/// Fees are positive debits. The fields satisfy
/// `storage + magic + execution + outgoing + net_credit == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceived {
    pub account: Address,
    pub source: Option<Address>,
    pub kind: MessageKind,
    /// Transaction hash
    pub hash: [u8; 32],
    /// Inbound message hash
    pub msg_hash: [u8; 32],
    pub lt: u64,
    pub now: u32,

    /// Value credited by the inbound message
    pub amount: u128,
    /// Paid by the receiver of an external message
    pub import_fee: u128,
    /// Forward fee the sender paid for the inbound message
    pub fwd_fee: u128,

    pub storage_fee: u128,
    pub gas_fee: u128,
    /// Action phase fees retained by the network
    pub total_action_fees: u128,
    /// Part of the balance change no known fee explains
    pub magic_fee: i128,
    pub balance_delta: i128,
    /// False when `balance_delta` was derived from the fees
    pub balance_reported: bool,

    pub success: bool,
    pub exit_code: ExitCode,
    /// The inbound message was itself a bounce
    pub bounced: bool,
    pub emitted_bounce: bool,

    /// Emitted messages whose destination transaction is not located
    pub outgoing_sent: Vec<SentMessage>,
    /// Destination transactions of emitted messages
    pub outgoing_received: Vec<MessageReceived>,
    pub outgoing_external: Vec<OutgoingExternalMessage>,
}

fn sum<I: Iterator<Item = u128>>(it: I) -> u128 {
    it.fold(0u128, |acc, v| acc.saturating_add(v))
}

impl MessageReceived {
    pub fn from_transaction(tx: &Transaction) -> Self {
        let (kind, source, msg_hash, amount, import_fee, fwd_fee, bounced) = match &tx.in_msg {
            Some(m) => match m.kind {
                MessageKind::ExternalIn => (m.kind, None, m.hash, 0, m.import_fee, 0, false),
                _ => (m.kind, m.src, m.hash, m.value, 0, m.fwd_fee, m.bounced),
            },
            None => (MessageKind::Internal, None, [0u8; 32], 0, 0, 0, false),
        };

        let gas_fee = if tx.compute.skipped { 0 } else { tx.compute.gas_fees };
        let total_action_fees = tx.action.as_ref().map_or(0, |a| a.total_action_fees);

        let mut outgoing_sent = Vec::new();
        let mut outgoing_external = Vec::new();
        for out in &tx.out_msgs {
            match (out.kind, out.dst) {
                (MessageKind::Internal, Some(dst)) => {
                    outgoing_sent.push(SentMessage::from_info(out, dst))
                }
                (MessageKind::ExternalOut, _) => outgoing_external.push(OutgoingExternalMessage {
                    created_at: out.created_at,
                    lt: out.created_lt,
                    body: out.body.clone(),
                }),
                _ => {}
            }
        }

        let compute_ok = tx.compute.skipped || tx.compute.success;
        let action_ok = tx.action.as_ref().map_or(true, |a| a.success);
        let exit_code = if !compute_ok || action_ok {
            tx.compute.exit_code
        } else {
            tx.action.as_ref().map_or(0, |a| a.result_code)
        };

        let mut msg = Self {
            account: tx.account,
            source,
            kind,
            hash: tx.hash,
            msg_hash,
            lt: tx.lt,
            now: tx.now,
            amount,
            import_fee,
            fwd_fee,
            storage_fee: tx.storage_fees,
            gas_fee,
            total_action_fees,
            magic_fee: 0,
            balance_delta: 0,
            balance_reported: tx.balance_delta.is_some(),
            success: !tx.aborted && compute_ok && action_ok,
            exit_code: ExitCode::from(exit_code),
            bounced,
            emitted_bounce: tx.bounce_emitted,
            outgoing_sent,
            outgoing_received: Vec::new(),
            outgoing_external,
        };

        let explained = msg.storage_fee as i128
            + msg.total_transaction_execution_fee() as i128
            + msg.outgoing_amount() as i128;
        match tx.balance_delta {
            Some(delta) => {
                msg.balance_delta = delta;
                msg.magic_fee = msg.amount as i128 - delta - explained;
            }
            None => {
                msg.magic_fee = tx.total_fees as i128
                    - msg.import_fee as i128
                    - msg.gas_fee as i128
                    - msg.storage_fee as i128
                    - msg.total_action_fees as i128;
                msg.balance_delta = msg.amount as i128 - explained - msg.magic_fee;
            }
        }
        msg
    }

    /// Forward fees of every emitted internal message
    pub fn total_forward_fees(&self) -> u128 {
        sum(self.outgoing_sent.iter().map(|m| m.fwd_fee))
            .saturating_add(sum(self.outgoing_received.iter().map(|m| m.fwd_fee)))
    }

    pub fn total_action_phase_fees(&self) -> u128 {
        self.total_action_fees.saturating_add(self.total_forward_fees())
    }

    /// `import + gas + action + forward`; storage and magic excluded
    pub fn total_transaction_execution_fee(&self) -> u128 {
        self.import_fee
            .saturating_add(self.gas_fee)
            .saturating_add(self.total_action_phase_fees())
    }

    /// Value carried by every emitted internal message
    pub fn outgoing_amount(&self) -> u128 {
        sum(self.outgoing_sent.iter().map(|m| m.amount))
            .saturating_add(sum(self.outgoing_received.iter().map(|m| m.amount)))
    }

    /// Balance change not accounted for by the inbound value
    pub fn net_credit_result(&self) -> i128 {
        self.balance_delta - self.amount as i128
    }

    /// `storage + magic + execution + outgoing + net_credit`; zero for consistent data
    pub fn fee_identity_residual(&self) -> i128 {
        self.storage_fee as i128
            + self.magic_fee
            + self.total_transaction_execution_fee() as i128
            + self.outgoing_amount() as i128
            + self.net_credit_result()
    }

    pub fn status(&self) -> MsgStatus {
        if self.outgoing_sent.is_empty() {
            MsgStatus::Finalized
        } else if !self.outgoing_received.is_empty() {
            MsgStatus::Cascading
        } else {
            MsgStatus::Received
        }
    }

    /// Every located hop succeeded
    pub fn trace_succeeded(&self) -> bool {
        self.success && self.outgoing_received.iter().all(|m| m.trace_succeeded())
    }

    /// First failing hop, depth first
    pub fn first_failure(&self) -> Option<(Address, ExitCode)> {
        if !self.success {
            return Some((self.account, self.exit_code));
        }
        self.outgoing_received.iter().find_map(|m| m.first_failure())
    }

    /// Value emitted across the whole located trace
    pub fn trace_outgoing_amount(&self) -> u128 {
        self.outgoing_amount().saturating_add(sum(
            self.outgoing_received.iter().map(|m| m.trace_outgoing_amount()),
        ))
    }

    pub fn node_count(&self) -> usize {
        1 + self
            .outgoing_received
            .iter()
            .map(|m| m.node_count())
            .sum::<usize>()
    }

    /// Hops below this one; a lone transaction has depth 0
    pub fn depth(&self) -> usize {
        self.outgoing_received
            .iter()
            .map(|m| m.depth() + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    fn fmt_hop(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        write!(
            f,
            "{}{} {} exit {} value {} gas {} fwd {} action {} storage {}",
            indent,
            if self.success { "ok" } else { "FAILED" },
            self.account,
            self.exit_code,
            self.amount,
            self.gas_fee,
            self.fwd_fee,
            self.total_action_fees,
            self.storage_fee
        )?;
        if self.magic_fee != 0 {
            write!(f, " magic {}", self.magic_fee)?;
        }
        if self.emitted_bounce {
            f.write_str(" bounced back")?;
        }
        writeln!(f)?;
        for sent in &self.outgoing_sent {
            writeln!(
                f,
                "{}  -> {} value {} fwd {} not located",
                indent, sent.dst, sent.amount, sent.fwd_fee
            )?;
        }
        for child in &self.outgoing_received {
            child.fmt_hop(f, depth + 1)?;
        }
        Ok(())
    }
}

/// One line per hop, children indented under their parent
impl fmt::Display for MessageReceived {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_hop(f, 0)
    }
}
