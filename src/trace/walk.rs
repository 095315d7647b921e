//! Incremental walk of a trace below a root transaction
//!
//! The walk keeps every located hop in an arena and a frontier of messages whose
//! destination transaction has not been found yet. Each `poll` tries the whole
//! frontier once, so one confirmation tick costs at most one lookup per open hop.

use crate::cell::Address;
use crate::chain::Transaction;
use crate::trace::{MessageReceived, SentMessage, TraceTracker};

use std::collections::HashSet;
use tracing::{debug, warn};

/// Bounds on a single walk
#[derive(Debug, Clone, Copy)]
pub struct WalkLimits {
    /// Hops below the root
    pub max_depth: usize,
    /// Located transactions, root included
    pub max_nodes: usize,
    /// Misses per hop before the walk fails
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkStep {
    /// Open hops remain
    Progress,
    Done,
    Failed(String),
}

struct Node {
    msg: MessageReceived,
    children: Vec<usize>,
}

struct PendingHop {
    parent: usize,
    sent: SentMessage,
    depth: usize,
    attempts: u32,
}

pub struct TraceWalk {
    origin: Address,
    limits: WalkLimits,
    nodes: Vec<Node>,
    frontier: Vec<PendingHop>,
    seen: HashSet<(Address, u64, [u8; 32])>,
    truncated: bool,
}

impl TraceWalk {
    pub fn new(root: &Transaction, limits: WalkLimits) -> Self {
        let msg = MessageReceived::from_transaction(root);
        let mut walk = Self {
            origin: root.account,
            limits,
            nodes: Vec::new(),
            frontier: Vec::new(),
            seen: HashSet::new(),
            truncated: false,
        };
        walk.seen.insert((root.account, root.lt, root.hash));
        walk.insert(msg, None, 0);
        walk
    }

    fn insert(&mut self, msg: MessageReceived, parent: Option<usize>, depth: usize) {
        let index = self.nodes.len();
        for sent in &msg.outgoing_sent {
            if sent.bounced && sent.dst == self.origin {
                continue;
            }
            if depth + 1 > self.limits.max_depth {
                self.truncated = true;
                continue;
            }
            self.frontier.push(PendingHop {
                parent: index,
                sent: sent.clone(),
                depth: depth + 1,
                attempts: 0,
            });
        }
        self.nodes.push(Node {
            msg,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(index);
        }
    }

    /// Try every open hop once
    pub async fn poll(&mut self, tracker: &TraceTracker) -> WalkStep {
        let mut failure = None;
        let open = std::mem::take(&mut self.frontier);

        for mut hop in open {
            if failure.is_some() {
                self.frontier.push(hop);
                continue;
            }
            match tracker.find_hop(&hop.sent).await {
                Ok(Some(tx)) => self.attach(hop, &tx),
                Ok(None) => {
                    hop.attempts += 1;
                    if hop.attempts >= self.limits.max_attempts {
                        failure = Some(format!(
                            "hop to {} not found after {} attempts",
                            hop.sent.dst, hop.attempts
                        ));
                    }
                    self.frontier.push(hop);
                }
                Err(e) if e.is_retryable() => {
                    debug!("Lookup of hop to {} deferred: {}", hop.sent.dst, e);
                    self.frontier.push(hop);
                }
                Err(e) => {
                    warn!("Lookup of hop to {} failed: {}", hop.sent.dst, e);
                    hop.attempts += 1;
                    if hop.attempts >= self.limits.max_attempts {
                        failure = Some(e.to_string());
                    }
                    self.frontier.push(hop);
                }
            }
        }

        match failure {
            Some(reason) => WalkStep::Failed(reason),
            None if self.frontier.is_empty() => WalkStep::Done,
            None => WalkStep::Progress,
        }
    }

    fn attach(&mut self, hop: PendingHop, tx: &Transaction) {
        if !self.seen.insert((tx.account, tx.lt, tx.hash)) {
            debug!("Transaction {} already in trace", tx.hash_hex());
            return;
        }
        if self.nodes.len() >= self.limits.max_nodes {
            self.truncated = true;
            return;
        }
        let parent = &mut self.nodes[hop.parent].msg;
        if let Some(pos) = parent.outgoing_sent.iter().position(|s| s.hash == hop.sent.hash) {
            parent.outgoing_sent.remove(pos);
        }
        self.insert(MessageReceived::from_transaction(tx), Some(hop.parent), hop.depth);
    }

    /// Trace as located so far, rooted at the wallet transaction
    pub fn assemble(&self) -> MessageReceived {
        self.assemble_from(0)
    }

    fn assemble_from(&self, index: usize) -> MessageReceived {
        let node = &self.nodes[index];
        let mut msg = node.msg.clone();
        msg.outgoing_received = node
            .children
            .iter()
            .map(|&child| self.assemble_from(child))
            .collect();
        msg
    }

    /// A depth or size bound cut the walk short
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn open_hops(&self) -> usize {
        self.frontier.len()
    }
}
