//! Seqno tracking for one sender wallet
//!
//! Handles:
//! - Reading the starting seqno from the node
//! - Local advancement after each broadcast
//! - Resync from the node after a batch expires or fails

use crate::chain::NodeClient;
use crate::error::{TxmError, TxmResult};
use crate::wallet::WalletIdentity;

use tracing::{debug, info, warn};

/// Next sequence number of a wallet. Owned by that wallet's worker.
#[derive(Debug)]
pub struct SeqnoTracker {
    wallet: WalletIdentity,
    next: Option<u64>,
    needs_resync: bool,
    /// Standard wallet that has not been deployed yet
    undeployed: bool,
}

impl SeqnoTracker {
    pub fn new(wallet: WalletIdentity) -> Self {
        Self {
            wallet,
            next: None,
            needs_resync: true,
            undeployed: false,
        }
    }

    /// Read the seqno from the node.
    ///
    /// Highload wallets have no seqno; their sequence is seeded from the clock once
    /// and then only moves forward, so query ids are never reused.
    pub async fn sync(&mut self, node: &dyn NodeClient, now_secs: u64) -> TxmResult<u64> {
        if self.wallet.version.is_highload() {
            let next = match self.next {
                Some(next) => next,
                None => self.wallet.version.initial_highload_seq(now_secs),
            };
            self.next = Some(next);
            self.needs_resync = false;
            debug!("Highload sequence for {} at {}", self.wallet, next);
            return Ok(next);
        }

        let tip = node.current_tip().await?;
        let account = node
            .get_account(&tip, &self.wallet.address)
            .await
            .map_err(|e| TxmError::Seqno {
                sender: self.wallet.to_string(),
                message: e.to_string(),
            })?;

        let on_chain = account.seqno as u64;
        if let Some(local) = self.next {
            if local != on_chain {
                warn!(
                    "Seqno drift for {}: local {}, node {}",
                    self.wallet, local, on_chain
                );
            }
        }
        self.next = Some(on_chain);
        self.undeployed = !account.is_active && on_chain == 0;
        self.needs_resync = false;
        info!("Synced seqno for {}: {}", self.wallet, on_chain);
        Ok(on_chain)
    }

    /// Seqno the next batch will carry
    pub fn current(&self) -> TxmResult<u64> {
        self.next.ok_or_else(|| TxmError::Seqno {
            sender: self.wallet.to_string(),
            message: "seqno not synced".into(),
        })
    }

    /// The batch carrying the current seqno was broadcast
    pub fn advance(&mut self) {
        if let Some(next) = self.next.as_mut() {
            *next += 1;
        }
        self.undeployed = false;
    }

    pub fn mark_resync(&mut self) {
        self.needs_resync = true;
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync || self.next.is_none()
    }

    pub fn is_undeployed(&self) -> bool {
        self.undeployed
    }
}
