//! Signed external messages for one wallet, with broadcast retry

use crate::cell::{ArcCell, CellExt};
use crate::chain::NodeClient;
use crate::error::{TxmError, TxmResult};
use crate::keystore::{public_key_bytes, Keystore};
use crate::wallet::{ExternalMessage, OutAction, StateInit, WalletBody, WalletIdentity};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A signed external message ready to broadcast
#[derive(Debug, Clone)]
pub struct SignedMessage {
    pub seqno: u64,
    pub valid_until: u32,
    pub query_id: Option<u64>,
    /// Hash of the external message cell
    pub hash: [u8; 32],
    pub boc: Vec<u8>,
    pub deploys_wallet: bool,
}

impl SignedMessage {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Broadcast retry schedule
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Binds a wallet, the keystore and the node
pub struct SignedApiClient {
    wallet: WalletIdentity,
    keystore: Arc<dyn Keystore>,
    node: Arc<dyn NodeClient>,
    wallet_code: Option<ArcCell>,
    retry: RetryPolicy,
}

impl SignedApiClient {
    pub fn new(
        wallet: WalletIdentity,
        keystore: Arc<dyn Keystore>,
        node: Arc<dyn NodeClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            wallet,
            keystore,
            node,
            wallet_code: None,
            retry,
        }
    }

    /// Wallet code to attach as state init while the wallet is undeployed
    pub fn with_wallet_code(mut self, code: Option<ArcCell>) -> Self {
        self.wallet_code = code;
        self
    }

    pub fn wallet(&self) -> &WalletIdentity {
        &self.wallet
    }

    fn wallet_state_init(&self) -> TxmResult<Option<StateInit>> {
        let Some(code) = &self.wallet_code else {
            return Ok(None);
        };
        let key = public_key_bytes(&self.wallet.public_key)?;
        let data = self.wallet.version.initial_data(&key)?;
        let init = StateInit::new(code.clone(), Arc::new(data));
        let derived = init.address(self.wallet.workchain())?;
        if derived != self.wallet.address {
            return Err(TxmError::Validation(format!(
                "wallet code and key derive {}, not {}",
                derived, self.wallet.address
            )));
        }
        Ok(Some(init))
    }

    /// Build and sign the external message for `seqno` carrying `actions`
    pub async fn build(
        &self,
        seqno: u64,
        actions: &[OutAction],
        now_secs: u64,
        deploy: bool,
    ) -> TxmResult<SignedMessage> {
        let body = WalletBody::new(
            &self.wallet.version,
            &self.wallet.address,
            seqno,
            now_secs,
            actions,
        )?;
        let signature = self
            .keystore
            .sign(&self.wallet.public_key, &body.digest())
            .await?;
        let signed = body.sign_with(&signature)?;

        let state_init = if deploy {
            self.wallet_state_init()?
        } else {
            None
        };
        let deploys_wallet = state_init.is_some();
        let external = ExternalMessage {
            dst: self.wallet.address,
            state_init,
            body: Arc::new(signed),
        };
        let cell = external.to_cell()?;

        debug!(
            "Built external message for {} seqno {} with {} actions",
            self.wallet,
            seqno,
            actions.len()
        );

        Ok(SignedMessage {
            seqno,
            valid_until: body.valid_until,
            query_id: body.query_id,
            hash: cell.repr_hash(),
            boc: cell.to_boc()?,
            deploys_wallet,
        })
    }

    /// One broadcast attempt
    pub async fn broadcast(&self, message: &SignedMessage) -> TxmResult<[u8; 32]> {
        let hash = self.node.send_external_message(&message.boc).await?;
        if hash != message.hash {
            warn!(
                "Node reported hash {} for message {}",
                hex::encode(hash),
                message.hash_hex()
            );
        }
        Ok(message.hash)
    }

    /// Broadcast with exponential backoff on retryable errors; returns the attempts used
    pub async fn broadcast_with_retry(&self, message: &SignedMessage) -> TxmResult<u32> {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.retry.max_attempts {
            attempts += 1;

            match self.broadcast(message).await {
                Ok(_) => {
                    info!(
                        "Broadcast {} seqno {} for {} (attempt {}/{})",
                        message.hash_hex(),
                        message.seqno,
                        self.wallet,
                        attempts,
                        self.retry.max_attempts
                    );
                    return Ok(attempts);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Broadcast attempt {} for {} failed: {}", attempts, self.wallet, e);
                    crate::metrics::record_broadcast_retry(&self.wallet.address);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            if attempts < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay(attempts)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| TxmError::Node {
            message: "broadcast was never attempted".into(),
        }))
    }
}
