//! Fee estimation for outgoing messages

use crate::cell::CellExt;
use crate::config::FeeConfig;
use crate::error::{TxmError, TxmResult};
use crate::txm::{PaymentMode, Request};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Estimated fees of one outgoing message, in nanotons
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeEstimate {
    pub gas: u128,
    pub forward: u128,
    pub storage: u128,
}

impl FeeEstimate {
    pub fn total(&self) -> u128 {
        self.gas + self.forward + self.storage
    }

    /// Reason the request cannot go out with these fees, if any
    pub fn check(&self, request: &Request) -> Option<String> {
        if let Some(cap) = request.fee_cap {
            if self.total() > cap {
                return Some(format!(
                    "estimated fees {} exceed cap {}",
                    self.total(),
                    cap
                ));
            }
        }
        if request.payment == PaymentMode::DeductFromValue && request.amount <= self.forward {
            return Some(format!(
                "value {} does not cover forward fee {}",
                request.amount, self.forward
            ));
        }
        None
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    async fn estimate(&self, request: &Request) -> TxmResult<FeeEstimate>;

    /// Called once when the transaction manager closes
    async fn close(&self) -> TxmResult<()>;
}

/// Estimator with fixed prices plus buffer percentages
pub struct StaticFeeEstimator {
    config: FeeConfig,
    closed: AtomicBool,
}

impl StaticFeeEstimator {
    pub fn new(config: FeeConfig) -> Self {
        Self {
            config,
            closed: AtomicBool::new(false),
        }
    }

    fn buffered(value: u128, percent: u64) -> u128 {
        value + value * percent as u128 / 100
    }
}

impl Default for StaticFeeEstimator {
    fn default() -> Self {
        Self::new(FeeConfig::default())
    }
}

#[async_trait]
impl FeeEstimator for StaticFeeEstimator {
    async fn estimate(&self, request: &Request) -> TxmResult<FeeEstimate> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TxmError::FeeEstimation("estimator is closed".into()));
        }

        let mut cells = request.body.as_ref().map_or(0, |b| b.count_cells());
        if let Some(init) = &request.state_init {
            cells += init.code.count_cells() + init.data.count_cells();
        }

        let forward =
            self.config.base_forward as u128 + self.config.per_cell as u128 * cells as u128;
        let estimate = FeeEstimate {
            gas: Self::buffered(self.config.base_gas as u128, self.config.gas_buffer_percent),
            forward: Self::buffered(forward, self.config.forward_buffer_percent),
            storage: self.config.base_storage as u128,
        };
        debug!("Fee estimate for {}: {:?}", request.key(), estimate);
        Ok(estimate)
    }

    async fn close(&self) -> TxmResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
