//! TON transaction manager
//!
//! Queues outgoing messages per sender wallet, batches and signs them, broadcasts them
//! through a node and follows each batch to a terminal state, optionally walking the
//! full trace of internal messages it caused.

pub mod api;
pub mod bindings;
pub mod cell;
pub mod chain;
pub mod config;
pub mod error;
pub mod keystore;
pub mod metrics;
pub mod trace;
pub mod tx;
pub mod txm;
pub mod wallet;

pub use error::{TxmError, TxmResult};
pub use txm::{Request, RequestHandle, RequestState, TxOutcome, Txm};
