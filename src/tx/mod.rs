//! Transaction submission: fee estimation, seqno tracking and signed broadcast

pub mod client;
pub mod fee;
pub mod seqno;

pub use client::{RetryPolicy, SignedApiClient, SignedMessage};
pub use fee::{FeeEstimate, FeeEstimator, StaticFeeEstimator};
pub use seqno::SeqnoTracker;
