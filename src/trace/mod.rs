//! Transaction traces
//!
//! This module provides:
//! - `MessageReceived`, one located hop with its fee breakdown
//! - `TraceTracker`, inclusion checks and transaction lookup against the node
//! - `TraceWalk`, the bounded walk from a root transaction down its trace

pub mod message;
pub mod tracker;
pub mod walk;

pub use message::{MessageReceived, MsgStatus, OutgoingExternalMessage, SentMessage};
pub use tracker::{Inclusion, TraceTracker};
pub use walk::{TraceWalk, WalkLimits, WalkStep};
