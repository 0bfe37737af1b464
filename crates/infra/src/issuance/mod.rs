//! Issue-out and return orchestration.
//!
//! Both executors run their steps in a fixed order against the stores.
//! Committed steps are never rolled back: fee attachment on issue is
//! best-effort, while fee reversal on return is a hard failure.

pub mod executor;
pub mod reversal;

pub use executor::{FeeAttach, IssuanceError, IssuanceExecutor, IssuanceOutcome, IssueCommand};
pub use reversal::{FeeReversal, ReturnCommand, ReturnError, ReturnExecutor, ReturnOutcome, ReversalConfig};
