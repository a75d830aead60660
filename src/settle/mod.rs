//! Settlement module - the scheduled batch pipeline
//!
//! This module provides:
//! - Agreement identifier sourcing for each cycle
//! - Operator-controlled fee policy and gas sizing
//! - The simulate / estimate / broadcast / confirm submission pipeline
//! - Schedule handling with skip-if-running overlap protection

pub mod fee;
pub mod scheduler;
pub mod source;
pub mod submitter;

pub use fee::{FeePolicy, FeeQuote};
pub use scheduler::SettlementScheduler;
pub use source::{AgreementBatch, AgreementSource};
pub use submitter::{BatchSubmitter, CycleResult, CycleSummary, SubmissionOutcome};
