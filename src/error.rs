//! Error types for the batch settler

use thiserror::Error;

/// Main error type for the settler
#[derive(Error, Debug)]
pub enum SettlerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract descriptor error: {0}")]
    Descriptor(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Simulation reverted: {reason}")]
    SimulationReverted { reason: String },

    #[error("Gas estimation failed: {0}")]
    EstimationFailed(String),

    #[error("Invalid fee policy: {0}")]
    InvalidFeePolicy(String),

    #[error("Broadcast rejected: {reason}")]
    BroadcastRejected { reason: String },

    #[error("Confirmation timed out after {waited_secs}s for tx {tx_hash}")]
    ConfirmationTimeout { tx_hash: String, waited_secs: u64 },

    #[error("Transaction {tx_hash} reverted on-chain in block {block_number}")]
    TransactionReverted { tx_hash: String, block_number: u64 },
}

impl SettlerError {
    /// Check if the next scheduled cycle may succeed without operator action.
    ///
    /// Transient failures cover unreachable endpoints and estimation noise;
    /// definite failures (reverts, rejections, bad policy) need a config or
    /// contract-side change first.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SettlerError::NetworkUnreachable(_)
                | SettlerError::EstimationFailed(_)
                | SettlerError::ConfirmationTimeout { .. }
        )
    }

    /// Check if a transaction is in flight with unknown fate.
    ///
    /// True only for a confirmation timeout: the transaction was accepted by
    /// the network and may still land after the wait expired. Callers must
    /// not treat this as a definite failure.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, SettlerError::ConfirmationTimeout { .. })
    }
}

/// Result type for settler operations
pub type SettlerResult<T> = Result<T, SettlerError>;
