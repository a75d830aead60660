//! Chain module - JSON-RPC access to the settlement contract
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Contract interface descriptor loading and calldata encoding
//! - EIP-1559 transaction signing and broadcast
//! - Receipt polling with bounded confirmation waits

pub mod client;
pub mod contract;

pub use client::ChainClient;
pub use contract::SettlementContract;

use crate::error::SettlerResult;
use crate::settle::fee::FeeQuote;
use crate::settle::source::AgreementBatch;

use async_trait::async_trait;
use ethers::types::{Bytes, H256, U256};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// Network identity reported by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub chain_id: u64,
    pub name: String,
}

/// Inclusion proof for a settled transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub tx_hash: H256,
    pub block_number: u64,
}

/// Chain operations the settlement pipeline depends on.
///
/// One implementation talks JSON-RPC to real nodes; tests substitute mocks.
/// Every operation is bounded by a timeout so a hung endpoint can never wedge
/// a cycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SettlementChain: Send + Sync {
    /// Confirm a node is reachable and serving the configured network.
    async fn verify_connectivity(&self) -> SettlerResult<NetworkIdentity>;

    /// Dry-run the batch call without spending gas. Returns the raw bytes the
    /// entry point would return; a contract-side rejection surfaces as
    /// `SimulationReverted` with the revert reason.
    async fn simulate_batch(&self, batch: &AgreementBatch) -> SettlerResult<Bytes>;

    /// Ask a node how much gas the batch call would consume.
    async fn estimate_batch_gas(&self, batch: &AgreementBatch) -> SettlerResult<U256>;

    /// Sign and send the batch transaction. A node that accepts the bytes
    /// yields the transaction hash; a node that rejects them ends the cycle
    /// with `BroadcastRejected` and is never retried within the cycle.
    async fn broadcast(&self, batch: &AgreementBatch, quote: FeeQuote) -> SettlerResult<H256>;

    /// Poll for the receipt until the configured confirmation depth is
    /// reached or the timeout expires. A mined-but-reverted transaction is
    /// `TransactionReverted`; an expired wait is `ConfirmationTimeout`, which
    /// says nothing about whether the transaction later lands.
    async fn await_confirmation(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> SettlerResult<Confirmation>;
}
