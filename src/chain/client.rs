//! JSON-RPC chain client with multi-endpoint failover
//!
//! One client owns the provider list, the signing wallet, and the parsed
//! contract descriptor for the lifetime of the process. Transport failures
//! rotate to the next configured endpoint; node-level rejections are surfaced
//! to the caller unchanged. Re-sending identical signed bytes after a
//! transport failure yields the same transaction hash, so broadcast failover
//! never creates duplicate intent.

use crate::chain::{Confirmation, NetworkIdentity, SettlementChain, SettlementContract};
use crate::config::{Settings, WalletConfig};
use crate::error::{SettlerError, SettlerResult};
use crate::settle::fee::FeeQuote;
use crate::settle::source::AgreementBatch;

use async_trait::async_trait;
use ethers::abi::{ParamType, Token};
use ethers::prelude::*;
use ethers::providers::{Http, JsonRpcError, Provider, ProviderError, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::BlockNumber;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// JSON-RPC client bound to one network, one signing key, and one contract.
pub struct ChainClient {
    chain_id: u64,
    network_name: String,
    confirmation_blocks: u64,
    contract: SettlementContract,
    /// HTTP providers in priority order.
    http_providers: Vec<Provider<Http>>,
    /// Index of the currently active provider.
    current_provider: AtomicUsize,
    wallet: LocalWallet,
    rpc_timeout: Duration,
    broadcast_timeout: Duration,
    receipt_poll_interval: Duration,
}

impl ChainClient {
    /// Build the client from settings: parse the contract descriptor, load
    /// the signing key, and set up the provider list.
    pub fn connect(settings: &Settings) -> SettlerResult<Self> {
        let chain = &settings.chain;

        let mut http_providers = Vec::new();
        for url in &chain.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added RPC endpoint for {}: {}", chain.name, url);
                }
                Err(e) => {
                    warn!("Skipping malformed RPC url {}: {}", url, e);
                }
            }
        }
        if http_providers.is_empty() {
            return Err(SettlerError::Config(format!(
                "no usable RPC endpoints configured for {}",
                chain.name
            )));
        }

        let address: Address = chain.contract_address.parse().map_err(|e| {
            SettlerError::Config(format!(
                "invalid contract address {}: {}",
                chain.contract_address, e
            ))
        })?;
        let contract = SettlementContract::load(&chain.abi_path, &chain.entry_point, address)?;

        let wallet = load_wallet(&settings.wallet, settings.private_key_env())?
            .with_chain_id(chain.chain_id);
        info!(
            "Signer {:?} bound to {} at {:?} on {}",
            wallet.address(),
            contract.entry_point_name(),
            contract.address(),
            chain.name
        );

        Ok(Self {
            chain_id: chain.chain_id,
            network_name: chain.name.clone(),
            confirmation_blocks: chain.confirmation_blocks,
            contract,
            http_providers,
            current_provider: AtomicUsize::new(0),
            wallet,
            rpc_timeout: Duration::from_secs(settings.settler.rpc_timeout_secs),
            broadcast_timeout: Duration::from_secs(settings.settler.broadcast_timeout_secs),
            receipt_poll_interval: Duration::from_millis(settings.settler.receipt_poll_interval_ms),
        })
    }

    /// Get the current HTTP provider.
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed) % self.http_providers.len();
        &self.http_providers[idx]
    }

    /// Rotate to the next provider after a transport failure.
    fn failover(&self) {
        let next = (self.current_provider.load(Ordering::Relaxed) + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("{} failing over to RPC endpoint {}", self.network_name, next);
    }

    /// Read-only call / estimate request for the batch entry point.
    fn call_request(&self, calldata: Bytes) -> TypedTransaction {
        TypedTransaction::Eip1559(
            Eip1559TransactionRequest::new()
                .from(self.wallet.address())
                .to(self.contract.address())
                .data(calldata),
        )
    }

    /// Sending account derived from the configured key.
    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Latest block number from the first endpoint that answers.
    pub async fn get_block_number(&self) -> SettlerResult<u64> {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match timeout(self.rpc_timeout, self.http().get_block_number()).await {
                Ok(Ok(block)) => return Ok(block.as_u64()),
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    self.failover();
                }
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.rpc_timeout);
                    self.failover();
                }
            }
        }
        Err(SettlerError::NetworkUnreachable(last_error))
    }

    /// Native balance of the signing account.
    pub async fn get_balance(&self) -> SettlerResult<U256> {
        let address = self.wallet.address();
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match timeout(self.rpc_timeout, self.http().get_balance(address, None)).await {
                Ok(Ok(balance)) => return Ok(balance),
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    self.failover();
                }
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.rpc_timeout);
                    self.failover();
                }
            }
        }
        Err(SettlerError::NetworkUnreachable(last_error))
    }

    /// Pending-block nonce for the signing account. Fetched fresh per
    /// broadcast; the single-flight guard upstream guarantees no competing
    /// in-flight transaction from this key.
    async fn pending_nonce(&self) -> SettlerResult<U256> {
        let address = self.wallet.address();
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            let lookup = self
                .http()
                .get_transaction_count(address, Some(BlockNumber::Pending.into()));
            match timeout(self.rpc_timeout, lookup).await {
                Ok(Ok(nonce)) => return Ok(nonce),
                Ok(Err(e)) => {
                    warn!("Nonce lookup failed on {}: {}", self.network_name, e);
                    last_error = e.to_string();
                    self.failover();
                }
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.rpc_timeout);
                    self.failover();
                }
            }
        }
        Err(SettlerError::NetworkUnreachable(last_error))
    }
}

#[async_trait]
impl SettlementChain for ChainClient {
    async fn verify_connectivity(&self) -> SettlerResult<NetworkIdentity> {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match timeout(self.rpc_timeout, self.http().get_chainid()).await {
                Ok(Ok(reported)) => {
                    let reported = reported.low_u64();
                    if reported != self.chain_id {
                        return Err(SettlerError::Config(format!(
                            "endpoint reports chain id {} but configuration expects {} ({})",
                            reported, self.chain_id, self.network_name
                        )));
                    }
                    return Ok(NetworkIdentity {
                        chain_id: reported,
                        name: self.network_name.clone(),
                    });
                }
                Ok(Err(e)) => {
                    warn!("Connectivity check failed on {}: {}", self.network_name, e);
                    last_error = e.to_string();
                    self.failover();
                }
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.rpc_timeout);
                    self.failover();
                }
            }
        }
        Err(SettlerError::NetworkUnreachable(last_error))
    }

    async fn simulate_batch(&self, batch: &AgreementBatch) -> SettlerResult<Bytes> {
        let calldata = self.contract.encode_batch(batch)?;
        debug!("Simulating batch call: 0x{}", hex::encode(&calldata));
        let tx = self.call_request(calldata);

        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match timeout(self.rpc_timeout, self.http().call(&tx, None)).await {
                Ok(Ok(returned)) => {
                    if let Ok(tokens) = self.contract.decode_return(&returned) {
                        debug!("Simulation returned {:?}", tokens);
                    }
                    return Ok(returned);
                }
                Ok(Err(e)) => {
                    if let Some(response) = node_error_response(&e) {
                        // The node executed the call and the contract said no.
                        return Err(SettlerError::SimulationReverted {
                            reason: revert_reason(response),
                        });
                    }
                    warn!("Simulation transport failure on {}: {}", self.network_name, e);
                    last_error = e.to_string();
                    self.failover();
                }
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.rpc_timeout);
                    self.failover();
                }
            }
        }
        Err(SettlerError::NetworkUnreachable(last_error))
    }

    async fn estimate_batch_gas(&self, batch: &AgreementBatch) -> SettlerResult<U256> {
        let calldata = self.contract.encode_batch(batch)?;
        let tx = self.call_request(calldata);

        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match timeout(self.rpc_timeout, self.http().estimate_gas(&tx, None)).await {
                Ok(Ok(gas)) => {
                    debug!("Node estimated {} gas units for the batch", gas);
                    return Ok(gas);
                }
                Ok(Err(e)) => {
                    if let Some(response) = node_error_response(&e) {
                        return Err(SettlerError::EstimationFailed(response.message.clone()));
                    }
                    warn!("Estimation transport failure on {}: {}", self.network_name, e);
                    last_error = e.to_string();
                    self.failover();
                }
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.rpc_timeout);
                    self.failover();
                }
            }
        }
        Err(SettlerError::EstimationFailed(format!(
            "no endpoint answered: {}",
            last_error
        )))
    }

    async fn broadcast(&self, batch: &AgreementBatch, quote: FeeQuote) -> SettlerResult<H256> {
        let calldata = self.contract.encode_batch(batch)?;
        let nonce = self.pending_nonce().await?;

        let tx = Eip1559TransactionRequest::new()
            .from(self.wallet.address())
            .to(self.contract.address())
            .data(calldata)
            .nonce(nonce)
            .gas(quote.gas_limit)
            .max_priority_fee_per_gas(quote.max_priority_fee_per_gas)
            .max_fee_per_gas(quote.max_fee_per_gas)
            .chain_id(self.chain_id);
        let tx = TypedTransaction::Eip1559(tx);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SettlerError::Wallet(format!("signing failed: {}", e)))?;
        let raw = tx.rlp_signed(&signature);

        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match timeout(
                self.broadcast_timeout,
                self.http().send_raw_transaction(raw.clone()),
            )
            .await
            {
                Ok(Ok(pending)) => {
                    let tx_hash = pending.tx_hash();
                    info!(
                        "Transaction accepted by {}: {:?} (nonce {})",
                        self.network_name, tx_hash, nonce
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    if let Some(response) = node_error_response(&e) {
                        // The node heard us and refused. The same bytes cannot
                        // succeed elsewhere, and a recomputed transaction
                        // risks duplicate intent, so the cycle ends here.
                        return Err(SettlerError::BroadcastRejected {
                            reason: response.message.clone(),
                        });
                    }
                    warn!(
                        "Broadcast transport failure on {}: {}; re-sending identical bytes",
                        self.network_name, e
                    );
                    last_error = e.to_string();
                    self.failover();
                }
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.broadcast_timeout);
                    self.failover();
                }
            }
        }
        Err(SettlerError::NetworkUnreachable(format!(
            "broadcast reached no endpoint: {}",
            last_error
        )))
    }

    async fn await_confirmation(
        &self,
        tx_hash: H256,
        wait: Duration,
    ) -> SettlerResult<Confirmation> {
        let poll_interval = self.receipt_poll_interval;

        let outcome = timeout(wait, async {
            loop {
                // Each poll carries the per-call bound; an endpoint that
                // accepts the request and never answers must not pin the
                // whole confirmation window on itself.
                let lookup = timeout(
                    self.rpc_timeout,
                    self.http().get_transaction_receipt(tx_hash),
                )
                .await;
                match lookup {
                    Ok(Ok(Some(receipt))) => {
                        if receipt.status == Some(0.into()) {
                            let block_number =
                                receipt.block_number.map(|b| b.as_u64()).unwrap_or_default();
                            return Err(SettlerError::TransactionReverted {
                                tx_hash: format!("{:?}", tx_hash),
                                block_number,
                            });
                        }
                        if let Some(block_number) = receipt.block_number {
                            match self.get_block_number().await {
                                Ok(current) => {
                                    let confirmations =
                                        current.saturating_sub(block_number.as_u64()) + 1;
                                    if confirmations >= self.confirmation_blocks {
                                        return Ok(Confirmation {
                                            tx_hash,
                                            block_number: block_number.as_u64(),
                                        });
                                    }
                                    debug!(
                                        "{:?} at {} of {} confirmations",
                                        tx_hash, confirmations, self.confirmation_blocks
                                    );
                                }
                                Err(e) => {
                                    warn!("Block height lookup failed: {}", e);
                                }
                            }
                        }
                    }
                    Ok(Ok(None)) => {
                        debug!("{:?} not yet mined", tx_hash);
                    }
                    Ok(Err(e)) => {
                        warn!("Receipt lookup failed on {}: {}", self.network_name, e);
                        self.failover();
                    }
                    Err(_) => {
                        warn!(
                            "Receipt lookup timed out after {:?} on {}",
                            self.rpc_timeout, self.network_name
                        );
                        self.failover();
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(SettlerError::ConfirmationTimeout {
                tx_hash: format!("{:?}", tx_hash),
                waited_secs: wait.as_secs(),
            }),
        }
    }
}

/// Load the signing key from the configured environment variable.
///
/// Only the derived address is ever logged; the raw key stays out of the
/// settings tree, log lines, and error messages. Unlocking an encrypted
/// keystore needs an interactive password, so `wallet.keystore_path` is
/// accepted in configuration but not usable for unattended runs.
fn load_wallet(wallet: &WalletConfig, env_var: &str) -> SettlerResult<LocalWallet> {
    if let Ok(key) = std::env::var(env_var) {
        return key.parse::<LocalWallet>().map_err(|e| {
            SettlerError::Wallet(format!("invalid signing key in {}: {}", env_var, e))
        });
    }

    match &wallet.keystore_path {
        Some(path) => Err(SettlerError::Wallet(format!(
            "keystore {} cannot be unlocked without a prompt; set {} instead",
            path, env_var
        ))),
        None => Err(SettlerError::Wallet(format!(
            "signing key not found: set {}",
            env_var
        ))),
    }
}

/// Error response returned by the node itself, as opposed to a transport
/// failure that never reached it.
fn node_error_response(err: &ProviderError) -> Option<&JsonRpcError> {
    match err {
        ProviderError::JsonRpcClientError(inner) => inner.as_error_response(),
        _ => None,
    }
}

/// Extract a human-readable revert reason from a node error response.
///
/// Nodes differ: some put "execution reverted: <reason>" in the message, some
/// attach the ABI-encoded Error(string) payload as data. Falls back to the
/// raw message.
fn revert_reason(err: &JsonRpcError) -> String {
    if let Some(data) = err.data.as_ref().and_then(|v| v.as_str()) {
        if let Some(reason) = decode_error_string(data) {
            return reason;
        }
    }
    err.message
        .strip_prefix("execution reverted: ")
        .map(str::to_string)
        .unwrap_or_else(|| err.message.clone())
}

/// Decode the standard Error(string) revert payload (selector 0x08c379a0).
fn decode_error_string(hex_data: &str) -> Option<String> {
    let raw = hex::decode(hex_data.trim_start_matches("0x")).ok()?;
    if raw.len() <= 4 || raw[..4] != [0x08, 0xc3, 0x79, 0xa0] {
        return None;
    }
    let tokens = ethers::abi::decode(&[ParamType::String], &raw[4..]).ok()?;
    match tokens.into_iter().next() {
        Some(Token::String(reason)) => Some(reason),
        _ => None,
    }
}
