//! Batch submission pipeline
//!
//! One cycle walks a fixed sequence of stages: simulate, estimate, quote,
//! broadcast, await confirmation. A failure at any stage ends the cycle with
//! a classified outcome; nothing inside a cycle retries a node rejection.

use crate::chain::SettlementChain;
use crate::error::SettlerError;
use crate::settle::fee::FeePolicy;
use crate::settle::source::AgreementBatch;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pipeline stage a cycle reached when it produced its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Simulation,
    Estimation,
    FeeQuote,
    Broadcast,
    Confirmation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Simulation => "simulation",
            Stage::Estimation => "estimation",
            Stage::FeeQuote => "fee_quote",
            Stage::Broadcast => "broadcast",
            Stage::Confirmation => "confirmation",
        }
    }
}

/// Terminal classification of one submission attempt.
///
/// `TransientFailure` covers both retryable transport problems and the
/// indeterminate confirmation timeout; in either case the next scheduled
/// cycle may resubmit. `Rejected` is definite: the contract or a node refused
/// the batch and resubmitting the same input will refuse again.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum SubmissionOutcome {
    Confirmed { tx_hash: String, block_number: u64 },
    Rejected { stage: Stage, reason: String },
    TransientFailure { stage: Stage, reason: String },
}

impl SubmissionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SubmissionOutcome::Confirmed { .. } => "confirmed",
            SubmissionOutcome::Rejected { .. } => "rejected",
            SubmissionOutcome::TransientFailure { .. } => "transient_failure",
        }
    }
}

/// What one scheduler tick produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleResult {
    /// The pipeline ran to a terminal outcome.
    Settled(SubmissionOutcome),
    /// Nothing was due; no network call was made.
    EmptyBatch,
    /// A previous cycle still holds the signing key.
    AlreadyRunning,
}

/// Record of the most recent completed cycle, served on the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batch_size: usize,
    /// One of confirmed, rejected, transient_failure, empty_batch.
    pub disposition: String,
    /// Stage detail for settled cycles; absent for an empty batch.
    pub outcome: Option<SubmissionOutcome>,
}

/// Drives one settlement cycle end to end.
///
/// # Resubmission precondition
///
/// After an indeterminate outcome (confirmation timeout) the next scheduled
/// cycle resubmits the same identifiers without checking whether the earlier
/// transaction landed. That is only safe because the settlement contract is
/// expected to skip identifiers that are already settled; nothing here
/// verifies that guarantee.
///
/// At most one run may be in flight per signing key, since two concurrent
/// transactions from one account contend on the nonce. `try_settle` refuses
/// overlapping runs instead of queueing them.
pub struct BatchSubmitter {
    chain: Arc<dyn SettlementChain>,
    fee_policy: FeePolicy,
    confirmation_timeout: Duration,
    /// Held for the duration of a cycle; `try_lock` is the overlap guard.
    run_lock: Mutex<()>,
    /// Observer-facing mirror of the run lock, set and cleared by
    /// `try_settle`.
    in_flight: AtomicBool,
    last_cycle: RwLock<Option<CycleSummary>>,
}

impl BatchSubmitter {
    /// A fee policy that cannot produce a valid quote is refused here, at
    /// startup, rather than on the first scheduled cycle.
    pub fn new(
        chain: Arc<dyn SettlementChain>,
        fee_policy: FeePolicy,
        confirmation_timeout: Duration,
    ) -> crate::error::SettlerResult<Self> {
        fee_policy.validate()?;
        Ok(Self {
            chain,
            fee_policy,
            confirmation_timeout,
            run_lock: Mutex::new(()),
            in_flight: AtomicBool::new(false),
            last_cycle: RwLock::new(None),
        })
    }

    /// Run one cycle unless a previous one is still in flight.
    pub async fn try_settle(&self, cycle_id: Uuid, batch: AgreementBatch) -> CycleResult {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return CycleResult::AlreadyRunning,
        };
        self.in_flight.store(true, Ordering::SeqCst);

        let started_at = Utc::now();
        let result = if batch.is_empty() {
            self.record_summary(cycle_id, started_at, 0, "empty_batch", None)
                .await;
            CycleResult::EmptyBatch
        } else {
            crate::metrics::record_batch_size(batch.len());
            let outcome = self.run_pipeline(cycle_id, &batch).await;
            let finished_at = Utc::now();
            crate::metrics::record_cycle_duration(
                (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
            );

            self.record_summary(
                cycle_id,
                started_at,
                batch.len(),
                outcome.label(),
                Some(outcome.clone()),
            )
            .await;

            CycleResult::Settled(outcome)
        };

        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    /// Whether a cycle currently holds the signing key. Reads a flag kept
    /// alongside the run lock; asking must not contend on the lock it
    /// reports, or a status poll could displace a scheduled cycle.
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most recent completed cycle, if any.
    pub async fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.read().await.clone()
    }

    async fn run_pipeline(&self, cycle_id: Uuid, batch: &AgreementBatch) -> SubmissionOutcome {
        debug!("Cycle {}: simulating batch {}", cycle_id, batch.summary());
        let returned = match self.chain.simulate_batch(batch).await {
            Ok(returned) => returned,
            Err(e) => {
                warn!("Cycle {}: simulation rejected the batch: {}", cycle_id, e);
                return failure_outcome(Stage::Simulation, &e);
            }
        };
        debug!(
            "Cycle {}: simulation ok (returned 0x{})",
            cycle_id,
            hex::encode(&returned)
        );

        let estimated = match self.chain.estimate_batch_gas(batch).await {
            Ok(estimated) => estimated,
            Err(e) => {
                warn!("Cycle {}: gas estimation failed: {}", cycle_id, e);
                return failure_outcome(Stage::Estimation, &e);
            }
        };
        info!("Cycle {}: gas estimate {}", cycle_id, estimated);

        let quote = match self.fee_policy.quote(estimated) {
            Ok(quote) => quote,
            Err(e) => {
                error!("Cycle {}: fee policy refused a quote: {}", cycle_id, e);
                return failure_outcome(Stage::FeeQuote, &e);
            }
        };
        info!(
            "Cycle {}: fee quote gas_limit={} max_priority_fee_per_gas={} max_fee_per_gas={}",
            cycle_id, quote.gas_limit, quote.max_priority_fee_per_gas, quote.max_fee_per_gas
        );

        let tx_hash = match self.chain.broadcast(batch, quote).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                warn!("Cycle {}: broadcast failed: {}", cycle_id, e);
                return failure_outcome(Stage::Broadcast, &e);
            }
        };
        info!("Cycle {}: transaction sent: {:?}", cycle_id, tx_hash);
        crate::metrics::record_tx_broadcast();

        match self
            .chain
            .await_confirmation(tx_hash, self.confirmation_timeout)
            .await
        {
            Ok(confirmation) => {
                info!(
                    "Cycle {}: confirmed in block {} ({:?})",
                    cycle_id, confirmation.block_number, confirmation.tx_hash
                );
                SubmissionOutcome::Confirmed {
                    tx_hash: format!("{:?}", confirmation.tx_hash),
                    block_number: confirmation.block_number,
                }
            }
            Err(e) if e.is_indeterminate() => {
                warn!(
                    "Cycle {}: fate of {:?} unknown after timeout: {}",
                    cycle_id, tx_hash, e
                );
                failure_outcome(Stage::Confirmation, &e)
            }
            Err(e) => {
                error!("Cycle {}: {:?} failed on chain: {}", cycle_id, tx_hash, e);
                failure_outcome(Stage::Confirmation, &e)
            }
        }
    }

    async fn record_summary(
        &self,
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
        batch_size: usize,
        disposition: &str,
        outcome: Option<SubmissionOutcome>,
    ) {
        let summary = CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            batch_size,
            disposition: disposition.to_string(),
            outcome,
        };
        *self.last_cycle.write().await = Some(summary);
    }
}

/// Indeterminate and retryable errors become `TransientFailure`; everything
/// else is a definite `Rejected`.
fn failure_outcome(stage: Stage, err: &SettlerError) -> SubmissionOutcome {
    let reason = err.to_string();
    if err.is_transient() {
        SubmissionOutcome::TransientFailure { stage, reason }
    } else {
        SubmissionOutcome::Rejected { stage, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Confirmation, MockSettlementChain, SettlementChain};
    use crate::error::SettlerResult;
    use crate::settle::fee::FeeQuote;
    use async_trait::async_trait;
    use ethers::types::{Bytes, H256, U256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn submitter(chain: MockSettlementChain) -> BatchSubmitter {
        BatchSubmitter::new(
            Arc::new(chain),
            FeePolicy::default(),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_network_calls() {
        // No expectations set: any chain call would panic the mock.
        let submitter = submitter(MockSettlementChain::new());

        let result = submitter
            .try_settle(Uuid::new_v4(), AgreementBatch::new(vec![]))
            .await;

        assert_eq!(result, CycleResult::EmptyBatch);
        let summary = submitter.last_cycle().await.unwrap();
        assert_eq!(summary.batch_size, 0);
        assert_eq!(summary.disposition, "empty_batch");
        assert!(summary.outcome.is_none());
    }

    #[tokio::test]
    async fn test_simulation_revert_spends_no_gas() {
        let mut chain = MockSettlementChain::new();
        chain.expect_simulate_batch().times(1).returning(|_| {
            Err(SettlerError::SimulationReverted {
                reason: "already settled".to_string(),
            })
        });
        chain.expect_estimate_batch_gas().never();
        chain.expect_broadcast().never();
        chain.expect_await_confirmation().never();

        let submitter = submitter(chain);
        let result = submitter
            .try_settle(Uuid::new_v4(), AgreementBatch::new(vec![4]))
            .await;

        match result {
            CycleResult::Settled(SubmissionOutcome::Rejected { stage, reason }) => {
                assert_eq!(stage, Stage::Simulation);
                assert!(reason.contains("already settled"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_pipeline_applies_fee_policy() {
        let tx_hash = H256::from_low_u64_be(0xabc);
        let mut chain = MockSettlementChain::new();

        chain
            .expect_simulate_batch()
            .withf(|batch| batch.len() == 51)
            .times(1)
            .returning(|_| Ok(Bytes::default()));
        chain
            .expect_estimate_batch_gas()
            .times(1)
            .returning(|_| Ok(U256::from(800_000)));
        chain
            .expect_broadcast()
            .withf(|_, quote| {
                quote.gas_limit == U256::from(900_000)
                    && quote.max_priority_fee_per_gas == U256::from(30_000_000_000u64)
                    && quote.max_fee_per_gas == U256::from(60_000_000_000u64)
            })
            .times(1)
            .returning(move |_, _| Ok(tx_hash));
        chain
            .expect_await_confirmation()
            .withf(move |hash, wait| *hash == tx_hash && *wait == Duration::from_secs(60))
            .times(1)
            .returning(move |_, _| {
                Ok(Confirmation {
                    tx_hash,
                    block_number: 4_321,
                })
            });

        let submitter = submitter(chain);
        let result = submitter
            .try_settle(Uuid::new_v4(), AgreementBatch::from_range(0, 50))
            .await;

        match result {
            CycleResult::Settled(SubmissionOutcome::Confirmed {
                tx_hash: reported,
                block_number,
            }) => {
                assert_eq!(reported, format!("{:?}", tx_hash));
                assert_eq!(block_number, 4_321);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let summary = submitter.last_cycle().await.unwrap();
        assert_eq!(summary.batch_size, 51);
        assert_eq!(summary.disposition, "confirmed");
    }

    #[tokio::test]
    async fn test_broadcast_rejection_is_not_retried() {
        let mut chain = MockSettlementChain::new();
        chain
            .expect_simulate_batch()
            .returning(|_| Ok(Bytes::default()));
        chain
            .expect_estimate_batch_gas()
            .returning(|_| Ok(U256::from(100_000)));
        chain.expect_broadcast().times(1).returning(|_, _| {
            Err(SettlerError::BroadcastRejected {
                reason: "insufficient funds for gas * price + value".to_string(),
            })
        });
        chain.expect_await_confirmation().never();

        let submitter = submitter(chain);
        let result = submitter
            .try_settle(Uuid::new_v4(), AgreementBatch::new(vec![1, 2]))
            .await;

        match result {
            CycleResult::Settled(SubmissionOutcome::Rejected { stage, .. }) => {
                assert_eq!(stage, Stage::Broadcast);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_and_revert_classified_differently() {
        let tx_hash = H256::from_low_u64_be(0xdef);

        let run = |confirmation: SettlerResult<Confirmation>| async move {
            let mut chain = MockSettlementChain::new();
            chain
                .expect_simulate_batch()
                .returning(|_| Ok(Bytes::default()));
            chain
                .expect_estimate_batch_gas()
                .returning(|_| Ok(U256::from(100_000)));
            chain
                .expect_broadcast()
                .returning(move |_, _| Ok(tx_hash));
            let mut confirmation = Some(confirmation);
            chain
                .expect_await_confirmation()
                .times(1)
                .returning(move |_, _| confirmation.take().unwrap());

            let submitter = submitter(chain);
            submitter
                .try_settle(Uuid::new_v4(), AgreementBatch::new(vec![7]))
                .await
        };

        let timed_out = run(Err(SettlerError::ConfirmationTimeout {
            tx_hash: format!("{:?}", tx_hash),
            waited_secs: 60,
        }))
        .await;
        match timed_out {
            CycleResult::Settled(SubmissionOutcome::TransientFailure { stage, .. }) => {
                assert_eq!(stage, Stage::Confirmation);
            }
            other => panic!("timeout misclassified: {:?}", other),
        }

        let reverted = run(Err(SettlerError::TransactionReverted {
            tx_hash: format!("{:?}", tx_hash),
            block_number: 99,
        }))
        .await;
        match reverted {
            CycleResult::Settled(SubmissionOutcome::Rejected { stage, .. }) => {
                assert_eq!(stage, Stage::Confirmation);
            }
            other => panic!("revert misclassified: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_fee_policy_refused_at_startup() {
        let policy = FeePolicy {
            gas_limit_margin: U256::from(100_000),
            max_priority_fee_per_gas: U256::from(60_000_000_000u64),
            max_fee_per_gas: U256::from(30_000_000_000u64),
        };
        let err = BatchSubmitter::new(
            Arc::new(MockSettlementChain::new()),
            policy,
            Duration::from_secs(60),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SettlerError::InvalidFeePolicy(_)));
    }

    /// Fake chain whose broadcast parks until virtual time advances, so a
    /// second cycle can be attempted while the first holds the run lock.
    struct SlowChain {
        broadcasts: AtomicUsize,
    }

    #[async_trait]
    impl SettlementChain for SlowChain {
        async fn verify_connectivity(&self) -> SettlerResult<crate::chain::NetworkIdentity> {
            Ok(crate::chain::NetworkIdentity {
                chain_id: 80002,
                name: "test".to_string(),
            })
        }

        async fn simulate_batch(&self, _batch: &AgreementBatch) -> SettlerResult<Bytes> {
            Ok(Bytes::default())
        }

        async fn estimate_batch_gas(&self, _batch: &AgreementBatch) -> SettlerResult<U256> {
            Ok(U256::from(100_000))
        }

        async fn broadcast(
            &self,
            _batch: &AgreementBatch,
            _quote: FeeQuote,
        ) -> SettlerResult<H256> {
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(H256::from_low_u64_be(1))
        }

        async fn await_confirmation(
            &self,
            tx_hash: H256,
            _timeout: Duration,
        ) -> SettlerResult<Confirmation> {
            Ok(Confirmation {
                tx_hash,
                block_number: 1,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycle_is_refused() {
        let chain = Arc::new(SlowChain {
            broadcasts: AtomicUsize::new(0),
        });
        let submitter = Arc::new(
            BatchSubmitter::new(chain.clone(), FeePolicy::default(), Duration::from_secs(60))
                .unwrap(),
        );

        let first = tokio::spawn({
            let submitter = submitter.clone();
            async move {
                submitter
                    .try_settle(Uuid::new_v4(), AgreementBatch::new(vec![1]))
                    .await
            }
        });

        // Let the first cycle reach its in-flight broadcast.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(submitter.is_running());

        let second = submitter
            .try_settle(Uuid::new_v4(), AgreementBatch::new(vec![1]))
            .await;
        assert_eq!(second, CycleResult::AlreadyRunning);

        let first = first.await.unwrap();
        assert!(matches!(
            first,
            CycleResult::Settled(SubmissionOutcome::Confirmed { .. })
        ));
        assert_eq!(chain.broadcasts.load(Ordering::SeqCst), 1);
        assert!(!submitter.is_running());
    }

    #[tokio::test]
    async fn test_status_poll_never_displaces_a_cycle() {
        let mut chain = MockSettlementChain::new();
        chain
            .expect_simulate_batch()
            .returning(|_| Ok(Bytes::default()));
        chain
            .expect_estimate_batch_gas()
            .returning(|_| Ok(U256::from(100_000)));
        chain
            .expect_broadcast()
            .returning(|_, _| Ok(H256::from_low_u64_be(9)));
        chain.expect_await_confirmation().returning(|hash, _| {
            Ok(Confirmation {
                tx_hash: hash,
                block_number: 2,
            })
        });

        let submitter = Arc::new(submitter(chain));

        // Hammer the in-flight question from another thread while cycles run
        // back to back. Observing must stay read-only; an observer that
        // touched the run lock could make a cycle report AlreadyRunning.
        let stop = Arc::new(AtomicBool::new(false));
        let observer = {
            let submitter = submitter.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    submitter.is_running();
                }
            })
        };

        for _ in 0..500 {
            let result = submitter
                .try_settle(Uuid::new_v4(), AgreementBatch::new(vec![3]))
                .await;
            assert!(
                matches!(
                    result,
                    CycleResult::Settled(SubmissionOutcome::Confirmed { .. })
                ),
                "status poll displaced a scheduled cycle: {:?}",
                result
            );
        }

        stop.store(true, Ordering::SeqCst);
        observer.join().unwrap();
    }
}
