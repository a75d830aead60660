//! Scheduled settlement trigger
//!
//! Turns the configured schedule into cycle invocations. Every failure is
//! caught at the cycle boundary: a failed cycle logs its outcome and the next
//! tick still fires. Overlap protection is skip-if-running; a tick that
//! arrives while a cycle holds the signing key is dropped, not queued.

use crate::config::{ScheduleConfig, ScheduleFrequency};
use crate::settle::source::AgreementSource;
use crate::settle::submitter::{BatchSubmitter, CycleResult, SubmissionOutcome};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct SettlementScheduler {
    config: ScheduleConfig,
    source: Arc<dyn AgreementSource>,
    submitter: Arc<BatchSubmitter>,
    shutdown: Arc<RwLock<bool>>,
}

impl SettlementScheduler {
    pub fn new(
        config: ScheduleConfig,
        source: Arc<dyn AgreementSource>,
        submitter: Arc<BatchSubmitter>,
    ) -> Self {
        Self {
            config,
            source,
            submitter,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main scheduling loop. Runs until `stop` is called.
    pub async fn run(&self) {
        match self.config.frequency {
            ScheduleFrequency::Daily => self.run_daily().await,
            ScheduleFrequency::Interval => self.run_interval().await,
        }
        info!("Settlement scheduler stopped");
    }

    async fn run_daily(&self) {
        loop {
            if *self.shutdown.read().await {
                break;
            }

            let next = next_daily_run(Utc::now(), self.config.hour, self.config.minute);
            info!(
                "Next settlement run scheduled for {} UTC",
                next.format("%Y-%m-%d %H:%M:%S")
            );
            wait_until(next).await;

            if *self.shutdown.read().await {
                break;
            }
            self.run_cycle().await;
        }
    }

    async fn run_interval(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        // One invocation per tick even when a cycle overruns its slot.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            self.run_cycle().await;
        }
    }

    /// One scheduled invocation. Never propagates an error: whatever happens
    /// inside a cycle is logged here and the next tick still fires.
    async fn run_cycle(&self) {
        let cycle_id = Uuid::new_v4();
        let as_of = Utc::now();
        crate::metrics::record_cycle_started();
        info!("Cycle {} started at {}", cycle_id, as_of.to_rfc3339());

        let batch = match self.source.fetch_due(as_of).await {
            Ok(batch) => batch,
            Err(e) => {
                error!("Cycle {}: identifier source failed: {}", cycle_id, e);
                crate::metrics::record_cycle_outcome("source_error");
                return;
            }
        };
        info!("Cycle {}: batch {}", cycle_id, batch.summary());

        match self.submitter.try_settle(cycle_id, batch).await {
            CycleResult::Settled(SubmissionOutcome::Confirmed {
                tx_hash,
                block_number,
            }) => {
                info!(
                    "Cycle {}: confirmed {} in block {}",
                    cycle_id, tx_hash, block_number
                );
                crate::metrics::record_cycle_outcome("confirmed");
            }
            CycleResult::Settled(SubmissionOutcome::TransientFailure { stage, reason }) => {
                // Retryable or indeterminate; the next tick re-simulates from
                // scratch rather than resuming this cycle.
                warn!(
                    "Cycle {}: transient failure at {}: {}",
                    cycle_id,
                    stage.as_str(),
                    reason
                );
                crate::metrics::record_cycle_outcome("transient_failure");
            }
            CycleResult::Settled(SubmissionOutcome::Rejected { stage, reason }) => {
                error!(
                    "Cycle {}: rejected at {}: {}",
                    cycle_id,
                    stage.as_str(),
                    reason
                );
                crate::metrics::record_cycle_outcome("rejected");
            }
            CycleResult::EmptyBatch => {
                info!("Cycle {}: no agreements due, skipping", cycle_id);
                crate::metrics::record_cycle_outcome("empty_batch");
            }
            CycleResult::AlreadyRunning => {
                warn!(
                    "Cycle {}: previous run still in flight, skipping this tick",
                    cycle_id
                );
                crate::metrics::record_cycle_outcome("skipped_overlap");
            }
        }
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Settlement scheduler shutdown initiated");
    }
}

/// Sleep until `deadline` on the wall clock, re-checking after each wake so
/// the caller never resumes before the slot. A cycle released even a fraction
/// of a second early would see the same slot from `next_daily_run` and fire
/// again.
async fn wait_until(deadline: DateTime<Utc>) {
    while let Ok(remaining) = deadline.signed_duration_since(Utc::now()).to_std() {
        tokio::time::sleep(remaining).await;
    }
}

/// Next daily tick at hour:minute UTC, rolling to tomorrow once today's slot
/// has passed.
fn next_daily_run(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    // hour and minute are validated at config load.
    let today = now.date_naive().and_hms_opt(hour, minute, 0).unwrap();
    let today = Utc.from_utc_datetime(&today);

    if today > now {
        today
    } else {
        let tomorrow = (now.date_naive() + ChronoDuration::days(1))
            .and_hms_opt(hour, minute, 0)
            .unwrap();
        Utc.from_utc_datetime(&tomorrow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockSettlementChain;
    use crate::error::{SettlerError, SettlerResult};
    use crate::settle::fee::FeePolicy;
    use crate::settle::source::{AgreementBatch, StaticSource};
    use async_trait::async_trait;

    #[test]
    fn test_next_daily_run_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let next = next_daily_run(now, 14, 30);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 14, 30, 0).unwrap());
    }

    #[test]
    fn test_next_daily_run_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        let passed = next_daily_run(now, 9, 0);
        assert_eq!(passed, Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap());

        // The exact slot counts as passed.
        let boundary = next_daily_run(now, 10, 0);
        assert_eq!(boundary, Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_next_daily_run_honors_minutes() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 5, 45, 0).unwrap();
        let next = next_daily_run(now, 5, 30);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 16, 5, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn test_wait_until_covers_the_subsecond_remainder() {
        // Whole-second truncation would release the loop before the slot and
        // the same tick would fire more than once. The wake must never land
        // short of the deadline, including for remainders under one second.
        let deadline = Utc::now() + ChronoDuration::milliseconds(1_300);
        wait_until(deadline).await;
        assert!(Utc::now() >= deadline);

        let short = Utc::now() + ChronoDuration::milliseconds(400);
        wait_until(short).await;
        assert!(Utc::now() >= short);
    }

    #[tokio::test]
    async fn test_wait_until_returns_for_a_passed_slot() {
        let started = std::time::Instant::now();
        wait_until(Utc::now() - ChronoDuration::seconds(30)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    fn scheduler_with(
        source: Arc<dyn AgreementSource>,
        chain: MockSettlementChain,
    ) -> SettlementScheduler {
        let submitter = Arc::new(
            BatchSubmitter::new(
                Arc::new(chain),
                FeePolicy::default(),
                Duration::from_secs(60),
            )
            .unwrap(),
        );
        let config = ScheduleConfig {
            frequency: ScheduleFrequency::Interval,
            hour: 0,
            minute: 0,
            interval_secs: 60,
        };
        SettlementScheduler::new(config, source, submitter)
    }

    struct FailingSource;

    #[async_trait]
    impl AgreementSource for FailingSource {
        async fn fetch_due(&self, _as_of: DateTime<Utc>) -> SettlerResult<AgreementBatch> {
            Err(SettlerError::NetworkUnreachable(
                "source backend down".to_string(),
            ))
        }

        fn describe(&self) -> String {
            "failing source".to_string()
        }
    }

    #[tokio::test]
    async fn test_source_failure_stays_inside_the_cycle() {
        // No chain expectations: the cycle must end before any chain call.
        let scheduler = scheduler_with(Arc::new(FailingSource), MockSettlementChain::new());
        scheduler.run_cycle().await;
    }

    #[tokio::test]
    async fn test_empty_batch_cycle_makes_no_chain_calls() {
        let scheduler = scheduler_with(
            Arc::new(StaticSource::new(vec![])),
            MockSettlementChain::new(),
        );
        scheduler.run_cycle().await;
    }
}
