//! Periodic scheduler entry point.
//!
//! `tick` is safe to call from overlapping runners: selection is read-only
//! and every enrollment is claimed before it is worked on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use campaign_core::config::{DeliveryRetryConfig, SequenceConfig};
use campaign_core::CampaignResult;
use campaign_delivery::{DeliveryRetryManager, RetryReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::advancer::{AdvanceOutcome, StepAdvancer};
use crate::store::EnrollmentStore;
use crate::types::Enrollment;

/// Outcome counts of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub selected: usize,
    pub sent: usize,
    pub skipped: usize,
    pub exited: usize,
    pub completed: usize,
    pub deferred: usize,
    pub contended: usize,
    pub errors: usize,
    pub retries: RetryReport,
}

impl TickReport {
    fn record(&mut self, outcome: &AdvanceOutcome) {
        match outcome {
            AdvanceOutcome::Sent => self.sent += 1,
            AdvanceOutcome::SkippedToNext => self.skipped += 1,
            AdvanceOutcome::Exited => self.exited += 1,
            AdvanceOutcome::Completed => self.completed += 1,
            AdvanceOutcome::DeferredRetry => self.deferred += 1,
            AdvanceOutcome::Contended => self.contended += 1,
        }
    }
}

#[derive(Clone)]
pub struct SequenceScheduler {
    enrollments: Arc<dyn EnrollmentStore>,
    advancer: Arc<StepAdvancer>,
    retries: Arc<DeliveryRetryManager>,
    config: SequenceConfig,
    retry_batch_limit: usize,
}

impl SequenceScheduler {
    pub fn new(
        enrollments: Arc<dyn EnrollmentStore>,
        advancer: Arc<StepAdvancer>,
        retries: Arc<DeliveryRetryManager>,
        config: SequenceConfig,
        retry_config: &DeliveryRetryConfig,
    ) -> Self {
        Self {
            enrollments,
            advancer,
            retries,
            config,
            retry_batch_limit: retry_config.batch_limit,
        }
    }

    /// Due-item selection: active enrollments due at `now`, oldest first.
    pub async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<Vec<Enrollment>> {
        self.enrollments.select_due(now, limit).await
    }

    /// Advances every due enrollment (bounded by the batch limit) and then
    /// runs the delivery retry pass. Per-item failures are counted, never
    /// propagated.
    pub async fn tick(&self, now: DateTime<Utc>) -> CampaignResult<TickReport> {
        let candidates = self.select_due(now, self.config.batch_limit).await?;
        let mut report = TickReport {
            selected: candidates.len(),
            ..TickReport::default()
        };

        let permits = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let mut workers = JoinSet::new();
        for candidate in candidates {
            let advancer = self.advancer.clone();
            let permits = permits.clone();
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = advancer.advance(&candidate, now).await;
                (candidate.id, result)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(&outcome),
                Ok((enrollment_id, Err(e))) => {
                    report.errors += 1;
                    warn!(enrollment_id = %enrollment_id, error = %e, "Advancing enrollment failed");
                }
                Err(join_err) => {
                    report.errors += 1;
                    error!(error = %join_err, "Advance task aborted");
                }
            }
        }

        match self.retries.retry_due(now, self.retry_batch_limit).await {
            Ok(retries) => report.retries = retries,
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, "Delivery retry pass failed");
            }
        }

        if report.selected > 0 || report.retries.processed > 0 {
            info!(
                selected = report.selected,
                sent = report.sent,
                skipped = report.skipped,
                exited = report.exited,
                completed = report.completed,
                deferred = report.deferred,
                contended = report.contended,
                errors = report.errors,
                retried = report.retries.processed,
                "Scheduler tick finished"
            );
        }
        Ok(report)
    }

    /// Ticks every `tick_interval_secs` until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        tokio::pin!(shutdown);
        info!(interval_secs = self.config.tick_interval_secs, "Sequence scheduler running");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Sequence scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
    }
}
