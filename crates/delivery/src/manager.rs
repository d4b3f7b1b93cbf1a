//! Delivery retry manager: periodic pass over failed delivery records.
//!
//! Knows nothing about sequences or steps: it only redelivers a rendered
//! payload to an address until the provider accepts it, the provider reports
//! a permanent failure, or the attempt cap is reached.

use std::sync::Arc;
use std::time::Duration;

use campaign_core::event_bus::{noop_sink, EventSink};
use campaign_core::types::{AnalyticsEvent, EventType};
use campaign_core::CampaignResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::provider::{send_with_timeout, DeliveryProvider, ProviderError};
use crate::retry::RetryPolicy;
use crate::store::DeliveryAttemptStore;
use crate::types::{DeliveryAttempt, StepRef};

/// Outcome counts of one `retry_due` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    /// Records claimed and redelivered (successfully or not).
    pub processed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Claimed by a concurrent pass first.
    pub contended: usize,
    pub errors: usize,
}

pub struct DeliveryRetryManager {
    store: Arc<dyn DeliveryAttemptStore>,
    provider: Arc<dyn DeliveryProvider>,
    policy: RetryPolicy,
    provider_timeout: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for DeliveryRetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRetryManager")
            .field("policy", &self.policy)
            .field("provider_timeout", &self.provider_timeout)
            .finish()
    }
}

impl DeliveryRetryManager {
    pub fn new(
        store: Arc<dyn DeliveryAttemptStore>,
        provider: Arc<dyn DeliveryProvider>,
        policy: RetryPolicy,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            policy,
            provider_timeout,
            event_sink: noop_sink(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The redelivery record for a sequence step, if its first send failed.
    pub async fn attempt_for(&self, origin: &StepRef) -> CampaignResult<Option<DeliveryAttempt>> {
        self.store.find_by_origin(origin).await
    }

    /// Records a message whose first transmission failed. Permanent failures
    /// (and a cap of one attempt) are stored terminal straight away.
    pub async fn enqueue_failure(
        &self,
        address: &str,
        subject: &str,
        body: &str,
        origin: Option<StepRef>,
        failure: &ProviderError,
        now: DateTime<Utc>,
    ) -> CampaignResult<DeliveryAttempt> {
        let mut attempt =
            DeliveryAttempt::failed(address, subject, body, origin, failure.to_string(), now);

        if failure.is_permanent() || self.policy.is_exhausted(attempt.attempt_count) {
            attempt.mark_terminal(failure.to_string(), now);
            metrics::counter!("delivery.permanent_failures").increment(1);
            warn!(
                attempt_id = %attempt.id,
                address = %address,
                error = %failure,
                "Delivery failed permanently, not scheduling retries"
            );
        } else {
            let retry_after = now + self.policy.backoff_for_attempt(attempt.attempt_count);
            attempt.mark_retry(failure.to_string(), retry_after, now);
            debug!(
                attempt_id = %attempt.id,
                retry_after = %retry_after,
                "Delivery failure queued for retry"
            );
        }

        self.store.insert(attempt.clone()).await?;
        self.emit(EventType::DeliveryFailed, &attempt);
        Ok(attempt)
    }

    /// Redelivers every retryable record due at `now`, up to `limit`.
    /// Failures of one record never abort the pass.
    pub async fn retry_due(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<RetryReport> {
        let candidates = self
            .store
            .select_retryable(now, self.policy.max_attempts, limit)
            .await?;

        let mut report = RetryReport::default();
        for candidate in candidates {
            match self.retry_one(candidate, now, &mut report).await {
                Ok(()) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(error = %e, "Delivery retry failed for one record, continuing");
                }
            }
        }

        if report.processed > 0 || report.contended > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                exhausted = report.exhausted,
                contended = report.contended,
                "Delivery retry pass finished"
            );
        }
        Ok(report)
    }

    async fn retry_one(
        &self,
        candidate: DeliveryAttempt,
        now: DateTime<Utc>,
        report: &mut RetryReport,
    ) -> CampaignResult<()> {
        let next_retry_after = now + self.policy.backoff_for_attempt(candidate.attempt_count + 1);
        let Some(mut attempt) = self
            .store
            .claim(&candidate.id, candidate.attempt_count, next_retry_after)
            .await?
        else {
            report.contended += 1;
            debug!(attempt_id = %candidate.id, "Delivery attempt already claimed");
            return Ok(());
        };

        report.processed += 1;
        metrics::counter!("delivery.retries_attempted").increment(1);

        let result = send_with_timeout(
            self.provider.as_ref(),
            self.provider_timeout,
            &attempt.address,
            &attempt.subject,
            &attempt.body,
        )
        .await;

        match result {
            Ok(delivery_id) => {
                attempt.mark_sent(delivery_id.0, now);
                report.succeeded += 1;
                metrics::counter!("delivery.retries_succeeded").increment(1);
                info!(
                    attempt_id = %attempt.id,
                    attempts = attempt.attempt_count,
                    "Delivery retry succeeded"
                );
                self.emit(EventType::DeliveryRetrySucceeded, &attempt);
            }
            Err(failure) if failure.is_permanent() || self.policy.is_exhausted(attempt.attempt_count) => {
                attempt.mark_terminal(failure.to_string(), now);
                report.exhausted += 1;
                metrics::counter!("delivery.retries_exhausted").increment(1);
                error!(
                    attempt_id = %attempt.id,
                    address = %attempt.address,
                    attempts = attempt.attempt_count,
                    error = %failure,
                    "Delivery retries exhausted, giving up"
                );
                self.emit(EventType::DeliveryRetryExhausted, &attempt);
            }
            Err(failure) => {
                attempt.mark_retry(failure.to_string(), next_retry_after, now);
                report.rescheduled += 1;
                debug!(
                    attempt_id = %attempt.id,
                    attempts = attempt.attempt_count,
                    retry_after = %next_retry_after,
                    "Delivery retry failed, rescheduled"
                );
            }
        }

        if !self.store.complete(&attempt).await? {
            warn!(attempt_id = %attempt.id, "Delivery attempt changed underneath retry, result dropped");
        }
        Ok(())
    }

    fn emit(&self, event_type: EventType, attempt: &DeliveryAttempt) {
        let mut event = AnalyticsEvent::new(event_type, attempt.id.to_string())
            .with_detail(attempt.last_error.clone());
        if let Some(origin) = &attempt.origin {
            event = event.in_sequence(origin.sequence_id, Some(origin.step_index));
        }
        self.event_sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DeliveryId;
    use crate::store::InMemoryAttemptStore;
    use crate::types::AttemptStatus;
    use async_trait::async_trait;
    use campaign_core::event_bus::capture_sink;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a scripted list of results, then succeeds.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<DeliveryId, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(mut script: Vec<Result<DeliveryId, ProviderError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeliveryProvider for ScriptedProvider {
        async fn send(&self, _: &str, _: &str, _: &str) -> Result<DeliveryId, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(DeliveryId("ok".into())))
        }
    }

    fn transient() -> Result<DeliveryId, ProviderError> {
        Err(ProviderError::Transient("503".into()))
    }

    fn manager(
        store: &InMemoryAttemptStore,
        provider: Arc<ScriptedProvider>,
        max_attempts: u32,
    ) -> DeliveryRetryManager {
        DeliveryRetryManager::new(
            Arc::new(store.clone()),
            provider,
            RetryPolicy {
                max_attempts,
                base_backoff_secs: 60,
                max_backoff_secs: 3600,
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_enqueue_schedules_backoff() {
        let store = InMemoryAttemptStore::new();
        let mgr = manager(&store, Arc::new(ScriptedProvider::new(vec![])), 5);
        let now = Utc::now();

        let attempt = mgr
            .enqueue_failure("r@example.com", "S", "B", None, &ProviderError::Transient("503".into()), now)
            .await
            .unwrap();
        assert_eq!(attempt.retry_after, Some(now + ChronoDuration::seconds(120)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal_on_enqueue() {
        let store = InMemoryAttemptStore::new();
        let mgr = manager(&store, Arc::new(ScriptedProvider::new(vec![])), 5);
        let now = Utc::now();

        let attempt = mgr
            .enqueue_failure("bounced@example.com", "S", "B", None, &ProviderError::Permanent("hard bounce".into()), now)
            .await
            .unwrap();
        assert!(attempt.is_terminal());
        let report = mgr.retry_due(now + ChronoDuration::days(1), 10).await.unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_retry_success_marks_sent() {
        let store = InMemoryAttemptStore::new();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let sink = capture_sink();
        let mgr = manager(&store, provider.clone(), 5).with_event_sink(sink.clone());
        let now = Utc::now();

        let attempt = mgr
            .enqueue_failure("r@example.com", "S", "B", None, &ProviderError::Timeout(Duration::from_secs(5)), now)
            .await
            .unwrap();

        // Not due yet.
        assert_eq!(mgr.retry_due(now, 10).await.unwrap().processed, 0);

        let report = mgr.retry_due(now + ChronoDuration::minutes(2), 10).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);

        let stored = store.get(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Sent);
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.retry_after.is_none());
        assert_eq!(sink.count_type(EventType::DeliveryRetrySucceeded), 1);
    }

    #[tokio::test]
    async fn test_cap_makes_record_terminal() {
        let store = InMemoryAttemptStore::new();
        let provider = Arc::new(ScriptedProvider::new(vec![
            transient(),
            transient(),
            transient(),
            transient(),
            transient(),
        ]));
        let sink = capture_sink();
        let mgr = manager(&store, provider.clone(), 3).with_event_sink(sink.clone());
        let start = Utc::now();

        let attempt = mgr
            .enqueue_failure("r@example.com", "S", "B", None, &ProviderError::Transient("503".into()), start)
            .await
            .unwrap();

        let mut now = start;
        for _ in 0..10 {
            now += ChronoDuration::hours(2);
            mgr.retry_due(now, 10).await.unwrap();
        }

        let stored = store.get(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(stored.status, AttemptStatus::Failed);
        assert!(stored.is_terminal());
        // First transmission happened elsewhere; two redeliveries here.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.count_type(EventType::DeliveryRetryExhausted), 1);

        let report = mgr.retry_due(now + ChronoDuration::days(30), 10).await.unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_during_retry_short_circuits() {
        let store = InMemoryAttemptStore::new();
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Permanent(
            "mailbox does not exist".into(),
        ))]));
        let mgr = manager(&store, provider.clone(), 5);
        let now = Utc::now();

        let attempt = mgr
            .enqueue_failure("r@example.com", "S", "B", None, &ProviderError::Transient("503".into()), now)
            .await
            .unwrap();
        let report = mgr.retry_due(now + ChronoDuration::hours(1), 10).await.unwrap();
        assert_eq!(report.exhausted, 1);

        let stored = store.get(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.is_terminal());
    }
}
