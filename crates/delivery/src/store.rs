use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::CampaignResult;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::types::{AttemptStatus, DeliveryAttempt, StepRef};

/// Persistence for delivery attempts. Every mutating call is a single
/// conditional update keyed on the record's `attempt_count`.
#[async_trait]
pub trait DeliveryAttemptStore: Send + Sync {
    async fn insert(&self, attempt: DeliveryAttempt) -> CampaignResult<()>;

    async fn get(&self, id: &Uuid) -> CampaignResult<Option<DeliveryAttempt>>;

    /// The attempt recorded for a sequence step. A `Sent` record wins over
    /// failed ones; otherwise the most recent record is returned.
    async fn find_by_origin(&self, origin: &StepRef) -> CampaignResult<Option<DeliveryAttempt>>;

    /// FAILED records with `retry_after <= now` and fewer than
    /// `max_attempts` attempts, earliest first.
    async fn select_retryable(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> CampaignResult<Vec<DeliveryAttempt>>;

    /// Reserves a record for redelivery: increments `attempt_count` and moves
    /// `retry_after` to `next_retry_after`, but only if the record is still
    /// retryable with `expected_attempts` attempts. Returns the claimed record.
    async fn claim(
        &self,
        id: &Uuid,
        expected_attempts: u32,
        next_retry_after: DateTime<Utc>,
    ) -> CampaignResult<Option<DeliveryAttempt>>;

    /// Writes back a claimed record. Returns `false` if someone else has
    /// claimed it since.
    async fn complete(&self, attempt: &DeliveryAttempt) -> CampaignResult<bool>;
}

#[derive(Clone, Default)]
pub struct InMemoryAttemptStore {
    attempts: Arc<DashMap<Uuid, DeliveryAttempt>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<DeliveryAttempt> {
        self.attempts.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[async_trait]
impl DeliveryAttemptStore for InMemoryAttemptStore {
    async fn insert(&self, attempt: DeliveryAttempt) -> CampaignResult<()> {
        self.attempts.insert(attempt.id, attempt);
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> CampaignResult<Option<DeliveryAttempt>> {
        Ok(self.attempts.get(id).map(|r| r.clone()))
    }

    async fn find_by_origin(&self, origin: &StepRef) -> CampaignResult<Option<DeliveryAttempt>> {
        Ok(self
            .attempts
            .iter()
            .filter(|r| r.value().origin.as_ref() == Some(origin))
            .map(|r| r.value().clone())
            .max_by_key(|a| (a.status == AttemptStatus::Sent, a.created_at)))
    }

    async fn select_retryable(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> CampaignResult<Vec<DeliveryAttempt>> {
        let mut due: Vec<DeliveryAttempt> = self
            .attempts
            .iter()
            .filter(|r| r.value().is_retryable(now, max_attempts))
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|a| a.retry_after);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(
        &self,
        id: &Uuid,
        expected_attempts: u32,
        next_retry_after: DateTime<Utc>,
    ) -> CampaignResult<Option<DeliveryAttempt>> {
        let Some(mut entry) = self.attempts.get_mut(id) else {
            return Ok(None);
        };
        if entry.status != AttemptStatus::Failed
            || entry.retry_after.is_none()
            || entry.attempt_count != expected_attempts
        {
            return Ok(None);
        }
        entry.attempt_count += 1;
        entry.retry_after = Some(next_retry_after);
        Ok(Some(entry.clone()))
    }

    async fn complete(&self, attempt: &DeliveryAttempt) -> CampaignResult<bool> {
        let Some(mut entry) = self.attempts.get_mut(&attempt.id) else {
            return Ok(false);
        };
        if entry.attempt_count != attempt.attempt_count || entry.is_terminal() {
            return Ok(false);
        }
        *entry = attempt.clone();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scheduled(now: DateTime<Utc>, offset_mins: i64) -> DeliveryAttempt {
        let mut attempt =
            DeliveryAttempt::failed("r@example.com", "Subject", "Body", None, "503", now);
        attempt.mark_retry("503", now + Duration::minutes(offset_mins), now);
        attempt
    }

    #[tokio::test]
    async fn test_select_orders_and_limits() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let later = scheduled(now, -1);
        let earlier = scheduled(now, -10);
        let future = scheduled(now, 10);
        store.insert(later.clone()).await.unwrap();
        store.insert(earlier.clone()).await.unwrap();
        store.insert(future).await.unwrap();

        let due = store.select_retryable(now, 5, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, earlier.id);
        assert_eq!(due[1].id, later.id);

        let limited = store.select_retryable(now, 5, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_origin_prefers_sent() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let origin = StepRef {
            sequence_id: Uuid::new_v4(),
            enrollment_id: Uuid::new_v4(),
            step_index: 1,
        };
        let mut delivered =
            DeliveryAttempt::failed("r@example.com", "S", "B", Some(origin.clone()), "503", now);
        delivered.mark_sent("msg-1".into(), now);
        let newer = DeliveryAttempt::failed(
            "r@example.com",
            "S",
            "B",
            Some(origin.clone()),
            "503",
            now + Duration::minutes(1),
        );
        store.insert(delivered.clone()).await.unwrap();
        store.insert(newer).await.unwrap();
        store.insert(scheduled(now, -1)).await.unwrap();

        let found = store.find_by_origin(&origin).await.unwrap().unwrap();
        assert_eq!(found.id, delivered.id);

        let other = StepRef {
            step_index: 2,
            ..origin
        };
        assert!(store.find_by_origin(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let attempt = scheduled(now, -1);
        store.insert(attempt.clone()).await.unwrap();

        let next = now + Duration::minutes(4);
        let first = store.claim(&attempt.id, 1, next).await.unwrap();
        let second = store.claim(&attempt.id, 1, next).await.unwrap();

        let claimed = first.unwrap();
        assert_eq!(claimed.attempt_count, 2);
        assert_eq!(claimed.retry_after, Some(next));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_complete_rejects_stale_write() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let attempt = scheduled(now, -1);
        store.insert(attempt.clone()).await.unwrap();

        let mut claimed = store
            .claim(&attempt.id, 1, now + Duration::minutes(4))
            .await
            .unwrap()
            .unwrap();
        // Stale snapshot from before the claim.
        assert!(!store.complete(&attempt).await.unwrap());

        claimed.mark_sent("msg-1".into(), now);
        assert!(store.complete(&claimed).await.unwrap());
        assert_eq!(
            store.get(&attempt.id).await.unwrap().unwrap().status,
            AttemptStatus::Sent
        );
    }
}
