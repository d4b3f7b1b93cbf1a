//! Campaign definition and enrollment stores.
//!
//! The enrollment store is the only place enrollment state changes. Its
//! `claim` and `commit` are single conditional updates on `version`, so two
//! workers holding the same snapshot can never both proceed.

use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::types::{Engagement, Enrollment, EnrollmentStatus, Sequence, TriggerType};

#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn get(&self, id: &Uuid) -> CampaignResult<Option<Sequence>>;

    /// Active sequences for `trigger`, highest priority first.
    async fn active_for_trigger(&self, trigger: &TriggerType) -> CampaignResult<Vec<Sequence>>;

    /// Inserts or revises a sequence. Revisions must be append-only.
    async fn save(&self, sequence: Sequence) -> CampaignResult<()>;

    async fn list(&self) -> CampaignResult<Vec<Sequence>>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Inserts unless the (recipient, sequence) pair is already enrolled.
    /// Returns whether the enrollment was created.
    async fn insert_if_absent(&self, enrollment: Enrollment) -> CampaignResult<bool>;

    async fn get(&self, id: &Uuid) -> CampaignResult<Option<Enrollment>>;

    async fn find(&self, recipient_id: &str, sequence_id: &Uuid) -> CampaignResult<Option<Enrollment>>;

    /// Active enrollments with `next_due_at <= now`, oldest due first.
    /// Read-only; the same candidate may be returned to overlapping ticks.
    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<Vec<Enrollment>>;

    /// Reserves an enrollment for one worker: if it is still active at
    /// `expected_version`, moves `next_due_at` to `lease_until` and bumps the
    /// version. Returns the claimed record, or `None` if someone else won.
    async fn claim(
        &self,
        id: &Uuid,
        expected_version: u64,
        lease_until: DateTime<Utc>,
    ) -> CampaignResult<Option<Enrollment>>;

    /// Writes back a claimed enrollment if its version is unchanged since
    /// the claim. Rejects backward status moves and step index regressions.
    async fn commit(&self, enrollment: &Enrollment) -> CampaignResult<bool>;

    async fn record_engagement(&self, id: &Uuid, engagement: Engagement) -> CampaignResult<()>;

    async fn list_for_sequence(&self, sequence_id: &Uuid) -> CampaignResult<Vec<Enrollment>>;
}

// ─── In-memory Sequence Store ───────────────────────────────────────────

#[derive(Clone, Default)]
pub struct InMemorySequenceStore {
    sequences: Arc<DashMap<Uuid, Sequence>>,
}

impl InMemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceStore for InMemorySequenceStore {
    async fn get(&self, id: &Uuid) -> CampaignResult<Option<Sequence>> {
        Ok(self.sequences.get(id).map(|r| r.clone()))
    }

    async fn active_for_trigger(&self, trigger: &TriggerType) -> CampaignResult<Vec<Sequence>> {
        let mut matching: Vec<Sequence> = self
            .sequences
            .iter()
            .filter(|r| r.value().active && r.value().trigger == *trigger)
            .map(|r| r.value().clone())
            .collect();
        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(matching)
    }

    async fn save(&self, mut sequence: Sequence) -> CampaignResult<()> {
        sequence.validate().map_err(CampaignError::Validation)?;
        match self.sequences.entry(sequence.id) {
            Entry::Occupied(mut existing) => {
                existing
                    .get()
                    .validate_revision(&sequence)
                    .map_err(CampaignError::Validation)?;
                sequence.updated_at = Utc::now();
                info!(sequence_id = %sequence.id, slug = %sequence.slug, "Revising sequence");
                existing.insert(sequence);
            }
            Entry::Vacant(slot) => {
                info!(
                    sequence_id = %sequence.id,
                    slug = %sequence.slug,
                    steps = sequence.steps.len(),
                    "Creating sequence"
                );
                slot.insert(sequence);
            }
        }
        Ok(())
    }

    async fn list(&self) -> CampaignResult<Vec<Sequence>> {
        Ok(self.sequences.iter().map(|r| r.value().clone()).collect())
    }
}

// ─── In-memory Enrollment Store ─────────────────────────────────────────

#[derive(Clone, Default)]
pub struct InMemoryEnrollmentStore {
    enrollments: Arc<DashMap<Uuid, Enrollment>>,
    by_pair: Arc<DashMap<(String, Uuid), Uuid>>,
}

impl InMemoryEnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.enrollments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrollments.is_empty()
    }
}

#[async_trait]
impl EnrollmentStore for InMemoryEnrollmentStore {
    async fn insert_if_absent(&self, enrollment: Enrollment) -> CampaignResult<bool> {
        let key = (enrollment.recipient_id.clone(), enrollment.sequence_id);
        match self.by_pair.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let id = enrollment.id;
                self.enrollments.insert(id, enrollment);
                slot.insert(id);
                Ok(true)
            }
        }
    }

    async fn get(&self, id: &Uuid) -> CampaignResult<Option<Enrollment>> {
        Ok(self.enrollments.get(id).map(|r| r.clone()))
    }

    async fn find(&self, recipient_id: &str, sequence_id: &Uuid) -> CampaignResult<Option<Enrollment>> {
        let id = self
            .by_pair
            .get(&(recipient_id.to_string(), *sequence_id))
            .map(|r| *r.value());
        Ok(id.and_then(|id| self.enrollments.get(&id).map(|r| r.clone())))
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<Vec<Enrollment>> {
        let mut due: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().is_due(now))
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|e| e.next_due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(
        &self,
        id: &Uuid,
        expected_version: u64,
        lease_until: DateTime<Utc>,
    ) -> CampaignResult<Option<Enrollment>> {
        let Some(mut entry) = self.enrollments.get_mut(id) else {
            return Ok(None);
        };
        if entry.status != EnrollmentStatus::Active || entry.version != expected_version {
            return Ok(None);
        }
        entry.next_due_at = Some(lease_until);
        entry.version += 1;
        Ok(Some(entry.clone()))
    }

    async fn commit(&self, enrollment: &Enrollment) -> CampaignResult<bool> {
        let mut entry = self
            .enrollments
            .get_mut(&enrollment.id)
            .ok_or_else(|| CampaignError::NotFound(format!("enrollment {}", enrollment.id)))?;

        if entry.version != enrollment.version {
            return Ok(false);
        }
        if !entry.status.can_transition(enrollment.status) {
            return Err(CampaignError::Validation(format!(
                "enrollment {} cannot move from {:?} to {:?}",
                enrollment.id, entry.status, enrollment.status
            )));
        }
        if enrollment.current_step_index < entry.current_step_index {
            return Err(CampaignError::Validation(format!(
                "enrollment {} step index would regress from {} to {}",
                enrollment.id, entry.current_step_index, enrollment.current_step_index
            )));
        }
        if !enrollment.is_consistent() {
            return Err(CampaignError::Validation(format!(
                "enrollment {} is {:?} with next_due_at {:?}",
                enrollment.id, enrollment.status, enrollment.next_due_at
            )));
        }

        let mut updated = enrollment.clone();
        // Counters may have moved since the claim.
        updated.opened = entry.opened;
        updated.clicked = entry.clicked;
        updated.version += 1;
        *entry = updated;
        Ok(true)
    }

    async fn record_engagement(&self, id: &Uuid, engagement: Engagement) -> CampaignResult<()> {
        let mut entry = self
            .enrollments
            .get_mut(id)
            .ok_or_else(|| CampaignError::NotFound(format!("enrollment {id}")))?;
        match engagement {
            Engagement::Opened => entry.opened += 1,
            Engagement::Clicked => entry.clicked += 1,
        }
        Ok(())
    }

    async fn list_for_sequence(&self, sequence_id: &Uuid) -> CampaignResult<Vec<Enrollment>> {
        Ok(self
            .enrollments
            .iter()
            .filter(|r| r.value().sequence_id == *sequence_id)
            .map(|r| r.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Step};
    use chrono::Duration;

    fn enrollment(recipient: &str, sequence_id: Uuid, due: DateTime<Utc>) -> Enrollment {
        Enrollment::new(recipient, sequence_id, due - Duration::minutes(5), due)
    }

    #[tokio::test]
    async fn test_insert_if_absent_is_idempotent_per_pair() {
        let store = InMemoryEnrollmentStore::new();
        let sequence_id = Uuid::new_v4();
        let now = Utc::now();

        assert!(store.insert_if_absent(enrollment("r1", sequence_id, now)).await.unwrap());
        assert!(!store.insert_if_absent(enrollment("r1", sequence_id, now)).await.unwrap());
        assert!(store.insert_if_absent(enrollment("r2", sequence_id, now)).await.unwrap());
        assert!(store.insert_if_absent(enrollment("r1", Uuid::new_v4(), now)).await.unwrap());
        assert_eq!(store.len(), 3);
        assert!(store.find("r1", &sequence_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_select_due_orders_oldest_first_and_skips_inactive() {
        let store = InMemoryEnrollmentStore::new();
        let sequence_id = Uuid::new_v4();
        let now = Utc::now();

        let recent = enrollment("r1", sequence_id, now - Duration::minutes(1));
        let oldest = enrollment("r2", sequence_id, now - Duration::hours(1));
        let future = enrollment("r3", sequence_id, now + Duration::hours(1));
        let mut done = enrollment("r4", sequence_id, now - Duration::hours(2));
        done.complete(now);
        for e in [recent.clone(), oldest.clone(), future, done] {
            store.insert_if_absent(e).await.unwrap();
        }

        let due = store.select_due(now, 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![oldest.id, recent.id]);
        assert_eq!(store.select_due(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_wins_once() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let e = enrollment("r1", Uuid::new_v4(), now);
        store.insert_if_absent(e.clone()).await.unwrap();

        let lease = now + Duration::minutes(10);
        let first = store.claim(&e.id, e.version, lease).await.unwrap();
        let second = store.claim(&e.id, e.version, lease).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        // A claimed enrollment is no longer due until the lease runs out.
        assert!(store.select_due(now, 10).await.unwrap().is_empty());
        assert_eq!(store.select_due(lease, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_requires_claimed_version() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let e = enrollment("r1", Uuid::new_v4(), now);
        store.insert_if_absent(e.clone()).await.unwrap();

        let mut claimed = store
            .claim(&e.id, e.version, now + Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        claimed.current_step_index = 1;
        claimed.schedule(now + Duration::days(2));
        assert!(store.commit(&claimed).await.unwrap());
        // Second write with the same version is stale.
        assert!(!store.commit(&claimed).await.unwrap());

        let stored = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step_index, 1);
        assert_eq!(stored.version, claimed.version + 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_regression_and_backward_status() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let mut e = enrollment("r1", Uuid::new_v4(), now);
        e.current_step_index = 2;
        store.insert_if_absent(e.clone()).await.unwrap();

        let mut claimed = store.claim(&e.id, 0, now).await.unwrap().unwrap();
        claimed.current_step_index = 1;
        assert!(store.commit(&claimed).await.is_err());

        claimed.current_step_index = 2;
        claimed.exit(now, ExitReason::Replied);
        assert!(store.commit(&claimed).await.unwrap());

        let mut revived = store.get(&e.id).await.unwrap().unwrap();
        revived.status = EnrollmentStatus::Active;
        revived.schedule(now);
        assert!(store.commit(&revived).await.is_err());
        // Terminal enrollments can't be claimed either.
        assert!(store.claim(&e.id, revived.version, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_engagement_survives_commit() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let e = enrollment("r1", Uuid::new_v4(), now);
        store.insert_if_absent(e.clone()).await.unwrap();

        let mut claimed = store.claim(&e.id, 0, now).await.unwrap().unwrap();
        store.record_engagement(&e.id, Engagement::Opened).await.unwrap();
        store.record_engagement(&e.id, Engagement::Clicked).await.unwrap();
        claimed.schedule(now + Duration::hours(1));
        assert!(store.commit(&claimed).await.unwrap());

        let stored = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!((stored.opened, stored.clicked), (1, 1));
    }

    #[tokio::test]
    async fn test_sequence_store_rejects_dropped_steps() {
        let store = InMemorySequenceStore::new();
        let sequence = Sequence::new("Onboarding", TriggerType::Signup)
            .with_step(Step::new("a"))
            .with_step(Step::new("b"));
        store.save(sequence.clone()).await.unwrap();

        let mut shorter = sequence.clone();
        shorter.steps.pop();
        assert!(matches!(
            store.save(shorter).await,
            Err(CampaignError::Validation(_))
        ));

        let longer = sequence.clone().with_step(Step::new("c"));
        store.save(longer).await.unwrap();
        assert_eq!(store.get(&sequence.id).await.unwrap().unwrap().steps.len(), 3);
    }

    #[tokio::test]
    async fn test_active_for_trigger_filters_and_orders() {
        let store = InMemorySequenceStore::new();
        let low = Sequence::new("Low", TriggerType::Signup).with_priority(1);
        let high = Sequence::new("High", TriggerType::Signup).with_priority(5);
        let paused = Sequence::new("Paused", TriggerType::Signup).inactive();
        let other = Sequence::new("Other", TriggerType::Manual);
        for s in [low.clone(), high.clone(), paused, other] {
            store.save(s).await.unwrap();
        }

        let found = store.active_for_trigger(&TriggerType::Signup).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }
}
