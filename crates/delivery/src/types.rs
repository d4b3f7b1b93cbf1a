use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a single redelivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Failed,
    Sent,
}

/// The sequence step a delivery attempt was rendered for. The retry loop
/// ignores it; the step advancer looks attempts up by it so a step handed to
/// the retry loop is never sent a second time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub sequence_id: Uuid,
    pub enrollment_id: Uuid,
    pub step_index: usize,
}

/// A rendered message awaiting redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub address: String,
    pub subject: String,
    pub body: String,
    pub status: AttemptStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// `None` once the record is terminal (sent or given up on).
    pub retry_after: Option<DateTime<Utc>>,
    pub origin: Option<StepRef>,
    pub delivery_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Record for a message whose first transmission already failed.
    pub fn failed(
        address: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        origin: Option<StepRef>,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            subject: subject.into(),
            body: body.into(),
            status: AttemptStatus::Failed,
            attempt_count: 1,
            last_error: Some(error.into()),
            retry_after: None,
            origin,
            delivery_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A failed record that will never be selected for retry again.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            AttemptStatus::Sent => true,
            AttemptStatus::Failed => self.retry_after.is_none(),
            AttemptStatus::Pending => false,
        }
    }

    pub fn is_retryable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.status == AttemptStatus::Failed
            && self.attempt_count < max_attempts
            && self.retry_after.is_some_and(|at| at <= now)
    }

    pub fn mark_sent(&mut self, delivery_id: String, now: DateTime<Utc>) {
        self.status = AttemptStatus::Sent;
        self.delivery_id = Some(delivery_id);
        self.last_error = None;
        self.retry_after = None;
        self.updated_at = now;
    }

    pub fn mark_terminal(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = AttemptStatus::Failed;
        self.last_error = Some(error.into());
        self.retry_after = None;
        self.updated_at = now;
    }

    pub fn mark_retry(&mut self, error: impl Into<String>, retry_after: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = AttemptStatus::Failed;
        self.last_error = Some(error.into());
        self.retry_after = Some(retry_after);
        self.updated_at = now;
    }
}
