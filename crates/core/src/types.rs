use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Analytics event emitted by the sequence engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    /// Id of the record the event is about (enrollment or delivery attempt).
    pub subject_id: String,
    pub recipient_id: Option<String>,
    pub sequence_id: Option<Uuid>,
    pub step_index: Option<usize>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Sequence events
    SequenceEnrolled,
    SequenceStepSent,
    SequenceStepSkipped,
    SequenceCompleted,
    SequenceExited,
    // Delivery events
    DeliveryFailed,
    DeliveryRetrySucceeded,
    DeliveryRetryExhausted,
}

impl AnalyticsEvent {
    pub fn new(event_type: EventType, subject_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            subject_id: subject_id.into(),
            recipient_id: None,
            sequence_id: None,
            step_index: None,
            detail: None,
            node_id: "local".into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn in_sequence(mut self, sequence_id: Uuid, step_index: Option<usize>) -> Self {
        self.sequence_id = Some(sequence_id);
        self.step_index = step_index;
        self
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}
