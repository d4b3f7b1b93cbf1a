//! Per-sequence aggregate counters, always derived from enrollment rows.

use campaign_core::CampaignResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::EnrollmentStore;
use crate::types::{Enrollment, EnrollmentStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceStats {
    pub sequence_id: Uuid,
    pub total_enrolled: u64,
    pub active: u64,
    pub completed: u64,
    pub exited: u64,
    pub messages_delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    /// Completed share of all enrollments, 0.0 when there are none.
    pub completion_rate: f64,
}

impl SequenceStats {
    pub fn from_enrollments(sequence_id: Uuid, enrollments: &[Enrollment]) -> Self {
        let mut stats = SequenceStats {
            sequence_id,
            ..SequenceStats::default()
        };

        for enrollment in enrollments.iter().filter(|e| e.sequence_id == sequence_id) {
            stats.total_enrolled += 1;
            match enrollment.status {
                EnrollmentStatus::Active => stats.active += 1,
                EnrollmentStatus::Completed => stats.completed += 1,
                EnrollmentStatus::Exited => stats.exited += 1,
            }
            stats.messages_delivered += u64::from(enrollment.messages_delivered);
            stats.opened += u64::from(enrollment.opened);
            stats.clicked += u64::from(enrollment.clicked);
        }

        stats.completion_rate = if stats.total_enrolled > 0 {
            stats.completed as f64 / stats.total_enrolled as f64
        } else {
            0.0
        };
        stats
    }

    pub async fn load(store: &dyn EnrollmentStore, sequence_id: Uuid) -> CampaignResult<Self> {
        let enrollments = store.list_for_sequence(&sequence_id).await?;
        Ok(Self::from_enrollments(sequence_id, &enrollments))
    }
}
