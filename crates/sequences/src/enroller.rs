//! Trigger and backfill enrollment.

use std::sync::Arc;

use campaign_core::event_bus::{noop_sink, EventSink};
use campaign_core::types::{AnalyticsEvent, EventType};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::recipients::{Recipient, RecipientDirectory, RecipientSignals};
use crate::schedule::Schedule;
use crate::store::{EnrollmentStore, SequenceStore};
use crate::types::{Enrollment, TriggerType};

/// Which recipients a backfill pass considers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RecipientSelector {
    All,
    HasTag { tag: String },
    Ids { ids: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub checked: usize,
    /// Recipients that gained at least one enrollment.
    pub enrolled: usize,
    /// Recipients already enrolled everywhere the trigger applies.
    pub skipped: usize,
    pub errors: usize,
}

pub struct TriggerEnroller {
    sequences: Arc<dyn SequenceStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    recipients: Arc<dyn RecipientDirectory>,
    signals: Arc<dyn RecipientSignals>,
    schedule: Schedule,
    event_sink: Arc<dyn EventSink>,
}

impl TriggerEnroller {
    pub fn new(
        sequences: Arc<dyn SequenceStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        recipients: Arc<dyn RecipientDirectory>,
        signals: Arc<dyn RecipientSignals>,
        schedule: Schedule,
    ) -> Self {
        Self {
            sequences,
            enrollments,
            recipients,
            signals,
            schedule,
            event_sink: noop_sink(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Enrolls the recipient into every active sequence listening for
    /// `trigger`. Re-firing a trigger never duplicates or resets an
    /// enrollment. Returns the number of new enrollments.
    pub async fn enroll(
        &self,
        recipient_id: &str,
        trigger: &TriggerType,
        now: DateTime<Utc>,
    ) -> CampaignResult<usize> {
        if self.recipients.find(recipient_id).await?.is_none() {
            return Err(CampaignError::NotFound(format!("recipient {recipient_id}")));
        }

        let sequences = self.sequences.active_for_trigger(trigger).await?;
        if sequences.is_empty() {
            debug!(recipient_id, ?trigger, "No active sequence for trigger");
            return Ok(0);
        }

        let mut created = 0;
        for sequence in sequences {
            if self.enrollments.find(recipient_id, &sequence.id).await?.is_some() {
                debug!(recipient_id, sequence_id = %sequence.id, "Already enrolled");
                continue;
            }

            let first_due = self.schedule.first_due(now, sequence.first_active_step())?;
            let enrollment = Enrollment::new(recipient_id, sequence.id, now, first_due);
            let enrollment_id = enrollment.id;
            // Lost a race with a concurrent trigger for the same pair.
            if !self.enrollments.insert_if_absent(enrollment).await? {
                continue;
            }

            created += 1;
            metrics::counter!("sequences.enrolled").increment(1);
            info!(
                enrollment_id = %enrollment_id,
                sequence_id = %sequence.id,
                sequence = %sequence.slug,
                recipient_id,
                first_due = %first_due,
                "Recipient enrolled in sequence"
            );
            self.event_sink.emit(
                AnalyticsEvent::new(EventType::SequenceEnrolled, enrollment_id.to_string())
                    .for_recipient(recipient_id)
                    .in_sequence(sequence.id, Some(0)),
            );
        }
        Ok(created)
    }

    /// Retroactively enrolls recipients who satisfied `trigger` in the past.
    /// Safe to re-run: enrollment is idempotent.
    pub async fn backfill(
        &self,
        trigger: &TriggerType,
        selector: &RecipientSelector,
        now: DateTime<Utc>,
    ) -> CampaignResult<BackfillReport> {
        let mut report = BackfillReport::default();

        for recipient_id in self.candidates(selector, &mut report).await? {
            report.checked += 1;
            match self.enroll(&recipient_id, trigger, now).await {
                Ok(0) => report.skipped += 1,
                Ok(_) => report.enrolled += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(recipient_id = %recipient_id, error = %e, "Backfill enrollment failed");
                }
            }
        }

        info!(
            ?trigger,
            checked = report.checked,
            enrolled = report.enrolled,
            skipped = report.skipped,
            errors = report.errors,
            "Backfill finished"
        );
        Ok(report)
    }

    async fn candidates(
        &self,
        selector: &RecipientSelector,
        report: &mut BackfillReport,
    ) -> CampaignResult<Vec<String>> {
        let ids = match selector {
            RecipientSelector::All => ids_of(self.recipients.list().await?),
            RecipientSelector::HasTag { tag } => {
                let mut tagged = Vec::new();
                for recipient in self.recipients.list().await? {
                    match self.signals.has_tag(&recipient.id, tag).await {
                        Ok(true) => tagged.push(recipient.id),
                        Ok(false) => {}
                        Err(e) => {
                            report.checked += 1;
                            report.errors += 1;
                            warn!(recipient_id = %recipient.id, error = %e, "Tag lookup failed");
                        }
                    }
                }
                tagged
            }
            RecipientSelector::Ids { ids } => ids.clone(),
        };
        Ok(ids)
    }
}

fn ids_of(recipients: Vec<Recipient>) -> Vec<String> {
    recipients.into_iter().map(|r| r.id).collect()
}
