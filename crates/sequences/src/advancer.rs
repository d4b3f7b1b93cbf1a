//! Step advancer: the per-enrollment state machine.
//!
//! Every advance runs claim → exit check → resolve step → skip check → send,
//! and writes the result back with a version-checked commit. Nothing external
//! happens before the claim succeeds. Lifecycle events are held until the
//! commit lands, so a lost lease publishes nothing.

use std::sync::Arc;

use campaign_core::config::SequenceConfig;
use campaign_core::event_bus::{noop_sink, EventSink};
use campaign_core::types::{AnalyticsEvent, EventType};
use campaign_core::{CampaignError, CampaignResult};
use campaign_delivery::provider::send_with_timeout;
use campaign_delivery::{AttemptStatus, DeliveryAttempt, DeliveryProvider, DeliveryRetryManager, StepRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conditions::{ConditionContext, ConditionEvaluator};
use crate::recipients::{Recipient, RecipientDirectory, RecipientSignals};
use crate::rendering::Renderer;
use crate::schedule::Schedule;
use crate::store::{EnrollmentStore, SequenceStore};
use crate::types::{Enrollment, ExitReason, Sequence};

/// What one `advance` call did to an enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// A step was delivered (the enrollment may now be completed).
    Sent,
    /// One or more steps were skipped and the next one scheduled.
    SkippedToNext,
    Exited,
    /// No step left to send.
    Completed,
    /// Send failed, the step is still with the retry loop, or the sequence
    /// is paused; retried later.
    DeferredRetry,
    /// Another worker claimed the enrollment first. Nothing was done.
    Contended,
}

/// External collaborators the advancer calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub recipients: Arc<dyn RecipientDirectory>,
    pub signals: Arc<dyn RecipientSignals>,
    pub renderer: Arc<dyn Renderer>,
    pub provider: Arc<dyn DeliveryProvider>,
}

/// Counters and events waiting on the commit.
#[derive(Default)]
struct Transitions {
    pending: Vec<(&'static str, EventType, Option<usize>, Option<String>)>,
}

impl Transitions {
    fn record(
        &mut self,
        counter: &'static str,
        event_type: EventType,
        step_index: Option<usize>,
        detail: Option<String>,
    ) {
        self.pending.push((counter, event_type, step_index, detail));
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

pub struct StepAdvancer {
    sequences: Arc<dyn SequenceStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    collaborators: Collaborators,
    evaluator: ConditionEvaluator,
    retries: Arc<DeliveryRetryManager>,
    schedule: Schedule,
    config: SequenceConfig,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StepAdvancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepAdvancer")
            .field("schedule", &self.schedule)
            .field("claim_lease_secs", &self.config.claim_lease_secs)
            .finish()
    }
}

impl StepAdvancer {
    pub fn new(
        sequences: Arc<dyn SequenceStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        collaborators: Collaborators,
        retries: Arc<DeliveryRetryManager>,
        config: SequenceConfig,
    ) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(collaborators.signals.clone()),
            schedule: Schedule::from_config(&config),
            sequences,
            enrollments,
            collaborators,
            retries,
            config,
            event_sink: noop_sink(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Advances one due enrollment. `candidate` is the snapshot returned by
    /// the due-item selection; a stale snapshot yields `Contended`.
    pub async fn advance(&self, candidate: &Enrollment, now: DateTime<Utc>) -> CampaignResult<AdvanceOutcome> {
        let lease_until = now + self.config.claim_lease();
        let Some(claimed) = self
            .enrollments
            .claim(&candidate.id, candidate.version, lease_until)
            .await?
        else {
            metrics::counter!("sequences.claim_contended").increment(1);
            debug!(enrollment_id = %candidate.id, "Enrollment already claimed, skipping");
            return Ok(AdvanceOutcome::Contended);
        };

        let mut enrollment = claimed.clone();
        let mut transitions = Transitions::default();
        match self.advance_claimed(&mut enrollment, now, &mut transitions).await {
            Ok(outcome) => {
                if self.enrollments.commit(&enrollment).await? {
                    self.publish(&enrollment, transitions);
                } else {
                    warn!(
                        enrollment_id = %enrollment.id,
                        ?outcome,
                        dropped_events = transitions.len(),
                        "Claim lease lost before commit, result dropped"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                // Hand the enrollment back untouched apart from a later due time.
                let mut released = claimed;
                released.schedule(self.schedule.adjust(now + self.config.send_retry_offset()));
                if let Err(release_err) = self.enrollments.commit(&released).await {
                    warn!(enrollment_id = %released.id, error = %release_err, "Failed to release claim");
                }
                Err(e)
            }
        }
    }

    async fn advance_claimed(
        &self,
        enrollment: &mut Enrollment,
        now: DateTime<Utc>,
        transitions: &mut Transitions,
    ) -> CampaignResult<AdvanceOutcome> {
        let sequence = self
            .sequences
            .get(&enrollment.sequence_id)
            .await?
            .ok_or_else(|| CampaignError::NotFound(format!("sequence {}", enrollment.sequence_id)))?;

        if !sequence.active {
            debug!(enrollment_id = %enrollment.id, sequence = %sequence.slug, "Sequence paused, deferring");
            enrollment.schedule(self.schedule.adjust(now + self.config.send_retry_offset()));
            return Ok(AdvanceOutcome::DeferredRetry);
        }

        let recipient = self
            .collaborators
            .recipients
            .find(&enrollment.recipient_id)
            .await?
            .ok_or_else(|| CampaignError::NotFound(format!("recipient {}", enrollment.recipient_id)))?;

        let ctx = ConditionContext {
            recipient_id: &recipient.id,
            sequence_id: sequence.id,
            since: enrollment.enrolled_at,
        };

        if let Some(reason) = self.evaluator.first_exit(&sequence.exit_conditions, &ctx).await? {
            return Ok(self.exit(enrollment, &sequence, reason, now, transitions));
        }

        let mut skipped = 0usize;
        loop {
            let Some(index) = sequence.next_active_index(enrollment.current_step_index) else {
                return Ok(self.complete(enrollment, &sequence, now, transitions));
            };
            enrollment.current_step_index = index;
            let step = &sequence.steps[index];

            if self.evaluator.should_skip(step, &ctx).await? {
                skipped += 1;
                enrollment.current_step_index = index + 1;
                transitions.record(
                    "sequences.steps_skipped",
                    EventType::SequenceStepSkipped,
                    Some(index),
                    Some(step.content_ref.clone()),
                );
                debug!(enrollment_id = %enrollment.id, step = index, "Step skipped");

                let Some(next) = sequence.next_active_index(index + 1) else {
                    return Ok(self.complete(enrollment, &sequence, now, transitions));
                };
                let due = self.schedule.due_after(now, &sequence.steps[next])?;
                if skipped >= self.config.max_consecutive_skips {
                    warn!(
                        enrollment_id = %enrollment.id,
                        sequence = %sequence.slug,
                        skipped,
                        "Too many consecutive skips, resuming next tick"
                    );
                    enrollment.schedule(due.max(now + self.schedule.grace()));
                    return Ok(AdvanceOutcome::SkippedToNext);
                }
                if due > now {
                    enrollment.schedule(due);
                    return Ok(AdvanceOutcome::SkippedToNext);
                }
                continue;
            }

            return self.send_step(enrollment, &sequence, &recipient, index, now, transitions).await;
        }
    }

    async fn send_step(
        &self,
        enrollment: &mut Enrollment,
        sequence: &Sequence,
        recipient: &Recipient,
        index: usize,
        now: DateTime<Utc>,
        transitions: &mut Transitions,
    ) -> CampaignResult<AdvanceOutcome> {
        let origin = StepRef {
            sequence_id: sequence.id,
            enrollment_id: enrollment.id,
            step_index: index,
        };
        if let Some(attempt) = self.retries.attempt_for(&origin).await? {
            return self.reconcile(enrollment, sequence, index, attempt, now, transitions);
        }

        let step = &sequence.steps[index];
        let message = self
            .collaborators
            .renderer
            .render(&step.content_ref, recipient)
            .await?;

        let result = send_with_timeout(
            self.collaborators.provider.as_ref(),
            self.config.provider_timeout(),
            &recipient.email,
            &message.subject,
            &message.body,
        )
        .await;

        match result {
            Ok(delivery_id) => {
                info!(
                    enrollment_id = %enrollment.id,
                    sequence = %sequence.slug,
                    recipient_id = %recipient.id,
                    step = index,
                    delivery_id = %delivery_id,
                    "Sequence step sent"
                );
                // The message is out whether or not the commit lands.
                metrics::counter!("sequences.steps_sent").increment(1);
                self.emit(EventType::SequenceStepSent, enrollment, Some(index), Some(delivery_id.0));
                self.mark_delivered(enrollment, sequence, index, now, now, transitions)
            }
            Err(failure) => {
                let attempt = self
                    .retries
                    .enqueue_failure(
                        &recipient.email,
                        &message.subject,
                        &message.body,
                        Some(origin),
                        &failure,
                        now,
                    )
                    .await?;
                if attempt.is_terminal() {
                    warn!(
                        enrollment_id = %enrollment.id,
                        sequence = %sequence.slug,
                        step = index,
                        error = %failure,
                        "Sequence step undeliverable"
                    );
                    return Ok(self.exit(enrollment, sequence, ExitReason::Undeliverable, now, transitions));
                }
                warn!(
                    enrollment_id = %enrollment.id,
                    sequence = %sequence.slug,
                    step = index,
                    error = %failure,
                    "Sequence step delivery failed, deferring"
                );
                metrics::counter!("sequences.deferred").increment(1);
                enrollment.schedule(self.schedule.adjust(now + self.config.send_retry_offset()));
                Ok(AdvanceOutcome::DeferredRetry)
            }
        }
    }

    /// Settles a step whose first send failed from its redelivery record
    /// instead of sending it again.
    fn reconcile(
        &self,
        enrollment: &mut Enrollment,
        sequence: &Sequence,
        index: usize,
        attempt: DeliveryAttempt,
        now: DateTime<Utc>,
        transitions: &mut Transitions,
    ) -> CampaignResult<AdvanceOutcome> {
        if attempt.status == AttemptStatus::Sent {
            debug!(
                enrollment_id = %enrollment.id,
                step = index,
                attempt_id = %attempt.id,
                "Step delivered by retry loop"
            );
            transitions.record(
                "sequences.steps_sent",
                EventType::SequenceStepSent,
                Some(index),
                attempt.delivery_id.clone(),
            );
            return self.mark_delivered(enrollment, sequence, index, attempt.updated_at, now, transitions);
        }
        if attempt.is_terminal() {
            warn!(
                enrollment_id = %enrollment.id,
                step = index,
                attempt_id = %attempt.id,
                error = attempt.last_error.as_deref().unwrap_or_default(),
                "Step redelivery gave up"
            );
            return Ok(self.exit(enrollment, sequence, ExitReason::Undeliverable, now, transitions));
        }
        debug!(
            enrollment_id = %enrollment.id,
            step = index,
            attempt_id = %attempt.id,
            "Step still awaiting redelivery"
        );
        enrollment.schedule(self.schedule.adjust(now + self.config.send_retry_offset()));
        Ok(AdvanceOutcome::DeferredRetry)
    }

    /// Moves past step `index`, delivered at `sent_at`, and schedules the next
    /// active step from that time.
    fn mark_delivered(
        &self,
        enrollment: &mut Enrollment,
        sequence: &Sequence,
        index: usize,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
        transitions: &mut Transitions,
    ) -> CampaignResult<AdvanceOutcome> {
        enrollment.messages_delivered += 1;
        enrollment.last_sent_at = Some(sent_at);
        enrollment.current_step_index = index + 1;

        match sequence.next_active_index(index + 1) {
            Some(next) => enrollment.schedule(self.schedule.due_after(sent_at, &sequence.steps[next])?),
            None => {
                self.complete(enrollment, sequence, now, transitions);
            }
        }
        Ok(AdvanceOutcome::Sent)
    }

    fn exit(
        &self,
        enrollment: &mut Enrollment,
        sequence: &Sequence,
        reason: ExitReason,
        now: DateTime<Utc>,
        transitions: &mut Transitions,
    ) -> AdvanceOutcome {
        info!(
            enrollment_id = %enrollment.id,
            sequence = %sequence.slug,
            recipient_id = %enrollment.recipient_id,
            reason = %reason,
            "Recipient exited sequence"
        );
        transitions.record("sequences.exited", EventType::SequenceExited, None, Some(reason.to_string()));
        enrollment.exit(now, reason);
        AdvanceOutcome::Exited
    }

    fn complete(
        &self,
        enrollment: &mut Enrollment,
        sequence: &Sequence,
        now: DateTime<Utc>,
        transitions: &mut Transitions,
    ) -> AdvanceOutcome {
        info!(
            enrollment_id = %enrollment.id,
            sequence = %sequence.slug,
            recipient_id = %enrollment.recipient_id,
            delivered = enrollment.messages_delivered,
            "Sequence completed"
        );
        transitions.record("sequences.completed", EventType::SequenceCompleted, None, None);
        enrollment.complete(now);
        AdvanceOutcome::Completed
    }

    fn publish(&self, enrollment: &Enrollment, transitions: Transitions) {
        for (counter, event_type, step_index, detail) in transitions.pending {
            metrics::counter!(counter).increment(1);
            self.emit(event_type, enrollment, step_index, detail);
        }
    }

    fn emit(
        &self,
        event_type: EventType,
        enrollment: &Enrollment,
        step_index: Option<usize>,
        detail: Option<String>,
    ) {
        self.event_sink.emit(
            AnalyticsEvent::new(event_type, enrollment.id.to_string())
                .for_recipient(enrollment.recipient_id.clone())
                .in_sequence(enrollment.sequence_id, step_index)
                .with_detail(detail),
        );
    }
}
