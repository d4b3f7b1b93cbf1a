use std::sync::Arc;

use campaign_core::CampaignResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::recipients::RecipientSignals;
use crate::types::{ExitReason, Step};

/// A rule evaluated against a recipient's current signals. Used both for a
/// sequence's exit rules and for a step's skip rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Condition {
    TagPresent { tag: String },
    TagAbsent { tag: String },
    /// Recipient replied to this sequence since enrolling.
    RepliedSince,
    /// Recipient clicked a link from this sequence since enrolling.
    ClickedSince,
}

impl Condition {
    pub fn exit_reason(&self) -> ExitReason {
        match self {
            Condition::TagPresent { tag } => ExitReason::Tag(tag.clone()),
            Condition::TagAbsent { tag } => ExitReason::TagMissing(tag.clone()),
            Condition::RepliedSince => ExitReason::Replied,
            Condition::ClickedSince => ExitReason::Clicked,
        }
    }
}

/// Who and when a condition is evaluated for.
#[derive(Debug, Clone)]
pub struct ConditionContext<'a> {
    pub recipient_id: &'a str,
    pub sequence_id: Uuid,
    pub since: DateTime<Utc>,
}

/// Evaluates conditions against the recipient signal collaborator.
#[derive(Clone)]
pub struct ConditionEvaluator {
    signals: Arc<dyn RecipientSignals>,
}

impl ConditionEvaluator {
    pub fn new(signals: Arc<dyn RecipientSignals>) -> Self {
        Self { signals }
    }

    pub async fn holds(&self, condition: &Condition, ctx: &ConditionContext<'_>) -> CampaignResult<bool> {
        let result = match condition {
            Condition::TagPresent { tag } => self.signals.has_tag(ctx.recipient_id, tag).await?,
            Condition::TagAbsent { tag } => !self.signals.has_tag(ctx.recipient_id, tag).await?,
            Condition::RepliedSince => {
                self.signals
                    .has_replied_since(ctx.recipient_id, &ctx.sequence_id, ctx.since)
                    .await?
            }
            Condition::ClickedSince => {
                self.signals
                    .has_clicked_since(ctx.recipient_id, &ctx.sequence_id, ctx.since)
                    .await?
            }
        };
        Ok(result)
    }

    /// Reason of the first exit condition that holds, if any.
    pub async fn first_exit(
        &self,
        conditions: &[Condition],
        ctx: &ConditionContext<'_>,
    ) -> CampaignResult<Option<ExitReason>> {
        for condition in conditions {
            if self.holds(condition, ctx).await? {
                debug!(recipient_id = %ctx.recipient_id, ?condition, "Exit condition matched");
                return Ok(Some(condition.exit_reason()));
            }
        }
        Ok(None)
    }

    pub async fn should_skip(&self, step: &Step, ctx: &ConditionContext<'_>) -> CampaignResult<bool> {
        for condition in &step.skip_conditions {
            if self.holds(condition, ctx).await? {
                debug!(
                    recipient_id = %ctx.recipient_id,
                    step = step.order,
                    ?condition,
                    "Skip condition matched"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}
