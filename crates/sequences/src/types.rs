use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conditions::Condition;

/// Longest delay a single step may carry.
pub const MAX_STEP_DELAY_DAYS: u32 = 3650;

/// What causes a recipient to be enrolled into a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerType {
    Signup,
    TagAdded { tag: String },
    Manual,
}

/// A drip campaign: an ordered list of steps plus enrollment and exit rules.
///
/// Once recipients are enrolled the step list may only be appended to or
/// have steps deactivated; enrollments point into it by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub trigger: TriggerType,
    pub active: bool,
    /// Any condition holding forces the recipient out of the sequence.
    pub exit_conditions: Vec<Condition>,
    pub priority: i32,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sequence {
    pub fn new(name: impl Into<String>, trigger: TriggerType) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            slug: slugify(&name),
            name,
            trigger,
            active: true,
            exit_conditions: Vec::new(),
            priority: 0,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a step, assigning it the next order index.
    pub fn with_step(mut self, mut step: Step) -> Self {
        step.order = self.steps.len();
        self.steps.push(step);
        self
    }

    pub fn with_exit_tag(mut self, tag: impl Into<String>) -> Self {
        self.exit_conditions.push(Condition::TagPresent { tag: tag.into() });
        self
    }

    pub fn with_exit_on_reply(mut self) -> Self {
        self.exit_conditions.push(Condition::RepliedSince);
        self
    }

    pub fn with_exit_on_click(mut self) -> Self {
        self.exit_conditions.push(Condition::ClickedSince);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Index of the first active step at or after `from`.
    pub fn next_active_index(&self, from: usize) -> Option<usize> {
        self.steps
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, step)| step.active)
            .map(|(index, _)| index)
    }

    pub fn first_active_step(&self) -> Option<&Step> {
        self.next_active_index(0).map(|index| &self.steps[index])
    }

    /// Order indices must be dense and match list position, and every
    /// delay must fit within `MAX_STEP_DELAY_DAYS`.
    pub fn validate(&self) -> Result<(), String> {
        for (position, step) in self.steps.iter().enumerate() {
            if step.order != position {
                return Err(format!(
                    "step at position {} of sequence '{}' has order {}",
                    position, self.slug, step.order
                ));
            }
            if step.delay() > Duration::days(i64::from(MAX_STEP_DELAY_DAYS)) {
                return Err(format!(
                    "step {} of sequence '{}' delays {}d {}h, more than {} days",
                    position, self.slug, step.delay_days, step.delay_hours, MAX_STEP_DELAY_DAYS
                ));
            }
        }
        Ok(())
    }

    /// A revision may append steps or flip `active`, never drop or reorder.
    pub fn validate_revision(&self, revised: &Sequence) -> Result<(), String> {
        revised.validate()?;
        if revised.steps.len() < self.steps.len() {
            return Err(format!(
                "sequence '{}' would drop {} step(s)",
                self.slug,
                self.steps.len() - revised.steps.len()
            ));
        }
        for (old, new) in self.steps.iter().zip(&revised.steps) {
            if old.id != new.id {
                return Err(format!(
                    "sequence '{}' would replace step {} in place",
                    self.slug, old.order
                ));
            }
        }
        Ok(())
    }
}

/// One message in a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub order: usize,
    /// Delay from the previous step's send, or from enrollment for the first step.
    pub delay_days: u32,
    pub delay_hours: u32,
    pub active: bool,
    /// Any condition holding skips this step without sending.
    pub skip_conditions: Vec<Condition>,
    pub content_ref: String,
}

impl Step {
    pub fn new(content_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order: 0,
            delay_days: 0,
            delay_hours: 0,
            active: true,
            skip_conditions: Vec::new(),
            content_ref: content_ref.into(),
        }
    }

    pub fn with_delay(mut self, days: u32, hours: u32) -> Self {
        self.delay_days = days;
        self.delay_hours = hours;
        self
    }

    /// Skip unless the recipient has `tag`.
    pub fn require_tag(mut self, tag: impl Into<String>) -> Self {
        self.skip_conditions.push(Condition::TagAbsent { tag: tag.into() });
        self
    }

    /// Skip if the recipient has `tag`.
    pub fn skip_tag(mut self, tag: impl Into<String>) -> Self {
        self.skip_conditions.push(Condition::TagPresent { tag: tag.into() });
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::days(i64::from(self.delay_days)) + Duration::hours(i64::from(self.delay_hours))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Exited,
}

impl EnrollmentStatus {
    /// Status only ever moves forward out of `Active`.
    pub fn can_transition(self, to: EnrollmentStatus) -> bool {
        matches!(
            (self, to),
            (EnrollmentStatus::Active, _)
                | (EnrollmentStatus::Completed, EnrollmentStatus::Completed)
                | (EnrollmentStatus::Exited, EnrollmentStatus::Exited)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, EnrollmentStatus::Active)
    }
}

/// Why an enrollment left its sequence early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "tag")]
pub enum ExitReason {
    Tag(String),
    TagMissing(String),
    Replied,
    Clicked,
    /// The provider permanently rejected a step or its retries ran out.
    Undeliverable,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Tag(tag) => write!(f, "tag:{tag}"),
            ExitReason::TagMissing(tag) => write!(f, "tag_missing:{tag}"),
            ExitReason::Replied => f.write_str("replied"),
            ExitReason::Clicked => f.write_str("clicked"),
            ExitReason::Undeliverable => f.write_str("undeliverable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engagement {
    Opened,
    Clicked,
}

/// Per-recipient progress through one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub recipient_id: String,
    pub sequence_id: Uuid,
    pub status: EnrollmentStatus,
    /// Index of the step about to be sent.
    pub current_step_index: usize,
    /// Set iff `status` is `Active`.
    pub next_due_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub messages_delivered: u32,
    pub opened: u32,
    pub clicked: u32,
    /// Bumped by every claim and commit.
    pub version: u64,
}

impl Enrollment {
    pub fn new(
        recipient_id: impl Into<String>,
        sequence_id: Uuid,
        enrolled_at: DateTime<Utc>,
        first_due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id: recipient_id.into(),
            sequence_id,
            status: EnrollmentStatus::Active,
            current_step_index: 0,
            next_due_at: Some(first_due_at),
            enrolled_at,
            last_sent_at: None,
            completed_at: None,
            exited_at: None,
            exit_reason: None,
            messages_delivered: 0,
            opened: 0,
            clicked: 0,
            version: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active && self.next_due_at.is_some_and(|at| at <= now)
    }

    pub fn schedule(&mut self, at: DateTime<Utc>) {
        self.next_due_at = Some(at);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Completed;
        self.completed_at = Some(now);
        self.next_due_at = None;
    }

    pub fn exit(&mut self, now: DateTime<Utc>, reason: ExitReason) {
        self.status = EnrollmentStatus::Exited;
        self.exited_at = Some(now);
        self.exit_reason = Some(reason);
        self.next_due_at = None;
    }

    /// `next_due_at` is present exactly when the enrollment is active.
    pub fn is_consistent(&self) -> bool {
        (self.status == EnrollmentStatus::Active) == self.next_due_at.is_some()
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assigns_dense_order() {
        let sequence = Sequence::new("Welcome Series!", TriggerType::Signup)
            .with_step(Step::new("welcome"))
            .with_step(Step::new("tips").with_delay(2, 0))
            .with_step(Step::new("offer").with_delay(0, 5));

        assert_eq!(sequence.slug, "welcome-series");
        let orders: Vec<usize> = sequence.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert!(sequence.validate().is_ok());
        assert_eq!(sequence.steps[1].delay(), Duration::days(2));
        assert_eq!(sequence.steps[2].delay(), Duration::hours(5));
    }

    #[test]
    fn test_validate_bounds_step_delay() {
        let at_limit = Sequence::new("Long", TriggerType::Manual)
            .with_step(Step::new("a").with_delay(MAX_STEP_DELAY_DAYS, 0));
        assert!(at_limit.validate().is_ok());

        let hours_over = Sequence::new("Long", TriggerType::Manual)
            .with_step(Step::new("a").with_delay(MAX_STEP_DELAY_DAYS, 1));
        assert!(hours_over.validate().is_err());

        let huge = Sequence::new("Huge", TriggerType::Manual)
            .with_step(Step::new("a").with_delay(u32::MAX, 0));
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_next_active_index_skips_inactive() {
        let sequence = Sequence::new("s", TriggerType::Manual)
            .with_step(Step::new("a").inactive())
            .with_step(Step::new("b"))
            .with_step(Step::new("c").inactive());

        assert_eq!(sequence.next_active_index(0), Some(1));
        assert_eq!(sequence.next_active_index(2), None);
        assert_eq!(sequence.next_active_index(10), None);
        assert_eq!(sequence.first_active_step().map(|s| s.content_ref.as_str()), Some("b"));
    }

    #[test]
    fn test_revision_is_append_only() {
        let original = Sequence::new("s", TriggerType::Manual)
            .with_step(Step::new("a"))
            .with_step(Step::new("b"));

        let mut appended = original.clone().with_step(Step::new("c"));
        appended.steps[0].active = false;
        assert!(original.validate_revision(&appended).is_ok());

        let mut truncated = original.clone();
        truncated.steps.pop();
        assert!(original.validate_revision(&truncated).is_err());

        let mut replaced = original.clone();
        replaced.steps[1] = Step::new("z");
        replaced.steps[1].order = 1;
        assert!(original.validate_revision(&replaced).is_err());
    }

    #[test]
    fn test_status_transitions_are_one_directional() {
        use EnrollmentStatus::*;
        assert!(Active.can_transition(Active));
        assert!(Active.can_transition(Completed));
        assert!(Active.can_transition(Exited));
        assert!(!Completed.can_transition(Active));
        assert!(!Completed.can_transition(Exited));
        assert!(!Exited.can_transition(Completed));
        assert!(!Exited.can_transition(Active));
    }

    #[test]
    fn test_terminal_transitions_clear_due_time() {
        let now = Utc::now();
        let mut enrollment = Enrollment::new("r1", Uuid::new_v4(), now, now);
        assert!(enrollment.is_consistent());
        assert!(enrollment.is_due(now));

        enrollment.exit(now, ExitReason::Tag("unsubscribed".into()));
        assert!(enrollment.is_consistent());
        assert!(enrollment.next_due_at.is_none());
        assert!(!enrollment.is_due(now));
        assert_eq!(enrollment.exit_reason.unwrap().to_string(), "tag:unsubscribed");
    }
}
