//! Due-time computation: step delays, the zero-delay grace offset, and the
//! optional send window that only ever pushes a time forward.

use campaign_core::config::{SendWindowConfig, SequenceConfig};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};

use crate::types::Step;

/// Hours of the day (UTC) and days of the week sends may be scheduled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWindow {
    start_hour: u32,
    end_hour: u32,
    skip_weekends: bool,
}

impl SendWindow {
    pub fn new(config: &SendWindowConfig) -> Self {
        Self {
            start_hour: config.start_hour.min(23),
            end_hour: config.end_hour.min(24),
            skip_weekends: config.skip_weekends,
        }
    }

    pub fn allows(&self, at: DateTime<Utc>) -> bool {
        self.day_allowed(at) && self.hour_allowed(at.hour())
    }

    /// Earliest allowed instant at or after `at`.
    pub fn next_allowed(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = at;
        // Two moves per day at most, a weekend is two days.
        for _ in 0..8 {
            if self.allows(candidate) {
                return candidate;
            }
            if !self.day_allowed(candidate) {
                candidate = start_of_day(candidate) + Duration::days(1);
                continue;
            }
            let opening = start_of_day(candidate) + Duration::hours(i64::from(self.start_hour));
            candidate = if opening > candidate {
                opening
            } else {
                opening + Duration::days(1)
            };
        }
        candidate
    }

    fn day_allowed(&self, at: DateTime<Utc>) -> bool {
        !(self.skip_weekends && matches!(at.weekday(), Weekday::Sat | Weekday::Sun))
    }

    fn hour_allowed(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            true
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

fn offset_from(at: DateTime<Utc>, delay: Duration) -> CampaignResult<DateTime<Utc>> {
    at.checked_add_signed(delay).ok_or_else(|| {
        CampaignError::Validation(format!("step delay of {delay} from {at} is out of range"))
    })
}

fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Turns step delays into absolute due times.
#[derive(Debug, Clone)]
pub struct Schedule {
    grace: Duration,
    window: Option<SendWindow>,
}

impl Schedule {
    pub fn new(grace: Duration, window: Option<SendWindow>) -> Self {
        Self { grace, window }
    }

    pub fn from_config(config: &SequenceConfig) -> Self {
        Self::new(
            config.first_step_grace(),
            config.send_window.as_ref().map(SendWindow::new),
        )
    }

    /// Due time of the first step. A zero delay becomes the grace offset so
    /// the enrollment write lands before any tick can pick it up.
    pub fn first_due(
        &self,
        enrolled_at: DateTime<Utc>,
        first_step: Option<&Step>,
    ) -> CampaignResult<DateTime<Utc>> {
        let delay = first_step.map(Step::delay).unwrap_or_else(Duration::zero);
        let offset = if delay <= Duration::zero() { self.grace } else { delay };
        Ok(self.adjust(offset_from(enrolled_at, offset)?))
    }

    /// Due time of `step` measured from `anchor` (the previous send, or the
    /// skip evaluation time).
    pub fn due_after(&self, anchor: DateTime<Utc>, step: &Step) -> CampaignResult<DateTime<Utc>> {
        Ok(self.adjust(offset_from(anchor, step.delay())?))
    }

    /// Pushes `at` into the send window, if one is configured.
    pub fn adjust(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match &self.window {
            Some(window) => window.next_allowed(at),
            None => at,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }
}
