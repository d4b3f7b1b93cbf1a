//! Analytics event bus.
//!
//! Enrollment and delivery components take an `Arc<dyn EventSink>` and emit
//! lifecycle events into it; the sink decides where they go.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::types::{AnalyticsEvent, EventType};

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// Drops every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// Writes each event as a structured log line under the `analytics` target,
/// stamped with this node's id.
pub struct TracingSink {
    node_id: String,
}

impl TracingSink {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: AnalyticsEvent) {
        info!(
            target: "analytics",
            node_id = %self.node_id,
            event_id = %event.event_id,
            event_type = ?event.event_type,
            subject_id = %event.subject_id,
            recipient_id = event.recipient_id.as_deref().unwrap_or(""),
            sequence_id = ?event.sequence_id,
            step_index = ?event.step_index,
            detail = event.detail.as_deref().unwrap_or(""),
            "analytics event"
        );
    }
}

/// Keeps every event in memory. Used by tests to assert on what was emitted.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<AnalyticsEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.guard().clone()
    }

    pub fn count(&self) -> usize {
        self.guard().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.guard().iter().filter(|e| e.event_type == event_type).count()
    }

    /// Events about one enrollment or delivery attempt, in emission order.
    pub fn for_subject(&self, subject_id: &str) -> Vec<AnalyticsEvent> {
        self.guard()
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.guard().push(event);
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
