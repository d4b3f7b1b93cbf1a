//! Recipient directory and behavioural signals consulted by exit/skip rules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::CampaignResult;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub email: String,
    /// Personalisation data available to templates.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Recipient {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn find(&self, recipient_id: &str) -> CampaignResult<Option<Recipient>>;

    async fn list(&self) -> CampaignResult<Vec<Recipient>>;
}

/// Read-only queries used by exit and skip evaluation.
#[async_trait]
pub trait RecipientSignals: Send + Sync {
    async fn has_tag(&self, recipient_id: &str, tag: &str) -> CampaignResult<bool>;

    async fn has_replied_since(
        &self,
        recipient_id: &str,
        sequence_id: &Uuid,
        since: DateTime<Utc>,
    ) -> CampaignResult<bool>;

    async fn has_clicked_since(
        &self,
        recipient_id: &str,
        sequence_id: &Uuid,
        since: DateTime<Utc>,
    ) -> CampaignResult<bool>;
}

/// In-memory directory and signal source.
#[derive(Clone, Default)]
pub struct InMemoryRecipients {
    recipients: Arc<DashMap<String, Recipient>>,
    tags: Arc<DashMap<String, HashSet<String>>>,
    replies: Arc<DashMap<(String, Uuid), Vec<DateTime<Utc>>>>,
    clicks: Arc<DashMap<(String, Uuid), Vec<DateTime<Utc>>>>,
}

impl InMemoryRecipients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, recipient: Recipient) {
        self.recipients.insert(recipient.id.clone(), recipient);
    }

    pub fn add_tag(&self, recipient_id: &str, tag: impl Into<String>) {
        self.tags
            .entry(recipient_id.to_string())
            .or_default()
            .insert(tag.into());
    }

    pub fn remove_tag(&self, recipient_id: &str, tag: &str) {
        if let Some(mut tags) = self.tags.get_mut(recipient_id) {
            tags.remove(tag);
        }
    }

    pub fn record_reply(&self, recipient_id: &str, sequence_id: Uuid, at: DateTime<Utc>) {
        self.replies
            .entry((recipient_id.to_string(), sequence_id))
            .or_default()
            .push(at);
    }

    pub fn record_click(&self, recipient_id: &str, sequence_id: Uuid, at: DateTime<Utc>) {
        self.clicks
            .entry((recipient_id.to_string(), sequence_id))
            .or_default()
            .push(at);
    }

    fn any_since(
        events: &DashMap<(String, Uuid), Vec<DateTime<Utc>>>,
        recipient_id: &str,
        sequence_id: &Uuid,
        since: DateTime<Utc>,
    ) -> bool {
        events
            .get(&(recipient_id.to_string(), *sequence_id))
            .is_some_and(|times| times.iter().any(|t| *t >= since))
    }
}

#[async_trait]
impl RecipientDirectory for InMemoryRecipients {
    async fn find(&self, recipient_id: &str) -> CampaignResult<Option<Recipient>> {
        Ok(self.recipients.get(recipient_id).map(|r| r.clone()))
    }

    async fn list(&self) -> CampaignResult<Vec<Recipient>> {
        let mut all: Vec<Recipient> = self.recipients.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

#[async_trait]
impl RecipientSignals for InMemoryRecipients {
    async fn has_tag(&self, recipient_id: &str, tag: &str) -> CampaignResult<bool> {
        Ok(self
            .tags
            .get(recipient_id)
            .is_some_and(|tags| tags.contains(tag)))
    }

    async fn has_replied_since(
        &self,
        recipient_id: &str,
        sequence_id: &Uuid,
        since: DateTime<Utc>,
    ) -> CampaignResult<bool> {
        Ok(Self::any_since(&self.replies, recipient_id, sequence_id, since))
    }

    async fn has_clicked_since(
        &self,
        recipient_id: &str,
        sequence_id: &Uuid,
        since: DateTime<Utc>,
    ) -> CampaignResult<bool> {
        Ok(Self::any_since(&self.clicks, recipient_id, sequence_id, since))
    }
}
