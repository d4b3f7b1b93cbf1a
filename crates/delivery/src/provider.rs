//! Transactional delivery provider seam.
//!
//! The engine only relies on transmission acceptance: a provider returns a
//! `DeliveryId` once it has taken the message, not once it is delivered.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Provider-assigned id for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryId(pub String);

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Temporary rejection; worth retrying on the backoff schedule.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Invalid address, hard bounce, or anything else retries can't fix.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    #[error("provider did not respond within {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Permanent(_))
    }
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send(&self, address: &str, subject: &str, body: &str)
        -> Result<DeliveryId, ProviderError>;
}

/// Calls the provider, converting an overrun of `timeout` into
/// `ProviderError::Timeout`.
pub async fn send_with_timeout(
    provider: &dyn DeliveryProvider,
    timeout: Duration,
    address: &str,
    subject: &str,
    body: &str,
) -> Result<DeliveryId, ProviderError> {
    match tokio::time::timeout(timeout, provider.send(address, subject, body)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

/// Provider that accepts everything and only logs it. Used by the worker in
/// development mode in place of a real transport.
pub struct LoggingProvider {
    sender: String,
}

impl LoggingProvider {
    pub fn new(sender: impl Into<String>) -> Self {
        let sender = sender.into();
        info!(from = %sender, "Logging delivery provider initialized");
        Self { sender }
    }
}

#[async_trait]
impl DeliveryProvider for LoggingProvider {
    async fn send(
        &self,
        address: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryId, ProviderError> {
        if !address.contains('@') {
            return Err(ProviderError::Permanent(format!("invalid address '{address}'")));
        }
        let id = DeliveryId(format!("log-{}", uuid::Uuid::new_v4()));
        debug!(
            from = %self.sender,
            to = %address,
            subject = %subject,
            body_len = body.len(),
            delivery_id = %id,
            "Message accepted"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowProvider;

    #[async_trait]
    impl DeliveryProvider for SlowProvider {
        async fn send(&self, _: &str, _: &str, _: &str) -> Result<DeliveryId, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(DeliveryId("late".into()))
        }
    }

    #[tokio::test]
    async fn test_logging_provider_accepts_valid_address() {
        let provider = LoggingProvider::new("noreply@example.com");
        let id = provider.send("r@example.com", "Hello", "Body").await.unwrap();
        assert!(id.0.starts_with("log-"));
    }

    #[tokio::test]
    async fn test_logging_provider_rejects_invalid_address() {
        let provider = LoggingProvider::new("noreply@example.com");
        let err = provider.send("not-an-address", "Hello", "Body").await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let timeout = Duration::from_millis(20);
        let err = send_with_timeout(&SlowProvider, timeout, "r@example.com", "s", "b")
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Timeout(timeout));
        assert!(!err.is_permanent());
    }
}
