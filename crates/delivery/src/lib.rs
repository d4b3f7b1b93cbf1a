//! Delivery retry: redelivers rendered messages whose transport attempt
//! failed, on an exponential backoff schedule independent of sequence timing.

pub mod manager;
pub mod provider;
pub mod retry;
pub mod store;
pub mod types;

pub use manager::{DeliveryRetryManager, RetryReport};
pub use provider::{DeliveryId, DeliveryProvider, LoggingProvider, ProviderError};
pub use retry::RetryPolicy;
pub use store::{DeliveryAttemptStore, InMemoryAttemptStore};
pub use types::{AttemptStatus, DeliveryAttempt, StepRef};
