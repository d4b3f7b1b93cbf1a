//! Shared foundation for the sequence engine: error type, configuration,
//! analytics events, and the event bus.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
