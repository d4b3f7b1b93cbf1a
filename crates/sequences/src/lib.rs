//! Sequence engine: time-delayed, multi-step drip campaigns advanced one
//! step at a time per recipient, with exit/skip rules and claim-before-send
//! concurrency control.

pub mod advancer;
pub mod conditions;
pub mod enroller;
pub mod recipients;
pub mod rendering;
pub mod schedule;
pub mod scheduler;
pub mod seed;
pub mod stats;
pub mod store;
pub mod types;

pub use advancer::{AdvanceOutcome, Collaborators, StepAdvancer};
pub use enroller::{BackfillReport, RecipientSelector, TriggerEnroller};
pub use scheduler::{SequenceScheduler, TickReport};
pub use stats::SequenceStats;
pub use store::{EnrollmentStore, InMemoryEnrollmentStore, InMemorySequenceStore, SequenceStore};
