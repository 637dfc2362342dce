//! Delivery record domain module.

mod entity;
mod state;

pub use entity::{DEFAULT_MAX_ATTEMPTS, DeliveryPhase, DeliveryRecord, FailureDetail, RetryDecision};
pub use state::DeliveryStatus;
