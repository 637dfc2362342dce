//! Domain layer for herald.
//!
//! This module contains the core business logic, entities, and value objects.

pub mod delivery;
pub mod notification;
pub mod preference;
pub mod value_objects;

pub use delivery::{DeliveryPhase, DeliveryRecord, DeliveryStatus, FailureDetail, RetryDecision};
pub use notification::{Notification, NotificationStatus};
pub use preference::{Preference, PreferenceUpdate};
pub use value_objects::*;
