//! Notification domain module.

mod entity;

pub use entity::{Notification, NotificationStatus};
