//! Domain value objects.
//!
//! Value objects are immutable objects that represent concepts in the domain
//! and are defined by their attributes rather than identity.

mod channel;
mod priority;
mod quiet_hours;

pub use channel::Channel;
pub use priority::NotificationPriority;
pub use quiet_hours::{QuietHours, parse_time};
