//! Database models for herald.
//!
//! These models map directly to the database schema. Timestamps are stored as
//! epoch milliseconds and enums as their SCREAMING_SNAKE_CASE strings.

pub mod delivery;
pub mod notification;
pub mod preference;

pub use delivery::*;
pub use notification::*;
pub use preference::*;
