//! Repository layer for database access.
//!
//! Each repository is an `async_trait` trait with a sqlx-backed implementation,
//! so services can be tested against mocks.

pub mod delivery;
pub mod notification;
pub mod preference;

pub use delivery::*;
pub use notification::*;
pub use preference::*;
