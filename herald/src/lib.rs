//! herald library crate.
//!
//! Notification delivery engine: consumes domain events, applies user
//! preferences, delivers over email, SMS and push, and retries with backoff.

pub mod broker;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod notification;
pub mod services;

pub use error::{Error, Result};
