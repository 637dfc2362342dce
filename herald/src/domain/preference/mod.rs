//! Recipient preference domain module.

mod entity;

pub use entity::{Preference, PreferenceUpdate};
