//! Service layer.
//!
//! Wires configuration, persistence, providers and the broker into a running
//! engine.

pub mod container;

pub use container::{ServiceContainer, build_providers};
