//! Election Module
//!
//! Bully leader election and the notifications it publishes.

mod bully;

pub use bully::{BullyElection, ElectionConfig, ElectionEvent, ElectionState, ElectionStatus};
