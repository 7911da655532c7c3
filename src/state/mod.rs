//! State Management Module
//!
//! Shared cluster view: which nodes exist, how senior they are and
//! whether they are alive.

mod registry;

pub use registry::{NodeRecord, NodeRegistry, NodeStatus, RegistrySummary};
