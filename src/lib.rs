//! ExamFleet - Distributed Exam Delivery
//!
//! A cluster of exam servers that agree on a shared clock and a
//! coordinator, fronted by a session-affine load balancer.
//!
//! # Architecture
//!
//! Every node runs a Bully election over a small binary TCP protocol.
//! The elected coordinator drives Berkeley clock synchronization rounds,
//! so exam deadlines computed on any node agree within the round error.
//! Clients reach the nodes through the load balancer, which places new
//! sessions on the least-loaded healthy backend and pins each session to
//! the backend that created it.
//!
//! # Features
//!
//! - Bully leader election with heartbeat-driven failure detection
//! - Berkeley clock synchronization led by the current coordinator
//! - Timed multiple-choice exam sessions with per-node capacity limits
//! - Health probing, least-connections placement and sticky sessions
//! - HTTP APIs for nodes and the balancer

pub mod config;
pub mod error;
pub mod protocol;
pub mod network;
pub mod state;
pub mod clock;
pub mod election;
pub mod exam;
pub mod balancer;
pub mod http;
pub mod node;

pub use config::FleetConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::FleetConfig;
    pub use crate::error::{Error, Result};
    pub use crate::protocol::Message;
    pub use crate::state::{NodeRecord, NodeRegistry, NodeStatus};
    pub use crate::clock::{BerkeleyClock, ClockRole};
    pub use crate::election::{BullyElection, ElectionState};
    pub use crate::exam::{ExamConfig, ExamStore};
    pub use crate::balancer::LoadBalancer;
    pub use crate::node::NodeRuntime;
}
