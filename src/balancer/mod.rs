//! Load Balancer Module
//!
//! Health tracking of backend exam servers, least-connections placement
//! and sticky session routing.

mod backend;
mod router;
pub mod api;

pub use backend::{Backend, BackendClient, BackendMetrics, ForwardedResponse, HttpBackendClient};
pub use router::{BalancerStats, ConfigResult, ListedExam, LoadBalancer};
