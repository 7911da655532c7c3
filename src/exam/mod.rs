//! Exam Module
//!
//! The exam server each node runs: content, sessions and results, and the
//! HTTP API the balancer forwards to.

mod store;
pub mod api;

pub use store::{
    ConfigureAck, EndReason, ExamConfig, ExamInfo, ExamMetrics, ExamResult, ExamStore,
    Question, QuestionView, StartedSession, SubmitOutcome,
};
