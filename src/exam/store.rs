//! Exam Store
//!
//! In-memory exam content, running sessions and finished results for a
//! single node. Deadlines come from the synchronized clock.

use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::clock::{BerkeleyClock, Timestamp};
use crate::config::ExamDefaults;
use crate::state::NodeRegistry;
use crate::error::{Error, Result};

/// A multiple choice question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: u32,
    pub question: String,
    pub options: Vec<String>,
    /// Letter of the correct option, e.g. `"C"`
    pub answer: String,
}

/// What a student gets to see of a question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionView {
    pub id: u32,
    pub question: String,
    pub options: Vec<String>,
}

impl From<&Question> for QuestionView {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id,
            question: q.question.clone(),
            options: q.options.clone(),
        }
    }
}

/// Exam definition, as pushed by `configure_exam`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamConfig {
    pub title: String,
    pub questions: Vec<Question>,
    /// Duration in seconds
    pub duration: u64,
    /// Maximum concurrent sessions
    pub capacity: usize,
}

impl ExamConfig {
    /// Default questions with the configured title, duration and capacity
    pub fn from_defaults(defaults: &ExamDefaults) -> Self {
        Self {
            title: defaults.title.clone(),
            questions: default_questions(),
            duration: defaults.duration_secs,
            capacity: defaults.capacity,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidExamConfig("title is required".into()));
        }
        if self.questions.is_empty() {
            return Err(Error::InvalidExamConfig("questions must not be empty".into()));
        }
        if self.duration == 0 {
            return Err(Error::InvalidExamConfig("duration must be positive".into()));
        }
        if self.capacity == 0 {
            return Err(Error::InvalidExamConfig("capacity must be positive".into()));
        }
        for q in &self.questions {
            if q.options.len() < 2 {
                return Err(Error::InvalidExamConfig(format!(
                    "question {} must have at least 2 options",
                    q.id
                )));
            }
            if q.answer.trim().is_empty() {
                return Err(Error::InvalidExamConfig(format!("question {} has no answer", q.id)));
            }
        }
        Ok(())
    }
}

fn default_questions() -> Vec<Question> {
    let q = |id, question: &str, options: [&str; 4], answer: &str| Question {
        id,
        question: question.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
        answer: answer.to_string(),
    };

    vec![
        q(
            1,
            "Which keyword is used to inherit a class in Java?",
            ["A) this", "B) super", "C) extends", "D) implements"],
            "C",
        ),
        q(
            2,
            "Which of these is not a Java primitive type?",
            ["A) int", "B) float", "C) boolean", "D) string"],
            "D",
        ),
        q(
            3,
            "Which package contains the Scanner class?",
            ["A) java.util", "B) java.io", "C) java.lang", "D) java.text"],
            "A",
        ),
    ]
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Completed,
    Timeout,
}

/// A finished exam
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamResult {
    pub username: String,
    pub score: usize,
    pub total: usize,
    pub session_id: String,
    pub ended_reason: EndReason,
    /// Synchronized time the session ended
    pub ended_at: Timestamp,
    /// Filled in by the balancer when aggregating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Session {
    username: String,
    score: usize,
    question_index: usize,
    /// Absolute synchronized time, fixed at creation
    deadline: Timestamp,
}

/// Reply to a successful start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedSession {
    pub message: String,
    pub session_id: String,
    pub question: QuestionView,
    pub deadline: Timestamp,
    /// Seconds
    pub time_remaining: f64,
}

/// Reply to an answer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitOutcome {
    Finished {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
        final_score: String,
    },
    Next {
        feedback: String,
        next_question: QuestionView,
        time_remaining: f64,
    },
}

/// Load figures polled by the balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamMetrics {
    pub active_sessions: usize,
    pub capacity: usize,
}

/// Exam metadata for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamInfo {
    pub server_id: String,
    pub title: String,
    pub num_questions: usize,
    pub duration: u64,
    pub capacity: usize,
    pub active_sessions: usize,
}

/// Reply to `configure_exam`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureAck {
    pub accepted: bool,
    pub server_id: String,
    pub questions: usize,
    pub duration: u64,
    pub capacity: usize,
}

struct ExamState {
    config: ExamConfig,
    sessions: HashMap<String, Session>,
    results: Vec<ExamResult>,
}

/// Exam state for one node
pub struct ExamStore {
    node_id: String,
    clock: BerkeleyClock,
    state: RwLock<ExamState>,
    /// Receives this node's session count as `active_load`
    registry: Option<Arc<NodeRegistry>>,
}

impl ExamStore {
    pub fn new(node_id: impl Into<String>, clock: BerkeleyClock, config: ExamConfig) -> Self {
        Self {
            node_id: node_id.into(),
            clock,
            state: RwLock::new(ExamState {
                config,
                sessions: HashMap::new(),
                results: Vec::new(),
            }),
            registry: None,
        }
    }

    /// Publish the open session count to this node's registry record
    pub fn with_registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    async fn publish_load(&self, load: usize) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.set_load(&self.node_id, load as u64).await {
                tracing::debug!(node_id = %self.node_id, error = %e, "Load not published");
            }
        }
    }

    /// Open a session for `username`
    pub async fn start_session(&self, username: &str) -> Result<StartedSession> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::BadRequest("username is required".into()));
        }

        let mut state = self.state.write().await;
        if state.sessions.len() >= state.config.capacity {
            tracing::warn!(
                node_id = %self.node_id,
                capacity = state.config.capacity,
                "Refusing session, node at capacity"
            );
            return Err(Error::CapacityExceeded);
        }

        let first = state
            .config
            .questions
            .first()
            .map(QuestionView::from)
            .ok_or_else(|| Error::InvalidExamConfig("exam has no questions".into()))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let duration = state.config.duration;
        let deadline = self.clock.now() + duration as f64;

        state.sessions.insert(
            session_id.clone(),
            Session {
                username: username.to_string(),
                score: 0,
                question_index: 0,
                deadline,
            },
        );

        let load = state.sessions.len();
        drop(state);
        self.publish_load(load).await;

        tracing::info!(
            node_id = %self.node_id,
            session_id = %session_id,
            username = %username,
            load,
            "Session started"
        );

        Ok(StartedSession {
            message: format!("Welcome, {}! You have {} seconds.", username, duration),
            session_id,
            question: first,
            deadline,
            time_remaining: self.clock.get_time_remaining(deadline).as_secs_f64(),
        })
    }

    /// Grade an answer to the session's current question
    pub async fn submit_answer(&self, session_id: &str, answer: Option<&str>) -> Result<SubmitOutcome> {
        let (outcome, load) = {
            let mut state = self.state.write().await;
            let outcome = self.grade(&mut state, session_id, answer);
            (outcome, state.sessions.len())
        };
        if matches!(outcome, Ok(SubmitOutcome::Finished { .. })) {
            self.publish_load(load).await;
        }
        outcome
    }

    fn grade(&self, state: &mut ExamState, session_id: &str, answer: Option<&str>) -> Result<SubmitOutcome> {
        let total = state.config.questions.len();

        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::InvalidSession(session_id.to_string()))?;

        if self.clock.get_time_remaining(session.deadline).is_zero() {
            let result = self.finish(state, session_id, EndReason::Timeout, total);
            return Ok(SubmitOutcome::Finished {
                message: "Time is up! Your exam has ended.".into(),
                feedback: None,
                final_score: format!("{}/{}", result.score, total),
            });
        }

        let correct = state
            .config
            .questions
            .get(session.question_index)
            .map_or(false, |q| {
                answer.map_or(false, |a| a.trim().eq_ignore_ascii_case(&q.answer))
            });
        if correct {
            session.score += 1;
        }
        let feedback = if correct { "Correct!" } else { "Incorrect!" }.to_string();

        session.question_index += 1;
        let deadline = session.deadline;

        match state.config.questions.get(session.question_index) {
            Some(next) => Ok(SubmitOutcome::Next {
                feedback,
                next_question: QuestionView::from(next),
                time_remaining: self.clock.get_time_remaining(deadline).as_secs_f64(),
            }),
            None => {
                let result = self.finish(state, session_id, EndReason::Completed, total);
                Ok(SubmitOutcome::Finished {
                    message: "Exam finished!".into(),
                    feedback: Some(feedback),
                    final_score: format!("{}/{}", result.score, total),
                })
            }
        }
    }

    fn finish(&self, state: &mut ExamState, session_id: &str, reason: EndReason, total: usize) -> ExamResult {
        let session = state.sessions.remove(session_id);
        let (username, score) = session.map_or((String::new(), 0), |s| (s.username, s.score));

        let result = ExamResult {
            username,
            score,
            total,
            session_id: session_id.to_string(),
            ended_reason: reason,
            ended_at: self.clock.now(),
            server_id: None,
        };

        tracing::info!(
            node_id = %self.node_id,
            session_id = %session_id,
            reason = ?reason,
            score = result.score,
            "Session ended"
        );

        state.results.push(result.clone());
        result
    }

    /// Replace the exam. Open sessions and past results are discarded.
    pub async fn configure(&self, config: ExamConfig) -> Result<ConfigureAck> {
        config.validate()?;

        let mut config = config;
        config.title = config.title.trim().to_string();

        let mut state = self.state.write().await;
        let ack = ConfigureAck {
            accepted: true,
            server_id: self.node_id.clone(),
            questions: config.questions.len(),
            duration: config.duration,
            capacity: config.capacity,
        };
        state.sessions.clear();
        state.results.clear();
        state.config = config;

        tracing::info!(
            node_id = %self.node_id,
            title = %state.config.title,
            questions = ack.questions,
            duration = ack.duration,
            capacity = ack.capacity,
            "Exam configured"
        );
        drop(state);
        self.publish_load(0).await;

        Ok(ack)
    }

    pub async fn metrics(&self) -> ExamMetrics {
        let state = self.state.read().await;
        ExamMetrics {
            active_sessions: state.sessions.len(),
            capacity: state.config.capacity,
        }
    }

    pub async fn info(&self) -> ExamInfo {
        let state = self.state.read().await;
        ExamInfo {
            server_id: self.node_id.clone(),
            title: state.config.title.clone(),
            num_questions: state.config.questions.len(),
            duration: state.config.duration,
            capacity: state.config.capacity,
            active_sessions: state.sessions.len(),
        }
    }

    pub async fn results(&self) -> Vec<ExamResult> {
        self.state.read().await.results.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::clock::{ClockRole, ClockSettings};
    use crate::network::loopback::LoopbackTransport;
    use crate::state::{NodeRecord, NodeRegistry};

    fn store_with(capacity: usize) -> ExamStore {
        let registry = Arc::new(NodeRegistry::new(NodeRecord::new("S1", "s1:7700", 1)));
        let clock = BerkeleyClock::new(
            "S1",
            ClockRole::Participant,
            ClockSettings::default(),
            registry,
            LoopbackTransport::new(),
        );
        let config = ExamConfig {
            title: "Java Basics Exam".into(),
            questions: default_questions(),
            duration: 60,
            capacity,
        };
        ExamStore::new("S1", clock, config)
    }

    #[tokio::test]
    async fn test_session_count_published_as_load() {
        let registry = Arc::new(NodeRegistry::new(NodeRecord::new("S1", "s1:7700", 1)));
        let store = store_with(3).with_registry(registry.clone());
        let load = || async { registry.get_self().await.unwrap().active_load };

        let first = store.start_session("alice").await.unwrap();
        store.start_session("bob").await.unwrap();
        assert_eq!(load().await, 2);

        // Answers in progress leave the load alone, finishing releases it
        store.submit_answer(&first.session_id, Some("C")).await.unwrap();
        assert_eq!(load().await, 2);
        store.submit_answer(&first.session_id, Some("D")).await.unwrap();
        store.submit_answer(&first.session_id, Some("A")).await.unwrap();
        assert_eq!(load().await, 1);

        let config = ExamConfig {
            title: "Retake".into(),
            questions: default_questions(),
            duration: 30,
            capacity: 3,
        };
        store.configure(config).await.unwrap();
        assert_eq!(load().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let store = store_with(2);
        store.start_session("alice").await.unwrap();
        store.start_session("bob").await.unwrap();

        assert!(matches!(store.start_session("carol").await, Err(Error::CapacityExceeded)));
        assert_eq!(store.metrics().await.active_sessions, 2);
    }

    #[tokio::test]
    async fn test_full_exam_scores_and_records() {
        let store = store_with(2);
        let started = store.start_session("alice").await.unwrap();
        assert_eq!(started.question.id, 1);
        assert!(started.time_remaining > 59.0);

        let id = started.session_id.as_str();
        match store.submit_answer(id, Some("c")).await.unwrap() {
            SubmitOutcome::Next { feedback, next_question, .. } => {
                assert_eq!(feedback, "Correct!");
                assert_eq!(next_question.id, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        store.submit_answer(id, Some("A")).await.unwrap();
        match store.submit_answer(id, Some("A")).await.unwrap() {
            SubmitOutcome::Finished { final_score, .. } => assert_eq!(final_score, "2/3"),
            other => panic!("unexpected {:?}", other),
        }

        let results = store.results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ended_reason, EndReason::Completed);
        assert_eq!(store.metrics().await.active_sessions, 0);

        // The session is gone
        assert!(matches!(
            store.submit_answer(id, Some("A")).await,
            Err(Error::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_clock_correction_expires_session() {
        let store = store_with(2);
        let started = store.start_session("alice").await.unwrap();

        // A forward correction past the deadline ends the exam
        store.clock.apply_adjustment(120.0).await;

        match store.submit_answer(&started.session_id, Some("C")).await.unwrap() {
            SubmitOutcome::Finished { message, final_score, .. } => {
                assert!(message.contains("Time is up"));
                assert_eq!(final_score, "0/3");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.results().await[0].ended_reason, EndReason::Timeout);
    }

    #[tokio::test]
    async fn test_configure_validates_and_resets() {
        let store = store_with(1);
        store.start_session("alice").await.unwrap();

        let bad = ExamConfig {
            title: "  ".into(),
            questions: default_questions(),
            duration: 30,
            capacity: 5,
        };
        assert!(matches!(store.configure(bad).await, Err(Error::InvalidExamConfig(_))));

        let mut one_option = default_questions();
        one_option[0].options.truncate(1);
        let bad = ExamConfig {
            title: "Rust".into(),
            questions: one_option,
            duration: 30,
            capacity: 5,
        };
        assert!(store.configure(bad).await.is_err());

        let good = ExamConfig {
            title: " Rust Basics ".into(),
            questions: default_questions()[..2].to_vec(),
            duration: 30,
            capacity: 5,
        };
        let ack = store.configure(good).await.unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.questions, 2);

        let info = store.info().await;
        assert_eq!(info.title, "Rust Basics");
        assert_eq!(info.active_sessions, 0);
        assert_eq!(info.capacity, 5);
    }

    #[tokio::test]
    async fn test_blank_username_rejected() {
        let store = store_with(2);
        assert!(matches!(store.start_session("  ").await, Err(Error::BadRequest(_))));
    }
}
