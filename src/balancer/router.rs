//! Load Balancer
//!
//! Least-connections placement of new exam sessions across healthy
//! backends, with sticky routing for the rest of each session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use super::backend::{Backend, BackendClient, BackendMetrics, ForwardedResponse};
use crate::exam::{ExamConfig, ExamInfo, ExamResult};
use crate::state::{NodeRecord, NodeRegistry};
use crate::error::{Error, Result};

/// Outcome of pushing a config to one backend
#[derive(Debug, Clone, Serialize)]
pub struct ConfigResult {
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConfigResult {
    pub fn applied(&self) -> bool {
        self.status.map_or(false, |s| (200..300).contains(&s))
    }
}

/// Exam listing entry
#[derive(Debug, Clone, Serialize)]
pub struct ListedExam {
    #[serde(flatten)]
    pub info: ExamInfo,
    pub url: String,
}

/// Balancer view for `/lb/status`
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub backends: Vec<Backend>,
    pub healthy_backends: usize,
    pub sticky_sessions: usize,
    pub leader_hint: Option<String>,
    /// Liveness and load per backend, when a registry is attached
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeRecord>,
}

/// Session-affine least-connections balancer
pub struct LoadBalancer {
    /// Backends in routing order
    backends: RwLock<Vec<Backend>>,
    /// session id -> backend url
    sessions: RwLock<HashMap<String, String>>,
    client: Arc<dyn BackendClient>,
    /// Backend liveness and load, fed by health checks
    registry: Option<Arc<NodeRegistry>>,
    /// Silence after which a backend is dead in the registry
    dead_after: Duration,
    leader_hint: RwLock<Option<String>>,
}

impl LoadBalancer {
    pub fn new(backends: Vec<Backend>, client: Arc<dyn BackendClient>) -> Self {
        Self {
            backends: RwLock::new(backends),
            sessions: RwLock::new(HashMap::new()),
            client,
            registry: None,
            dead_after: Duration::from_secs(30),
            leader_hint: RwLock::new(None),
        }
    }

    /// Record health check results in `registry` and skip backends it considers
    /// dead. A backend without a successful check for `dead_after` is dead;
    /// half of that makes it suspected.
    pub fn with_registry(mut self, registry: Arc<NodeRegistry>, dead_after: Duration) -> Self {
        self.registry = Some(registry);
        self.dead_after = dead_after;
        self
    }

    async fn dead_ids(&self) -> HashSet<String> {
        match &self.registry {
            Some(registry) => registry.dead_ids().await.into_iter().collect(),
            None => HashSet::new(),
        }
    }

    /// Probe every backend once. Returns the number of healthy backends.
    ///
    /// No lock is held while the probes are in flight.
    pub async fn probe_health(&self) -> usize {
        let targets: Vec<(String, String)> = self
            .backends
            .read()
            .await
            .iter()
            .map(|b| (b.id.clone(), b.url.clone()))
            .collect();

        let client = &self.client;
        let outcomes = join_all(targets.iter().map(|(_, url)| async move {
            client.health(url).await?;
            client.metrics(url).await
        }))
        .await;

        let now = chrono::Utc::now();
        let mut leader_seen: Option<String> = None;
        let mut backends = self.backends.write().await;

        for ((id, _), outcome) in targets.iter().zip(outcomes) {
            let Some(backend) = backends.iter_mut().find(|b| &b.id == id) else {
                continue;
            };
            backend.last_probe = Some(now);

            match outcome {
                Ok(BackendMetrics { active_sessions, capacity, leader_id }) => {
                    if !backend.healthy {
                        tracing::info!(backend = %id, url = %backend.url, "Backend is healthy again");
                    }
                    backend.healthy = true;
                    backend.active_sessions = active_sessions;
                    backend.capacity = capacity;
                    backend.last_error = None;
                    if leader_seen.is_none() {
                        leader_seen = leader_id;
                    }
                }
                Err(e) => {
                    if backend.healthy {
                        tracing::warn!(backend = %id, url = %backend.url, error = %e, "Backend is now UNHEALTHY");
                    }
                    backend.healthy = false;
                    backend.last_error = Some(e.to_string());
                }
            }
        }

        let healthy = backends.iter().filter(|b| b.healthy).count();
        let observed: Vec<(String, String, Option<usize>)> = backends
            .iter()
            .map(|b| {
                let load = b.healthy.then_some(b.active_sessions);
                (b.id.clone(), b.url.clone(), load)
            })
            .collect();
        for b in backends.iter() {
            tracing::debug!(
                backend = %b.id,
                healthy = b.healthy,
                active_sessions = b.active_sessions,
                "Backend status"
            );
        }
        drop(backends);

        if let Some(leader) = leader_seen {
            *self.leader_hint.write().await = Some(leader);
        }

        self.record_health(&observed).await;

        healthy
    }

    /// Successful checks count as heartbeats carrying the backend's load
    async fn record_health(&self, observed: &[(String, String, Option<usize>)]) {
        let Some(registry) = &self.registry else {
            return;
        };

        for (id, url, load) in observed {
            let Some(load) = load else {
                continue;
            };
            if !registry.record_heartbeat(id).await {
                let mut record = NodeRecord::new(id.as_str(), url.as_str(), 0);
                record.touch();
                registry.register(record).await;
            }
            if let Err(e) = registry.set_load(id, *load as u64).await {
                tracing::debug!(backend = %id, error = %e, "Load not recorded");
            }
        }

        for (id, status) in registry.check_timeouts(self.dead_after / 2, self.dead_after).await {
            tracing::warn!(backend = %id, status = %status, "Backend liveness changed");
        }
    }

    /// Healthy backend with the fewest active sessions, first one on ties
    pub async fn pick_target(&self) -> Option<Backend> {
        let dead = self.dead_ids().await;
        let backends = self.backends.read().await;
        backends
            .iter()
            .filter(|b| b.healthy && !dead.contains(&b.id))
            .min_by_key(|b| b.active_sessions)
            .cloned()
    }

    /// Place a new session and remember where it went
    pub async fn route_new_session(&self, username: Option<&str>) -> Result<ForwardedResponse> {
        let username = username.map(str::trim).unwrap_or_default();
        if username.is_empty() {
            return Err(Error::BadRequest("username is required".into()));
        }

        let target = self.pick_target().await.ok_or(Error::NoHealthyBackend)?;
        tracing::info!(backend = %target.id, username = %username, "Forwarding new exam session");

        let body = serde_json::json!({ "username": username });
        let response = self.client.start_exam(&target.url, &body).await?;

        if response.is_success() {
            if let Some(session_id) = response.body.get("session_id").and_then(|v| v.as_str()) {
                self.sessions
                    .write()
                    .await
                    .insert(session_id.to_string(), target.url.clone());

                // Count it now so a burst does not pile onto one backend
                // before the next probe
                let mut backends = self.backends.write().await;
                if let Some(b) = backends.iter_mut().find(|b| b.id == target.id) {
                    b.active_sessions += 1;
                }
            }
        }

        Ok(response)
    }

    /// Backend for an existing session: its sticky backend while healthy,
    /// otherwise the best healthy one
    async fn resolve_session(&self, session_id: &str) -> Result<Backend> {
        let sticky = self.sessions.read().await.get(session_id).cloned();

        if let Some(url) = &sticky {
            let dead = self.dead_ids().await;
            let backends = self.backends.read().await;
            if let Some(b) = backends
                .iter()
                .find(|b| &b.url == url && b.healthy && !dead.contains(&b.id))
            {
                return Ok(b.clone());
            }
        }

        let fallback = self.pick_target().await.ok_or(Error::NoHealthyBackend)?;
        if let Some(url) = sticky {
            tracing::warn!(
                session_id = %session_id,
                from = %url,
                to = %fallback.url,
                "Sticky backend unavailable, session state is lost"
            );
            self.sessions
                .write()
                .await
                .insert(session_id.to_string(), fallback.url.clone());
        }

        Ok(fallback)
    }

    /// Forward an answer for an existing session
    pub async fn route_existing_session(
        &self,
        session_id: &str,
        body: &serde_json::Value,
    ) -> Result<ForwardedResponse> {
        let target = self.resolve_session(session_id).await?;
        tracing::debug!(backend = %target.id, session_id = %session_id, "Forwarding answer");

        let response = self.client.submit_answer(&target.url, body).await?;

        if response.is_success() && response.body.get("final_score").is_some() {
            if self.sessions.write().await.remove(session_id).is_some() {
                let mut backends = self.backends.write().await;
                if let Some(b) = backends.iter_mut().find(|b| b.id == target.id) {
                    b.active_sessions = b.active_sessions.saturating_sub(1);
                }
            }
        }

        Ok(response)
    }

    /// Push an exam config to every healthy backend. Partial success is
    /// reported, never rolled back.
    pub async fn propagate_config(&self, config: &ExamConfig) -> Result<Vec<ConfigResult>> {
        config.validate()?;

        let targets: Vec<Backend> = self
            .backends
            .read()
            .await
            .iter()
            .filter(|b| b.healthy)
            .cloned()
            .collect();

        let client = &self.client;
        let replies = join_all(targets.iter().map(|b| client.configure(&b.url, config))).await;

        let results: Vec<ConfigResult> = targets
            .iter()
            .zip(replies)
            .map(|(b, reply)| match reply {
                Ok(response) => ConfigResult {
                    server_id: b.id.clone(),
                    status: Some(response.status),
                    body: Some(response.body),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(backend = %b.id, error = %e, "Config push failed");
                    ConfigResult {
                        server_id: b.id.clone(),
                        status: None,
                        body: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();

        tracing::info!(
            applied = results.iter().filter(|r| r.applied()).count(),
            targets = results.len(),
            "Exam config propagated"
        );

        Ok(results)
    }

    fn all_targets(backends: &[Backend]) -> Vec<(String, String)> {
        backends.iter().map(|b| (b.id.clone(), b.url.clone())).collect()
    }

    /// Exam metadata from every reachable backend
    pub async fn fetch_exam_infos(&self) -> Vec<ListedExam> {
        let targets = Self::all_targets(&self.backends.read().await);
        let client = &self.client;
        let replies = join_all(targets.iter().map(|(_, url)| client.exam_info(url))).await;

        targets
            .into_iter()
            .zip(replies)
            .filter_map(|((id, url), reply)| match reply {
                Ok(mut info) => {
                    info.server_id = id;
                    Some(ListedExam { info, url })
                }
                Err(e) => {
                    tracing::debug!(backend = %id, error = %e, "Skipping exam listing");
                    None
                }
            })
            .collect()
    }

    /// Results from every reachable backend, newest first
    pub async fn fetch_results(&self) -> Vec<ExamResult> {
        let targets = Self::all_targets(&self.backends.read().await);
        let client = &self.client;
        let replies = join_all(targets.iter().map(|(_, url)| client.results(url))).await;

        let mut aggregated: Vec<ExamResult> = targets
            .into_iter()
            .zip(replies)
            .filter_map(|((id, _), reply)| reply.ok().map(|results| (id, results)))
            .flat_map(|(id, results)| {
                results.into_iter().map(move |mut r| {
                    r.server_id = Some(id.clone());
                    r
                })
            })
            .collect();

        aggregated.sort_by(|a, b| b.ended_at.total_cmp(&a.ended_at));
        aggregated
    }

    pub async fn leader_hint(&self) -> Option<String> {
        self.leader_hint.read().await.clone()
    }

    pub async fn stats(&self) -> BalancerStats {
        let backends = self.backends.read().await.clone();
        BalancerStats {
            healthy_backends: backends.iter().filter(|b| b.healthy).count(),
            backends,
            sticky_sessions: self.sessions.read().await.len(),
            leader_hint: self.leader_hint().await,
            nodes: match &self.registry {
                Some(registry) => registry.peers().await,
                None => Vec::new(),
            },
        }
    }

    /// Probe now and then every `period` until `shutdown` flips
    pub async fn run_health_checks(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Health checker started, interval {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let healthy = self.probe_health().await;
                    if healthy == 0 {
                        tracing::warn!("No healthy backends");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Health checker stopped");
    }
}
