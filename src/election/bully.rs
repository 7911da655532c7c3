//! Bully Leader Election
//!
//! The highest-priority reachable node coordinates the cluster. A node
//! that suspects the leader asks every more senior active peer to take
//! over; if none answers `ElectionOk` before the election timeout it
//! declares itself coordinator and announces it.

use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, MissedTickBehavior};

use crate::network::{PeerTransport, RequestHandler};
use crate::protocol::{ErrorCode, Message};
use crate::state::{NodeRecord, NodeRegistry, NodeStatus};
use crate::error::{Error, Result};

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElectionState {
    /// Following a known (or soon to be known) leader
    Normal,
    /// Waiting for senior peers to answer
    ElectionInProgress,
    /// This node leads
    Coordinator,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Normal => write!(f, "NORMAL"),
            ElectionState::ElectionInProgress => write!(f, "ELECTION_IN_PROGRESS"),
            ElectionState::Coordinator => write!(f, "COORDINATOR"),
        }
    }
}

/// Election timing
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long to wait for `ElectionOk` before claiming leadership
    pub election_timeout: Duration,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

impl ElectionConfig {
    /// Leader silence after which it is presumed dead
    pub fn leader_timeout(&self) -> Duration {
        self.election_timeout * 2
    }

    /// Peer silence after which it is suspected
    pub fn suspect_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Notifications for components that follow leadership
#[derive(Debug, Clone)]
pub enum ElectionEvent {
    /// This node started an election
    ElectionStarted {
        node_id: String,
        priority: i64,
        at: chrono::DateTime<chrono::Utc>,
    },
    /// A different node (possibly this one) now leads
    LeaderChanged { leader: NodeRecord },
}

/// Point-in-time view for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ElectionStatus {
    pub node_id: String,
    pub priority: i64,
    pub state: ElectionState,
    pub leader: Option<NodeRecord>,
    pub epoch: u64,
}

struct ElectionInner {
    state: ElectionState,
    current_leader: Option<NodeRecord>,
    /// Bumped on every election start and leadership change; pending
    /// timeouts from older epochs do nothing.
    epoch: u64,
    /// When we last deferred to a senior peer
    deferred_at: Option<Instant>,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

struct ElectionShared {
    node_id: String,
    priority: i64,
    address: String,
    config: ElectionConfig,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn PeerTransport>,
    inner: Mutex<ElectionInner>,
    events: broadcast::Sender<ElectionEvent>,
    worker: Mutex<Option<Worker>>,
}

/// Bully election engine for one node. Clones share state.
#[derive(Clone)]
pub struct BullyElection {
    shared: Arc<ElectionShared>,
}

impl BullyElection {
    /// Create an engine in `Normal` state with no known leader
    pub fn new(
        self_record: &NodeRecord,
        config: ElectionConfig,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(ElectionShared {
                node_id: self_record.id.clone(),
                priority: self_record.priority,
                address: self_record.address.clone(),
                config,
                registry,
                transport,
                inner: Mutex::new(ElectionInner {
                    state: ElectionState::Normal,
                    current_leader: None,
                    epoch: 0,
                    deferred_at: None,
                }),
                events,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn priority(&self) -> i64 {
        self.shared.priority
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.shared.registry
    }

    /// Subscribe to leadership notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn state(&self) -> ElectionState {
        self.shared.inner.lock().await.state
    }

    pub async fn current_leader(&self) -> Option<NodeRecord> {
        self.shared.inner.lock().await.current_leader.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.state().await == ElectionState::Coordinator
    }

    fn self_record(&self) -> NodeRecord {
        let mut record = NodeRecord::new(
            self.shared.node_id.clone(),
            self.shared.address.clone(),
            self.shared.priority,
        );
        record.touch();
        record
    }

    fn emit(&self, event: ElectionEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    /// Start an election for this node's candidacy.
    ///
    /// Fails with [`Error::ElectionAlreadyInProgress`] if one is running.
    pub async fn start_election(&self) -> Result<()> {
        let epoch = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == ElectionState::ElectionInProgress {
                return Err(Error::ElectionAlreadyInProgress);
            }
            inner.state = ElectionState::ElectionInProgress;
            inner.epoch += 1;
            inner.deferred_at = None;
            inner.epoch
        };

        tracing::info!(
            node_id = %self.shared.node_id,
            priority = self.shared.priority,
            epoch,
            "Starting election"
        );
        self.emit(ElectionEvent::ElectionStarted {
            node_id: self.shared.node_id.clone(),
            priority: self.shared.priority,
            at: chrono::Utc::now(),
        });

        let seniors = self.shared.registry.higher_priority_active(self.shared.priority).await;
        if seniors.is_empty() {
            self.claim_leadership(Some(epoch)).await;
            return Ok(());
        }

        // Arm the timeout before asking anyone
        let engine = self.clone();
        let election_timeout = self.shared.config.election_timeout;
        tokio::spawn(async move {
            sleep(election_timeout).await;
            engine.on_election_timeout(epoch).await;
        });

        let message = Message::Election {
            from_id: self.shared.node_id.clone(),
            from_priority: self.shared.priority,
        };
        let transport = &self.shared.transport;
        let replies = join_all(
            seniors
                .iter()
                .map(|peer| transport.request(&peer.address, message.clone())),
        )
        .await;

        for (peer, reply) in seniors.iter().zip(replies) {
            match reply {
                Ok(Message::ElectionOk { from_id }) => self.handle_ok_message(&from_id).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(node_id = %peer.id, error = %e, "Election message not delivered");
                }
            }
        }

        Ok(())
    }

    async fn on_election_timeout(&self, epoch: u64) {
        let pending = {
            let inner = self.shared.inner.lock().await;
            inner.epoch == epoch && inner.state == ElectionState::ElectionInProgress
        };
        if pending {
            tracing::info!(node_id = %self.shared.node_id, "No senior peer answered, taking over");
            self.claim_leadership(Some(epoch)).await;
        }
    }

    /// Handle `Election` from another node. Returns `true` when this node
    /// outranks the sender, answers `ElectionOk` and runs for itself.
    pub async fn handle_election_message(&self, from_id: &str, from_priority: i64) -> bool {
        if from_priority >= self.shared.priority {
            tracing::debug!(from = %from_id, "Ignoring election from a senior node");
            return false;
        }

        tracing::debug!(from = %from_id, "Outranking election from junior node");

        let engine = self.clone();
        tokio::spawn(async move {
            if engine.is_leader().await {
                engine.announce().await;
            } else if let Err(e) = engine.start_election().await {
                tracing::debug!("Escalation skipped: {}", e);
            }
        });

        true
    }

    /// A senior node took over the election
    pub async fn handle_ok_message(&self, from_id: &str) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == ElectionState::ElectionInProgress {
            tracing::info!(node_id = %self.shared.node_id, senior = %from_id, "Deferring to senior node");
            inner.state = ElectionState::Normal;
            inner.deferred_at = Some(Instant::now());
        }
    }

    /// Become coordinator unconditionally
    pub async fn become_coordinator(&self) {
        self.claim_leadership(None).await;
    }

    /// Take leadership if `epoch` (when given) is still the live election
    async fn claim_leadership(&self, epoch: Option<u64>) {
        let changed = {
            let mut inner = self.shared.inner.lock().await;
            if let Some(epoch) = epoch {
                if inner.epoch != epoch || inner.state != ElectionState::ElectionInProgress {
                    return;
                }
            }
            let changed = inner
                .current_leader
                .as_ref()
                .map_or(true, |leader| leader.id != self.shared.node_id);
            inner.state = ElectionState::Coordinator;
            inner.current_leader = Some(self.self_record());
            inner.deferred_at = None;
            changed
        };

        if changed {
            tracing::info!(
                node_id = %self.shared.node_id,
                priority = self.shared.priority,
                "Became coordinator"
            );
            self.emit(ElectionEvent::LeaderChanged {
                leader: self.self_record(),
            });
        }

        self.announce().await;
    }

    /// Tell every active peer that this node leads
    async fn announce(&self) {
        let peers = self.shared.registry.active_peers().await;
        let message = Message::CoordinatorAnnounce {
            leader_id: self.shared.node_id.clone(),
            priority: self.shared.priority,
            address: self.shared.address.clone(),
        };
        let transport = &self.shared.transport;

        let results = join_all(
            peers
                .iter()
                .map(|peer| transport.notify(&peer.address, message.clone())),
        )
        .await;

        for (peer, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(node_id = %peer.id, error = %e, "Coordinator announcement not delivered");
            }
        }
    }

    /// Accept an announced leader, whatever state we are in
    pub async fn handle_coordinator_announcement(&self, leader_id: &str, priority: i64, address: &str) {
        if leader_id == self.shared.node_id {
            return;
        }

        let registry = &self.shared.registry;
        if registry.register(NodeRecord::new(leader_id, address, priority)).await {
            tracing::info!(node_id = %leader_id, "Learned of new node from announcement");
        }
        registry.record_heartbeat(leader_id).await;

        let leader = match registry.get(leader_id).await {
            Some(record) => record,
            None => {
                let mut record = NodeRecord::new(leader_id, address, priority);
                record.touch();
                record
            }
        };

        let changed = {
            let mut inner = self.shared.inner.lock().await;
            let changed = inner
                .current_leader
                .as_ref()
                .map_or(true, |current| current.id != leader_id);
            inner.state = ElectionState::Normal;
            inner.current_leader = Some(leader.clone());
            inner.deferred_at = None;
            inner.epoch += 1;
            changed
        };

        if changed {
            tracing::info!(node_id = %self.shared.node_id, leader = %leader_id, "New coordinator");
            self.emit(ElectionEvent::LeaderChanged { leader });
        }

        if priority < self.shared.priority {
            tracing::info!(leader = %leader_id, "Announced coordinator is junior, challenging");
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.start_election().await {
                    tracing::debug!("Challenge skipped: {}", e);
                }
            });
        }
    }

    /// Record a heartbeat from a peer. Returns `false` for unknown senders.
    pub async fn handle_heartbeat(&self, from_id: &str) -> bool {
        if !self.shared.registry.record_heartbeat(from_id).await {
            return false;
        }

        let mut inner = self.shared.inner.lock().await;
        if let Some(leader) = inner.current_leader.as_mut() {
            if leader.id == from_id {
                leader.touch();
                leader.status = NodeStatus::Active;
            }
        }
        true
    }

    /// Add a peer. It counts as alive from now on.
    pub async fn register_server(&self, mut record: NodeRecord) -> bool {
        record.touch();
        self.shared.registry.register(record).await
    }

    /// Remove a peer; removing the leader triggers an election
    pub async fn unregister_server(&self, id: &str) -> Result<Option<NodeRecord>> {
        let removed = self.shared.registry.unregister(id).await;
        if removed.is_some() && self.forget_leader_if(id).await {
            tracing::warn!(leader = %id, "Leader unregistered");
            self.start_election_quietly().await;
        }
        Ok(removed)
    }

    /// Set a peer's status. Returns `true` if this triggered an election,
    /// which happens only when the current leader stops being active.
    pub async fn mark_server_status(&self, id: &str, status: NodeStatus) -> Result<bool> {
        if id == self.shared.node_id {
            return Ok(false);
        }
        self.shared.registry.set_status(id, status).await?;

        if status == NodeStatus::Active || !self.forget_leader_if(id).await {
            return Ok(false);
        }

        tracing::warn!(leader = %id, status = %status, "Leader is no longer active");
        self.start_election_quietly().await;
        Ok(true)
    }

    /// Clear the leader if it is `id`
    async fn forget_leader_if(&self, id: &str) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let is_leader = inner.current_leader.as_ref().map_or(false, |l| l.id == id);
        if is_leader {
            inner.current_leader = None;
        }
        is_leader
    }

    async fn start_election_quietly(&self) {
        match self.start_election().await {
            Ok(()) | Err(Error::ElectionAlreadyInProgress) => {}
            Err(e) => tracing::warn!("Election failed to start: {}", e),
        }
    }

    /// First election after startup, jittered so peers started together
    /// do not all broadcast at once
    pub async fn bootstrap(&self) {
        let max_jitter = (self.shared.config.heartbeat_interval.as_millis() / 4) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        sleep(Duration::from_millis(jitter)).await;

        if self.current_leader().await.is_none() {
            self.start_election_quietly().await;
        }
    }

    /// One heartbeat period: ping peers, age the registry, check the leader
    pub async fn heartbeat_round(&self) {
        let registry = &self.shared.registry;
        let peers = registry.peers().await;
        let message = Message::Heartbeat {
            from_id: self.shared.node_id.clone(),
            active_load: registry.get_self().await.map_or(0, |r| r.active_load),
        };
        let transport = &self.shared.transport;

        let results = join_all(
            peers
                .iter()
                .map(|peer| transport.notify(&peer.address, message.clone())),
        )
        .await;

        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.handle_heartbeat(&peer.id).await;
                }
                Err(e) => tracing::debug!(node_id = %peer.id, error = %e, "Heartbeat failed"),
            }
        }

        let config = &self.shared.config;
        let changes = self
            .shared
            .registry
            .check_timeouts(config.suspect_timeout(), config.leader_timeout())
            .await;
        for (id, status) in changes {
            tracing::warn!(node_id = %id, status = %status, "Peer status changed");
        }

        self.check_leader().await;
    }

    async fn check_leader(&self) {
        let (state, leader, deferred_at) = {
            let inner = self.shared.inner.lock().await;
            (inner.state, inner.current_leader.clone(), inner.deferred_at)
        };
        if state != ElectionState::Normal {
            return;
        }

        let leader_timeout = self.shared.config.leader_timeout();
        match leader {
            Some(leader) => {
                let stale = match self.shared.registry.get(&leader.id).await {
                    Some(record) => {
                        record.status == NodeStatus::Dead
                            || record
                                .time_since_heartbeat()
                                .map_or(true, |silence| silence > leader_timeout)
                    }
                    None => true,
                };
                if stale && self.forget_leader_if(&leader.id).await {
                    tracing::warn!(leader = %leader.id, "Leader heartbeat timed out");
                    self.start_election_quietly().await;
                }
            }
            None => {
                let waited_out = deferred_at.map_or(true, |at| at.elapsed() > leader_timeout);
                if waited_out {
                    tracing::info!(node_id = %self.shared.node_id, "No coordinator known");
                    self.start_election_quietly().await;
                }
            }
        }
    }

    /// Start the heartbeat loop
    pub async fn start(&self) {
        let mut worker = self.shared.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let engine = self.clone();
        let period = self.shared.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(node_id = %engine.shared.node_id, "Election heartbeat started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.heartbeat_round().await,
                    _ = stop_rx.changed() => break,
                }
            }

            tracing::info!(node_id = %engine.shared.node_id, "Election heartbeat stopped");
        });

        *worker = Some(Worker { handle, stop });
    }

    /// Stop the heartbeat loop and wait for it
    pub async fn stop(&self) {
        let worker = self.shared.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(true);
            if let Err(e) = worker.handle.await {
                tracing::error!("Election heartbeat panicked: {}", e);
            }
        }
    }

    pub async fn snapshot(&self) -> ElectionStatus {
        let inner = self.shared.inner.lock().await;
        ElectionStatus {
            node_id: self.shared.node_id.clone(),
            priority: self.shared.priority,
            state: inner.state,
            leader: inner.current_leader.clone(),
            epoch: inner.epoch,
        }
    }
}

#[async_trait]
impl RequestHandler for BullyElection {
    async fn handle(&self, _peer: &str, message: Message) -> Message {
        match message {
            Message::Election { from_id, from_priority } => {
                if self.handle_election_message(&from_id, from_priority).await {
                    Message::ElectionOk {
                        from_id: self.shared.node_id.clone(),
                    }
                } else {
                    Message::Ack
                }
            }
            Message::ElectionOk { from_id } => {
                self.handle_ok_message(&from_id).await;
                Message::Ack
            }
            Message::CoordinatorAnnounce { leader_id, priority, address } => {
                self.handle_coordinator_announcement(&leader_id, priority, &address)
                    .await;
                Message::Ack
            }
            Message::Heartbeat { from_id, active_load } => {
                if self.handle_heartbeat(&from_id).await {
                    if let Err(e) = self.shared.registry.set_load(&from_id, active_load).await {
                        tracing::debug!(node_id = %from_id, error = %e, "Load not recorded");
                    }
                }
                Message::Ack
            }
            other => Message::Error {
                code: ErrorCode::Unsupported,
                message: format!("election does not handle {}", other.type_name()),
            },
        }
    }
}
