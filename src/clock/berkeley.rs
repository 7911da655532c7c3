//! Berkeley Clock Synchronization
//!
//! Each node keeps a signed offset on top of its wall clock. The
//! coordinator polls every participant, averages the reported offsets
//! (itself counting as zero) and pushes per-node corrections so the
//! whole cluster converges on the mean rather than on any single clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::network::{PeerTransport, RequestHandler};
use crate::protocol::{ErrorCode, Message};
use crate::state::NodeRegistry;
use crate::error::{Error, Result};

/// Seconds since the Unix epoch
pub type Timestamp = f64;

/// Uncorrected wall clock
pub fn wall_clock() -> Timestamp {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Mean of the participant offsets with the coordinator's own zero included
pub fn average_offset(offsets: &[f64]) -> f64 {
    let sum: f64 = offsets.iter().sum();
    sum / (offsets.len() + 1) as f64
}

/// Role of this node in clock synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockRole {
    Coordinator,
    Participant,
}

impl std::fmt::Display for ClockRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockRole::Coordinator => write!(f, "COORDINATOR"),
            ClockRole::Participant => write!(f, "PARTICIPANT"),
        }
    }
}

/// Offset measured for one participant in the current round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeOffset {
    pub node_id: String,
    /// Participant time minus coordinator send time, in seconds
    pub offset: f64,
    /// Round trip time in seconds
    pub round_trip_time: f64,
}

/// Outcome of one coordinator round
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub average_offset: f64,
    pub samples: Vec<TimeOffset>,
    /// Participants that did not answer in time
    pub unreachable: Vec<String>,
}

/// Clock synchronization settings
#[derive(Debug, Clone)]
pub struct ClockSettings {
    pub sync_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Point-in-time view for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ClockStatus {
    pub node_id: String,
    pub role: ClockRole,
    pub offset: f64,
    pub now: Timestamp,
    pub last_sync: Option<Timestamp>,
    pub last_round: Vec<TimeOffset>,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

struct ClockShared {
    node_id: String,
    /// f64 bits of the offset; written only under `sync_lock`
    offset_bits: AtomicU64,
    /// Serializes offset mutations from rounds and adjustments
    sync_lock: Mutex<()>,
    last_sync: RwLock<Option<Timestamp>>,
    last_round: RwLock<Vec<TimeOffset>>,
    role: RwLock<ClockRole>,
    /// Running loop, if any. Also serializes role switches.
    worker: Mutex<Option<Worker>>,
    settings: ClockSettings,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn PeerTransport>,
}

/// Per-node Berkeley clock. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BerkeleyClock {
    shared: Arc<ClockShared>,
}

impl BerkeleyClock {
    /// Create a clock with zero offset in the given role. The loop is not
    /// running until [`BerkeleyClock::start`].
    pub fn new(
        node_id: impl Into<String>,
        role: ClockRole,
        settings: ClockSettings,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            shared: Arc::new(ClockShared {
                node_id: node_id.into(),
                offset_bits: AtomicU64::new(0f64.to_bits()),
                sync_lock: Mutex::new(()),
                last_sync: RwLock::new(None),
                last_round: RwLock::new(Vec::new()),
                role: RwLock::new(role),
                worker: Mutex::new(None),
                settings,
                registry,
                transport,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// Current offset from the wall clock, in seconds
    pub fn offset(&self) -> f64 {
        f64::from_bits(self.shared.offset_bits.load(Ordering::Acquire))
    }

    fn store_offset(&self, offset: f64) {
        self.shared.offset_bits.store(offset.to_bits(), Ordering::Release);
    }

    /// Synchronized current time. Never blocks.
    pub fn now(&self) -> Timestamp {
        wall_clock() + self.offset()
    }

    /// Time left until `deadline`, zero once it has passed
    pub fn get_time_remaining(&self, deadline: Timestamp) -> Duration {
        let remaining = deadline - self.now();
        if remaining.is_finite() && remaining > 0.0 {
            Duration::from_secs_f64(remaining)
        } else {
            Duration::ZERO
        }
    }

    pub async fn role(&self) -> ClockRole {
        *self.shared.role.read().await
    }

    pub async fn last_sync(&self) -> Option<Timestamp> {
        *self.shared.last_sync.read().await
    }

    /// Apply a correction pushed by the coordinator
    pub async fn apply_adjustment(&self, amount: f64) {
        let _guard = self.shared.sync_lock.lock().await;
        let offset = self.offset() + amount;
        self.store_offset(offset);
        *self.shared.last_sync.write().await = Some(wall_clock());

        tracing::debug!(
            node_id = %self.shared.node_id,
            amount,
            offset,
            "Applied clock adjustment"
        );
    }

    /// Run one Berkeley round: poll, average, push corrections, adopt the average.
    pub async fn run_coordinator_round(&self) -> Result<RoundReport> {
        let _guard = self.shared.sync_lock.lock().await;

        let participants = self.shared.registry.peers().await;
        let request_timeout = self.shared.settings.request_timeout;
        let transport = &self.shared.transport;

        let polls = participants.iter().map(|peer| async move {
            let send_time = wall_clock();
            let started = Instant::now();
            let reply = timeout(request_timeout, transport.time_request(&peer.address)).await;
            let round_trip_time = started.elapsed().as_secs_f64();

            match reply {
                Ok(Ok(local_time)) => Ok((
                    peer.address.clone(),
                    TimeOffset {
                        node_id: peer.id.clone(),
                        offset: local_time - send_time,
                        round_trip_time,
                    },
                )),
                Ok(Err(e)) => Err((peer.id.clone(), e)),
                Err(_) => Err((peer.id.clone(), Error::Timeout(peer.address.clone()))),
            }
        });

        let mut responders = Vec::new();
        let mut unreachable = Vec::new();
        for result in join_all(polls).await {
            match result {
                Ok(sample) => responders.push(sample),
                Err((node_id, e)) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Skipping participant this round");
                    unreachable.push(node_id);
                }
            }
        }

        // Nobody answered: keep the current offset, no corrections
        if responders.is_empty() {
            tracing::debug!(
                node_id = %self.shared.node_id,
                unreachable = unreachable.len(),
                "No participant answered, offset unchanged"
            );
            self.shared.last_round.write().await.clear();
            return Ok(RoundReport {
                average_offset: self.offset(),
                samples: Vec::new(),
                unreachable,
            });
        }

        let offsets: Vec<f64> = responders.iter().map(|(_, s)| s.offset).collect();
        let average = average_offset(&offsets);

        let corrections = responders.iter().map(|(address, sample)| async move {
            let amount = average - sample.offset;
            let result = timeout(
                request_timeout,
                transport.notify(address, Message::TimeAdjust { amount }),
            )
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(node_id = %sample.node_id, error = %e, "Failed to send clock adjustment")
                }
                Err(_) => {
                    tracing::warn!(node_id = %sample.node_id, "Clock adjustment timed out")
                }
            }
        });
        join_all(corrections).await;

        self.store_offset(average);
        *self.shared.last_sync.write().await = Some(wall_clock());

        let samples: Vec<TimeOffset> = responders.into_iter().map(|(_, s)| s).collect();
        *self.shared.last_round.write().await = samples.clone();

        tracing::debug!(
            node_id = %self.shared.node_id,
            average_offset = average,
            responders = samples.len(),
            unreachable = unreachable.len(),
            "Clock sync round complete"
        );

        Ok(RoundReport {
            average_offset: average,
            samples,
            unreachable,
        })
    }

    /// Start the synchronization loop for the current role
    pub async fn start(&self) {
        let mut worker = self.shared.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let role = *self.shared.role.read().await;
        *worker = Some(self.spawn_loop(role));
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(&self) {
        let worker = self.shared.worker.lock().await.take();
        if let Some(worker) = worker {
            Self::join_worker(worker).await;
        }
    }

    /// Switch role. A running loop is stopped, awaited and restarted under
    /// the new role so two loops never overlap.
    pub async fn set_role(&self, new_role: ClockRole) {
        let mut worker = self.shared.worker.lock().await;
        let current = *self.shared.role.read().await;
        if current == new_role {
            return;
        }

        tracing::info!(node_id = %self.shared.node_id, from = %current, to = %new_role, "Switching clock role");

        let was_running = match worker.take() {
            Some(old) => {
                Self::join_worker(old).await;
                true
            }
            None => false,
        };

        *self.shared.role.write().await = new_role;

        if was_running {
            *worker = Some(self.spawn_loop(new_role));
        }
    }

    async fn join_worker(worker: Worker) {
        let _ = worker.stop.send(true);
        if let Err(e) = worker.handle.await {
            tracing::error!("Clock loop panicked: {}", e);
        }
    }

    fn spawn_loop(&self, role: ClockRole) -> Worker {
        let (stop, stop_rx) = watch::channel(false);
        let clock = self.clone();
        let handle = tokio::spawn(async move { clock.run_loop(role, stop_rx).await });
        Worker { handle, stop }
    }

    async fn run_loop(self, role: ClockRole, mut stop: watch::Receiver<bool>) {
        let sync_interval = self.shared.settings.sync_interval;
        let mut ticker = interval(sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(node_id = %self.shared.node_id, role = %role, "Clock sync loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match role {
                        ClockRole::Coordinator => {
                            if let Err(e) = self.run_coordinator_round().await {
                                tracing::warn!("Clock sync round failed: {}", e);
                            }
                        }
                        ClockRole::Participant => {
                            self.check_staleness().await;
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }

        tracing::info!(node_id = %self.shared.node_id, role = %role, "Clock sync loop stopped");
    }

    /// Participants only watch for a coordinator that went quiet.
    /// Returns `true` when no correction arrived for 3 sync intervals.
    async fn check_staleness(&self) -> bool {
        let limit = self.shared.settings.sync_interval.as_secs_f64() * 3.0;
        let Some(last) = self.last_sync().await else {
            return false;
        };

        let silent_for = wall_clock() - last;
        let stale = silent_for > limit;
        if stale {
            tracing::warn!(
                node_id = %self.shared.node_id,
                silent_for,
                "No clock correction received recently"
            );
        }
        stale
    }

    pub async fn snapshot(&self) -> ClockStatus {
        ClockStatus {
            node_id: self.shared.node_id.clone(),
            role: self.role().await,
            offset: self.offset(),
            now: self.now(),
            last_sync: self.last_sync().await,
            last_round: self.shared.last_round.read().await.clone(),
        }
    }
}

#[async_trait]
impl RequestHandler for BerkeleyClock {
    async fn handle(&self, _peer: &str, message: Message) -> Message {
        match message {
            Message::TimeRequest => Message::TimeResponse {
                node_id: self.shared.node_id.clone(),
                local_time: self.now(),
            },
            Message::TimeAdjust { amount } => {
                self.apply_adjustment(amount).await;
                Message::Ack
            }
            other => Message::Error {
                code: ErrorCode::Unsupported,
                message: format!("clock does not handle {}", other.type_name()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::loopback::LoopbackTransport;
    use crate::state::NodeRecord;

    /// Participant whose clock runs `skew` seconds ahead and that records
    /// the corrections it receives.
    struct SkewedParticipant {
        skew: f64,
        adjustments: RwLock<Vec<f64>>,
    }

    #[async_trait]
    impl RequestHandler for SkewedParticipant {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::TimeRequest => Message::TimeResponse {
                    node_id: "skewed".into(),
                    local_time: wall_clock() + self.skew,
                },
                Message::TimeAdjust { amount } => {
                    self.adjustments.write().await.push(amount);
                    Message::Ack
                }
                _ => Message::Ack,
            }
        }
    }

    fn fast_settings() -> ClockSettings {
        ClockSettings {
            sync_interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(200),
        }
    }

    async fn coordinator_with(
        skews: &[(&str, f64)],
    ) -> (BerkeleyClock, Vec<Arc<SkewedParticipant>>, Arc<LoopbackTransport>) {
        let transport = LoopbackTransport::new();
        let registry = Arc::new(NodeRegistry::new(NodeRecord::new("C", "c:1", 10)));
        let mut participants = Vec::new();

        for (i, (id, skew)) in skews.iter().enumerate() {
            let address = format!("p{}:1", i);
            registry.register(NodeRecord::new(*id, address.clone(), i as i64)).await;
            let participant = Arc::new(SkewedParticipant {
                skew: *skew,
                adjustments: RwLock::new(Vec::new()),
            });
            transport.attach(&address, participant.clone()).await;
            participants.push(participant);
        }

        let clock = BerkeleyClock::new(
            "C",
            ClockRole::Coordinator,
            fast_settings(),
            registry,
            transport.clone(),
        );
        (clock, participants, transport)
    }

    #[test]
    fn test_average_offset_includes_coordinator() {
        assert_eq!(average_offset(&[2.0, -2.0]), 0.0);
        assert_eq!(average_offset(&[4.0, 2.0]), 2.0);
        assert_eq!(average_offset(&[]), 0.0);
    }

    #[tokio::test]
    async fn test_round_averages_and_corrects() {
        let (clock, participants, _) = coordinator_with(&[("P1", 4.0), ("P2", 2.0)]).await;

        let report = clock.run_coordinator_round().await.unwrap();
        assert!((report.average_offset - 2.0).abs() < 0.1);
        assert!((clock.offset() - 2.0).abs() < 0.1);
        assert_eq!(report.samples.len(), 2);
        assert!(report.unreachable.is_empty());

        // P1 is two seconds ahead of the average, P2 is on it
        let p1 = participants[0].adjustments.read().await.clone();
        let p2 = participants[1].adjustments.read().await.clone();
        assert_eq!(p1.len(), 1);
        assert!((p1[0] + 2.0).abs() < 0.1);
        assert!(p2[0].abs() < 0.1);
    }

    #[tokio::test]
    async fn test_unreachable_participant_is_skipped() {
        let (clock, participants, transport) =
            coordinator_with(&[("P1", 2.0), ("P2", -2.0), ("P3", 30.0)]).await;
        transport.take_down("p2:1").await;

        let report = clock.run_coordinator_round().await.unwrap();
        assert_eq!(report.unreachable, vec!["P3".to_string()]);
        // mean of {0, 2, -2}
        assert!(report.average_offset.abs() < 0.1);
        assert!(participants[2].adjustments.read().await.is_empty());

        // Still registered; the next round will try again
        assert_eq!(clock.shared.registry.peers().await.len(), 3);
    }

    #[tokio::test]
    async fn test_round_without_responders_keeps_offset() {
        let (clock, participants, transport) = coordinator_with(&[("P1", 5.0)]).await;
        // Corrected while it was still a participant
        clock.apply_adjustment(3.0).await;
        transport.take_down("p0:1").await;

        let report = clock.run_coordinator_round().await.unwrap();
        assert_eq!(report.unreachable, vec!["P1".to_string()]);
        assert!(report.samples.is_empty());
        assert_eq!(clock.offset(), 3.0);
        assert_eq!(report.average_offset, 3.0);
        assert!(participants[0].adjustments.read().await.is_empty());

        // Alone in the cluster behaves the same
        let registry = Arc::new(NodeRegistry::new(NodeRecord::new("L", "l:1", 1)));
        let lone = BerkeleyClock::new(
            "L",
            ClockRole::Coordinator,
            fast_settings(),
            registry,
            LoopbackTransport::new(),
        );
        lone.apply_adjustment(-1.5).await;
        let report = lone.run_coordinator_round().await.unwrap();
        assert!(report.unreachable.is_empty());
        assert_eq!(lone.offset(), -1.5);
    }

    #[tokio::test]
    async fn test_quiet_coordinator_is_reported_stale() {
        let registry = Arc::new(NodeRegistry::new(NodeRecord::new("P", "p:1", 1)));
        let clock = BerkeleyClock::new(
            "P",
            ClockRole::Participant,
            fast_settings(),
            registry,
            LoopbackTransport::new(),
        );

        // Never synced yet is not stale
        assert!(!clock.check_staleness().await);

        clock.apply_adjustment(0.25).await;
        assert!(!clock.check_staleness().await);

        // Last correction a minute ago, limit is 3 x 50ms
        *clock.shared.last_sync.write().await = Some(wall_clock() - 60.0);
        assert!(clock.check_staleness().await);
        assert_eq!(clock.offset(), 0.25);
    }

    #[tokio::test]
    async fn test_participant_applies_adjustments() {
        let registry = Arc::new(NodeRegistry::new(NodeRecord::new("P", "p:1", 1)));
        let clock = BerkeleyClock::new(
            "P",
            ClockRole::Participant,
            fast_settings(),
            registry,
            LoopbackTransport::new(),
        );
        assert!(clock.last_sync().await.is_none());

        let reply = clock.handle("c", Message::TimeAdjust { amount: 1.5 }).await;
        assert_eq!(reply, Message::Ack);
        clock.apply_adjustment(-0.5).await;

        assert!((clock.offset() - 1.0).abs() < 1e-9);
        assert!(clock.last_sync().await.is_some());

        match clock.handle("c", Message::TimeRequest).await {
            Message::TimeResponse { local_time, .. } => {
                assert!((local_time - (wall_clock() + 1.0)).abs() < 0.1)
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_time_remaining_never_negative() {
        let registry = Arc::new(NodeRegistry::new(NodeRecord::new("P", "p:1", 1)));
        let clock = BerkeleyClock::new(
            "P",
            ClockRole::Participant,
            fast_settings(),
            registry,
            LoopbackTransport::new(),
        );

        assert_eq!(clock.get_time_remaining(clock.now() - 3600.0), Duration::ZERO);
        assert_eq!(clock.get_time_remaining(0.0), Duration::ZERO);

        let remaining = clock.get_time_remaining(clock.now() + 60.0);
        assert!(remaining > Duration::from_secs(59));

        // A forward correction eats into the remaining time
        clock.apply_adjustment(30.0).await;
        let remaining_after = clock.get_time_remaining(clock.now() - 30.0 + 60.0);
        assert!(remaining_after <= Duration::from_secs(31));
    }

    #[tokio::test]
    async fn test_role_switch_restarts_loop() {
        let (clock, participants, _) = coordinator_with(&[("P1", 4.0)]).await;
        clock.set_role(ClockRole::Participant).await;
        clock.start().await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        // Participants never poll
        assert!(participants[0].adjustments.read().await.is_empty());

        clock.set_role(ClockRole::Coordinator).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!participants[0].adjustments.read().await.is_empty());
        assert_eq!(clock.role().await, ClockRole::Coordinator);

        clock.stop().await;
        let rounds = participants[0].adjustments.read().await.len();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(participants[0].adjustments.read().await.len(), rounds);
    }
}
