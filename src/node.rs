//! Node Runtime
//!
//! Wires one exam node together: registry, clock, election, cluster
//! server, exam store and HTTP API, plus the tasks that keep them running.

use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::clock::{self, BerkeleyClock, ClockRole, ClockSettings};
use crate::config::FleetConfig;
use crate::election::{BullyElection, ElectionConfig};
use crate::exam::{api, ExamConfig, ExamStore};
use crate::http;
use crate::network::{NetworkClient, NetworkServer, RequestHandler};
use crate::protocol::Message;
use crate::state::{NodeRecord, NodeRegistry};
use crate::error::Result;

/// Routes inbound cluster messages to the clock or the election engine
pub struct ClusterHandler {
    clock: BerkeleyClock,
    election: BullyElection,
}

impl ClusterHandler {
    pub fn new(clock: BerkeleyClock, election: BullyElection) -> Self {
        Self { clock, election }
    }
}

#[async_trait]
impl RequestHandler for ClusterHandler {
    async fn handle(&self, peer: &str, message: Message) -> Message {
        match message {
            Message::TimeRequest | Message::TimeAdjust { .. } => self.clock.handle(peer, message).await,
            _ => self.election.handle(peer, message).await,
        }
    }
}

/// A running exam node
pub struct NodeRuntime {
    node_id: String,
    cluster_addr: SocketAddr,
    api_addr: SocketAddr,
    clock: BerkeleyClock,
    election: BullyElection,
    store: Arc<ExamStore>,
    /// Stops the HTTP API
    shutdown: watch::Sender<bool>,
    /// Stops the cluster server
    network_stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRuntime {
    /// Bind both listeners, start every loop and kick off the first election
    pub async fn start(config: &FleetConfig) -> Result<Self> {
        let node_id = config.node.id.clone();

        let cluster_listener = TcpListener::bind(&config.node.bind_address).await?;
        let api_listener = TcpListener::bind(&config.api.bind_address).await?;
        let cluster_addr = cluster_listener.local_addr()?;
        let api_addr = api_listener.local_addr()?;

        let advertise = config
            .node
            .advertise_address
            .clone()
            .unwrap_or_else(|| cluster_addr.to_string());
        let self_record = NodeRecord::new(node_id.clone(), advertise, config.node.priority);
        let registry = Arc::new(NodeRegistry::new(self_record.clone()));
        let transport = Arc::new(NetworkClient::new(config.peer_timeout(), config.peer_timeout()));

        let clock = BerkeleyClock::new(
            node_id.clone(),
            ClockRole::Participant,
            ClockSettings {
                sync_interval: config.sync_interval(),
                request_timeout: config.clock_request_timeout(),
            },
            Arc::clone(&registry),
            transport.clone(),
        );

        let election = BullyElection::new(
            &self_record,
            ElectionConfig {
                election_timeout: config.election_timeout(),
                heartbeat_interval: config.heartbeat_interval(),
            },
            Arc::clone(&registry),
            transport,
        );

        for peer in &config.cluster.peers {
            election
                .register_server(NodeRecord::new(peer.id.clone(), peer.address.clone(), peer.priority))
                .await;
        }

        let known = registry.size().await;
        if known != config.cluster.server_count {
            tracing::warn!(
                known,
                expected = config.cluster.server_count,
                "Configured peers do not match server_count"
            );
        }

        let store = Arc::new(
            ExamStore::new(
                node_id.clone(),
                clock.clone(),
                ExamConfig::from_defaults(&config.exam),
            )
            .with_registry(Arc::clone(&registry)),
        );

        let mut tasks = Vec::new();

        // Cluster server
        let handler = Arc::new(ClusterHandler::new(clock.clone(), election.clone()));
        let server = NetworkServer::from_listener(cluster_listener, handler);
        let network_stop = server.shutdown_handle();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Cluster server error: {}", e);
            }
        }));

        // HTTP API
        let (shutdown, shutdown_rx) = watch::channel(false);
        let app = http::with_layers(
            api::router(Arc::new(api::AppState {
                node_id: node_id.clone(),
                store: Arc::clone(&store),
                clock: clock.clone(),
                election: election.clone(),
            })),
            config.api.cors_enabled,
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::serve(api_listener, app, shutdown_rx).await {
                tracing::error!("HTTP API error: {}", e);
            }
        }));

        // Clock role follows leadership
        tasks.push(tokio::spawn(clock::follow_leadership(clock.clone(), election.subscribe())));

        clock.start().await;
        election.start().await;

        let bootstrap = election.clone();
        tasks.push(tokio::spawn(async move { bootstrap.bootstrap().await }));

        tracing::info!(
            node_id = %node_id,
            priority = config.node.priority,
            cluster = %cluster_addr,
            api = %api_addr,
            "Node started"
        );

        Ok(Self {
            node_id,
            cluster_addr,
            api_addr,
            clock,
            election,
            store,
            shutdown,
            network_stop,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bound cluster (TCP) address
    pub fn cluster_addr(&self) -> SocketAddr {
        self.cluster_addr
    }

    /// Bound HTTP API address
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn clock(&self) -> &BerkeleyClock {
        &self.clock
    }

    pub fn election(&self) -> &BullyElection {
        &self.election
    }

    pub fn store(&self) -> &Arc<ExamStore> {
        &self.store
    }

    /// Stop every loop and server, waiting for them to exit
    pub async fn shutdown(&self) {
        tracing::info!(node_id = %self.node_id, "Shutting down");

        let _ = self.network_stop.send(true);
        let _ = self.shutdown.send(true);
        self.election.stop().await;
        self.clock.stop().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            // The leadership follower only ends with the event channel
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!("Node task panicked: {}", e);
                }
            }
        }

        tracing::info!(node_id = %self.node_id, "Node stopped");
    }
}
