//! Node Registry
//!
//! Tracks the known exam nodes, their Bully priority, liveness and load.
//! Mutated by the election engine; read by the clock coordinator and the
//! load balancer.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Liveness of a node as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Heard from recently
    Active,
    /// Missed heartbeats, still eligible to come back
    Suspected,
    /// Silent past the dead timeout
    Dead,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "ACTIVE"),
            NodeStatus::Suspected => write!(f, "SUSPECTED"),
            NodeStatus::Dead => write!(f, "DEAD"),
        }
    }
}

/// A single node known to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique node identifier
    pub id: String,
    /// Cluster address (host:port)
    pub address: String,
    /// Bully priority, higher is more senior
    pub priority: i64,
    /// Current status
    pub status: NodeStatus,
    /// Last heartbeat time (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
    /// Active exam sessions last reported by the node
    pub active_load: u64,
    /// When the node was registered
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

impl NodeRecord {
    /// Create a new record, assumed active until proven otherwise
    pub fn new(id: impl Into<String>, address: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            priority,
            status: NodeStatus::Active,
            last_heartbeat: None,
            active_load: 0,
            registered_at: chrono::Utc::now(),
        }
    }

    /// Update heartbeat time
    pub fn touch(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }

    /// Time since last heartbeat
    pub fn time_since_heartbeat(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

/// Registry of cluster nodes, including this one
pub struct NodeRegistry {
    /// This node's ID
    node_id: String,
    /// All known nodes (including self)
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeRegistry {
    /// Create a registry seeded with this node's own record
    pub fn new(self_record: NodeRecord) -> Self {
        let node_id = self_record.id.clone();
        let mut self_record = self_record;
        self_record.status = NodeStatus::Active;
        self_record.touch();

        let mut nodes = HashMap::new();
        nodes.insert(node_id.clone(), self_record);

        Self {
            node_id,
            nodes: RwLock::new(nodes),
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register a node. Returns `true` if it was not known before.
    ///
    /// Re-registering keeps the liveness history but takes the new
    /// address and priority.
    pub async fn register(&self, record: NodeRecord) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&record.id) {
            Some(existing) => {
                existing.address = record.address;
                existing.priority = record.priority;
                false
            }
            None => {
                tracing::debug!(node_id = %record.id, priority = record.priority, "Registered node");
                nodes.insert(record.id.clone(), record);
                true
            }
        }
    }

    /// Remove a node
    pub async fn unregister(&self, id: &str) -> Option<NodeRecord> {
        if id == self.node_id {
            return None;
        }
        self.nodes.write().await.remove(id)
    }

    /// Get a node's record
    pub async fn get(&self, id: &str) -> Option<NodeRecord> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Get this node's record
    pub async fn get_self(&self) -> Option<NodeRecord> {
        self.get(&self.node_id).await
    }

    /// Update a node's record
    pub async fn update<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut NodeRecord),
    {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(id) {
            Some(node) => {
                f(node);
                Ok(())
            }
            None => Err(Error::NodeNotFound(id.to_string())),
        }
    }

    /// Record a heartbeat from a node, reviving it if it was suspected or dead.
    /// Returns `false` if the node is unknown.
    pub async fn record_heartbeat(&self, id: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(id) {
            Some(node) => {
                node.touch();
                if node.status != NodeStatus::Active {
                    tracing::info!(node_id = %id, previous = %node.status, "Node is back");
                    node.status = NodeStatus::Active;
                }
                true
            }
            None => {
                tracing::trace!(node_id = %id, "Heartbeat from unregistered node");
                false
            }
        }
    }

    /// Force a node's status
    pub async fn set_status(&self, id: &str, status: NodeStatus) -> Result<()> {
        self.update(id, |node| node.status = status).await
    }

    /// Store the load last reported for a node
    pub async fn set_load(&self, id: &str, active_load: u64) -> Result<()> {
        self.update(id, |node| node.active_load = active_load).await
    }

    /// Demote silent nodes: `suspect_after` without a heartbeat makes an
    /// active node suspected, `dead_after` makes any node dead.
    ///
    /// Nodes we never heard from are left alone.
    pub async fn check_timeouts(
        &self,
        suspect_after: Duration,
        dead_after: Duration,
    ) -> Vec<(String, NodeStatus)> {
        let mut nodes = self.nodes.write().await;
        let mut changed = Vec::new();

        for (id, node) in nodes.iter_mut() {
            if id == &self.node_id {
                continue;
            }

            let Some(silence) = node.time_since_heartbeat() else {
                continue;
            };

            let next = if silence > dead_after {
                NodeStatus::Dead
            } else if silence > suspect_after && node.status == NodeStatus::Active {
                NodeStatus::Suspected
            } else {
                node.status
            };

            if next != node.status {
                node.status = next;
                changed.push((id.clone(), next));
            }
        }

        changed
    }

    /// All nodes except this one
    pub async fn peers(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.id != self.node_id)
            .cloned()
            .collect()
    }

    /// Active nodes except this one
    pub async fn active_peers(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.id != self.node_id && n.is_active())
            .cloned()
            .collect()
    }

    /// Active peers that outrank `priority`
    pub async fn higher_priority_active(&self, priority: i64) -> Vec<NodeRecord> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.id != self.node_id && n.is_active() && n.priority > priority)
            .cloned()
            .collect()
    }

    /// Ids of nodes currently considered dead
    pub async fn dead_ids(&self) -> Vec<String> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.status == NodeStatus::Dead)
            .map(|n| n.id.clone())
            .collect()
    }

    /// All nodes, most senior first
    pub async fn all_nodes(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes.read().await;
        let mut all: Vec<NodeRecord> = nodes.values().cloned().collect();
        all.sort_by(|a, b| b.priority.cmp(&a.priority));
        all
    }

    /// Get the registry size (including self)
    pub async fn size(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Count nodes per status
    pub async fn summary(&self) -> RegistrySummary {
        let nodes = self.nodes.read().await;
        let mut summary = RegistrySummary {
            total_nodes: nodes.len(),
            active_nodes: 0,
            suspected_nodes: 0,
            dead_nodes: 0,
        };

        for node in nodes.values() {
            match node.status {
                NodeStatus::Active => summary.active_nodes += 1,
                NodeStatus::Suspected => summary.suspected_nodes += 1,
                NodeStatus::Dead => summary.dead_nodes += 1,
            }
        }

        summary
    }
}

/// Registry summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub suspected_nodes: usize,
    pub dead_nodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(NodeRecord::new("S2", "127.0.0.1:7702", 2))
    }

    #[tokio::test]
    async fn test_register_and_priorities() {
        let registry = registry();
        assert!(registry.register(NodeRecord::new("S1", "127.0.0.1:7701", 1)).await);
        assert!(registry.register(NodeRecord::new("S3", "127.0.0.1:7703", 3)).await);
        assert!(!registry.register(NodeRecord::new("S3", "127.0.0.1:7803", 3)).await);

        assert_eq!(registry.size().await, 3);
        assert_eq!(registry.peers().await.len(), 2);

        let higher = registry.higher_priority_active(2).await;
        assert_eq!(higher.len(), 1);
        assert_eq!(higher[0].id, "S3");
        assert_eq!(higher[0].address, "127.0.0.1:7803");

        let ordered: Vec<String> = registry.all_nodes().await.into_iter().map(|n| n.id).collect();
        assert_eq!(ordered, vec!["S3", "S2", "S1"]);
    }

    #[tokio::test]
    async fn test_suspected_nodes_are_not_candidates() {
        let registry = registry();
        registry.register(NodeRecord::new("S3", "127.0.0.1:7703", 3)).await;
        registry.set_status("S3", NodeStatus::Suspected).await.unwrap();

        assert!(registry.higher_priority_active(2).await.is_empty());

        // A heartbeat revives it
        assert!(registry.record_heartbeat("S3").await);
        assert_eq!(registry.higher_priority_active(2).await.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_and_timeout() {
        let registry = registry();
        registry.register(NodeRecord::new("S1", "127.0.0.1:7701", 1)).await;
        registry.register(NodeRecord::new("S3", "127.0.0.1:7703", 3)).await;
        registry.record_heartbeat("S1").await;

        tokio::time::sleep(Duration::from_millis(60)).await;

        let changed = registry
            .check_timeouts(Duration::from_millis(20), Duration::from_millis(500))
            .await;
        // S3 never sent a heartbeat, so only S1 is demoted
        assert_eq!(changed, vec![("S1".to_string(), NodeStatus::Suspected)]);

        let changed = registry
            .check_timeouts(Duration::from_millis(20), Duration::from_millis(40))
            .await;
        assert_eq!(changed, vec![("S1".to_string(), NodeStatus::Dead)]);
        assert_eq!(registry.dead_ids().await, vec!["S1".to_string()]);

        let summary = registry.summary().await;
        assert_eq!(summary.total_nodes, 3);
        assert_eq!(summary.active_nodes, 2);
        assert_eq!(summary.dead_nodes, 1);
    }

    #[tokio::test]
    async fn test_self_cannot_be_unregistered() {
        let registry = registry();
        assert!(registry.unregister("S2").await.is_none());
        assert!(registry.get_self().await.is_some());
        assert!(matches!(
            registry.set_load("nope", 3).await,
            Err(Error::NodeNotFound(_))
        ));
    }
}
