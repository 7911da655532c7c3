//! End-to-end tests: real nodes talking over localhost TCP and HTTP.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use examfleet::balancer::{Backend, HttpBackendClient, LoadBalancer};
use examfleet::clock::ClockRole;
use examfleet::config::{BackendConfig, BalancerConfig, FleetConfig};
use examfleet::node::NodeRuntime;
use examfleet::state::NodeRecord;

fn node_config(id: &str, priority: i64) -> FleetConfig {
    let toml = format!(
        r#"
[node]
id = "{id}"
bind_address = "127.0.0.1:0"
priority = {priority}

[cluster]
server_count = 3
election_timeout_ms = 300
heartbeat_interval_ms = 100
peer_timeout_ms = 200

[clock]
sync_interval_ms = 200
request_timeout_ms = 200

[api]
bind_address = "127.0.0.1:0"

[exam]
capacity = 5
"#
    );
    FleetConfig::from_str(&toml).unwrap()
}

/// Start S1..S3 (priorities 1..3) and make them known to each other
async fn start_cluster() -> Vec<NodeRuntime> {
    let mut nodes = Vec::new();
    for priority in 1..=3 {
        let id = format!("S{}", priority);
        nodes.push(NodeRuntime::start(&node_config(&id, priority)).await.unwrap());
    }

    for node in &nodes {
        for (priority, peer) in nodes.iter().enumerate() {
            if peer.node_id() == node.node_id() {
                continue;
            }
            node.election()
                .register_server(NodeRecord::new(
                    peer.node_id(),
                    peer.cluster_addr().to_string(),
                    priority as i64 + 1,
                ))
                .await;
        }
    }

    nodes
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn leader_of(node: &NodeRuntime) -> Option<String> {
    node.election().current_leader().await.map(|l| l.id)
}

async fn all_agree(nodes: &[&NodeRuntime], leader: &str) -> bool {
    for node in nodes {
        if leader_of(node).await.as_deref() != Some(leader) {
            return false;
        }
    }
    true
}

#[tokio::test]
async fn test_cluster_elects_highest_and_fails_over() {
    let nodes = start_cluster().await;
    let (s1, s2, s3) = (&nodes[0], &nodes[1], &nodes[2]);

    // A junior node's election ends with the most senior node in charge
    let _ = s1.election().start_election().await;
    let all = [s1, s2, s3];
    wait_for("S3 to lead", || all_agree(&all, "S3")).await;
    wait_for("S3 clock to coordinate", || async {
        s3.clock().role().await == ClockRole::Coordinator
    })
    .await;
    assert!(s3.election().is_leader().await);
    assert_eq!(s1.clock().role().await, ClockRole::Participant);

    // The HTTP API reports the same leader
    let metrics: serde_json::Value = reqwest::get(format!("http://{}/metrics", s1.api_addr()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["node_id"], "S1");
    assert_eq!(metrics["leader_id"], "S3");

    // Losing the leader hands coordination to the next in line
    s3.shutdown().await;
    let survivors = [s1, s2];
    wait_for("S2 to take over", || all_agree(&survivors, "S2")).await;
    wait_for("S2 clock to coordinate", || async {
        s2.clock().role().await == ClockRole::Coordinator
    })
    .await;
    assert_eq!(s1.clock().role().await, ClockRole::Participant);

    s1.shutdown().await;
    s2.shutdown().await;
}

#[tokio::test]
async fn test_clock_rounds_reach_participants() {
    let nodes = start_cluster().await;
    let (s1, s2, s3) = (&nodes[0], &nodes[1], &nodes[2]);

    let _ = s1.election().start_election().await;
    let all = [s1, s2, s3];
    wait_for("S3 to lead", || all_agree(&all, "S3")).await;

    wait_for("participants to sync", || async {
        s1.clock().last_sync().await.is_some() && s2.clock().last_sync().await.is_some()
    })
    .await;

    // Same host, so every corrected clock stays close to the others
    let spread = (s1.clock().now() - s3.clock().now()).abs();
    assert!(spread < 0.5, "clocks drifted apart by {}s", spread);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_balancer_routes_sessions_to_nodes() {
    let nodes = start_cluster().await;

    let lb_config = BalancerConfig {
        backends: nodes
            .iter()
            .map(|n| BackendConfig {
                id: n.node_id().to_string(),
                url: format!("http://{}", n.api_addr()),
            })
            .collect(),
        ..Default::default()
    };
    let backends: Vec<Backend> = lb_config.backends.iter().map(Backend::from).collect();
    let client = Arc::new(HttpBackendClient::new(&lb_config).unwrap());
    let lb = LoadBalancer::new(backends, client);

    assert_eq!(lb.probe_health().await, 3);

    // Three students land on three different servers
    let mut sessions = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let started = lb.route_new_session(Some(name)).await.unwrap();
        assert!(started.is_success(), "start failed: {:?}", started.body);
        sessions.push(started.body["session_id"].as_str().unwrap().to_string());
    }
    let mut placed: Vec<usize> = Vec::new();
    for node in &nodes {
        placed.push(node.store().metrics().await.active_sessions);
    }
    assert_eq!(placed, vec![1, 1, 1]);

    // Answers follow the session to its server until the exam ends
    let session_id = &sessions[0];
    let mut last = serde_json::Value::Null;
    for answer in ["C", "D", "A"] {
        let reply = lb
            .route_existing_session(
                session_id,
                &serde_json::json!({ "session_id": session_id, "answer": answer }),
            )
            .await
            .unwrap();
        assert!(reply.is_success(), "submit failed: {:?}", reply.body);
        last = reply.body;
    }
    assert_eq!(last["final_score"], 3);

    let results = lb.fetch_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].username, "alice");

    for node in &nodes {
        node.shutdown().await;
    }
}
