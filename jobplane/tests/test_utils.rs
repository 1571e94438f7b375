#![allow(dead_code)]
//! Shared helpers for jobplane integration tests.

use std::future::Future;
use std::time::Duration;

use env_logger::Env;
use jobplane::{DaemonConfig, Jobplane, start_jobplane};
use reqwest::Client;
use tokio::time::{Instant, sleep};

// ============================================================================
// Daemon Configuration
// ============================================================================

/// Daemon config for a loopback-only node with no public bootstrap peers.
///
/// Ports are auto-assigned so tests can run in parallel.
pub fn make_test_daemon(bootstrap_peers: Vec<String>) -> DaemonConfig {
    DaemonConfig {
        rest_api_host: "127.0.0.1".to_string(),
        rest_api_port: 0,
        rest_port_attempts: 1,
        p2p_host: "127.0.0.1".to_string(),
        p2p_port: 0,
        bootstrap_peer: bootstrap_peers,
        no_default_bootstrap: true,
        exec_timeout_secs: 10,
        discovery_search_secs: 1,
        gossip_heartbeat_ms: 100,
        ..DaemonConfig::default()
    }
}

// ============================================================================
// Node Lifecycle
// ============================================================================

/// Prepare logging for integration tests.
pub fn setup_test_environment() -> Client {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info")).try_init();
    Client::new()
}

/// Start one node per config, in order.
pub async fn start_nodes(daemons: Vec<DaemonConfig>) -> Vec<Jobplane> {
    let mut nodes = Vec::new();
    for daemon in daemons {
        match start_jobplane(daemon).await {
            Ok(node) => {
                log::info!(
                    "started test node {} with REST http://{}",
                    node.network.peer_id(),
                    node.rest_addr
                );
                nodes.push(node);
            }
            Err(e) => panic!("failed to start node: {e:?}"),
        }
    }
    nodes
}

/// Abort all background tasks of the given nodes.
pub fn shutdown_nodes(nodes: &mut Vec<Jobplane>) {
    for node in nodes.drain(..) {
        for handle in node.handles {
            handle.abort();
        }
    }
}

/// REST base URL of a node.
pub fn base_url(node: &Jobplane) -> String {
    format!("http://{}", node.rest_addr)
}

/// Polls `check` every 250ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        sleep(Duration::from_millis(250)).await;
    }
}
