//! CLI parsing tests for the jobplane daemon.

use clap::Parser;
use jobplane::{Cli, DEFAULT_TOPIC};

#[test]
fn test_cli_defaults() {
    let cli = Cli::parse_from(["jobplane"]);

    assert_eq!(cli.rest_api_host, "0.0.0.0");
    assert_eq!(cli.rest_api_port, 8080);
    assert_eq!(cli.rest_port_attempts, 10);
    assert_eq!(cli.p2p_host, "0.0.0.0");
    assert_eq!(cli.p2p_port, 0);
    assert!(cli.bootstrap_peer.is_empty());
    assert!(!cli.no_default_bootstrap);
    assert_eq!(cli.topic, DEFAULT_TOPIC);
    assert!(cli.rendezvous.is_none());
    assert!(cli.identity_key.is_none());
    assert_eq!(cli.exec_timeout_secs, 30);
    assert_eq!(cli.discovery_search_secs, 20);
    assert_eq!(cli.discovery_settle_secs, 600);
    assert_eq!(cli.gossip_heartbeat_ms, 1000);
}

#[test]
fn test_cli_overrides() {
    let cli = Cli::parse_from([
        "jobplane",
        "--rest-api-host",
        "127.0.0.1",
        "--rest-api-port",
        "9090",
        "--p2p-port",
        "4001",
        "--topic",
        "builds",
        "--rendezvous",
        "lab",
        "--exec-timeout-secs",
        "5",
        "--no-default-bootstrap",
    ]);

    assert_eq!(cli.rest_api_host, "127.0.0.1");
    assert_eq!(cli.rest_api_port, 9090);
    assert_eq!(cli.p2p_port, 4001);
    assert_eq!(cli.topic, "builds");
    assert_eq!(cli.rendezvous_namespace(), "lab");
    assert_eq!(cli.exec_timeout_secs, 5);
    assert!(cli.no_default_bootstrap);
    assert!(cli.bootstrap_addresses().is_empty());
}

#[test]
fn test_bootstrap_peers_repeat_and_split() {
    let a = "/ip4/10.0.0.1/tcp/4001/p2p/12D3KooWA";
    let b = "/ip4/10.0.0.2/tcp/4001/p2p/12D3KooWB";
    let c = "/ip4/10.0.0.3/tcp/4001/p2p/12D3KooWC";

    let cli = Cli::parse_from([
        "jobplane",
        "--bootstrap-peer",
        a,
        "--bootstrap-peer",
        &format!("{b},{c}"),
    ]);

    assert_eq!(cli.bootstrap_peer, vec![a, b, c]);
    assert_eq!(&cli.bootstrap_addresses()[..3], &[a, b, c]);
}

#[test]
fn test_invalid_port_is_rejected() {
    let result = Cli::try_parse_from(["jobplane", "--rest-api-port", "70000"]);
    assert!(result.is_err());
}
