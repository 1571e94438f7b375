//! # Jobplane
//!
//! Jobplane turns a set of machines into a peer-to-peer job runner. Every node
//! joins a libp2p overlay, finds the other nodes through a rendezvous
//! namespace, and can ask any of them to run a program. It provides:
//!
//! - **Overlay membership**: bootstrap, provider-record advertisement and a
//!   periodic discovery loop over Kademlia
//! - **Broadcast fabric**: gossipsub request and response topics
//! - **Job dispatch**: identity-correlated request/response over those topics
//! - **Command execution**: programs run as child processes with captured
//!   output and a wall-clock ceiling
//!
//! ## Architecture
//!
//! The jobplane daemon consists of several subsystems:
//! - [`network`]: libp2p swarm, event loop and gossipsub topics
//! - [`membership`]: bootstrap, advertise and discovery
//! - [`fabric`]: topic traits and an in-process hub
//! - [`dispatcher`]: request and response loops, target selection
//! - [`executor`]: child process execution
//! - [`messages`]: protocol message types
//! - [`api`]: REST ingress
//! - [`telemetry`]: host compute snapshot
//! - [`identity`]: node key pair

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use tokio::task::JoinHandle;

pub mod api;
pub mod dispatcher;
pub mod executor;
pub mod fabric;
pub mod identity;
pub mod membership;
pub mod messages;
pub mod network;
pub mod telemetry;

use dispatcher::Dispatcher;
use executor::CommandExecutor;
use membership::{DEFAULT_BOOTSTRAP_PEERS, Discovery, PeerBook};
use network::{Network, NetworkConfig};

/// Base topic name used when none is configured.
pub const DEFAULT_TOPIC: &str = "container-deployment";

/// Command-line interface configuration for the jobplane daemon.
///
/// All options can also be set via `JOBPLANE_*` environment variables.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Host address for the REST API server
    #[arg(long, env = "JOBPLANE_REST_API_HOST", default_value = "0.0.0.0")]
    pub rest_api_host: String,

    /// First port tried for the REST API server
    #[arg(long, env = "JOBPLANE_REST_API_PORT", default_value = "8080")]
    pub rest_api_port: u16,

    /// Consecutive ports tried when the REST port is taken
    #[arg(long, env = "JOBPLANE_REST_PORT_ATTEMPTS", default_value = "10")]
    pub rest_port_attempts: u16,

    /// Host address for the libp2p listener
    #[arg(long, env = "JOBPLANE_P2P_HOST", default_value = "0.0.0.0")]
    pub p2p_host: String,

    /// Port for the libp2p listener (0 = auto-assign)
    #[arg(long, env = "JOBPLANE_P2P_PORT", default_value = "0")]
    pub p2p_port: u16,

    /// Extra bootstrap peer multiaddrs ending in /p2p/<peer-id>.
    /// Multiple peers can be specified by repeating the flag.
    #[arg(long, env = "JOBPLANE_BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub bootstrap_peer: Vec<String>,

    /// Skip the public IPFS bootstrap nodes
    #[arg(long, env = "JOBPLANE_NO_DEFAULT_BOOTSTRAP", default_value_t = false)]
    pub no_default_bootstrap: bool,

    /// Base topic; responses use `<topic>-response`
    #[arg(long, env = "JOBPLANE_TOPIC", default_value = DEFAULT_TOPIC)]
    pub topic: String,

    /// Rendezvous namespace for discovery (defaults to the topic)
    #[arg(long, env = "JOBPLANE_RENDEZVOUS")]
    pub rendezvous: Option<String>,

    /// Key file for a persistent node identity (ephemeral when unset)
    #[arg(long, env = "JOBPLANE_IDENTITY_KEY")]
    pub identity_key: Option<PathBuf>,

    /// Wall-clock limit for one program run, in seconds
    #[arg(long, env = "JOBPLANE_EXEC_TIMEOUT_SECS", default_value = "30")]
    pub exec_timeout_secs: u64,

    /// Seconds between discovery cycles that found nobody new
    #[arg(long, env = "JOBPLANE_DISCOVERY_SEARCH_SECS", default_value = "20")]
    pub discovery_search_secs: u64,

    /// Seconds to wait after a discovery cycle that connected to someone
    #[arg(long, env = "JOBPLANE_DISCOVERY_SETTLE_SECS", default_value = "600")]
    pub discovery_settle_secs: u64,

    /// Gossipsub heartbeat interval in milliseconds
    #[arg(long, env = "JOBPLANE_GOSSIP_HEARTBEAT_MS", default_value = "1000")]
    pub gossip_heartbeat_ms: u64,
}

/// Type alias for daemon configuration (same as CLI arguments)
pub type DaemonConfig = Cli;

impl Default for Cli {
    fn default() -> Self {
        Self {
            rest_api_host: "127.0.0.1".to_string(),
            rest_api_port: 8080,
            rest_port_attempts: 10,
            p2p_host: "0.0.0.0".to_string(),
            p2p_port: 0,
            bootstrap_peer: Vec::new(),
            no_default_bootstrap: false,
            topic: DEFAULT_TOPIC.to_string(),
            rendezvous: None,
            identity_key: None,
            exec_timeout_secs: 30,
            discovery_search_secs: 20,
            discovery_settle_secs: 600,
            gossip_heartbeat_ms: 1000,
        }
    }
}

impl Cli {
    /// Namespace nodes advertise and search under.
    pub fn rendezvous_namespace(&self) -> &str {
        self.rendezvous.as_deref().unwrap_or(&self.topic)
    }

    /// Bootstrap addresses to dial, configured peers first.
    pub fn bootstrap_addresses(&self) -> Vec<String> {
        let mut addresses = self.bootstrap_peer.clone();
        if !self.no_default_bootstrap {
            addresses.extend(DEFAULT_BOOTSTRAP_PEERS.iter().map(|a| a.to_string()));
        }
        addresses
    }
}

/// A running jobplane node.
pub struct Jobplane {
    pub network: Network,
    pub dispatcher: Dispatcher,
    pub peer_book: PeerBook,
    pub rest_addr: SocketAddr,
    /// Background tasks: network loop, discovery, request and response
    /// loops, REST server
    pub handles: Vec<JoinHandle<()>>,
}

/// Starts the jobplane daemon with the given configuration.
///
/// This is the main entry point that initializes all subsystems:
/// 1. Configures logging
/// 2. Loads the node identity and starts the libp2p swarm
/// 3. Dials bootstrap peers, advertises and starts discovery
/// 4. Joins the request and response topics and starts both loops
/// 5. Starts the REST API server
///
/// # Example
/// ```ignore
/// let node = start_jobplane(DaemonConfig::default()).await?;
/// futures::future::join_all(node.handles).await;
/// ```
pub async fn start_jobplane(cli: DaemonConfig) -> anyhow::Result<Jobplane> {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info")).try_init();

    let keypair = identity::load_or_generate(cli.identity_key.as_deref())
        .context("failed to load node identity")?;

    let network_config = NetworkConfig {
        listen_host: cli.p2p_host.clone(),
        listen_port: cli.p2p_port,
        gossip_heartbeat: Duration::from_millis(cli.gossip_heartbeat_ms),
        ..Default::default()
    };
    let (network, network_handle) = Network::start(keypair, &network_config)
        .await
        .context("failed to start overlay network")?;
    let mut handles = vec![network_handle];

    for addr in network.list_addresses() {
        info!("Node address: {}", addr);
    }

    membership::bootstrap(&network, &cli.bootstrap_addresses())
        .await
        .context("bootstrap failed")?;

    let discovery = Discovery::new(Arc::new(network.clone()), cli.rendezvous_namespace())
        .with_intervals(
            Duration::from_secs(cli.discovery_search_secs),
            Duration::from_secs(cli.discovery_settle_secs),
        );
    if let Err(e) = discovery.advertise().await {
        warn!("Advertising failed, continuing with discovery only: {}", e);
    }
    let peer_book = discovery.book();
    handles.push(tokio::spawn(discovery.run()));

    let runner = Arc::new(CommandExecutor::new(Duration::from_secs(
        cli.exec_timeout_secs,
    )));
    let dispatcher = Dispatcher::join(&network, &cli.topic, runner, Arc::new(network.clone()))
        .await
        .context("failed to join job topics")?;
    handles.extend(
        dispatcher
            .start()
            .await
            .context("failed to subscribe to job topics")?,
    );

    let listener = api::bind_with_retry(
        &cli.rest_api_host,
        cli.rest_api_port,
        cli.rest_port_attempts,
    )
    .await
    .with_context(|| {
        format!(
            "failed to bind REST API on {}:{}",
            cli.rest_api_host, cli.rest_api_port
        )
    })?;
    let rest_addr = listener.local_addr()?;
    info!("REST API listening on {}", rest_addr);

    let app = api::build_router(
        Arc::new(network.clone()),
        Arc::new(dispatcher.clone()),
        peer_book.clone(),
    );
    handles.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
            log::error!("axum server error: {}", e);
        }
    }));

    Ok(Jobplane {
        network,
        dispatcher,
        peer_book,
        rest_addr,
        handles,
    })
}
