//! # Overlay Membership
//!
//! Keeps the node connected to the overlay:
//!
//! - [`bootstrap`] dials a fixed set of well-known addresses concurrently and
//!   starts the routing table, tolerating any number of failed dials
//! - [`Discovery`] advertises the node under a rendezvous namespace and then
//!   repeatedly looks up the other providers of that namespace, dialing the
//!   ones it is not yet connected to
//! - [`PeerBook`] records what discovery has learned about each peer
//!
//! Discovery talks to the overlay through the [`Rendezvous`] trait so that its
//! scheduling and skip rules can be exercised without a live swarm.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use libp2p::PeerId;
use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::network::{Network, NetworkError};

/// Public IPFS bootstrap nodes, dialed unless disabled in configuration.
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Pause between discovery cycles that made no new connection.
pub const DEFAULT_SEARCH_INTERVAL: Duration = Duration::from_secs(20);

/// Pause after a cycle that connected to at least one new peer.
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_secs(600);

/// Dials every address concurrently, then starts the routing table.
///
/// Failed or malformed addresses are logged and skipped. Returns the number of
/// successful dials; zero is not an error.
pub async fn bootstrap(network: &Network, addresses: &[String]) -> Result<usize, NetworkError> {
    let dials = addresses.iter().map(|address| async move {
        match network.add_peer(address).await {
            Ok(peer) => {
                info!("Connection established with bootstrap node {}", peer);
                true
            }
            Err(e) => {
                warn!("Bootstrap warning: {}", e);
                false
            }
        }
    });
    let connected = join_all(dials).await.into_iter().filter(|ok| *ok).count();

    network.bootstrap_routing().await?;
    info!(
        "Bootstrap finished: {}/{} nodes reachable",
        connected,
        addresses.len()
    );
    Ok(connected)
}

/// What discovery knows about one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    pub first_seen: Instant,
    pub last_connected: Option<Instant>,
    pub consecutive_failures: u32,
}

/// Per-peer discovery bookkeeping, shared behind a lock.
#[derive(Debug, Clone, Default)]
pub struct PeerBook {
    records: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.records.read().await.get(peer).copied()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn known_peers(&self) -> Vec<PeerId> {
        self.records.read().await.keys().copied().collect()
    }

    /// Peers whose most recent dial failed.
    pub async fn unreachable_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|record| record.consecutive_failures > 0)
            .count()
    }

    async fn record_seen(&self, peer: PeerId) {
        self.records
            .write()
            .await
            .entry(peer)
            .or_insert_with(|| PeerRecord {
                first_seen: Instant::now(),
                last_connected: None,
                consecutive_failures: 0,
            });
    }

    async fn record_connected(&self, peer: PeerId) {
        if let Some(record) = self.records.write().await.get_mut(&peer) {
            record.last_connected = Some(Instant::now());
            record.consecutive_failures = 0;
        }
    }

    async fn record_failure(&self, peer: PeerId) {
        if let Some(record) = self.records.write().await.get_mut(&peer) {
            record.consecutive_failures += 1;
        }
    }
}

/// Overlay operations discovery depends on.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    async fn advertise(&self, namespace: &str) -> Result<(), NetworkError>;

    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerId>, NetworkError>;

    async fn is_connected(&self, peer: PeerId) -> Result<bool, NetworkError>;

    async fn connect(&self, peer: PeerId) -> Result<(), NetworkError>;
}

#[async_trait]
impl Rendezvous for Network {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id()
    }

    async fn advertise(&self, namespace: &str) -> Result<(), NetworkError> {
        Network::advertise(self, namespace).await
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerId>, NetworkError> {
        self.find_providers(namespace).await
    }

    async fn is_connected(&self, peer: PeerId) -> Result<bool, NetworkError> {
        Network::is_connected(self, peer).await
    }

    async fn connect(&self, peer: PeerId) -> Result<(), NetworkError> {
        self.dial(peer, Vec::new()).await
    }
}

/// Outcome of one discovery cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Providers returned by the lookup, self excluded
    pub found: usize,
    pub already_connected: usize,
    pub connected: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

/// Periodic rendezvous lookup that keeps the node connected to its namespace.
pub struct Discovery {
    rendezvous: Arc<dyn Rendezvous>,
    namespace: String,
    book: PeerBook,
    search_interval: Duration,
    settle_interval: Duration,
}

impl Discovery {
    pub fn new(rendezvous: Arc<dyn Rendezvous>, namespace: impl Into<String>) -> Self {
        Self {
            rendezvous,
            namespace: namespace.into(),
            book: PeerBook::new(),
            search_interval: DEFAULT_SEARCH_INTERVAL,
            settle_interval: DEFAULT_SETTLE_INTERVAL,
        }
    }

    pub fn with_intervals(mut self, search: Duration, settle: Duration) -> Self {
        self.search_interval = search;
        self.settle_interval = settle;
        self
    }

    pub fn book(&self) -> PeerBook {
        self.book.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Announces the local node under the namespace.
    pub async fn advertise(&self) -> Result<(), NetworkError> {
        self.rendezvous.advertise(&self.namespace).await?;
        info!("Advertising under '{}'", self.namespace);
        Ok(())
    }

    /// One lookup followed by a dial to every new provider.
    ///
    /// A failed dial is logged and not retried within the cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, NetworkError> {
        info!("Searching for peers under '{}'", self.namespace);
        let providers = self.rendezvous.find_peers(&self.namespace).await?;
        let local = self.rendezvous.local_peer_id();

        let mut report = CycleReport::default();
        for peer in providers {
            if peer == local {
                continue;
            }
            report.found += 1;
            self.book.record_seen(peer).await;

            if self.rendezvous.is_connected(peer).await? {
                debug!("Already connected to {}", peer);
                report.already_connected += 1;
                continue;
            }

            match self.rendezvous.connect(peer).await {
                Ok(()) => {
                    info!("Connected to {}", peer);
                    self.book.record_connected(peer).await;
                    report.connected.push(peer);
                }
                Err(e) => {
                    warn!("Failed connecting to {}: {}", peer, e);
                    self.book.record_failure(peer).await;
                    report.failed.push(peer);
                }
            }
        }
        Ok(report)
    }

    /// Pause before the next cycle.
    pub fn delay_after(&self, report: &CycleReport) -> Duration {
        if report.connected.is_empty() {
            self.search_interval
        } else {
            self.settle_interval
        }
    }

    /// Runs discovery cycles for the lifetime of the process.
    pub async fn run(self) {
        loop {
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    if !report.connected.is_empty() {
                        info!(
                            "Peer discovery complete: {} new connection(s)",
                            report.connected.len()
                        );
                    }
                    self.delay_after(&report)
                }
                Err(NetworkError::Shutdown) => {
                    info!("Network stopped; ending discovery");
                    return;
                }
                Err(e) => {
                    warn!("Error finding peers: {}", e);
                    self.search_interval
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}
