//! # Overlay Network Layer
//!
//! This module owns the libp2p swarm that connects jobplane nodes. It handles:
//!
//! - **Node setup and identity**: the swarm is built from the node's Ed25519
//!   key pair; its [`PeerId`] is the node identity used in protocol messages
//! - **PubSub messaging**: gossipsub topics implementing [`Fabric`] and
//!   [`Topic`]; a publish is looped back to local subscribers
//! - **Peer routing**: Kademlia provider records act as the rendezvous
//!   advertisement; identify feeds observed listen addresses into Kademlia
//! - **Connection management**: dials resolve once the connection is
//!   established or has failed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Network Layer                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Network handle (cloneable) ──── NetworkCommand ───┐          │
//! │    ├─ membership (dial, advertise, providers)      │          │
//! │    ├─ dispatcher (MeshTopic publish/subscribe)     ▼          │
//! │    └─ api (add peer, health)              ┌──────────────┐    │
//! │                                           │  Event loop  │    │
//! │  subscribers ◀──── FabricMessage ─────────│  owns Swarm  │    │
//! │                                           └──────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the event loop task touches the swarm. Every other component talks to
//! it through a bounded command channel and waits on a oneshot reply, so
//! connects and publishes from many tasks never race on swarm state.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, Swarm, SwarmBuilder, gossipsub, identify, identity::Keypair, kad,
    multiaddr::Protocol,
    noise,
    swarm::{NetworkBehaviour, SwarmEvent, dial_opts::DialOpts},
    tcp, yamux,
};
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::fabric::{
    Fabric, FabricError, FabricMessage, MessageStream, SUBSCRIBER_QUEUE_CAPACITY, Topic, fan_out,
};
use crate::messages::MAX_MESSAGE_SIZE;

/// Protocol version announced through identify.
pub const IDENTIFY_PROTOCOL: &str = "/jobplane/1.0.0";

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on a single dial, covering slow TCP handshakes and DNS.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long startup waits for the first listen address.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Room for the gossipsub envelope (signature, key, sequence number, topic)
/// around a payload of [`MAX_MESSAGE_SIZE`].
const GOSSIP_ENVELOPE_ALLOWANCE: usize = 16 * 1024;

/// Largest gossipsub frame the node sends or accepts.
pub const MAX_TRANSMIT_SIZE: usize = MAX_MESSAGE_SIZE + GOSSIP_ENVELOPE_ALLOWANCE;

/// Combined libp2p behaviour for the overlay.
#[derive(NetworkBehaviour)]
pub struct JobplaneBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    /// The address is not a valid multiaddr or names no peer
    #[error("invalid peer address '{address}': {reason}")]
    AddressParse { address: String, reason: String },

    #[error("failed to connect to {peer}: {reason}")]
    Connect { peer: PeerId, reason: String },

    #[error("failed to advertise under '{namespace}': {reason}")]
    Advertise { namespace: String, reason: String },

    #[error("peer discovery under '{namespace}' failed: {reason}")]
    Discovery { namespace: String, reason: String },

    #[error("network setup failed: {0}")]
    Setup(String),

    #[error("network event loop has stopped")]
    Shutdown,
}

/// Overlay settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface to listen on, e.g. `0.0.0.0`
    pub listen_host: String,
    /// TCP port, 0 picks a free one
    pub listen_port: u16,
    pub gossip_heartbeat: Duration,
    pub idle_connection_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 0,
            gossip_heartbeat: Duration::from_secs(1),
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

/// Commands sent to the event loop.
///
/// Each variant that needs an answer carries its own reply channel.
#[derive(Debug)]
pub enum NetworkCommand {
    /// Dial `peer`, optionally at known `addrs`, and report the outcome
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Subscribe the node to a gossipsub topic
    Join {
        topic: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Register a local consumer for a joined topic
    Subscribe {
        topic: String,
        tx: mpsc::Sender<FabricMessage>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    TopicPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    /// Start a Kademlia bootstrap query
    Bootstrap {
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Publish a provider record for `key`
    StartProviding {
        key: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Collect every provider of `key`
    GetProviders {
        key: String,
        reply: oneshot::Sender<Result<Vec<PeerId>, String>>,
    },
}

/// Cloneable handle to the running overlay node.
#[derive(Clone)]
pub struct Network {
    cmd_tx: mpsc::Sender<NetworkCommand>,
    local_peer_id: PeerId,
    listen_rx: watch::Receiver<Vec<Multiaddr>>,
}

impl Network {
    /// Builds the swarm, starts listening and spawns the event loop.
    ///
    /// Returns once the node has at least one listen address, or after a
    /// short timeout if the OS is slow to report one.
    pub async fn start(
        keypair: Keypair,
        config: &NetworkConfig,
    ) -> Result<(Self, JoinHandle<()>), NetworkError> {
        let mut swarm = build_swarm(keypair, config)?;
        let local_peer_id = *swarm.local_peer_id();

        let listen_addr = listen_multiaddr(&config.listen_host, config.listen_port)?;
        swarm
            .listen_on(listen_addr.clone())
            .map_err(|e| NetworkError::Setup(format!("listen on {listen_addr}: {e}")))?;
        swarm
            .behaviour_mut()
            .kademlia
            .set_mode(Some(kad::Mode::Server));

        info!("Local peer id: {}", local_peer_id);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (listen_tx, listen_rx) = watch::channel(Vec::new());

        let event_loop = EventLoop::new(swarm, cmd_rx, listen_tx);
        let handle = tokio::spawn(event_loop.run());

        let mut ready = listen_rx.clone();
        if tokio::time::timeout(LISTEN_TIMEOUT, ready.wait_for(|addrs| !addrs.is_empty()))
            .await
            .is_err()
        {
            warn!("No listen address reported after {:?}", LISTEN_TIMEOUT);
        }

        Ok((
            Self {
                cmd_tx,
                local_peer_id,
                listen_rx,
            },
            handle,
        ))
    }

    pub fn peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dialable addresses of this node, each ending in `/p2p/<peer-id>`.
    pub fn list_addresses(&self) -> Vec<String> {
        self.listen_rx
            .borrow()
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.local_peer_id)).to_string())
            .collect()
    }

    /// Peers with at least one open connection.
    pub async fn list_peers(&self) -> Result<Vec<PeerId>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.request(NetworkCommand::ConnectedPeers { reply }, rx).await
    }

    pub async fn is_connected(&self, peer: PeerId) -> Result<bool, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.request(NetworkCommand::IsConnected { peer, reply }, rx).await
    }

    /// Connects to the peer named by a textual multiaddr.
    ///
    /// The address must end in `/p2p/<peer-id>`. Resolves once the connection
    /// is established or has definitively failed.
    pub async fn add_peer(&self, address: &str) -> Result<PeerId, NetworkError> {
        let (peer, addr) = parse_peer_address(address)?;
        if peer == self.local_peer_id {
            return Err(NetworkError::AddressParse {
                address: address.to_string(),
                reason: "address names the local node".to_string(),
            });
        }
        self.dial(peer, vec![addr]).await?;
        info!("Connected to peer {}", peer);
        Ok(peer)
    }

    /// Dials `peer` at `addrs`, or at addresses the routing table knows when empty.
    pub async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        let outcome = tokio::time::timeout(
            DIAL_TIMEOUT,
            self.request(NetworkCommand::Dial { peer, addrs, reply }, rx),
        )
        .await
        .map_err(|_| NetworkError::Connect {
            peer,
            reason: format!("timed out after {:?}", DIAL_TIMEOUT),
        })??;
        outcome.map_err(|reason| NetworkError::Connect { peer, reason })
    }

    /// Starts a Kademlia bootstrap. A node that knows no peers yet is not an error.
    pub async fn bootstrap_routing(&self) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        match self.request(NetworkCommand::Bootstrap { reply }, rx).await? {
            Ok(()) => Ok(()),
            Err(reason) => {
                debug!("Routing bootstrap skipped: {}", reason);
                Ok(())
            }
        }
    }

    /// Announces this node under `namespace`.
    pub async fn advertise(&self, namespace: &str) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        let key = namespace.to_string();
        self.request(NetworkCommand::StartProviding { key, reply }, rx)
            .await?
            .map_err(|reason| NetworkError::Advertise {
                namespace: namespace.to_string(),
                reason,
            })
    }

    /// Peers that advertised under `namespace`.
    pub async fn find_providers(&self, namespace: &str) -> Result<Vec<PeerId>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        let key = namespace.to_string();
        self.request(NetworkCommand::GetProviders { key, reply }, rx)
            .await?
            .map_err(|reason| NetworkError::Discovery {
                namespace: namespace.to_string(),
                reason,
            })
    }

    async fn send(&self, command: NetworkCommand) -> Result<(), NetworkError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| NetworkError::Shutdown)
    }

    async fn request<T>(
        &self,
        command: NetworkCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, NetworkError> {
        self.send(command).await?;
        rx.await.map_err(|_| NetworkError::Shutdown)
    }
}

#[async_trait]
impl Fabric for Network {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, FabricError> {
        let (reply, rx) = oneshot::channel();
        let command = NetworkCommand::Join {
            topic: topic.to_string(),
            reply,
        };
        self.request(command, rx)
            .await
            .map_err(|_| FabricError::Closed)?
            .map_err(|reason| FabricError::Join {
                topic: topic.to_string(),
                reason,
            })?;
        info!("Joined topic {}", topic);
        Ok(Arc::new(MeshTopic {
            network: self.clone(),
            name: topic.to_string(),
        }))
    }
}

/// A gossipsub topic the local node has joined.
pub struct MeshTopic {
    network: Network,
    name: String,
}

#[async_trait]
impl Topic for MeshTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), FabricError> {
        let (reply, rx) = oneshot::channel();
        let command = NetworkCommand::Publish {
            topic: self.name.clone(),
            data,
            reply,
        };
        self.network
            .request(command, rx)
            .await
            .map_err(|_| FabricError::Closed)?
            .map_err(|reason| FabricError::Publish {
                topic: self.name.clone(),
                reason,
            })
    }

    async fn subscribe(&self) -> Result<MessageStream, FabricError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.network
            .send(NetworkCommand::Subscribe {
                topic: self.name.clone(),
                tx,
            })
            .await
            .map_err(|_| FabricError::Closed)?;
        Ok(MessageStream::new(rx))
    }

    async fn list_peers(&self) -> Result<Vec<PeerId>, FabricError> {
        let (reply, rx) = oneshot::channel();
        let command = NetworkCommand::TopicPeers {
            topic: self.name.clone(),
            reply,
        };
        self.network
            .request(command, rx)
            .await
            .map_err(|_| FabricError::Closed)
    }
}

/// Splits `/…/p2p/<id>` into the peer id and the full dialable address.
pub fn parse_peer_address(address: &str) -> Result<(PeerId, Multiaddr), NetworkError> {
    let parse_error = |reason: String| NetworkError::AddressParse {
        address: address.to_string(),
        reason,
    };
    let addr: Multiaddr = address
        .trim()
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| parse_error(e.to_string()))?;
    let peer = addr
        .iter()
        .filter_map(|p| match p {
            Protocol::P2p(id) => Some(id),
            _ => None,
        })
        .last()
        .ok_or_else(|| parse_error("missing /p2p/<peer-id> component".to_string()))?;
    Ok((peer, addr))
}

/// Strips a trailing `/p2p/<id>` so the address can be stored in the routing table.
fn transport_address(addr: &Multiaddr) -> Multiaddr {
    let mut addr = addr.clone();
    if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.pop();
    }
    addr
}

fn listen_multiaddr(host: &str, port: u16) -> Result<Multiaddr, NetworkError> {
    let ip: IpAddr = host
        .parse()
        .map_err(|e| NetworkError::Setup(format!("invalid listen host '{host}': {e}")))?;
    let addr = Multiaddr::empty()
        .with(match ip {
            IpAddr::V4(v4) => Protocol::Ip4(v4),
            IpAddr::V6(v6) => Protocol::Ip6(v6),
        })
        .with(Protocol::Tcp(port));
    Ok(addr)
}

fn build_swarm(
    keypair: Keypair,
    config: &NetworkConfig,
) -> Result<Swarm<JobplaneBehaviour>, NetworkError> {
    let heartbeat = config.gossip_heartbeat;
    let idle = config.idle_connection_timeout;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::Setup(format!("tcp transport: {e}")))?
        .with_dns()
        .map_err(|e| NetworkError::Setup(format!("dns transport: {e}")))?
        .with_behaviour(|key| {
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(heartbeat)
                .max_transmit_size(MAX_TRANSMIT_SIZE)
                .validation_mode(gossipsub::ValidationMode::Strict)
                .build()
                .map_err(|e| e.to_string())?;
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )?;

            let peer_id = key.public().to_peer_id();
            let kademlia =
                kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));

            let identify = identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            ));

            Ok(JobplaneBehaviour {
                gossipsub,
                kademlia,
                identify,
            })
        })
        .map_err(|e| NetworkError::Setup(format!("behaviour: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle))
        .build();

    Ok(swarm)
}

/// Providers collected so far for one in-flight query.
struct ProviderQuery {
    found: HashSet<PeerId>,
    reply: oneshot::Sender<Result<Vec<PeerId>, String>>,
}

/// Sole owner of the swarm.
struct EventLoop {
    swarm: Swarm<JobplaneBehaviour>,
    cmd_rx: mpsc::Receiver<NetworkCommand>,
    listen_tx: watch::Sender<Vec<Multiaddr>>,
    listen_addrs: Vec<Multiaddr>,
    subscribers: HashMap<String, Vec<mpsc::Sender<FabricMessage>>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    provider_queries: HashMap<kad::QueryId, ProviderQuery>,
}

impl EventLoop {
    fn new(
        swarm: Swarm<JobplaneBehaviour>,
        cmd_rx: mpsc::Receiver<NetworkCommand>,
        listen_tx: watch::Sender<Vec<Multiaddr>>,
    ) -> Self {
        Self {
            swarm,
            cmd_rx,
            listen_tx,
            listen_addrs: Vec::new(),
            subscribers: HashMap::new(),
            pending_dials: HashMap::new(),
            provider_queries: HashMap::new(),
        }
    }

    /// Runs until every [`Network`] handle has been dropped.
    async fn run(mut self) {
        loop {
            trace!("Network loop iteration");
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("Command channel closed; shutting down network loop");
                        break;
                    }
                },
            }
        }
    }

    fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::Dial { peer, addrs, reply } => self.dial(peer, addrs, reply),

            NetworkCommand::Join { topic, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&gossipsub::IdentTopic::new(&topic))
                    .map(|_| ())
                    .map_err(|e| format!("{e:?}"));
                let _ = reply.send(result);
            }

            NetworkCommand::Subscribe { topic, tx } => {
                self.subscribers.entry(topic).or_default().push(tx);
            }

            NetworkCommand::Publish { topic, data, reply } => {
                let _ = reply.send(self.publish(topic, data));
            }

            NetworkCommand::TopicPeers { topic, reply } => {
                let hash = gossipsub::IdentTopic::new(&topic).hash();
                let peers = self
                    .swarm
                    .behaviour()
                    .gossipsub
                    .all_peers()
                    .filter(|(_, topics)| topics.contains(&&hash))
                    .map(|(peer, _)| *peer)
                    .collect();
                let _ = reply.send(peers);
            }

            NetworkCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }

            NetworkCommand::IsConnected { peer, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }

            NetworkCommand::Bootstrap { reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .bootstrap()
                    .map(|_| ())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }

            NetworkCommand::StartProviding { key, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(kad::RecordKey::new(&key))
                    .map(|_| ())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }

            NetworkCommand::GetProviders { key, reply } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(kad::RecordKey::new(&key));
                self.provider_queries.insert(
                    id,
                    ProviderQuery {
                        found: HashSet::new(),
                        reply,
                    },
                );
            }
        }
    }

    fn dial(
        &mut self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), String>>,
    ) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }

        for addr in &addrs {
            self.swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer, transport_address(addr));
        }

        let opts = DialOpts::peer_id(peer).addresses(addrs).build();
        match self.swarm.dial(opts) {
            Ok(()) => {
                debug!("Dialing {}", peer);
                self.pending_dials.entry(peer).or_default().push(reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e.to_string()));
            }
        }
    }

    /// Publishes to remote subscribers, then loops the message back locally.
    fn publish(&mut self, topic: String, data: Vec<u8>) -> Result<(), String> {
        let ident = gossipsub::IdentTopic::new(&topic);
        match self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(ident, data.clone())
        {
            Ok(_) => {}
            Err(gossipsub::PublishError::InsufficientPeers) => {
                debug!("No remote subscribers on topic {}", topic);
            }
            Err(e) => return Err(e.to_string()),
        }

        let message = FabricMessage {
            topic,
            source: Some(self.local_peer_id()),
            data,
        };
        self.deliver(message);
        Ok(())
    }

    fn deliver(&mut self, message: FabricMessage) {
        match self.subscribers.get_mut(&message.topic) {
            Some(subscribers) => fan_out(subscribers, &message),
            None => trace!("No local subscriber for topic {}", message.topic),
        }
    }

    fn resolve_dials(&mut self, peer: &PeerId, result: Result<(), String>) {
        if let Some(waiters) = self.pending_dials.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<JobplaneBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.listen_addrs.push(address);
                let _ = self.listen_tx.send(self.listen_addrs.clone());
            }

            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| *a != address);
                let _ = self.listen_tx.send(self.listen_addrs.clone());
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } => {
                if num_established.get() == 1 {
                    info!("Connection established with {}", peer_id);
                }
                self.resolve_dials(&peer_id, Ok(()));
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                if num_established == 0 {
                    debug!("Connection to {} closed: {:?}", peer_id, cause);
                }
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                debug!("Dial to {} failed: {}", peer_id, error);
                if !self.swarm.is_connected(&peer_id) {
                    self.resolve_dials(&peer_id, Err(error.to_string()));
                }
            }

            SwarmEvent::Behaviour(JobplaneBehaviourEvent::Gossipsub(
                gossipsub::Event::Message { message, .. },
            )) => {
                trace!(
                    "Received {} bytes on topic {} from {:?}",
                    message.data.len(),
                    message.topic,
                    message.source
                );
                self.deliver(FabricMessage {
                    topic: message.topic.as_str().to_string(),
                    source: message.source,
                    data: message.data,
                });
            }

            SwarmEvent::Behaviour(JobplaneBehaviourEvent::Gossipsub(
                gossipsub::Event::Subscribed { peer_id, topic },
            )) => {
                debug!("Peer {} joined topic {}", peer_id, topic);
            }

            SwarmEvent::Behaviour(JobplaneBehaviourEvent::Identify(
                identify::Event::Received { peer_id, info, .. },
            )) => {
                trace!("Identified {} ({})", peer_id, info.protocol_version);
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(JobplaneBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed {
                    id, result, step, ..
                },
            )) => self.handle_query_progress(id, result, step.last),

            _ => {}
        }
    }

    fn handle_query_progress(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                if let Some(query) = self.provider_queries.get_mut(&id) {
                    query.found.extend(providers);
                }
            }
            kad::QueryResult::GetProviders(Ok(
                kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {}
            kad::QueryResult::GetProviders(Err(e)) => {
                if let Some(query) = self.provider_queries.remove(&id) {
                    if query.found.is_empty() {
                        let _ = query.reply.send(Err(e.to_string()));
                    } else {
                        let _ = query.reply.send(Ok(query.found.into_iter().collect()));
                    }
                }
                return;
            }
            kad::QueryResult::StartProviding(Err(e)) => {
                warn!("Provider record not replicated: {}", e);
            }
            kad::QueryResult::StartProviding(Ok(ok)) => {
                debug!("Provider record for {:?} replicated", ok.key);
            }
            kad::QueryResult::Bootstrap(Err(e)) => {
                debug!("Routing bootstrap query failed: {}", e);
            }
            other => trace!("Unhandled query result {:?}", other),
        }

        if last && let Some(query) = self.provider_queries.remove(&id) {
            let _ = query.reply.send(Ok(query.found.into_iter().collect()));
        }
    }
}
