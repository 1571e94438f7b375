//! # Job Dispatcher
//!
//! Implements the request/response protocol on top of two broadcast topics:
//!
//! ```text
//!   requester                      request topic                       target
//!   submit ─▶ select target ─▶ DeployRequest ───────────────────▶ request_loop
//!                                                                      │ run
//!   response_loop ◀──────────── DeployResponse ◀── response topic ◀───┘
//! ```
//!
//! Every node sees every message on both topics. Correlation is purely by
//! identity: a request is acted on only by the node named as its target, and a
//! response is reported only by the node named as its source. Each loop drops
//! the node's own messages before looking at them.
//!
//! Both loops handle messages strictly one at a time; a slow program delays
//! the requests queued behind it.

use std::sync::Arc;

use libp2p::PeerId;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::executor::CommandRunner;
use crate::fabric::{Fabric, FabricError, FabricMessage, ForeignMessages, Topic, response_topic};
use crate::messages::{self, DeployRequest, DeployResponse, JobRequest, MAX_MESSAGE_SIZE};
use crate::network::Network;

/// Outcomes buffered for slow in-process observers.
const OUTCOME_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// No peer is on the request topic; nothing was published
    #[error("no peers available on topic {topic}")]
    NoPeers { topic: String },

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] FabricError),
}

/// Chooses the peer that runs a job.
pub trait TargetSelector: Send + Sync {
    /// Picks one of `candidates`, or `None` when none is acceptable.
    fn select(&self, candidates: &[PeerId]) -> Option<PeerId>;
}

/// Picks the first candidate in the order the fabric reports them.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstPeer;

impl TargetSelector for FirstPeer {
    fn select(&self, candidates: &[PeerId]) -> Option<PeerId> {
        candidates.first().copied()
    }
}

/// Source of the node's own overlay addresses, stamped into outgoing messages.
pub trait AddressSource: Send + Sync {
    fn addresses(&self) -> Vec<String>;
}

impl AddressSource for Network {
    fn addresses(&self) -> Vec<String> {
        self.list_addresses()
    }
}

impl AddressSource for Vec<String> {
    fn addresses(&self) -> Vec<String> {
        self.clone()
    }
}

/// Publishes job requests and serves both protocol loops for one node.
#[derive(Clone)]
pub struct Dispatcher {
    local_peer: PeerId,
    addresses: Arc<dyn AddressSource>,
    requests: Arc<dyn Topic>,
    responses: Arc<dyn Topic>,
    runner: Arc<dyn CommandRunner>,
    selector: Arc<dyn TargetSelector>,
    outcomes: broadcast::Sender<DeployResponse>,
}

/// Encodes `response`, returning it alongside its payload.
///
/// A response that would exceed [`MAX_MESSAGE_SIZE`] loses its outputs and is
/// marked failed, with `err` saying why, so the requester still hears back.
fn encode_response(
    mut response: DeployResponse,
) -> Result<(DeployResponse, Vec<u8>), serde_json::Error> {
    let payload = messages::encode(&response)?;
    if payload.len() <= MAX_MESSAGE_SIZE {
        return Ok((response, payload));
    }

    let note = format!(
        "response of {} bytes exceeds the {} byte message limit; {} output line(s) dropped",
        payload.len(),
        MAX_MESSAGE_SIZE,
        response.outputs.len()
    );
    warn!("{}", note);
    response.outputs.clear();
    response.success = false;
    response.err = if response.err.is_empty() {
        note
    } else {
        format!("{}; {}", response.err, note)
    };
    let payload = messages::encode(&response)?;
    Ok((response, payload))
}

impl Dispatcher {
    /// Joins `<base>` and `<base>-response` on `fabric`.
    pub async fn join(
        fabric: &dyn Fabric,
        base_topic: &str,
        runner: Arc<dyn CommandRunner>,
        addresses: Arc<dyn AddressSource>,
    ) -> Result<Self, FabricError> {
        let requests = fabric.join(base_topic).await?;
        let responses = fabric.join(&response_topic(base_topic)).await?;
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        Ok(Self {
            local_peer: fabric.local_peer_id(),
            addresses,
            requests,
            responses,
            runner,
            selector: Arc::new(FirstPeer),
            outcomes,
        })
    }

    pub fn with_selector(mut self, selector: Arc<dyn TargetSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer
    }

    /// Responses addressed to this node, as they are reported.
    pub fn outcomes(&self) -> broadcast::Receiver<DeployResponse> {
        self.outcomes.subscribe()
    }

    /// Peers that could receive a job right now.
    pub async fn candidates(&self) -> Result<Vec<PeerId>, FabricError> {
        self.requests.list_peers().await
    }

    /// Subscribes to both topics and spawns the request and response loops.
    ///
    /// The subscriptions exist when this returns, so no message published
    /// afterwards is missed.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, FabricError> {
        let requests = self.requests.subscribe().await?.excluding(self.local_peer);
        let responses = self.responses.subscribe().await?.excluding(self.local_peer);

        let request_dispatcher = self.clone();
        let response_dispatcher = self.clone();
        Ok(vec![
            tokio::spawn(async move { request_dispatcher.request_loop(requests).await }),
            tokio::spawn(async move { response_dispatcher.response_loop(responses).await }),
        ])
    }

    /// Picks a target for `job` and publishes the request.
    ///
    /// Fails with [`DispatchError::NoPeers`] before publishing anything when
    /// the request topic has no peers.
    pub async fn submit(&self, job: &JobRequest) -> Result<DeployRequest, DispatchError> {
        job.validate().map_err(DispatchError::InvalidJob)?;

        let candidates = self.candidates().await?;
        let target = self
            .selector
            .select(&candidates)
            .ok_or_else(|| DispatchError::NoPeers {
                topic: self.requests.name().to_string(),
            })?;

        let request = DeployRequest {
            source_peer_id: self.local_peer.to_string(),
            source_addrs: self.addresses.addresses(),
            target_peer_id: target.to_string(),
            program: job.program.clone(),
            arguments: job.arguments.clone(),
        };
        self.publish_request(&request).await?;
        info!(
            "Dispatched '{}' to {} ({} candidate(s))",
            request.program,
            target,
            candidates.len()
        );
        Ok(request)
    }

    /// Encodes and publishes `request` on the request topic. Not retried.
    pub async fn publish_request(&self, request: &DeployRequest) -> Result<(), DispatchError> {
        let payload = messages::encode(request)?;
        self.requests.publish(payload).await?;
        Ok(())
    }

    /// Serves requests addressed to this node until the topic closes.
    pub async fn request_loop(&self, mut stream: ForeignMessages) {
        while let Some(message) = stream.next().await {
            self.handle_request(message).await;
        }
        info!("Request topic closed; request loop exiting");
    }

    /// Runs the program named by a request addressed to this node and
    /// publishes the outcome. Returns the published response, if any.
    pub async fn handle_request(&self, message: FabricMessage) -> Option<DeployResponse> {
        let request: DeployRequest = match messages::decode(&message.data) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping undecodable request from {:?}: {}", message.source, e);
                return None;
            }
        };

        if request.target_peer_id != self.local_peer.to_string() {
            debug!(
                "Ignoring request for {} (not this node)",
                request.target_peer_id
            );
            return None;
        }

        info!(
            "Running '{}' {:?} for {}",
            request.program, request.arguments, request.source_peer_id
        );
        let response = self.execute(request).await;

        match encode_response(response) {
            Ok((response, payload)) => {
                if let Err(e) = self.responses.publish(payload).await {
                    error!(
                        "Failed to publish response for {}: {}",
                        response.source_peer_id, e
                    );
                }
                Some(response)
            }
            Err(e) => {
                error!("Failed to encode response: {}", e);
                None
            }
        }
    }

    async fn execute(&self, request: DeployRequest) -> DeployResponse {
        let mut response = DeployResponse {
            success: false,
            err: String::new(),
            source_peer_id: request.source_peer_id,
            source_addrs: request.source_addrs,
            program: request.program,
            arguments: request.arguments,
            pid: None,
            target_peer_id: self.local_peer.to_string(),
            target_addrs: self.addresses.addresses(),
            outputs: Vec::new(),
        };

        match self.runner.run(&response.program, &response.arguments).await {
            Ok(execution) => {
                response.success = execution.succeeded();
                response.pid = Some(execution.pid);
                response.outputs = execution.outputs;
                if let Some(failure) = execution.failure {
                    response.err = failure.to_string();
                }
            }
            Err(e) => response.err = e.to_string(),
        }
        response
    }

    /// Reports responses to this node's requests until the topic closes.
    pub async fn response_loop(&self, mut stream: ForeignMessages) {
        while let Some(message) = stream.next().await {
            self.handle_response(message);
        }
        info!("Response topic closed; response loop exiting");
    }

    /// Reports a response if this node sent the matching request.
    pub fn handle_response(&self, message: FabricMessage) -> Option<DeployResponse> {
        let response: DeployResponse = match messages::decode(&message.data) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping undecodable response from {:?}: {}", message.source, e);
                return None;
            }
        };

        if response.source_peer_id != self.local_peer.to_string() {
            return None;
        }

        if response.success {
            info!(
                "Deployment of '{}' succeeded on {} (pid {})",
                response.program,
                response.target_peer_id,
                response.pid.unwrap_or_default()
            );
            for line in &response.outputs {
                info!("  {}", line);
            }
        } else {
            warn!(
                "Deployment of '{}' failed on {}: {}",
                response.program, response.target_peer_id, response.err
            );
        }

        // No observers is fine; outcomes are also logged.
        let _ = self.outcomes.send(response.clone());
        Some(response)
    }
}
