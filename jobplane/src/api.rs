//! # REST API Layer
//!
//! HTTP ingress for a jobplane node.
//!
//! # API Surface
//!
//! - `GET /health` - Node identity, addresses, job peers, discovery state and
//!   host capacity
//! - `POST /peer` - Connect to a peer: `{"address": "/ip4/…/tcp/…/p2p/…"}`
//! - `POST /deploy` - Dispatch a job: `{"program": "echo", "arguments": ["hi"]}`
//!
//! Every reply is an [`ApiResponse`] envelope with `status` set to `success`
//! or `error`. A deploy reply only confirms that the request was published;
//! the outcome arrives later through the response loop.
//!
//! # Architecture
//!
//! Handlers reach the rest of the node only through [`PeerOperations`] and
//! [`JobOperations`], held in [`RestState`].

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use libp2p::PeerId;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::fabric::FabricError;
use crate::membership::PeerBook;
use crate::messages::{DeployRequest, JobRequest};
use crate::network::{Network, NetworkError};
use crate::telemetry;

/// Request bodies larger than this are rejected.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Overlay operations the API needs.
#[async_trait]
pub trait PeerOperations: Send + Sync {
    fn peer_id(&self) -> PeerId;

    fn list_addresses(&self) -> Vec<String>;

    async fn add_peer(&self, address: &str) -> Result<PeerId, NetworkError>;
}

#[async_trait]
impl PeerOperations for Network {
    fn peer_id(&self) -> PeerId {
        Network::peer_id(self)
    }

    fn list_addresses(&self) -> Vec<String> {
        Network::list_addresses(self)
    }

    async fn add_peer(&self, address: &str) -> Result<PeerId, NetworkError> {
        Network::add_peer(self, address).await
    }
}

/// Job operations the API needs.
#[async_trait]
pub trait JobOperations: Send + Sync {
    /// Peers on the request topic
    async fn list_peers(&self) -> Result<Vec<PeerId>, FabricError>;

    async fn submit(&self, job: &JobRequest) -> Result<DeployRequest, DispatchError>;
}

#[async_trait]
impl JobOperations for Dispatcher {
    async fn list_peers(&self) -> Result<Vec<PeerId>, FabricError> {
        self.candidates().await
    }

    async fn submit(&self, job: &JobRequest) -> Result<DeployRequest, DispatchError> {
        Dispatcher::submit(self, job).await
    }
}

#[derive(Clone)]
pub struct RestState {
    pub peers: Arc<dyn PeerOperations>,
    pub jobs: Arc<dyn JobOperations>,
    pub book: PeerBook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Success,
    Error,
}

/// Envelope for every API reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: ApiStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            status: ApiStatus::Success,
            message: Some(message.into()),
            error: None,
            details: None,
            data,
        }
    }

    pub fn error(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: ApiStatus::Error,
            message: None,
            error: Some(error.into()),
            details: Some(details.into()),
            data: None,
        }
    }
}

type ApiReply<T> = (StatusCode, Json<ApiResponse<T>>);

fn reply<T>(status: StatusCode, body: ApiResponse<T>) -> ApiReply<T> {
    (status, Json(body))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub id: String,
    pub addresses: Vec<String>,
    pub peers: Vec<String>,
    pub num_peers: usize,
    pub network: String,
    /// Peers discovery has seen under the rendezvous namespace
    pub known_peers: usize,
    /// Known peers whose last dial failed
    pub unreachable_peers: usize,
    /// Free CPU cores
    pub cpu: usize,
    /// Free RAM in GiB
    pub ram: f64,
    pub total_cpu: usize,
    pub total_ram: f64,
    pub cpu_model: String,
    pub cpu_ghz: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AddPeerRequest {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddPeerAccepted {
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployAccepted {
    pub target_peer_id: String,
}

/// Builds the API router.
pub fn build_router(
    peers: Arc<dyn PeerOperations>,
    jobs: Arc<dyn JobOperations>,
    book: PeerBook,
) -> Router {
    let state = RestState { peers, jobs, book };
    Router::new()
        .route("/health", get(health))
        .route("/peer", post(add_peer))
        .route("/deploy", post(deploy))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

async fn health(State(state): State<RestState>) -> ApiReply<HealthResponse> {
    let compute = match telemetry::snapshot().await {
        Ok(compute) => compute,
        Err(e) => {
            error!("health: {}", e);
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error("Error getting compute availability", e.to_string()),
            );
        }
    };

    let peers: Vec<String> = match state.jobs.list_peers().await {
        Ok(peers) => peers.iter().map(PeerId::to_string).collect(),
        Err(e) => {
            error!("health: {}", e);
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error("Error listing peers", e.to_string()),
            );
        }
    };

    let body = HealthResponse {
        id: state.peers.peer_id().to_string(),
        addresses: state.peers.list_addresses(),
        num_peers: peers.len(),
        peers,
        network: "libp2p".to_string(),
        known_peers: state.book.len().await,
        unreachable_peers: state.book.unreachable_count().await,
        cpu: compute.free_cpu_cores,
        ram: compute.free_ram_gib,
        total_cpu: compute.total_cpu_cores,
        total_ram: compute.total_ram_gib,
        cpu_ghz: compute.cpu_ghz(),
        cpu_model: compute.cpu_model,
    };
    reply(StatusCode::OK, ApiResponse::success("Healthy", Some(body)))
}

async fn add_peer(
    State(state): State<RestState>,
    payload: Result<Json<AddPeerRequest>, JsonRejection>,
) -> ApiReply<AddPeerAccepted> {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return reply(
                StatusCode::BAD_REQUEST,
                ApiResponse::error("Invalid request", rejection.body_text()),
            );
        }
    };
    if request.address.trim().is_empty() {
        return reply(
            StatusCode::BAD_REQUEST,
            ApiResponse::error("Invalid request", "address is required"),
        );
    }

    info!("add_peer: {}", request.address);
    match state.peers.add_peer(&request.address).await {
        Ok(peer) => reply(
            StatusCode::OK,
            ApiResponse::success(
                "Peer added",
                Some(AddPeerAccepted {
                    peer_id: peer.to_string(),
                }),
            ),
        ),
        Err(e) => {
            warn!("add_peer: {}", e);
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error("Error adding peer", e.to_string()),
            )
        }
    }
}

async fn deploy(
    State(state): State<RestState>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> ApiReply<DeployAccepted> {
    let Json(job) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return reply(
                StatusCode::BAD_REQUEST,
                ApiResponse::error("Invalid request", rejection.body_text()),
            );
        }
    };

    debug!("deploy: {} {:?}", job.program, job.arguments);
    match state.jobs.submit(&job).await {
        Ok(request) => reply(
            StatusCode::OK,
            ApiResponse::success(
                "Job request sent",
                Some(DeployAccepted {
                    target_peer_id: request.target_peer_id,
                }),
            ),
        ),
        Err(DispatchError::InvalidJob(reason)) => reply(
            StatusCode::BAD_REQUEST,
            ApiResponse::error("Invalid request", reason),
        ),
        Err(DispatchError::NoPeers { .. }) => reply(
            StatusCode::SERVICE_UNAVAILABLE,
            ApiResponse::error(
                "No peers available to deploy program",
                "Ensure there are other peers listening on the deployment topic",
            ),
        ),
        Err(e) => {
            error!("deploy: {}", e);
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error("Error publishing request", e.to_string()),
            )
        }
    }
}

/// Binds `host:port`, moving to the next port while the current one is taken.
///
/// Tries at most `attempts` consecutive ports. Any error other than
/// "address in use" is returned immediately.
pub async fn bind_with_retry(host: &str, port: u16, attempts: u16) -> io::Result<TcpListener> {
    let mut last_error = None;
    for offset in 0..attempts.max(1) {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(
                    "Port {} already in use, retrying with port {}",
                    candidate,
                    candidate.wrapping_add(1)
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, format!("no free port from {port}"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_with_retry_skips_taken_port() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        match bind_with_retry("127.0.0.1", port, 5).await {
            Ok(listener) => {
                let bound = listener.local_addr().unwrap().port();
                assert!(bound > port && bound < port.saturating_add(5));
            }
            // The neighbouring ports may all be taken on a busy host.
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::AddrInUse),
        }
    }

    #[tokio::test]
    async fn bind_with_retry_gives_up_after_attempts() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_with_retry("127.0.0.1", port, 1).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn error_envelope_omits_empty_fields() {
        let body: ApiResponse<()> = ApiResponse::error("Invalid request", "address is required");
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "status": "error",
                "error": "Invalid request",
                "details": "address is required"
            })
        );
    }
}
