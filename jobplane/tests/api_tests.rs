//! REST API tests against fake overlay and job backends.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobplane::api::{PeerOperations, JobOperations, build_router};
use jobplane::dispatcher::DispatchError;
use jobplane::fabric::FabricError;
use jobplane::membership::{Discovery, PeerBook, Rendezvous};
use jobplane::messages::{DeployRequest, JobRequest};
use jobplane::network::{NetworkError, parse_peer_address};
use libp2p::PeerId;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::net::TcpListener;

struct FakePeers {
    local: PeerId,
}

#[async_trait]
impl PeerOperations for FakePeers {
    fn peer_id(&self) -> PeerId {
        self.local
    }

    fn list_addresses(&self) -> Vec<String> {
        vec![format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", self.local)]
    }

    async fn add_peer(&self, address: &str) -> Result<PeerId, NetworkError> {
        let (peer, _) = parse_peer_address(address)?;
        Ok(peer)
    }
}

#[derive(Default)]
struct FakeJobs {
    peers: Vec<PeerId>,
    submitted: Mutex<Vec<JobRequest>>,
}

#[async_trait]
impl JobOperations for FakeJobs {
    async fn list_peers(&self) -> Result<Vec<PeerId>, FabricError> {
        Ok(self.peers.clone())
    }

    async fn submit(&self, job: &JobRequest) -> Result<DeployRequest, DispatchError> {
        job.validate().map_err(DispatchError::InvalidJob)?;
        let target = self.peers.first().ok_or_else(|| DispatchError::NoPeers {
            topic: "container-deployment".to_string(),
        })?;
        self.submitted.lock().unwrap().push(job.clone());
        Ok(DeployRequest {
            target_peer_id: target.to_string(),
            program: job.program.clone(),
            arguments: job.arguments.clone(),
            ..Default::default()
        })
    }
}

/// Discovery backend with one reachable and one unreachable provider.
struct FakeRendezvous {
    local: PeerId,
    reachable: PeerId,
    unreachable: PeerId,
}

#[async_trait]
impl Rendezvous for FakeRendezvous {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn advertise(&self, _namespace: &str) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn find_peers(&self, _namespace: &str) -> Result<Vec<PeerId>, NetworkError> {
        Ok(vec![self.reachable, self.unreachable])
    }

    async fn is_connected(&self, _peer: PeerId) -> Result<bool, NetworkError> {
        Ok(false)
    }

    async fn connect(&self, peer: PeerId) -> Result<(), NetworkError> {
        if peer == self.unreachable {
            return Err(NetworkError::Connect {
                peer,
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Serves the router on an ephemeral port and returns its base URL.
async fn serve(peers: Arc<FakePeers>, jobs: Arc<FakeJobs>) -> String {
    serve_with_book(peers, jobs, PeerBook::new()).await
}

async fn serve_with_book(peers: Arc<FakePeers>, jobs: Arc<FakeJobs>, book: PeerBook) -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(peers, jobs, book);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    format!("http://{addr}")
}

fn fake_peers() -> Arc<FakePeers> {
    Arc::new(FakePeers {
        local: PeerId::random(),
    })
}

#[tokio::test]
async fn test_health_reports_identity_and_peers() {
    let peers = fake_peers();
    let remote = PeerId::random();
    let jobs = Arc::new(FakeJobs {
        peers: vec![remote],
        ..Default::default()
    });
    let base = serve(peers.clone(), jobs).await;

    let resp = Client::new()
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "success");
    let data = &body["data"];
    assert_eq!(data["id"], peers.local.to_string());
    assert_eq!(data["peers"], json!([remote.to_string()]));
    assert_eq!(data["num_peers"], 1);
    assert_eq!(data["network"], "libp2p");
    assert_eq!(data["known_peers"], 0);
    assert_eq!(data["unreachable_peers"], 0);
    assert_eq!(data["addresses"].as_array().unwrap().len(), 1);
    assert!(data["total_cpu"].as_u64().unwrap() > 0);
    assert!(data["total_ram"].as_f64().unwrap() > 0.0);
    assert!(data["cpu_model"].is_string());
}

#[tokio::test]
async fn test_health_reports_discovery_state() {
    let peers = fake_peers();
    let discovery = Discovery::new(
        Arc::new(FakeRendezvous {
            local: peers.local,
            reachable: PeerId::random(),
            unreachable: PeerId::random(),
        }),
        "container-deployment",
    );
    let report = discovery.run_cycle().await.unwrap();
    assert_eq!(report.connected.len(), 1);
    assert_eq!(report.failed.len(), 1);

    let base = serve_with_book(peers, Arc::new(FakeJobs::default()), discovery.book()).await;
    let body: Value = Client::new()
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["data"]["known_peers"], 2);
    assert_eq!(body["data"]["unreachable_peers"], 1);
}

#[tokio::test]
async fn test_add_peer_validation_and_success() {
    let base = serve(fake_peers(), Arc::new(FakeJobs::default())).await;
    let client = Client::new();

    // Malformed JSON
    let resp = client
        .post(format!("{base}/peer"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"], "Invalid request");

    // Missing address
    let resp = client
        .post(format!("{base}/peer"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Unparseable address
    let resp = client
        .post(format!("{base}/peer"))
        .json(&json!({"address": "/ip4/127.0.0.1/tcp/4001"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Error adding peer");

    let remote = PeerId::random();
    let resp = client
        .post(format!("{base}/peer"))
        .json(&json!({"address": format!("/ip4/127.0.0.1/tcp/4001/p2p/{remote}")}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["peer_id"], remote.to_string());
}

#[tokio::test]
async fn test_deploy_without_peers_is_unavailable() {
    let jobs = Arc::new(FakeJobs::default());
    let base = serve(fake_peers(), jobs.clone()).await;

    let resp = Client::new()
        .post(format!("{base}/deploy"))
        .json(&json!({"program": "echo", "arguments": ["hi"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"], "No peers available to deploy program");
    assert!(jobs.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_deploy_rejects_missing_program() {
    let jobs = Arc::new(FakeJobs {
        peers: vec![PeerId::random()],
        ..Default::default()
    });
    let base = serve(fake_peers(), jobs.clone()).await;

    let resp = Client::new()
        .post(format!("{base}/deploy"))
        .json(&json!({"program": "  ", "arguments": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(jobs.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_deploy_names_the_target() {
    let target = PeerId::random();
    let jobs = Arc::new(FakeJobs {
        peers: vec![target, PeerId::random()],
        ..Default::default()
    });
    let base = serve(fake_peers(), jobs.clone()).await;

    let resp = Client::new()
        .post(format!("{base}/deploy"))
        .json(&json!({"program": "echo", "arguments": ["hi"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "Job request sent");
    assert_eq!(body["data"]["target_peer_id"], target.to_string());

    let submitted = jobs.submitted.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].program, "echo");
    assert_eq!(submitted[0].arguments, vec!["hi".to_string()]);
}
