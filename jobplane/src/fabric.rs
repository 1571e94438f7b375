//! # Broadcast Fabric
//!
//! Named topics that nodes join, publish to and subscribe on. Delivery is
//! best-effort to the current members of a topic, without acknowledgement.
//!
//! A publisher also receives its own messages: every subscriber of a topic,
//! local ones included, sees every message published on it, tagged with the
//! identity of the node that published it. Consumers that must ignore their
//! own traffic wrap their stream with [`MessageStream::excluding`].
//!
//! Two implementations sit behind [`Fabric`] and [`Topic`]:
//! - [`crate::network::Network`]: gossipsub topics over the libp2p overlay
//! - [`LocalHub`]: an in-process hub that any number of simulated nodes can
//!   attach to, used to exercise the dispatch protocol without sockets

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libp2p::PeerId;
use log::{trace, warn};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of each subscriber queue. A full queue drops new messages.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

/// Suffix appended to the base topic to form the response topic.
const RESPONSE_TOPIC_SUFFIX: &str = "-response";

/// Name of the response topic paired with `base`.
pub fn response_topic(base: &str) -> String {
    format!("{base}{RESPONSE_TOPIC_SUFFIX}")
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("failed to join topic {topic}: {reason}")]
    Join { topic: String, reason: String },

    #[error("failed to publish on topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("fabric is shut down")]
    Closed,
}

/// A message received from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricMessage {
    pub topic: String,
    /// Publishing node, `None` for anonymous messages
    pub source: Option<PeerId>,
    pub data: Vec<u8>,
}

/// Messages delivered to one subscription, in arrival order.
pub struct MessageStream {
    rx: mpsc::Receiver<FabricMessage>,
}

impl MessageStream {
    pub fn new(rx: mpsc::Receiver<FabricMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<FabricMessage> {
        self.rx.recv().await
    }

    /// Filters out messages published by `local`.
    pub fn excluding(self, local: PeerId) -> ForeignMessages {
        ForeignMessages {
            inner: self,
            local,
        }
    }
}

/// A [`MessageStream`] with the local node's own messages removed.
pub struct ForeignMessages {
    inner: MessageStream,
    local: PeerId,
}

impl ForeignMessages {
    pub async fn next(&mut self) -> Option<FabricMessage> {
        loop {
            let message = self.inner.recv().await?;
            if message.source == Some(self.local) {
                trace!("Skipping own message on topic {}", message.topic);
                continue;
            }
            return Some(message);
        }
    }
}

/// Entry point to a broadcast fabric for one node.
#[async_trait]
pub trait Fabric: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Joins `topic`, returning a handle that stays valid for the process lifetime.
    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, FabricError>;
}

/// A joined topic.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, data: Vec<u8>) -> Result<(), FabricError>;

    async fn subscribe(&self) -> Result<MessageStream, FabricError>;

    /// Peers currently known to be on this topic, never including the local node.
    async fn list_peers(&self) -> Result<Vec<PeerId>, FabricError>;
}

/// Delivers `message` to every open subscriber, pruning closed ones.
///
/// Shared by both fabric implementations so that the drop-on-full policy is
/// identical for the mesh and the hub.
pub(crate) fn fan_out(subscribers: &mut Vec<mpsc::Sender<FabricMessage>>, message: &FabricMessage) {
    subscribers.retain(|tx| match tx.try_send(message.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                "Subscriber queue full on topic {}, dropping message",
                message.topic
            );
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[derive(Default)]
struct TopicState {
    members: Vec<PeerId>,
    subscribers: Vec<mpsc::Sender<FabricMessage>>,
}

/// In-process fabric shared by simulated nodes.
#[derive(Clone, Default)]
pub struct LocalHub {
    topics: Arc<Mutex<HashMap<String, TopicState>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a node to the hub.
    pub fn attach(&self, peer: PeerId) -> LocalFabric {
        LocalFabric {
            hub: self.clone(),
            peer,
        }
    }

    fn with_topic<R>(
        &self,
        topic: &str,
        f: impl FnOnce(&mut TopicState) -> R,
    ) -> Result<R, FabricError> {
        let mut topics = self.topics.lock().map_err(|_| FabricError::Closed)?;
        Ok(f(topics.entry(topic.to_string()).or_default()))
    }
}

/// One node's view of a [`LocalHub`].
#[derive(Clone)]
pub struct LocalFabric {
    hub: LocalHub,
    peer: PeerId,
}

#[async_trait]
impl Fabric for LocalFabric {
    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, FabricError> {
        let peer = self.peer;
        self.hub.with_topic(topic, |state| {
            if !state.members.contains(&peer) {
                state.members.push(peer);
            }
        })?;
        Ok(Arc::new(LocalTopic {
            hub: self.hub.clone(),
            peer,
            name: topic.to_string(),
        }))
    }
}

struct LocalTopic {
    hub: LocalHub,
    peer: PeerId,
    name: String,
}

#[async_trait]
impl Topic for LocalTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), FabricError> {
        let message = FabricMessage {
            topic: self.name.clone(),
            source: Some(self.peer),
            data,
        };
        self.hub
            .with_topic(&self.name, |state| fan_out(&mut state.subscribers, &message))
    }

    async fn subscribe(&self) -> Result<MessageStream, FabricError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.hub
            .with_topic(&self.name, |state| state.subscribers.push(tx))?;
        Ok(MessageStream::new(rx))
    }

    async fn list_peers(&self) -> Result<Vec<PeerId>, FabricError> {
        let local = self.peer;
        self.hub.with_topic(&self.name, |state| {
            state
                .members
                .iter()
                .copied()
                .filter(|p| *p != local)
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn response_topic_appends_suffix() {
        assert_eq!(
            response_topic("container-deployment"),
            "container-deployment-response"
        );
    }

    #[tokio::test]
    async fn publisher_receives_its_own_message() {
        let hub = LocalHub::new();
        let a = hub.attach(PeerId::random());
        let topic = a.join("jobs").await.unwrap();
        let mut stream = topic.subscribe().await.unwrap();

        topic.publish(b"hello".to_vec()).await.unwrap();

        let message = stream.recv().await.unwrap();
        assert_eq!(message.source, Some(a.local_peer_id()));
        assert_eq!(message.data, b"hello");
        assert_eq!(message.topic, "jobs");
    }

    #[tokio::test]
    async fn excluding_drops_own_messages_only() {
        let hub = LocalHub::new();
        let a = hub.attach(PeerId::random());
        let b = hub.attach(PeerId::random());
        let topic_a = a.join("jobs").await.unwrap();
        let topic_b = b.join("jobs").await.unwrap();
        let mut foreign = topic_a
            .subscribe()
            .await
            .unwrap()
            .excluding(a.local_peer_id());

        topic_a.publish(b"mine".to_vec()).await.unwrap();
        topic_b.publish(b"theirs".to_vec()).await.unwrap();

        let message = foreign.next().await.unwrap();
        assert_eq!(message.source, Some(b.local_peer_id()));
        assert_eq!(message.data, b"theirs");
    }

    #[tokio::test]
    async fn list_peers_excludes_self_and_other_topics() {
        let hub = LocalHub::new();
        let a = hub.attach(PeerId::random());
        let b = hub.attach(PeerId::random());
        let c = hub.attach(PeerId::random());

        let jobs = a.join("jobs").await.unwrap();
        assert!(jobs.list_peers().await.unwrap().is_empty());

        b.join("jobs").await.unwrap();
        c.join("other").await.unwrap();

        assert_eq!(jobs.list_peers().await.unwrap(), vec![b.local_peer_id()]);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let hub = LocalHub::new();
        let a = hub.attach(PeerId::random());
        let jobs = a.join("jobs").await.unwrap();
        let other = a.join("other").await.unwrap();
        let mut stream = jobs.subscribe().await.unwrap();

        other.publish(b"elsewhere".to_vec()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_instead_of_blocking() {
        let hub = LocalHub::new();
        let a = hub.attach(PeerId::random());
        let topic = a.join("jobs").await.unwrap();
        let mut stream = topic.subscribe().await.unwrap();

        for i in 0..SUBSCRIBER_QUEUE_CAPACITY + 10 {
            topic.publish(i.to_string().into_bytes()).await.unwrap();
        }

        let mut received = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(20), stream.recv()).await
        {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let hub = LocalHub::new();
        let a = hub.attach(PeerId::random());
        let topic = a.join("jobs").await.unwrap();
        drop(topic.subscribe().await.unwrap());

        topic.publish(b"x".to_vec()).await.unwrap();

        let count = hub.with_topic("jobs", |s| s.subscribers.len()).unwrap();
        assert_eq!(count, 0);
    }
}
