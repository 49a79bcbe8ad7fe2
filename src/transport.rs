use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::debug;

use crate::{
    error::ConcordError,
    types::{PeerId, TopicID, ValidationResult},
};

/// Inbound message gate registered per topic. Called once for every received message,
/// possibly concurrently.
pub type TopicValidator = Arc<dyn Fn(&PeerId, &[u8]) -> ValidationResult + Send + Sync>;

/// Handle to a joined gossip topic.
#[async_trait::async_trait]
pub trait Topic: Send + Sync + 'static {
    async fn publish(&self, data: Vec<u8>) -> Result<(), ConcordError>;
}

/// Gossip pub/sub with unordered, at-least-once delivery.
#[async_trait::async_trait]
pub trait PubSub: Send + Sync + 'static {
    type Topic: Topic;

    async fn join(&self, topic_id: &str) -> Result<Self::Topic, ConcordError>;

    fn register_validator(
        &self,
        topic_id: &str,
        validator: TopicValidator,
    ) -> Result<(), ConcordError>;

    /// Remove this node's validator for `topic_id`. Unregistering an unknown topic is a no-op.
    fn unregister_validator(&self, topic_id: &str) -> Result<(), ConcordError>;
}

#[derive(Default)]
struct NetworkState {
    validators: HashMap<TopicID, Vec<(PeerId, TopicValidator)>>,
    offline: HashSet<PeerId>,
}

/// In-process gossip network shared by several [`InMemoryPubSub`] nodes.
///
/// Publishing runs every other subscribed node's validator inline, so delivery is immediate.
/// Offline peers neither send nor receive.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport handle for the node identified by `peer_id`.
    pub fn node(&self, peer_id: impl Into<PeerId>) -> InMemoryPubSub {
        InMemoryPubSub {
            peer_id: peer_id.into(),
            network: self.clone(),
        }
    }

    pub fn set_offline(&self, peer_id: &PeerId, offline: bool) {
        let mut state = self.state.write();
        if offline {
            state.offline.insert(peer_id.clone());
        } else {
            state.offline.remove(peer_id);
        }
    }

    /// Deliver `data` from `from` to every other node on the topic.
    pub fn broadcast(&self, topic_id: &str, from: &PeerId, data: &[u8]) -> Vec<ValidationResult> {
        let receivers: Vec<TopicValidator> = {
            let state = self.state.read();
            if state.offline.contains(from) {
                return Vec::new();
            }
            state
                .validators
                .get(topic_id)
                .map(|validators| {
                    validators
                        .iter()
                        .filter(|(peer, _)| peer != from && !state.offline.contains(peer))
                        .map(|(_, validator)| Arc::clone(validator))
                        .collect()
                })
                .unwrap_or_default()
        };

        receivers
            .into_iter()
            .map(|validator| validator(from, data))
            .collect()
    }
}

/// One node's view of an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryPubSub {
    peer_id: PeerId,
    network: InMemoryNetwork,
}

impl InMemoryPubSub {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

pub struct InMemoryTopic {
    topic_id: TopicID,
    peer_id: PeerId,
    network: InMemoryNetwork,
}

#[async_trait::async_trait]
impl Topic for InMemoryTopic {
    async fn publish(&self, data: Vec<u8>) -> Result<(), ConcordError> {
        let results = self.network.broadcast(&self.topic_id, &self.peer_id, &data);
        let rejected = results
            .iter()
            .filter(|result| **result == ValidationResult::Reject)
            .count();
        if rejected > 0 {
            debug!(
                "{rejected} of {} peers rejected message from {} on {}",
                results.len(),
                self.peer_id,
                self.topic_id
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PubSub for InMemoryPubSub {
    type Topic = InMemoryTopic;

    async fn join(&self, topic_id: &str) -> Result<Self::Topic, ConcordError> {
        Ok(InMemoryTopic {
            topic_id: topic_id.to_string(),
            peer_id: self.peer_id.clone(),
            network: self.network.clone(),
        })
    }

    fn register_validator(
        &self,
        topic_id: &str,
        validator: TopicValidator,
    ) -> Result<(), ConcordError> {
        let mut state = self.network.state.write();
        let validators = state.validators.entry(topic_id.to_string()).or_default();
        if validators.iter().any(|(peer, _)| peer == &self.peer_id) {
            return Err(ConcordError::Transport(format!(
                "validator already registered for {topic_id} by {}",
                self.peer_id
            )));
        }
        validators.push((self.peer_id.clone(), validator));
        Ok(())
    }

    fn unregister_validator(&self, topic_id: &str) -> Result<(), ConcordError> {
        let mut state = self.network.state.write();
        if let Some(validators) = state.validators.get_mut(topic_id) {
            validators.retain(|(peer, _)| peer != &self.peer_id);
            if validators.is_empty() {
                state.validators.remove(topic_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use crate::{
        transport::{InMemoryNetwork, PubSub, Topic, TopicValidator},
        types::{PeerId, ValidationResult},
    };

    fn counting_validator(counter: Arc<AtomicUsize>) -> TopicValidator {
        Arc::new(move |_: &PeerId, _: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            ValidationResult::Accept
        })
    }

    #[tokio::test]
    async fn publish_reaches_other_online_nodes() {
        let network = InMemoryNetwork::new();
        let a = network.node("a");
        let b = network.node("b");
        let c = network.node("c");

        let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for (node, counter) in [&a, &b, &c].into_iter().zip(&counters) {
            node.register_validator("t", counting_validator(Arc::clone(counter)))
                .unwrap();
        }
        assert!(a.register_validator("t", counting_validator(Arc::clone(&counters[0]))).is_err());

        let topic = a.join("t").await.unwrap();
        topic.publish(b"hello".to_vec()).await.unwrap();
        assert_eq!(counters[0].load(Ordering::SeqCst), 0);
        assert_eq!(counters[1].load(Ordering::SeqCst), 1);
        assert_eq!(counters[2].load(Ordering::SeqCst), 1);

        network.set_offline(&"c".to_string(), true);
        topic.publish(b"again".to_vec()).await.unwrap();
        assert_eq!(counters[1].load(Ordering::SeqCst), 2);
        assert_eq!(counters[2].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_node_stops_receiving_and_can_register_again() {
        let network = InMemoryNetwork::new();
        let a = network.node("a");
        let b = network.node("b");

        let first = Arc::new(AtomicUsize::new(0));
        b.register_validator("t", counting_validator(Arc::clone(&first)))
            .unwrap();
        b.unregister_validator("t").unwrap();
        b.unregister_validator("unknown").unwrap();

        let topic = a.join("t").await.unwrap();
        topic.publish(b"dropped".to_vec()).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);

        let second = Arc::new(AtomicUsize::new(0));
        b.register_validator("t", counting_validator(Arc::clone(&second)))
            .unwrap();
        topic.publish(b"delivered".to_vec()).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
