use tokio::sync::broadcast;

use crate::types::{ContentHash, TopicID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcordEvent {
    /// An agreement finished with a decided value.
    Decided {
        height: u64,
        round: u32,
        content_hash: ContentHash,
    },
    /// A round ended without a decision and the session moved on.
    RoundAdvanced { height: u64, from: u32, to: u32 },
    /// A voter signed two different votes for the same slot.
    EquivocationDetected {
        height: u64,
        round: u32,
        voter_index: u32,
    },
}

pub trait ConcordEventBus: Clone + Send + Sync + 'static {
    /// Type returned to consumers that subscribe to agreement events.
    type Receiver;

    fn subscribe(&self) -> Self::Receiver;
    fn publish(&self, topic_id: TopicID, event: ConcordEvent);
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<(TopicID, ConcordEvent)>,
}

impl BroadcastEventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ConcordEventBus for BroadcastEventBus {
    type Receiver = broadcast::Receiver<(TopicID, ConcordEvent)>;

    fn subscribe(&self) -> Self::Receiver {
        self.sender.subscribe()
    }

    fn publish(&self, topic_id: TopicID, event: ConcordEvent) {
        let _ = self.sender.send((topic_id, event));
    }
}
