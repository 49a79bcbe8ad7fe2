use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

use crate::{error::ConcordError, proposer_set::ProposerSet, types::TopicID};

/// Source of the proposer set of each topic.
#[async_trait::async_trait]
pub trait ProposerStore: Send + Sync + 'static {
    async fn get(&self, topic_id: &str) -> Result<ProposerSet, ConcordError>;

    async fn save(&self, topic_id: &str, proposers: ProposerSet) -> Result<(), ConcordError>;
}

/// In-memory implementation of [`ProposerStore`].
#[derive(Clone, Default)]
pub struct InMemoryProposerStore {
    sets: Arc<RwLock<HashMap<TopicID, ProposerSet>>>,
}

impl InMemoryProposerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list_topics(&self) -> Vec<TopicID> {
        self.sets.read().await.keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl ProposerStore for InMemoryProposerStore {
    async fn get(&self, topic_id: &str) -> Result<ProposerSet, ConcordError> {
        self.sets
            .read()
            .await
            .get(topic_id)
            .cloned()
            .ok_or_else(|| ConcordError::ProposerSetNotFound(topic_id.to_string()))
    }

    async fn save(&self, topic_id: &str, proposers: ProposerSet) -> Result<(), ConcordError> {
        self.sets
            .write()
            .await
            .insert(topic_id.to_string(), proposers);
        Ok(())
    }
}
