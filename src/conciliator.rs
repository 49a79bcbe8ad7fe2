use alloy_signer::Signer;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tracing::{debug, info};

use crate::{
    concord::Concord,
    config::ConcordConfig,
    error::ConcordError,
    events::{BroadcastEventBus, ConcordEventBus},
    storage::ProposerStore,
    transport::{PubSub, TopicValidator},
    types::{PeerId, TopicID, ValidationResult},
    validator::ProposalValidator,
};

/// Session type produced by a [`Conciliator`] over pub/sub `P`.
pub type ConcordFor<P, S, SN, E> = Concord<<P as PubSub>::Topic, S, SN, E>;

/// Factory of [`Concord`] sessions sharing one transport, proposer store, and signer.
///
/// Each topic can be joined once per conciliator while its session is alive.
pub struct Conciliator<P, S, SN, E = BroadcastEventBus>
where
    P: PubSub,
    S: ProposerStore,
    SN: Signer + Send + Sync + 'static,
    E: ConcordEventBus,
{
    pubsub: Arc<P>,
    store: Arc<S>,
    signer: Arc<SN>,
    config: ConcordConfig,
    event_bus: E,
    concords: Mutex<HashMap<TopicID, Weak<ConcordFor<P, S, SN, E>>>>,
}

impl<P, S, SN> Conciliator<P, S, SN, BroadcastEventBus>
where
    P: PubSub,
    S: ProposerStore,
    SN: Signer + Send + Sync + 'static,
{
    pub fn new(
        pubsub: Arc<P>,
        store: Arc<S>,
        signer: Arc<SN>,
        config: ConcordConfig,
    ) -> Result<Self, ConcordError> {
        Self::new_with_components(pubsub, store, signer, config, BroadcastEventBus::default())
    }
}

impl<P, S, SN, E> Conciliator<P, S, SN, E>
where
    P: PubSub,
    S: ProposerStore,
    SN: Signer + Send + Sync + 'static,
    E: ConcordEventBus,
{
    pub fn new_with_components(
        pubsub: Arc<P>,
        store: Arc<S>,
        signer: Arc<SN>,
        config: ConcordConfig,
        event_bus: E,
    ) -> Result<Self, ConcordError> {
        config.validate()?;
        Ok(Self {
            pubsub,
            store,
            signer,
            config,
            event_bus,
            concords: Mutex::new(HashMap::new()),
        })
    }

    /// Events of every session created by this conciliator.
    pub fn subscribe_to_events(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Topics with a live session.
    pub fn topics(&self) -> Vec<TopicID> {
        self.concords
            .lock()
            .iter()
            .filter(|(_, concord)| concord.strong_count() > 0)
            .map(|(topic_id, _)| topic_id.clone())
            .collect()
    }

    /// Join `topic_id` and create its agreement session.
    ///
    /// Fails when the topic already has a live session or the store has no proposer set for it.
    pub async fn new_concord(
        &self,
        topic_id: &str,
        validator: Arc<dyn ProposalValidator>,
    ) -> Result<Arc<ConcordFor<P, S, SN, E>>, ConcordError> {
        if self.is_joined(topic_id) {
            return Err(ConcordError::TopicAlreadyJoined(topic_id.to_string()));
        }

        let topic = self.pubsub.join(topic_id).await?;
        let proposers = self.store.get(topic_id).await?;

        let concord = Arc::new(Concord::new(
            topic_id.to_string(),
            Arc::new(topic),
            validator,
            Arc::clone(&self.store),
            Arc::clone(&self.signer),
            self.config.clone(),
            self.event_bus.clone(),
        ));

        let mut concords = self.concords.lock();
        match concords.get(topic_id) {
            Some(existing) if existing.strong_count() > 0 => {
                return Err(ConcordError::TopicAlreadyJoined(topic_id.to_string()));
            }
            // The previous session was dropped but its gate is still registered.
            Some(_) => {
                self.pubsub.unregister_validator(topic_id)?;
                concords.remove(topic_id);
                debug!("Released the dropped session on {topic_id}");
            }
            None => {}
        }

        let session = Arc::downgrade(&concord);
        let gate: TopicValidator = Arc::new(move |peer: &PeerId, data: &[u8]| {
            session
                .upgrade()
                .map_or(ValidationResult::Ignore, |concord| concord.incoming(peer, data))
        });
        self.pubsub.register_validator(topic_id, gate)?;
        concords.insert(topic_id.to_string(), Arc::downgrade(&concord));
        drop(concords);

        info!(
            "Joined {topic_id} as {} with {} proposers",
            self.signer.address(),
            proposers.len()
        );
        Ok(concord)
    }

    fn is_joined(&self, topic_id: &str) -> bool {
        self.concords
            .lock()
            .get(topic_id)
            .is_some_and(|concord| concord.strong_count() > 0)
    }
}
