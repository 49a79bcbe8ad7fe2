use alloy_signer::Signer;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ConcordConfig,
    error::ConcordError,
    events::{BroadcastEventBus, ConcordEvent, ConcordEventBus},
    message::decode_message,
    protos::concord::v1::{VoteKind, concord_message::Payload},
    round::{Decision, Round, Step},
    storage::ProposerStore,
    transport::Topic,
    types::{PeerId, TopicID, ValidationResult},
    utils::MAX_CONTENT_HASH_LENGTH,
    validator::ProposalValidator,
};

enum RoundOutcome {
    Advance(u32),
    Decided(Decision),
}

struct RoundSlot<T, SN> {
    round: Option<Arc<Round<T, SN>>>,
    pending: VecDeque<(PeerId, Payload)>,
}

fn payload_origin(payload: &Payload) -> (&str, u64) {
    match payload {
        Payload::Proposal(proposal) => (proposal.topic_id.as_str(), proposal.height),
        Payload::Vote(vote) => (vote.topic_id.as_str(), vote.height),
    }
}

/// Agreement session bound to one gossip topic.
///
/// Every call to [`Concord::agree_on`] runs one agreement at the next height, fetching the
/// proposer set for that height from the store. Inbound gossip is fed through
/// [`Concord::incoming`], which the [`Conciliator`](crate::conciliator::Conciliator) registers as
/// the topic's validator.
pub struct Concord<T, S, SN, E = BroadcastEventBus>
where
    T: Topic,
    S: ProposerStore,
    SN: Signer + Send + Sync + 'static,
    E: ConcordEventBus,
{
    topic_id: TopicID,
    topic: Arc<T>,
    validator: Arc<dyn ProposalValidator>,
    store: Arc<S>,
    signer: Arc<SN>,
    config: ConcordConfig,
    event_bus: E,
    height: AtomicU64,
    agreement: tokio::sync::Mutex<()>,
    slot: Mutex<RoundSlot<T, SN>>,
}

impl<T, S, SN, E> Concord<T, S, SN, E>
where
    T: Topic,
    S: ProposerStore,
    SN: Signer + Send + Sync + 'static,
    E: ConcordEventBus,
{
    pub fn new(
        topic_id: TopicID,
        topic: Arc<T>,
        validator: Arc<dyn ProposalValidator>,
        store: Arc<S>,
        signer: Arc<SN>,
        config: ConcordConfig,
        event_bus: E,
    ) -> Self {
        Self {
            topic_id,
            topic,
            validator,
            store,
            signer,
            config,
            event_bus,
            height: AtomicU64::new(0),
            agreement: tokio::sync::Mutex::new(()),
            slot: Mutex::new(RoundSlot {
                round: None,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn topic_id(&self) -> &TopicID {
        &self.topic_id
    }

    pub fn config(&self) -> &ConcordConfig {
        &self.config
    }

    /// Height of the last finished agreement, `0` before the first one.
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    /// Round of the running agreement, or of the last finished one.
    pub fn active_round(&self) -> Option<Arc<Round<T, SN>>> {
        self.slot.lock().round.clone()
    }

    pub fn subscribe_to_events(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    /// Number of buffered messages for heights that have not started yet.
    pub fn pending_len(&self) -> usize {
        self.slot.lock().pending.len()
    }

    /// Run one agreement, proposing `value` whenever this node is the round's proposer, and
    /// return the decided value.
    ///
    /// Calls are serialized; each one consumes a height whether it decides or fails.
    pub async fn agree_on(
        &self,
        cancel: &CancellationToken,
        value: Vec<u8>,
    ) -> Result<Vec<u8>, ConcordError> {
        let _agreement = self.agreement.lock().await;

        let proposers = Arc::new(self.store.get(&self.topic_id).await?);
        let height = self.height().saturating_add(1);
        let round = Arc::new(Round::new(
            self.topic_id.clone(),
            height,
            Arc::clone(&self.topic),
            Arc::clone(&self.signer),
            proposers,
            &self.config,
        ));
        self.install(Arc::clone(&round));
        info!(
            "Starting agreement at height {height} on {} with {} proposers",
            self.topic_id,
            round.proposers().len()
        );

        let result = self.drive(cancel, &round, &value).await;
        self.height.store(height, Ordering::SeqCst);
        result
    }

    /// Inbound gate for gossip on this session's topic.
    ///
    /// Malformed, forged, or conflicting messages are rejected. Messages for one of the next
    /// `pending_heights` heights are buffered and ignored for propagation; messages further
    /// ahead are ignored without being kept.
    pub fn incoming(&self, peer: &PeerId, data: &[u8]) -> ValidationResult {
        match self.handle(peer, data) {
            Ok(result) => result,
            Err(err) => {
                debug!("Rejecting message from {peer} on {}: {err}", self.topic_id);
                ValidationResult::Reject
            }
        }
    }

    fn handle(&self, peer: &PeerId, data: &[u8]) -> Result<ValidationResult, ConcordError> {
        let payload = decode_message(data)?;
        let (topic_id, height) = payload_origin(&payload);
        if topic_id != self.topic_id {
            return Err(ConcordError::TopicMismatch {
                expected: self.topic_id.clone(),
                got: topic_id.to_string(),
            });
        }

        let round = {
            let mut slot = self.slot.lock();
            let active = slot.round.clone();
            match active {
                Some(round) if round.height() == height => round,
                Some(round) if round.height() > height => {
                    return Err(ConcordError::StaleHeight {
                        active: round.height(),
                        got: height,
                    });
                }
                active => {
                    let finished = self.height();
                    if height <= finished {
                        return Err(ConcordError::StaleHeight {
                            active: finished,
                            got: height,
                        });
                    }
                    let local = active.map_or(finished, |round| round.height().max(finished));
                    self.buffer(&mut slot, local, peer, payload, height);
                    return Ok(ValidationResult::Ignore);
                }
            }
        };

        self.dispatch(&round, peer, payload)
    }

    /// Hold a message for a height that has not started, within the look-ahead window and
    /// the per-peer share of the buffer.
    fn buffer(
        &self,
        slot: &mut RoundSlot<T, SN>,
        local: u64,
        peer: &PeerId,
        payload: Payload,
        height: u64,
    ) {
        if height > local.saturating_add(self.config.pending_heights) {
            debug!(
                "Ignoring message from {peer} for height {height} on {}, local height is {local}",
                self.topic_id
            );
            return;
        }
        if slot.pending.len() >= self.config.pending_capacity {
            debug!(
                "Pending buffer full on {}, dropping message for height {height}",
                self.topic_id
            );
            return;
        }
        let buffered = slot
            .pending
            .iter()
            .filter(|(sender, _)| sender == peer)
            .count();
        if buffered >= self.config.pending_per_peer {
            debug!(
                "Peer {peer} already has {buffered} buffered messages on {}, dropping one for height {height}",
                self.topic_id
            );
            return;
        }
        slot.pending.push_back((peer.clone(), payload));
    }

    fn dispatch(
        &self,
        round: &Round<T, SN>,
        peer: &PeerId,
        payload: Payload,
    ) -> Result<ValidationResult, ConcordError> {
        match payload {
            Payload::Proposal(proposal) => {
                round.rcv_proposal(proposal)?;
                Ok(ValidationResult::Accept)
            }
            Payload::Vote(vote) => match round.rcv_vote(vote, peer) {
                Ok(true) => Ok(ValidationResult::Accept),
                Ok(false) => Ok(ValidationResult::Ignore),
                Err(ConcordError::ConflictingVote {
                    voter_index,
                    round: vote_round,
                }) => {
                    warn!(
                        "Voter {voter_index} equivocated in round {vote_round} at height {} on {}",
                        round.height(),
                        self.topic_id
                    );
                    self.event_bus.publish(
                        self.topic_id.clone(),
                        ConcordEvent::EquivocationDetected {
                            height: round.height(),
                            round: vote_round,
                            voter_index,
                        },
                    );
                    Err(ConcordError::ConflictingVote {
                        voter_index,
                        round: vote_round,
                    })
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Make `round` the target of inbound messages and replay what was buffered for its height.
    fn install(&self, round: Arc<Round<T, SN>>) {
        let height = round.height();
        let horizon = height.saturating_add(self.config.pending_heights);
        let replay: Vec<(PeerId, Payload)> = {
            let mut slot = self.slot.lock();
            slot.round = Some(Arc::clone(&round));
            let (ready, later): (VecDeque<_>, VecDeque<_>) = slot
                .pending
                .drain(..)
                .filter(|(_, payload)| (height..=horizon).contains(&payload_origin(payload).1))
                .partition(|(_, payload)| payload_origin(payload).1 == height);
            slot.pending = later;
            ready.into()
        };

        if !replay.is_empty() {
            debug!(
                "Replaying {} buffered messages at height {height} on {}",
                replay.len(),
                self.topic_id
            );
        }
        for (peer, payload) in replay {
            if let Err(err) = self.dispatch(&round, &peer, payload) {
                debug!("Dropping buffered message from {peer} on {}: {err}", self.topic_id);
            }
        }
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        round: &Round<T, SN>,
        value: &[u8],
    ) -> Result<Vec<u8>, ConcordError> {
        loop {
            let current = round.current_round();
            if self.config.max_rounds.is_some_and(|max| current >= max) {
                warn!(
                    "Agreement at height {} on {} exceeded {current} rounds",
                    round.height(),
                    self.topic_id
                );
                return Err(ConcordError::MaxRoundsExceeded);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(
                        "Agreement at height {} on {} cancelled in round {current}",
                        round.height(),
                        self.topic_id
                    );
                    return Err(ConcordError::Cancelled);
                }
                outcome = tokio::time::timeout(
                    self.config.round_timeout,
                    self.run_round(round, value),
                ) => outcome,
            };

            match outcome {
                Err(_) => {
                    warn!(
                        "Round {current} at height {} on {} timed out",
                        round.height(),
                        self.topic_id
                    );
                    self.advance(round, current, current.saturating_add(1));
                }
                Ok(Ok(RoundOutcome::Advance(next))) => self.advance(round, current, next),
                Ok(Ok(RoundOutcome::Decided(decision))) => {
                    info!(
                        "Decided at height {} round {} on {}",
                        round.height(),
                        decision.round,
                        self.topic_id
                    );
                    round.mark_decided(decision.clone());
                    self.event_bus.publish(
                        self.topic_id.clone(),
                        ConcordEvent::Decided {
                            height: round.height(),
                            round: decision.round,
                            content_hash: decision.content_hash,
                        },
                    );
                    return Ok(decision.value);
                }
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    async fn run_round(
        &self,
        round: &Round<T, SN>,
        value: &[u8],
    ) -> Result<RoundOutcome, ConcordError> {
        let current = round.current_round();

        let proposal = match round.propose(value).await? {
            Step::Ready(proposal) => proposal,
            Step::Skip(next) => return Ok(RoundOutcome::Advance(next)),
            Step::Decided(decision) => return Ok(RoundOutcome::Decided(decision)),
        };
        let hash = self
            .validator
            .validate(&proposal)
            .await
            .map_err(|err| ConcordError::ValidationFailed(err.to_string()))?;
        if hash.is_empty() || hash.len() > MAX_CONTENT_HASH_LENGTH {
            return Err(ConcordError::ValidationFailed(format!(
                "validator returned a {} byte content hash",
                hash.len()
            )));
        }
        round.record_valid(hash.clone(), proposal);

        let prevote = round.prevote_target(current, hash);
        let majority = match round.vote(prevote, VoteKind::Prevote).await? {
            Step::Ready(majority) => majority,
            Step::Skip(next) => return Ok(RoundOutcome::Advance(next)),
            Step::Decided(decision) => return Ok(RoundOutcome::Decided(decision)),
        };

        let Some(precommit) = round.precommit_target(current, &majority) else {
            return Ok(RoundOutcome::Advance(current.saturating_add(1)));
        };
        match round.vote(precommit, VoteKind::Precommit).await? {
            Step::Decided(decision) => Ok(RoundOutcome::Decided(decision)),
            Step::Skip(next) => Ok(RoundOutcome::Advance(next)),
            // Majorities on locally validated values surface as `Decided`.
            Step::Ready(_) => {
                debug!(
                    "Precommit majority in round {current} on {} is for an unknown value",
                    self.topic_id
                );
                Ok(RoundOutcome::Advance(current.saturating_add(1)))
            }
        }
    }

    fn advance(&self, round: &Round<T, SN>, from: u32, to: u32) {
        let to = to.max(from.saturating_add(1));
        round.enter_round(to);
        self.event_bus.publish(
            self.topic_id.clone(),
            ConcordEvent::RoundAdvanced {
                height: round.height(),
                from,
                to,
            },
        );
    }
}
