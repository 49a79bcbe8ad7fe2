use alloy_signer::Signer;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, btree_map::Entry},
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    config::ConcordConfig,
    error::ConcordError,
    height_vote_set::HeightVoteSet,
    message::encode_message,
    proposer_set::ProposerSet,
    protos::concord::v1::{Proposal, Vote, VoteKind, concord_message::Payload},
    transport::Topic,
    types::{ContentHash, LockedValue, PeerId, TopicID},
    utils::{build_proposal, build_vote, verify_proposal_signature},
    vote_set::VoteSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStep {
    Propose,
    Prevote,
    Precommit,
    Decided,
}

/// A value that reached a precommit majority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub round: u32,
    pub value: Vec<u8>,
    pub content_hash: ContentHash,
}

/// Result of one suspension point of the round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// The awaited proposal or majority is available.
    Ready(T),
    /// A majority was seen at a later round; the caller should jump to it.
    Skip(u32),
    /// Some tracked round already committed a locally validated value.
    Decided(Decision),
}

#[derive(Debug)]
struct RoundState {
    round: u32,
    step: RoundStep,
    proposals: BTreeMap<u32, Proposal>,
    votes: HeightVoteSet,
    valid_values: HashMap<ContentHash, Vec<u8>>,
    locked: Option<LockedValue>,
    decided: Option<Decision>,
}

impl RoundState {
    fn decision(&self) -> Option<Decision> {
        if let Some(decided) = &self.decided {
            return Some(decided.clone());
        }
        self.votes
            .precommit_majorities()
            .find_map(|(round, hash)| {
                self.valid_values.get(hash).map(|value| Decision {
                    round,
                    value: value.clone(),
                    content_hash: hash.clone(),
                })
            })
    }
}

/// Proposal and vote bookkeeping for one height, driven through rounds by its session.
///
/// The driving task calls [`Round::propose`] and [`Round::vote`], which suspend until the
/// intake side ([`Round::rcv_proposal`], [`Round::rcv_vote`]) has gathered what they wait for.
/// Intake may run concurrently from any number of network handlers.
pub struct Round<T, SN> {
    topic_id: TopicID,
    height: u64,
    topic: Arc<T>,
    signer: Arc<SN>,
    proposers: Arc<ProposerSet>,
    local_index: Option<u32>,
    local_peer: PeerId,
    catchup_rounds: u32,
    state: Mutex<RoundState>,
    progress: watch::Sender<u64>,
}

impl<T, SN> Round<T, SN>
where
    T: Topic,
    SN: Signer + Send + Sync + 'static,
{
    pub fn new(
        topic_id: TopicID,
        height: u64,
        topic: Arc<T>,
        signer: Arc<SN>,
        proposers: Arc<ProposerSet>,
        config: &ConcordConfig,
    ) -> Self {
        let address = signer.address();
        let votes = HeightVoteSet::new(
            topic_id.clone(),
            height,
            Arc::clone(&proposers),
            config.catchup_rounds,
            config.retained_rounds,
        );
        let (progress, _) = watch::channel(0);

        Self {
            topic_id,
            height,
            topic,
            signer,
            local_index: proposers.index_of(&address),
            local_peer: address.to_string(),
            proposers,
            catchup_rounds: config.catchup_rounds as u32,
            state: Mutex::new(RoundState {
                round: 0,
                step: RoundStep::Propose,
                proposals: BTreeMap::new(),
                votes,
                valid_values: HashMap::new(),
                locked: None,
                decided: None,
            }),
            progress,
        }
    }

    pub fn topic_id(&self) -> &TopicID {
        &self.topic_id
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn proposers(&self) -> &Arc<ProposerSet> {
        &self.proposers
    }

    /// Whether the local signer belongs to the proposer set and therefore signs messages.
    pub fn is_member(&self) -> bool {
        self.local_index.is_some()
    }

    pub fn current_round(&self) -> u32 {
        self.state.lock().round
    }

    pub fn step(&self) -> RoundStep {
        self.state.lock().step
    }

    pub fn locked(&self) -> Option<LockedValue> {
        self.state.lock().locked.clone()
    }

    pub fn decision(&self) -> Option<Decision> {
        self.state.lock().decided.clone()
    }

    pub fn proposal(&self, round: u32) -> Option<Proposal> {
        self.state.lock().proposals.get(&round).cloned()
    }

    /// Snapshot of a tracked vote set.
    pub fn vote_set(&self, round: u32, kind: VoteKind) -> Option<VoteSet> {
        self.state.lock().votes.vote_set(round, kind).cloned()
    }

    pub fn prevotes(&self, round: u32) -> Option<VoteSet> {
        self.vote_set(round, VoteKind::Prevote)
    }

    pub fn precommits(&self, round: u32) -> Option<VoteSet> {
        self.vote_set(round, VoteKind::Precommit)
    }

    /// Move to a later round. Earlier or equal rounds are ignored.
    pub fn enter_round(&self, round: u32) {
        {
            let mut state = self.state.lock();
            if round <= state.round {
                return;
            }
            state.round = round;
            state.step = RoundStep::Propose;
            state.votes.set_round(round);
            let floor = state.votes.floor();
            state.proposals = state.proposals.split_off(&floor);
        }
        self.notify();
    }

    /// Propose step: broadcast our proposal if we are this round's proposer, then wait for the
    /// round's proposal and return its value. A locked participant re-proposes its locked value.
    pub async fn propose(&self, value: &[u8]) -> Result<Step<Vec<u8>>, ConcordError> {
        let round = self.current_round();
        let proposer_index = self.proposers.proposer_index_for(round);

        if self.local_index == Some(proposer_index) {
            let (proposed, locked) = {
                let state = self.state.lock();
                (state.proposals.contains_key(&round), state.locked.clone())
            };
            if !proposed {
                let value = locked.map_or_else(|| value.to_vec(), |lock| lock.value);
                let proposal = build_proposal(
                    &*self.signer,
                    &self.topic_id,
                    self.height,
                    round,
                    proposer_index,
                    value,
                )
                .await?;
                debug!(
                    "Proposing at height {} round {round} on {}",
                    self.height, self.topic_id
                );
                if self.store_proposal(proposal.clone())? {
                    self.notify();
                }
                self.publish(Payload::Proposal(proposal)).await?;
            }
        }

        self.wait_for(round, |state| {
            state
                .proposals
                .get(&round)
                .map(|proposal| proposal.value.clone())
        })
        .await
    }

    /// Sign and broadcast our vote of `kind` for `hash` in the current round, then wait until
    /// that round's vote set of `kind` reaches a majority and return the winning hash.
    pub async fn vote(
        &self,
        hash: ContentHash,
        kind: VoteKind,
    ) -> Result<Step<ContentHash>, ConcordError> {
        let round = {
            let mut state = self.state.lock();
            state.step = match kind {
                VoteKind::Precommit => RoundStep::Precommit,
                _ => RoundStep::Prevote,
            };
            state.round
        };

        if let Some(index) = self.local_index {
            let voted = self
                .state
                .lock()
                .votes
                .vote_set(round, kind)
                .is_some_and(|votes| votes.has_vote(index));

            if !voted {
                let vote = build_vote(
                    &*self.signer,
                    &self.topic_id,
                    self.height,
                    round,
                    kind,
                    index,
                    hash,
                )
                .await?;

                let recorded = {
                    let mut state = self.state.lock();
                    state.votes.add_vote(vote.clone(), &self.local_peer)
                };
                match recorded {
                    Ok(_) => {
                        self.notify();
                        self.publish(Payload::Vote(vote)).await?;
                    }
                    // The window moved past this round; the wait below reports the skip.
                    Err(ConcordError::GotVoteFromUnwantedRound) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        self.wait_for(round, |state| state.votes.majority(round, kind))
            .await
    }

    /// Intake of a proposal received from the network.
    pub fn rcv_proposal(&self, proposal: Proposal) -> Result<(), ConcordError> {
        self.check_origin(&proposal.topic_id, proposal.height)?;

        let expected = self.proposers.proposer_index_for(proposal.round);
        if proposal.proposer_index != expected {
            return Err(ConcordError::UnexpectedProposer {
                round: proposal.round,
                expected,
                got: proposal.proposer_index,
            });
        }
        let proposer = self.proposers.proposer_for(proposal.round);
        verify_proposal_signature(&proposal, &proposer.address)?;

        if self.store_proposal(proposal)? {
            self.notify();
        }
        Ok(())
    }

    /// Intake of a vote received from `peer`. Returns whether the vote was new.
    pub fn rcv_vote(&self, vote: Vote, peer: &PeerId) -> Result<bool, ConcordError> {
        self.check_origin(&vote.topic_id, vote.height)?;

        let added = self.state.lock().votes.add_vote(vote, peer)?;
        if added {
            self.notify();
        }
        Ok(added)
    }

    /// Remember a value the application validated, so majorities on its hash can be committed.
    pub fn record_valid(&self, hash: ContentHash, value: Vec<u8>) {
        self.state.lock().valid_values.insert(hash, value);
        self.notify();
    }

    /// Hash to prevote in `round` for a proposal hashing to `proposal_hash`.
    ///
    /// A locked participant keeps prevoting its locked hash unless a round after the lock shows
    /// a prevote majority for the new proposal, in which case the lock is released.
    pub fn prevote_target(&self, round: u32, proposal_hash: ContentHash) -> ContentHash {
        let mut state = self.state.lock();
        let Some(lock) = state.locked.clone() else {
            return proposal_hash;
        };
        if lock.hash == proposal_hash {
            return proposal_hash;
        }

        let unlocked = (lock.round + 1..=round)
            .any(|pol_round| state.votes.pol_info(pol_round).as_ref() == Some(&proposal_hash));
        if unlocked {
            info!(
                "Releasing lock from round {} at height {} on {}",
                lock.round, self.height, self.topic_id
            );
            state.locked = None;
            proposal_hash
        } else {
            lock.hash
        }
    }

    /// Hash to precommit after a prevote majority for `majority` in `round`, locking on its
    /// value. `None` when the value behind the majority is unknown here or the majority is nil.
    pub fn precommit_target(&self, round: u32, majority: &ContentHash) -> Option<ContentHash> {
        if majority.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        let value = state.valid_values.get(majority).cloned()?;
        state.locked = Some(LockedValue {
            round,
            value,
            hash: majority.clone(),
        });
        Some(majority.clone())
    }

    /// Value behind a locally validated hash.
    pub fn value_for(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.state.lock().valid_values.get(hash).cloned()
    }

    pub fn mark_decided(&self, decision: Decision) {
        {
            let mut state = self.state.lock();
            state.step = RoundStep::Decided;
            state.decided = Some(decision);
        }
        self.notify();
    }

    fn check_origin(&self, topic_id: &str, height: u64) -> Result<(), ConcordError> {
        if topic_id != self.topic_id {
            return Err(ConcordError::TopicMismatch {
                expected: self.topic_id.clone(),
                got: topic_id.to_string(),
            });
        }
        if height != self.height {
            return Err(ConcordError::HeightMismatch {
                expected: self.height,
                got: height,
            });
        }
        Ok(())
    }

    /// Keep at most one proposal per round. Returns whether the proposal was new.
    fn store_proposal(&self, proposal: Proposal) -> Result<bool, ConcordError> {
        let mut state = self.state.lock();
        let round = proposal.round;
        let ceiling = state
            .votes
            .anchor()
            .saturating_add(1)
            .saturating_add(self.catchup_rounds);
        if round < state.votes.floor() || round > ceiling {
            return Err(ConcordError::GotProposalFromUnwantedRound(round));
        }

        match state.proposals.entry(round) {
            Entry::Occupied(existing) => {
                if existing.get().value == proposal.value {
                    Ok(false)
                } else {
                    Err(ConcordError::ConflictingProposal(round))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(proposal);
                Ok(true)
            }
        }
    }

    async fn publish(&self, payload: Payload) -> Result<(), ConcordError> {
        self.topic.publish(encode_message(payload)).await
    }

    fn notify(&self) {
        self.progress.send_modify(|seq| *seq = seq.wrapping_add(1));
    }

    async fn wait_for<R>(
        &self,
        round: u32,
        check: impl Fn(&RoundState) -> Option<R>,
    ) -> Result<Step<R>, ConcordError> {
        let mut progress = self.progress.subscribe();
        loop {
            let step = {
                let state = self.state.lock();
                if let Some(decision) = state.decision() {
                    Some(Step::Decided(decision))
                } else if let Some(ahead) = state
                    .votes
                    .highest_majority_round()
                    .filter(|highest| *highest > round)
                {
                    Some(Step::Skip(ahead))
                } else {
                    check(&*state).map(Step::Ready)
                }
            };
            if let Some(step) = step {
                return Ok(step);
            }
            progress
                .changed()
                .await
                .map_err(|_| ConcordError::RoundClosed)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy::signers::local::PrivateKeySigner;
    use parking_lot::Mutex;
    use std::sync::Arc;

    use crate::{
        config::ConcordConfig,
        error::ConcordError,
        message::decode_message,
        proposer_set::ProposerSet,
        protos::concord::v1::{VoteKind, concord_message::Payload},
        round::{Round, RoundStep, Step},
        transport::Topic,
        utils::{build_proposal, sha256_content_hash},
        vote_set::tests::{HEIGHT, TOPIC, make_signers, make_vote},
    };

    #[derive(Default)]
    struct RecordingTopic {
        published: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingTopic {
        fn payloads(&self) -> Vec<Payload> {
            self.published
                .lock()
                .iter()
                .map(|data| decode_message(data).expect("published message decodes"))
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Topic for RecordingTopic {
        async fn publish(&self, data: Vec<u8>) -> Result<(), ConcordError> {
            self.published.lock().push(data);
            Ok(())
        }
    }

    fn new_round(
        signer: &PrivateKeySigner,
        set: &Arc<ProposerSet>,
        topic: &Arc<RecordingTopic>,
    ) -> Round<RecordingTopic, PrivateKeySigner> {
        Round::new(
            TOPIC.to_string(),
            HEIGHT,
            Arc::clone(topic),
            Arc::new(signer.clone()),
            Arc::clone(set),
            &ConcordConfig::default(),
        )
    }

    #[tokio::test]
    async fn single_member_commits_its_own_proposal() {
        let (signers, set) = make_signers(1);
        let topic = Arc::new(RecordingTopic::default());
        let round = new_round(&signers[0], &set, &topic);
        let hash = sha256_content_hash(b"block");

        let value = round.propose(b"block").await.unwrap();
        assert_eq!(value, Step::Ready(b"block".to_vec()));
        round.record_valid(hash.clone(), b"block".to_vec());

        let target = round.prevote_target(0, hash.clone());
        let prevoted = round.vote(target, VoteKind::Prevote).await.unwrap();
        assert_eq!(prevoted, Step::Ready(hash.clone()));
        assert_eq!(round.step(), RoundStep::Prevote);

        let target = round.precommit_target(0, &hash).expect("value is known");
        let Step::Decided(decision) = round.vote(target, VoteKind::Precommit).await.unwrap() else {
            panic!("precommit majority on a validated value must decide");
        };
        assert_eq!(decision.round, 0);
        assert_eq!(decision.value, b"block".to_vec());
        assert_eq!(round.locked().map(|lock| lock.round), Some(0));

        let payloads = topic.payloads();
        assert_eq!(payloads.len(), 3);
        assert!(matches!(payloads[0], Payload::Proposal(_)));
        assert!(matches!(payloads[2], Payload::Vote(ref vote) if vote.kind == VoteKind::Precommit as i32));
    }

    #[tokio::test]
    async fn vote_waits_for_remote_majority() {
        let (signers, set) = make_signers(4);
        let topic = Arc::new(RecordingTopic::default());
        let round = Arc::new(new_round(&signers[0], &set, &topic));
        let hash = sha256_content_hash(b"a");

        let waiting = {
            let round = Arc::clone(&round);
            let hash = hash.clone();
            tokio::spawn(async move { round.vote(hash, VoteKind::Prevote).await })
        };

        for i in 1..3 {
            let vote = make_vote(&signers, i, 0, VoteKind::Prevote, b"a").await;
            round.rcv_vote(vote, &format!("peer{i}")).unwrap();
        }

        let step = waiting.await.expect("task").unwrap();
        assert_eq!(step, Step::Ready(hash));
        assert_eq!(round.prevotes(0).expect("tracked").vote_count(), 3);
    }

    #[tokio::test]
    async fn proposals_are_checked_against_the_rotation() {
        let (signers, set) = make_signers(4);
        let topic = Arc::new(RecordingTopic::default());
        let round = new_round(&signers[0], &set, &topic);

        let wrong_index = build_proposal(&signers[2], TOPIC, HEIGHT, 1, 2, b"x".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            round.rcv_proposal(wrong_index),
            Err(ConcordError::UnexpectedProposer { round: 1, expected: 1, got: 2 })
        ));

        let forged = build_proposal(&signers[2], TOPIC, HEIGHT, 1, 1, b"x".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            round.rcv_proposal(forged),
            Err(ConcordError::InvalidSignature)
        ));

        let proposal = build_proposal(&signers[1], TOPIC, HEIGHT, 1, 1, b"x".to_vec())
            .await
            .unwrap();
        round.rcv_proposal(proposal.clone()).unwrap();
        round.rcv_proposal(proposal).unwrap();
        assert_eq!(round.proposal(1).map(|p| p.value), Some(b"x".to_vec()));

        let conflicting = build_proposal(&signers[1], TOPIC, HEIGHT, 1, 1, b"y".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            round.rcv_proposal(conflicting),
            Err(ConcordError::ConflictingProposal(1))
        ));

        let other_height = build_proposal(&signers[1], TOPIC, HEIGHT + 1, 1, 1, b"x".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            round.rcv_proposal(other_height),
            Err(ConcordError::HeightMismatch { .. })
        ));

        let far_future = build_proposal(&signers[2], TOPIC, HEIGHT, 10, 2, b"x".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            round.rcv_proposal(far_future),
            Err(ConcordError::GotProposalFromUnwantedRound(10))
        ));
    }

    #[tokio::test]
    async fn lock_holds_until_later_proof_of_lock() {
        let (signers, set) = make_signers(4);
        let topic = Arc::new(RecordingTopic::default());
        let round = new_round(&signers[0], &set, &topic);
        let locked_hash = sha256_content_hash(b"a");
        let new_hash = sha256_content_hash(b"b");

        assert_eq!(round.precommit_target(0, &new_hash), None);
        assert_eq!(round.precommit_target(0, &Vec::new()), None);

        round.record_valid(locked_hash.clone(), b"a".to_vec());
        assert_eq!(round.precommit_target(0, &locked_hash), Some(locked_hash.clone()));

        round.enter_round(1);
        assert_eq!(round.prevote_target(1, new_hash.clone()), locked_hash);

        for i in 1..4 {
            let vote = make_vote(&signers, i, 1, VoteKind::Prevote, b"b").await;
            round.rcv_vote(vote, &"peer".to_string()).unwrap();
        }
        assert_eq!(round.prevote_target(1, new_hash.clone()), new_hash);
        assert!(round.locked().is_none());
    }

    #[tokio::test]
    async fn majority_in_later_round_skips_ahead() {
        let (signers, set) = make_signers(4);
        let topic = Arc::new(RecordingTopic::default());
        let round = new_round(&signers[0], &set, &topic);

        for i in 1..4 {
            let vote = make_vote(&signers, i, 2, VoteKind::Prevote, b"a").await;
            round.rcv_vote(vote, &"peer".to_string()).unwrap();
        }

        let step = round
            .vote(sha256_content_hash(b"a"), VoteKind::Prevote)
            .await
            .unwrap();
        assert_eq!(step, Step::Skip(2));

        round.enter_round(2);
        assert_eq!(round.current_round(), 2);
        assert_eq!(round.step(), RoundStep::Propose);
    }

    #[tokio::test]
    async fn precommit_majority_in_earlier_round_decides() {
        let (signers, set) = make_signers(4);
        let topic = Arc::new(RecordingTopic::default());
        let round = new_round(&signers[3], &set, &topic);
        let hash = sha256_content_hash(b"a");

        round.record_valid(hash.clone(), b"a".to_vec());
        for i in 0..3 {
            let vote = make_vote(&signers, i, 0, VoteKind::Precommit, b"a").await;
            round.rcv_vote(vote, &format!("peer{i}")).unwrap();
        }
        round.enter_round(1);

        let Step::Decided(decision) = round.vote(hash.clone(), VoteKind::Prevote).await.unwrap()
        else {
            panic!("late commit must be reported");
        };
        assert_eq!(decision.round, 0);
        assert_eq!(decision.content_hash, hash);
    }

    #[tokio::test]
    async fn observer_never_signs() {
        let (signers, set) = make_signers(4);
        let observer = PrivateKeySigner::random();
        let topic = Arc::new(RecordingTopic::default());
        let round = new_round(&observer, &set, &topic);
        assert!(!round.is_member());

        let proposal = build_proposal(&signers[0], TOPIC, HEIGHT, 0, 0, b"a".to_vec())
            .await
            .unwrap();
        round.rcv_proposal(proposal).unwrap();
        assert_eq!(
            round.propose(b"ignored").await.unwrap(),
            Step::Ready(b"a".to_vec())
        );

        for i in 0..3 {
            let vote = make_vote(&signers, i, 0, VoteKind::Prevote, b"a").await;
            round.rcv_vote(vote, &format!("peer{i}")).unwrap();
        }
        let step = round
            .vote(sha256_content_hash(b"a"), VoteKind::Prevote)
            .await
            .unwrap();
        assert_eq!(step, Step::Ready(sha256_content_hash(b"a")));
        assert!(topic.payloads().is_empty());
    }
}
