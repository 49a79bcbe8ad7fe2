use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::{
    error::ConcordError,
    proposer_set::ProposerSet,
    protos::concord::v1::{Vote, VoteKind},
    types::{ContentHash, PeerId, TopicID},
    vote_set::VoteSet,
};

#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl RoundVoteSet {
    fn for_kind(&mut self, kind: VoteKind) -> &mut VoteSet {
        match kind {
            VoteKind::Prevote => &mut self.prevotes,
            _ => &mut self.precommits,
        }
    }
}

/// Vote sets for every tracked round of one height.
///
/// The tracked window is `[floor, anchor + 1]`, where the anchor is the later of the current
/// round and the newest round in which any vote set reached a majority, and the floor sits
/// `retained_rounds` below the anchor. Rounds under the floor are evicted and never tracked
/// again. Beyond the window every peer may open up to `catchup_rounds` extra rounds, which
/// bounds the memory a peer can claim with votes for far-future rounds.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    topic_id: TopicID,
    height: u64,
    proposers: Arc<ProposerSet>,
    catchup_rounds: usize,
    retained_rounds: u32,
    round: u32,
    floor: u32,
    highest_majority_round: Option<u32>,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, Vec<u32>>,
}

impl HeightVoteSet {
    pub fn new(
        topic_id: TopicID,
        height: u64,
        proposers: Arc<ProposerSet>,
        catchup_rounds: usize,
        retained_rounds: u32,
    ) -> Self {
        let mut votes = Self {
            topic_id,
            height,
            proposers,
            catchup_rounds,
            retained_rounds,
            round: 0,
            floor: 0,
            highest_majority_round: None,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        votes.add_round(0);
        votes
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Lowest round still tracked; anything below is rejected.
    pub fn floor(&self) -> u32 {
        self.floor
    }

    pub fn highest_majority_round(&self) -> Option<u32> {
        self.highest_majority_round
    }

    /// Move the current round forward. Earlier rounds are ignored.
    pub fn set_round(&mut self, round: u32) {
        if round < self.round {
            return;
        }
        self.round = round;
        self.advance_floor();
    }

    /// Route a vote received from `peer` to the vote set of its round and kind.
    pub fn add_vote(&mut self, vote: Vote, peer: &PeerId) -> Result<bool, ConcordError> {
        let kind = VoteKind::try_from(vote.kind)
            .ok()
            .filter(|kind| *kind != VoteKind::Unspecified)
            .ok_or(ConcordError::UnknownVoteKind(vote.kind))?;
        let round = vote.round;

        if round < self.floor {
            return Err(ConcordError::GotVoteFromUnwantedRound);
        }

        let added = match self.round_vote_sets.get_mut(&round) {
            Some(round_votes) => round_votes.for_kind(kind).add_vote(vote)?,
            None => self.open_round(round, kind, vote, peer)?,
        };
        let has_majority = self
            .vote_set(round, kind)
            .is_some_and(|votes| votes.has_majority().is_some());
        if added && has_majority {
            let newer = self
                .highest_majority_round
                .is_none_or(|highest| round > highest);
            if newer {
                self.highest_majority_round = Some(round);
                self.advance_floor();
            }
        }
        Ok(added)
    }

    /// Prevote majority hash at `round`, the proof-of-lock for a value seen in that round.
    pub fn pol_info(&self, round: u32) -> Option<ContentHash> {
        self.majority(round, VoteKind::Prevote)
    }

    pub fn majority(&self, round: u32, kind: VoteKind) -> Option<ContentHash> {
        self.vote_set(round, kind)
            .and_then(|votes| votes.has_majority().cloned())
    }

    /// Read-only view of a tracked vote set.
    pub fn vote_set(&self, round: u32, kind: VoteKind) -> Option<&VoteSet> {
        self.round_vote_sets
            .get(&round)
            .map(|round_votes| match kind {
                VoteKind::Prevote => &round_votes.prevotes,
                _ => &round_votes.precommits,
            })
    }

    /// Prevotes of `round`, created when the round is inside the window.
    pub fn prevotes(&mut self, round: u32) -> Option<&VoteSet> {
        if !self.ensure_round(round) {
            return None;
        }
        self.vote_set(round, VoteKind::Prevote)
    }

    /// Precommits of `round`, created when the round is inside the window.
    pub fn precommits(&mut self, round: u32) -> Option<&VoteSet> {
        if !self.ensure_round(round) {
            return None;
        }
        self.vote_set(round, VoteKind::Precommit)
    }

    /// Tracked rounds in ascending order.
    pub fn rounds(&self) -> impl Iterator<Item = u32> + '_ {
        self.round_vote_sets.keys().copied()
    }

    /// Precommit majorities of all tracked rounds, newest first.
    pub fn precommit_majorities(&self) -> impl Iterator<Item = (u32, &ContentHash)> + '_ {
        self.round_vote_sets
            .iter()
            .rev()
            .filter_map(|(round, votes)| votes.precommits.has_majority().map(|hash| (*round, hash)))
    }

    /// Later of the current round and the newest round with a majority.
    pub fn anchor(&self) -> u32 {
        self.highest_majority_round
            .map_or(self.round, |highest| highest.max(self.round))
    }

    fn ensure_round(&mut self, round: u32) -> bool {
        if self.round_vote_sets.contains_key(&round) {
            return true;
        }
        if round < self.floor || round > self.anchor().saturating_add(1) {
            return false;
        }
        self.add_round(round);
        true
    }

    /// Track `round` for a vote that is the first one seen there.
    ///
    /// The vote is checked against a fresh vote set before anything is tracked, so a rejected
    /// vote neither creates the round nor spends the peer's catch-up allowance.
    fn open_round(
        &mut self,
        round: u32,
        kind: VoteKind,
        vote: Vote,
        peer: &PeerId,
    ) -> Result<bool, ConcordError> {
        let catchup = round > self.anchor().saturating_add(1);
        if catchup {
            let used = self.peer_catchup_rounds.get(peer).map_or(0, Vec::len);
            if used >= self.catchup_rounds {
                return Err(ConcordError::GotVoteFromUnwantedRound);
            }
        }

        let mut round_votes = self.new_round_votes(round);
        let added = round_votes.for_kind(kind).add_vote(vote)?;

        if catchup {
            self.peer_catchup_rounds
                .entry(peer.clone())
                .or_default()
                .push(round);
        }
        self.round_vote_sets.insert(round, round_votes);
        Ok(added)
    }

    fn add_round(&mut self, round: u32) {
        let round_votes = self.new_round_votes(round);
        self.round_vote_sets.insert(round, round_votes);
    }

    fn new_round_votes(&self, round: u32) -> RoundVoteSet {
        let make = |kind| {
            VoteSet::new(
                self.topic_id.clone(),
                self.height,
                round,
                kind,
                Arc::clone(&self.proposers),
            )
        };
        RoundVoteSet {
            prevotes: make(VoteKind::Prevote),
            precommits: make(VoteKind::Precommit),
        }
    }

    fn advance_floor(&mut self) {
        let floor = self.anchor().saturating_sub(self.retained_rounds);
        if floor <= self.floor {
            return;
        }
        self.floor = floor;
        self.round_vote_sets = self.round_vote_sets.split_off(&floor);
        for rounds in self.peer_catchup_rounds.values_mut() {
            rounds.retain(|round| *round >= floor);
        }
        self.peer_catchup_rounds.retain(|_, rounds| !rounds.is_empty());
    }
}
