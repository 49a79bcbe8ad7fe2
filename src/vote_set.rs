use std::{collections::HashMap, sync::Arc};

use crate::{
    error::ConcordError,
    proposer_set::ProposerSet,
    protos::concord::v1::{Vote, VoteKind},
    types::{ContentHash, TopicID},
    utils::verify_vote_signature,
};

/// Signed votes of one kind for one round, indexed by voter.
///
/// A voter contributes power to at most one content hash. A second vote from the same voter
/// for a different hash is equivocation and is never counted. The first such vote is kept as
/// evidence; one conflicting pair proves the fault, so later ones are dropped.
#[derive(Debug, Clone)]
pub struct VoteSet {
    topic_id: TopicID,
    height: u64,
    round: u32,
    kind: VoteKind,
    proposers: Arc<ProposerSet>,
    votes: Vec<Option<Vote>>,
    sum: u64,
    power_by_hash: HashMap<ContentHash, u64>,
    majority: Option<ContentHash>,
    conflicts: HashMap<u32, Vote>,
}

impl VoteSet {
    pub fn new(
        topic_id: TopicID,
        height: u64,
        round: u32,
        kind: VoteKind,
        proposers: Arc<ProposerSet>,
    ) -> Self {
        let size = proposers.len();
        Self {
            topic_id,
            height,
            round,
            kind,
            proposers,
            votes: vec![None; size],
            sum: 0,
            power_by_hash: HashMap::new(),
            majority: None,
            conflicts: HashMap::new(),
        }
    }

    /// Record a vote.
    ///
    /// Returns `Ok(true)` when the vote was new, `Ok(false)` when an identical vote from the same
    /// voter was already recorded.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, ConcordError> {
        if vote.topic_id != self.topic_id
            || vote.height != self.height
            || vote.round != self.round
            || vote.kind != self.kind as i32
        {
            return Err(ConcordError::VoteMismatch);
        }

        let member = *self
            .proposers
            .member_by_index(vote.voter_index)
            .ok_or(ConcordError::InvalidVoter(vote.voter_index))?;
        if vote.voter_address != member.address.as_slice() {
            return Err(ConcordError::InvalidVoter(vote.voter_index));
        }

        verify_vote_signature(&vote, &member.address)?;

        let index = vote.voter_index;
        if let Some(existing) = &self.votes[index as usize] {
            if existing.content_hash == vote.content_hash {
                return Ok(false);
            }

            self.conflicts.entry(index).or_insert(vote);
            return Err(ConcordError::ConflictingVote {
                voter_index: index,
                round: self.round,
            });
        }

        let power = self
            .power_by_hash
            .entry(vote.content_hash.clone())
            .or_insert(0);
        *power += member.power;
        if self.majority.is_none() && *power >= self.proposers.quorum_power() {
            self.majority = Some(vote.content_hash.clone());
        }
        self.sum += member.power;
        self.votes[index as usize] = Some(vote);

        Ok(true)
    }

    /// Content hash that gathered a quorum of power, if any. Never changes once established.
    pub fn has_majority(&self) -> Option<&ContentHash> {
        self.majority.as_ref()
    }

    /// Whether votes for any mix of hashes reached a quorum of power.
    pub fn has_quorum_any(&self) -> bool {
        self.sum >= self.proposers.quorum_power()
    }

    /// Presence of a vote per voter index.
    pub fn bit_array(&self) -> Vec<bool> {
        self.votes.iter().map(Option::is_some).collect()
    }

    pub fn has_vote(&self, voter_index: u32) -> bool {
        matches!(self.votes.get(voter_index as usize), Some(Some(_)))
    }

    pub fn get_by_index(&self, voter_index: u32) -> Option<&Vote> {
        self.votes.get(voter_index as usize).and_then(Option::as_ref)
    }

    /// The counted vote and the first conflicting vote received from `voter_index`.
    pub fn conflicting_votes(&self, voter_index: u32) -> Vec<Vote> {
        match self.conflicts.get(&voter_index) {
            Some(conflict) => self
                .get_by_index(voter_index)
                .into_iter()
                .chain(std::iter::once(conflict))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn equivocators(&self) -> Vec<u32> {
        let mut voters: Vec<u32> = self.conflicts.keys().copied().collect();
        voters.sort_unstable();
        voters
    }

    pub fn power_for(&self, hash: &[u8]) -> u64 {
        self.power_by_hash.get(hash).copied().unwrap_or(0)
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn vote_count(&self) -> usize {
        self.votes.iter().filter(|vote| vote.is_some()).count()
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn kind(&self) -> VoteKind {
        self.kind
    }
}
