use alloy::primitives::Address;
use std::{collections::HashSet, slice};

use crate::{error::ConcordError, types::Member};

/// Ordered, weighted membership of a topic.
///
/// The order of members is the order given at construction and is what voter indices refer to.
/// A set never changes after construction; a fresh one is fetched for every agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerSet {
    members: Vec<Member>,
    total_power: u64,
}

impl ProposerSet {
    /// Build a proposer set, rejecting empty sets, zero power and duplicate identities.
    pub fn new(members: Vec<Member>) -> Result<Self, ConcordError> {
        if members.is_empty() {
            return Err(ConcordError::EmptyProposerSet);
        }

        let mut seen = HashSet::with_capacity(members.len());
        let mut total_power: u64 = 0;
        for member in &members {
            if !seen.insert(member.address) {
                return Err(ConcordError::DuplicateProposer(member.address));
            }
            if member.power == 0 {
                return Err(ConcordError::InvalidPower(member.address));
            }
            total_power = total_power
                .checked_add(member.power)
                .ok_or(ConcordError::InvalidPower(member.address))?;
        }

        Ok(Self {
            members,
            total_power,
        })
    }

    /// Build a set where every address carries the same power.
    pub fn with_equal_power(
        addresses: impl IntoIterator<Item = Address>,
        power: u64,
    ) -> Result<Self, ConcordError> {
        Self::new(
            addresses
                .into_iter()
                .map(|address| Member::new(address, power))
                .collect(),
        )
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Smallest power strictly greater than two thirds of the total power.
    pub fn quorum_power(&self) -> u64 {
        ((self.total_power as u128 * 2 / 3) + 1) as u64
    }

    /// Index of the proposer for `round`, rotating round-robin over the members.
    pub fn proposer_index_for(&self, round: u32) -> u32 {
        (round as usize % self.members.len()) as u32
    }

    pub fn proposer_for(&self, round: u32) -> &Member {
        &self.members[self.proposer_index_for(round) as usize]
    }

    pub fn member_by_index(&self, index: u32) -> Option<&Member> {
        self.members.get(index as usize)
    }

    pub fn index_of(&self, address: &Address) -> Option<u32> {
        self.members
            .iter()
            .position(|member| &member.address == address)
            .map(|pos| pos as u32)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    pub fn members(&self) -> slice::Iter<'_, Member> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
