use alloy::primitives::Address;

use crate::types::TopicID;

#[derive(Debug, thiserror::Error)]
pub enum ConcordError {
    #[error("Mismatched length: expected {expect}, actual {actual}")]
    MismatchedLength { expect: usize, actual: usize },

    #[error("Empty message: no proposal or vote payload")]
    EmptyMessage,
    #[error("Failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Empty signature")]
    EmptySignature,
    #[error("Unknown vote kind: {0}")]
    UnknownVoteKind(i32),
    #[error("Content hash of {0} bytes is too long")]
    InvalidContentHash(usize),
    #[error("Empty voter address")]
    EmptyVoterAddress,
    #[error("Message for topic {got} delivered to topic {expected}")]
    TopicMismatch { expected: TopicID, got: TopicID },
    #[error("Message for height {got} is older than the active height {active}")]
    StaleHeight { active: u64, got: u64 },
    #[error("Message for height {got} delivered to round at height {expected}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("Invalid voter index {0}")]
    InvalidVoter(u32),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Conflicting vote from voter {voter_index} in round {round}")]
    ConflictingVote { voter_index: u32, round: u32 },
    #[error("Vote does not belong to this vote set")]
    VoteMismatch,
    #[error("Got vote from unwanted round")]
    GotVoteFromUnwantedRound,
    #[error("Got proposal from unwanted round {0}")]
    GotProposalFromUnwantedRound(u32),
    #[error("Conflicting proposal for round {0}")]
    ConflictingProposal(u32),
    #[error("Proposal for round {round} signed by proposer {got}, expected {expected}")]
    UnexpectedProposer { round: u32, expected: u32, got: u32 },

    #[error("Proposer set is empty")]
    EmptyProposerSet,
    #[error("Duplicate proposer {0}")]
    DuplicateProposer(Address),
    #[error("Invalid voting power for {0}")]
    InvalidPower(Address),
    #[error("Proposer set not found for topic {0}")]
    ProposerSetNotFound(TopicID),

    #[error("Topic {0} already joined")]
    TopicAlreadyJoined(TopicID),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Failed to sign message: {0}")]
    FailedToSignMessage(#[from] alloy_signer::Error),
    #[error("Proposal validation failed: {0}")]
    ValidationFailed(String),

    #[error("Agreement cancelled")]
    Cancelled,
    #[error("Agreement exceeded configured max rounds")]
    MaxRoundsExceeded,
    #[error("Round closed")]
    RoundClosed,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to get current time")]
    FailedToGetCurrentTime(#[from] std::time::SystemTimeError),
}
