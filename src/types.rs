use alloy::primitives::Address;

/// Name of the gossip topic one agreement instance runs on.
pub type TopicID = String;

/// Identifier of the network peer a message was received from.
pub type PeerId = String;

/// Canonical content hash of a proposal value. An empty hash is a nil vote.
pub type ContentHash = Vec<u8>;

/// Verdict returned to the transport for every inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// The message was processed and may be forwarded.
    Accept,
    /// The message is invalid; the transport may penalize the sender.
    Reject,
    /// The message could not be judged yet (buffered for a later height) and should not be forwarded.
    Ignore,
}

/// A participant entitled to propose and vote on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Member {
    /// Signer address, derived from the member's public key.
    pub address: Address,
    /// Voting power, always positive.
    pub power: u64,
}

impl Member {
    pub fn new(address: Address, power: u64) -> Self {
        Self { address, power }
    }

    /// Peer identity used on the network for this member.
    pub fn peer_id(&self) -> PeerId {
        self.address.to_string()
    }
}

/// Value a participant precommitted and is locked on for the rest of the height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedValue {
    pub round: u32,
    pub value: Vec<u8>,
    pub hash: ContentHash,
}
