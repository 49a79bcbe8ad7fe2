use alloy::primitives::Address;
use alloy_signer::{Signature, Signer};
use prost::Message;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    error::ConcordError,
    protos::concord::v1::{Proposal, Vote, VoteKind},
    types::ContentHash,
};

/// Length of a recoverable secp256k1 signature.
pub const SIGNATURE_LENGTH: usize = 65;

/// Longest content hash a validator may produce. Empty hashes are nil votes.
pub const MAX_CONTENT_HASH_LENGTH: usize = 64;

pub fn current_timestamp() -> Result<u64, ConcordError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn sha256_content_hash(value: &[u8]) -> ContentHash {
    Sha256::digest(value).to_vec()
}

/// Bytes covered by a vote signature: the encoded vote with the signature cleared.
pub fn vote_sign_bytes(vote: &Vote) -> Vec<u8> {
    let mut unsigned = vote.clone();
    unsigned.signature = Vec::new();
    unsigned.encode_to_vec()
}

/// Bytes covered by a proposal signature: the encoded proposal with the signature cleared.
pub fn proposal_sign_bytes(proposal: &Proposal) -> Vec<u8> {
    let mut unsigned = proposal.clone();
    unsigned.signature = Vec::new();
    unsigned.encode_to_vec()
}

/// Build and sign a vote from the local signer.
pub async fn build_vote<S: Signer + Sync>(
    signer: &S,
    topic_id: &str,
    height: u64,
    round: u32,
    kind: VoteKind,
    voter_index: u32,
    content_hash: ContentHash,
) -> Result<Vote, ConcordError> {
    let mut vote = Vote {
        topic_id: topic_id.to_string(),
        height,
        round,
        kind: kind as i32,
        voter_index,
        voter_address: signer.address().as_slice().to_vec(),
        content_hash,
        timestamp: current_timestamp()?,
        signature: Vec::new(),
    };

    let signature = signer.sign_message(&vote_sign_bytes(&vote)).await?;
    vote.signature = signature.as_bytes().to_vec();
    Ok(vote)
}

/// Build and sign a proposal from the local signer.
pub async fn build_proposal<S: Signer + Sync>(
    signer: &S,
    topic_id: &str,
    height: u64,
    round: u32,
    proposer_index: u32,
    value: Vec<u8>,
) -> Result<Proposal, ConcordError> {
    let mut proposal = Proposal {
        topic_id: topic_id.to_string(),
        height,
        round,
        proposer_index,
        value,
        timestamp: current_timestamp()?,
        signature: Vec::new(),
    };

    let signature = signer
        .sign_message(&proposal_sign_bytes(&proposal))
        .await?;
    proposal.signature = signature.as_bytes().to_vec();
    Ok(proposal)
}

/// Check that `signature` over `message` was produced by `expected`.
pub fn verify_signature(
    signature: &[u8],
    expected: &Address,
    message: &[u8],
) -> Result<bool, ConcordError> {
    let signature_bytes: [u8; SIGNATURE_LENGTH] =
        signature
            .try_into()
            .map_err(|_| ConcordError::MismatchedLength {
                expect: SIGNATURE_LENGTH,
                actual: signature.len(),
            })?;
    let signature =
        Signature::from_raw_array(&signature_bytes).map_err(|_| ConcordError::InvalidSignature)?;
    let address = signature
        .recover_address_from_msg(message)
        .map_err(|_| ConcordError::InvalidSignature)?;
    Ok(&address == expected)
}

pub fn verify_vote_signature(vote: &Vote, expected: &Address) -> Result<(), ConcordError> {
    match verify_signature(&vote.signature, expected, &vote_sign_bytes(vote)) {
        Ok(true) => Ok(()),
        _ => Err(ConcordError::InvalidSignature),
    }
}

pub fn verify_proposal_signature(
    proposal: &Proposal,
    expected: &Address,
) -> Result<(), ConcordError> {
    match verify_signature(&proposal.signature, expected, &proposal_sign_bytes(proposal)) {
        Ok(true) => Ok(()),
        _ => Err(ConcordError::InvalidSignature),
    }
}

#[cfg(test)]
mod tests {
    use alloy::signers::local::PrivateKeySigner;

    use crate::{
        error::ConcordError,
        protos::concord::v1::VoteKind,
        utils::{
            build_proposal, build_vote, sha256_content_hash, verify_proposal_signature,
            verify_signature, verify_vote_signature,
        },
    };

    #[tokio::test]
    async fn signed_vote_verifies_only_against_its_signer() {
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();

        let vote = build_vote(
            &signer,
            "topic",
            1,
            0,
            VoteKind::Prevote,
            0,
            sha256_content_hash(b"value"),
        )
        .await
        .unwrap();

        verify_vote_signature(&vote, &signer.address()).expect("signer verifies");
        assert!(matches!(
            verify_vote_signature(&vote, &other.address()),
            Err(ConcordError::InvalidSignature)
        ));

        let mut tampered = vote.clone();
        tampered.round = 1;
        assert!(verify_vote_signature(&tampered, &signer.address()).is_err());
    }

    #[tokio::test]
    async fn signed_proposal_verifies() {
        let signer = PrivateKeySigner::random();
        let mut proposal = build_proposal(&signer, "topic", 1, 2, 0, b"value".to_vec())
            .await
            .unwrap();
        verify_proposal_signature(&proposal, &signer.address()).expect("signer verifies");

        proposal.value = b"other".to_vec();
        assert!(verify_proposal_signature(&proposal, &signer.address()).is_err());
    }

    #[test]
    fn short_signature_is_a_length_error() {
        let signer = PrivateKeySigner::random();
        assert!(matches!(
            verify_signature(&[1, 2, 3], &signer.address(), b"msg"),
            Err(ConcordError::MismatchedLength { expect: 65, actual: 3 })
        ));
    }
}
