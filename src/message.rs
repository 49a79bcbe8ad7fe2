use prost::Message;

use crate::{
    error::ConcordError,
    protos::concord::v1::{ConcordMessage, Proposal, Vote, VoteKind, concord_message::Payload},
    utils::MAX_CONTENT_HASH_LENGTH,
};

pub fn encode_message(payload: Payload) -> Vec<u8> {
    ConcordMessage {
        payload: Some(payload),
    }
    .encode_to_vec()
}

/// Decode a wire message and run structural validation on its payload.
pub fn decode_message(data: &[u8]) -> Result<Payload, ConcordError> {
    let message = ConcordMessage::decode(data)?;
    let payload = message.payload.ok_or(ConcordError::EmptyMessage)?;
    validate_basic(&payload)?;
    Ok(payload)
}

/// Field presence checks that need no proposer set or round state.
pub fn validate_basic(payload: &Payload) -> Result<(), ConcordError> {
    match payload {
        Payload::Proposal(proposal) => validate_proposal_basic(proposal),
        Payload::Vote(vote) => validate_vote_basic(vote),
    }
}

pub fn validate_proposal_basic(proposal: &Proposal) -> Result<(), ConcordError> {
    if proposal.signature.is_empty() {
        return Err(ConcordError::EmptySignature);
    }
    Ok(())
}

pub fn validate_vote_basic(vote: &Vote) -> Result<(), ConcordError> {
    match VoteKind::try_from(vote.kind) {
        Ok(VoteKind::Prevote | VoteKind::Precommit) => {}
        _ => return Err(ConcordError::UnknownVoteKind(vote.kind)),
    }
    if vote.signature.is_empty() {
        return Err(ConcordError::EmptySignature);
    }
    if vote.voter_address.is_empty() {
        return Err(ConcordError::EmptyVoterAddress);
    }
    if vote.content_hash.len() > MAX_CONTENT_HASH_LENGTH {
        return Err(ConcordError::InvalidContentHash(vote.content_hash.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use crate::{
        error::ConcordError,
        message::{decode_message, encode_message},
        protos::concord::v1::{ConcordMessage, Proposal, Vote, VoteKind, concord_message::Payload},
    };

    fn vote() -> Vote {
        Vote {
            topic_id: "topic".into(),
            height: 1,
            round: 0,
            kind: VoteKind::Prevote as i32,
            voter_index: 0,
            voter_address: vec![1; 20],
            content_hash: vec![2; 32],
            timestamp: 0,
            signature: vec![3; 65],
        }
    }

    #[test]
    fn decodes_each_payload_kind() {
        let decoded = decode_message(&encode_message(Payload::Vote(vote()))).unwrap();
        assert_eq!(decoded, Payload::Vote(vote()));

        let proposal = Proposal {
            topic_id: "topic".into(),
            height: 1,
            round: 3,
            proposer_index: 1,
            value: b"value".to_vec(),
            timestamp: 0,
            signature: vec![1; 65],
        };
        let decoded = decode_message(&encode_message(Payload::Proposal(proposal.clone()))).unwrap();
        assert_eq!(decoded, Payload::Proposal(proposal));
    }

    #[test]
    fn nil_vote_passes_basic_validation() {
        let nil = Vote {
            content_hash: vec![],
            ..vote()
        };
        assert!(decode_message(&encode_message(Payload::Vote(nil))).is_ok());
    }

    #[test]
    fn content_hash_length_is_up_to_the_validator() {
        for len in [1, 20, 32, 48, 64] {
            let vote = Vote {
                content_hash: vec![2; len],
                ..vote()
            };
            assert!(
                decode_message(&encode_message(Payload::Vote(vote))).is_ok(),
                "{len} byte hash should pass"
            );
        }

        let oversized = Vote {
            content_hash: vec![2; 65],
            ..vote()
        };
        assert!(matches!(
            decode_message(&encode_message(Payload::Vote(oversized))),
            Err(ConcordError::InvalidContentHash(65))
        ));
    }

    #[test]
    fn rejects_structurally_invalid_messages() {
        assert!(matches!(
            decode_message(&[0xff, 0xff, 0xff]),
            Err(ConcordError::Decode(_))
        ));
        assert!(matches!(
            decode_message(&ConcordMessage { payload: None }.encode_to_vec()),
            Err(ConcordError::EmptyMessage)
        ));

        let cases = [
            (
                Vote {
                    kind: VoteKind::Unspecified as i32,
                    ..vote()
                },
                "unspecified kind",
            ),
            (Vote { kind: 7, ..vote() }, "unknown kind"),
            (
                Vote {
                    signature: vec![],
                    ..vote()
                },
                "empty signature",
            ),
            (
                Vote {
                    voter_address: vec![],
                    ..vote()
                },
                "empty voter",
            ),
            (
                Vote {
                    content_hash: vec![1; 65],
                    ..vote()
                },
                "oversized hash",
            ),
        ];
        for (vote, case) in cases {
            assert!(
                decode_message(&encode_message(Payload::Vote(vote))).is_err(),
                "{case} should be rejected"
            );
        }

        let unsigned = Proposal {
            signature: vec![],
            ..Default::default()
        };
        assert!(matches!(
            decode_message(&encode_message(Payload::Proposal(unsigned))),
            Err(ConcordError::EmptySignature)
        ));
    }
}
