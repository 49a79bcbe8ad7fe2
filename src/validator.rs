use crate::{error::ConcordError, types::ContentHash, utils::sha256_content_hash};

/// Application hook turning a raw proposal into its canonical content hash.
///
/// The hash may have any length from 1 up to
/// [`MAX_CONTENT_HASH_LENGTH`](crate::utils::MAX_CONTENT_HASH_LENGTH) bytes. An error, or a hash
/// outside that range, rejects the proposal and aborts the agreement in progress.
#[async_trait::async_trait]
pub trait ProposalValidator: Send + Sync + 'static {
    async fn validate(&self, value: &[u8]) -> Result<ContentHash, ConcordError>;
}

/// Accepts any value and hashes it with SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Validator;

#[async_trait::async_trait]
impl ProposalValidator for Sha256Validator {
    async fn validate(&self, value: &[u8]) -> Result<ContentHash, ConcordError> {
        Ok(sha256_content_hash(value))
    }
}
