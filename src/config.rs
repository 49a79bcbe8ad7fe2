use std::time::Duration;

use crate::error::ConcordError;

/// Default per-round deadline.
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of ahead-of-window rounds each peer may open.
pub const DEFAULT_CATCHUP_ROUNDS: usize = 2;
/// Default number of rounds kept below the newest active round.
pub const DEFAULT_RETAINED_ROUNDS: u32 = 2;
/// Default number of inbound messages buffered for heights not started yet.
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;
/// Default number of heights ahead of the local one whose messages are buffered.
pub const DEFAULT_PENDING_HEIGHTS: u64 = 2;
/// Default share of the pending buffer a single peer may occupy.
pub const DEFAULT_PENDING_PER_PEER: usize = 128;

/// Tuning of one [`Concord`](crate::concord::Concord) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcordConfig {
    /// How long a round may run before the session moves on to the next round.
    pub round_timeout: Duration,
    /// Upper bound on rounds per agreement (`None` means unbounded).
    pub max_rounds: Option<u32>,
    /// Rounds beyond the tracked window that a single peer may open with its votes.
    pub catchup_rounds: usize,
    /// Rounds kept below the window anchor before vote sets are evicted.
    pub retained_rounds: u32,
    /// Inbound messages held while no round for their height is installed.
    pub pending_capacity: usize,
    /// Heights past the local one that are buffered. Anything further ahead is ignored.
    pub pending_heights: u64,
    /// Buffered messages kept per delivering peer.
    pub pending_per_peer: usize,
}

impl Default for ConcordConfig {
    fn default() -> Self {
        Self {
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            max_rounds: None,
            catchup_rounds: DEFAULT_CATCHUP_ROUNDS,
            retained_rounds: DEFAULT_RETAINED_ROUNDS,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            pending_heights: DEFAULT_PENDING_HEIGHTS,
            pending_per_peer: DEFAULT_PENDING_PER_PEER,
        }
    }
}

impl ConcordConfig {
    pub fn builder() -> ConcordConfigBuilder {
        ConcordConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConcordError> {
        if self.round_timeout.is_zero() {
            return Err(ConcordError::InvalidConfiguration(
                "round_timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_rounds == Some(0) {
            return Err(ConcordError::InvalidConfiguration(
                "max_rounds must allow at least one round".to_string(),
            ));
        }
        if self.pending_heights == 0 {
            return Err(ConcordError::InvalidConfiguration(
                "pending_heights must cover at least the next height".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConcordConfigBuilder {
    config: ConcordConfig,
}

impl ConcordConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start builder from an existing config (useful for partial updates)
    pub fn from_existing(config: ConcordConfig) -> Self {
        Self { config }
    }

    pub fn with_round_timeout(mut self, round_timeout: Duration) -> Self {
        self.config.round_timeout = round_timeout;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: Option<u32>) -> Self {
        self.config.max_rounds = max_rounds;
        self
    }

    pub fn with_catchup_rounds(mut self, catchup_rounds: usize) -> Self {
        self.config.catchup_rounds = catchup_rounds;
        self
    }

    pub fn with_retained_rounds(mut self, retained_rounds: u32) -> Self {
        self.config.retained_rounds = retained_rounds;
        self
    }

    pub fn with_pending_capacity(mut self, pending_capacity: usize) -> Self {
        self.config.pending_capacity = pending_capacity;
        self
    }

    pub fn with_pending_heights(mut self, pending_heights: u64) -> Self {
        self.config.pending_heights = pending_heights;
        self
    }

    pub fn with_pending_per_peer(mut self, pending_per_peer: usize) -> Self {
        self.config.pending_per_peer = pending_per_peer;
        self
    }

    /// Short rounds for local networks and tests.
    pub fn fast_rounds(mut self) -> Self {
        self.config.round_timeout = Duration::from_millis(500);
        self
    }

    pub fn validate(&self) -> Result<(), ConcordError> {
        self.config.validate()
    }

    /// Build the final config
    pub fn build(self) -> Result<ConcordConfig, ConcordError> {
        self.validate()?;
        Ok(self.config)
    }
}
