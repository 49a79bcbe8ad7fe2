use std::time::Duration;

use concord::{
    config::{
        ConcordConfig, ConcordConfigBuilder, DEFAULT_CATCHUP_ROUNDS, DEFAULT_PENDING_CAPACITY,
        DEFAULT_PENDING_HEIGHTS, DEFAULT_PENDING_PER_PEER, DEFAULT_RETAINED_ROUNDS,
        DEFAULT_ROUND_TIMEOUT,
    },
    error::ConcordError,
};

#[test]
fn test_default_config() {
    let config = ConcordConfig::default();

    assert_eq!(config.round_timeout, DEFAULT_ROUND_TIMEOUT);
    assert_eq!(config.max_rounds, None);
    assert_eq!(config.catchup_rounds, DEFAULT_CATCHUP_ROUNDS);
    assert_eq!(config.catchup_rounds, 2);
    assert_eq!(config.retained_rounds, DEFAULT_RETAINED_ROUNDS);
    assert_eq!(config.pending_capacity, DEFAULT_PENDING_CAPACITY);
    assert_eq!(config.pending_heights, DEFAULT_PENDING_HEIGHTS);
    assert_eq!(config.pending_per_peer, DEFAULT_PENDING_PER_PEER);
    assert!(config.pending_per_peer < config.pending_capacity);
    assert!(config.validate().is_ok());
}

#[test]
fn test_builder_overrides() {
    let config = ConcordConfig::builder()
        .with_round_timeout(Duration::from_secs(5))
        .with_max_rounds(Some(10))
        .with_catchup_rounds(4)
        .with_retained_rounds(1)
        .with_pending_capacity(16)
        .with_pending_heights(1)
        .with_pending_per_peer(4)
        .build()
        .expect("valid config");

    assert_eq!(config.round_timeout, Duration::from_secs(5));
    assert_eq!(config.max_rounds, Some(10));
    assert_eq!(config.catchup_rounds, 4);
    assert_eq!(config.retained_rounds, 1);
    assert_eq!(config.pending_capacity, 16);
    assert_eq!(config.pending_heights, 1);
    assert_eq!(config.pending_per_peer, 4);
}

#[test]
fn test_partial_update_from_existing() {
    let base = ConcordConfig::builder()
        .with_max_rounds(Some(3))
        .build()
        .expect("valid config");

    // Only the timeout changes.
    let updated = ConcordConfigBuilder::from_existing(base.clone())
        .fast_rounds()
        .build()
        .expect("valid config");

    assert_eq!(updated.round_timeout, Duration::from_millis(500));
    assert_eq!(updated.max_rounds, base.max_rounds);
    assert_eq!(updated.catchup_rounds, base.catchup_rounds);
}

#[test]
fn test_invalid_configs() {
    let zero_timeout = ConcordConfig::builder().with_round_timeout(Duration::ZERO);
    assert!(matches!(
        zero_timeout.validate(),
        Err(ConcordError::InvalidConfiguration(_))
    ));
    assert!(zero_timeout.build().is_err());

    let zero_rounds = ConcordConfig::builder().with_max_rounds(Some(0)).build();
    assert!(matches!(
        zero_rounds,
        Err(ConcordError::InvalidConfiguration(_))
    ));

    let no_lookahead = ConcordConfig::builder().with_pending_heights(0).build();
    assert!(matches!(
        no_lookahead,
        Err(ConcordError::InvalidConfiguration(_))
    ));

    let unbounded = ConcordConfig::builder().with_max_rounds(None).build();
    assert!(unbounded.is_ok());
}
