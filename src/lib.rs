//! Pluggable Byzantine fault tolerant agreement over gossip pub/sub.
//!
//! A group of weighted proposers agrees on one opaque value per height through rounds of
//! propose, prevote, and precommit. A value is decided once members holding more than two
//! thirds of the voting power precommit it, so the group tolerates fewer than one third of
//! faulty power.
//!
//! ## How it works
//!
//! Proposers take turns round-robin. The round's proposer broadcasts a signed proposal, every
//! member prevotes the content hash its application validator computed for it, and once
//! prevotes reach a majority members lock on that value and precommit it. Rounds that stall
//! time out and the next proposer tries, re-proposing any locked value.
//!
//! The main entry point is [`conciliator::Conciliator`], which joins topics on a
//! [`transport::PubSub`] and hands out one [`concord::Concord`] session per topic. Call
//! [`concord::Concord::agree_on`] to run an agreement. Proposer sets come from a pluggable
//! [`storage::ProposerStore`]; an in-memory store and an in-process gossip network are included.

pub mod protos {
    pub mod concord {
        pub mod v1 {
            include!(concat!(env!("OUT_DIR"), "/concord.v1.rs"));
        }
    }
}

pub mod conciliator;
pub mod concord;
pub mod config;
pub mod error;
pub mod events;
pub mod height_vote_set;
pub mod message;
pub mod proposer_set;
pub mod round;
pub mod storage;
pub mod transport;
pub mod types;
pub mod utils;
pub mod validator;
pub mod vote_set;
