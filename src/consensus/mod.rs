// Consensus - HotStuff-family BFT core
//
// Agreement on a growing chain among a weighted committee, tolerating up to
// one third (by weight) of Byzantine members.
//
// Data flow:
// 1. Proposals, votes and timeouts arrive from the network
// 2. The validator checks them against the committee and the verifier
// 3. Aggregators accumulate weight per view and build QCs/TCs exactly once
// 4. Forks tracks certified blocks and finalizes along two-chains
//
// The coldstuff module is the round-robin reference loop: one round at a
// time, unweighted vote counting, commit after quorum.

pub mod threshold;
pub mod error;
pub mod signer_indices;
pub mod packer;
pub mod committee;
pub mod signer;
pub mod verification;
pub mod validator;
pub mod metrics;
pub mod forks;
pub mod notifications;
pub mod aggregation;
pub mod safety;
pub mod pacemaker;
pub mod coldstuff;

pub use threshold::{quorum_threshold, timeout_partial_threshold};
pub use error::{BoxError, CommitteeError, EncodingError, ValidationError, VerifyError};
pub use committee::{Committee, EpochSetup, StaticCommittee};
pub use signer::{LocalSigner, Signer};
pub use verification::{Ed25519Verifier, Verifier};
pub use validator::{ConsensusValidator, Validator};
pub use forks::{Finalizer, Forks, ForksReader};
pub use notifications::{ChannelConsumer, ConsensusEvent, Consumer, Distributor, NoopConsumer};
pub use aggregation::{TimeoutAggregator, VoteAggregator};
pub use safety::{InMemoryPersister, Persister, SafetyData, SafetyRules};
pub use pacemaker::{TimeoutConfig, TimeoutController};
pub use coldstuff::{ColdStuff, ColdStuffConfig, ColdStuffHandle};

/// Consensus configuration constants
pub mod config {
    /// Capacity of each round-robin mailbox (proposal, vote, commit)
    pub const MAILBOX_CAPACITY: usize = 1;

    /// How long a producer blocks on a full mailbox before dropping
    pub const MAILBOX_SUBMIT_TIMEOUT_MS: u64 = 1000;

    /// Minimum time between a parent's timestamp and the next round start
    pub const DEFAULT_ROUND_INTERVAL_MS: u64 = 1000;

    /// Pacemaker timeouts
    pub const DEFAULT_TIMEOUT_INITIAL_MS: u64 = 2500;
    pub const DEFAULT_TIMEOUT_MIN_MS: u64 = 1000;
    pub const DEFAULT_TIMEOUT_MAX_MS: u64 = 30_000;
    pub const DEFAULT_TIMEOUT_INCREASE_FACTOR: f64 = 2.0;
    pub const DEFAULT_TIMEOUT_DECREASE_FACTOR: f64 = 0.8;

    /// How far past the pruning horizon an aggregator accepts messages
    pub const MAX_VIEWS_AHEAD: u64 = 1000;

    /// Persister key for safety data
    pub const SAFETY_DATA_KEY: &[u8] = b"consensus/safety_data";
}
