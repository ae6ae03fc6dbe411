// Metrics - Counters for validation, aggregation and rounds
//
// Plain atomics: cheap to update from any task, read as a snapshot.

use super::error::ValidationError;
use super::validator::ConsensusValidator;
use crate::types::{Block, Identity, Proposal, QuorumCertificate, TimeoutCertificate, TimeoutObject, Vote};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Count and cumulative duration of one validation kind
#[derive(Debug, Default)]
struct Timing {
    count: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
}

impl Timing {
    fn record(&self, started: Instant, ok: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let micros = started.elapsed().as_micros().min(u64::MAX as u128) as u64;
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            count: self.count.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
        }
    }
}

/// Consensus instrumentation
#[derive(Debug, Default)]
pub struct ConsensusMetrics {
    qc_validation: Timing,
    tc_validation: Timing,
    proposal_validation: Timing,
    vote_validation: Timing,
    timeout_validation: Timing,

    qcs_built: AtomicU64,
    tcs_built: AtomicU64,
    votes_rejected: AtomicU64,

    rounds_completed: AtomicU64,
    rounds_timed_out: AtomicU64,
    rounds_failed: AtomicU64,
}

impl ConsensusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn qc_built(&self) {
        self.qcs_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tc_built(&self) {
        self.tcs_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_rejected(&self) {
        self.votes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn round_completed(&self) {
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn round_timed_out(&self) {
        self.rounds_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn round_failed(&self) {
        self.rounds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            qc_validation: self.qc_validation.snapshot(),
            tc_validation: self.tc_validation.snapshot(),
            proposal_validation: self.proposal_validation.snapshot(),
            vote_validation: self.vote_validation.snapshot(),
            timeout_validation: self.timeout_validation.snapshot(),
            qcs_built: self.qcs_built.load(Ordering::Relaxed),
            tcs_built: self.tcs_built.load(Ordering::Relaxed),
            votes_rejected: self.votes_rejected.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            rounds_timed_out: self.rounds_timed_out.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub failures: u64,
    pub total_micros: u64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub qc_validation: TimingSnapshot,
    pub tc_validation: TimingSnapshot,
    pub proposal_validation: TimingSnapshot,
    pub vote_validation: TimingSnapshot,
    pub timeout_validation: TimingSnapshot,
    pub qcs_built: u64,
    pub tcs_built: u64,
    pub votes_rejected: u64,
    pub rounds_completed: u64,
    pub rounds_timed_out: u64,
    pub rounds_failed: u64,
}

/// Validator decorator that times every call
pub struct ValidatorMetricsWrapper<V: ConsensusValidator> {
    inner: V,
    metrics: Arc<ConsensusMetrics>,
}

impl<V: ConsensusValidator> ValidatorMetricsWrapper<V> {
    pub fn new(inner: V, metrics: Arc<ConsensusMetrics>) -> Self {
        Self { inner, metrics }
    }
}

impl<V: ConsensusValidator> ConsensusValidator for ValidatorMetricsWrapper<V> {
    fn validate_qc(&self, qc: &QuorumCertificate, block: &Block) -> Result<(), ValidationError> {
        let started = Instant::now();
        let result = self.inner.validate_qc(qc, block);
        self.metrics.qc_validation.record(started, result.is_ok());
        result
    }

    fn validate_tc(&self, tc: &TimeoutCertificate) -> Result<(), ValidationError> {
        let started = Instant::now();
        let result = self.inner.validate_tc(tc);
        self.metrics.tc_validation.record(started, result.is_ok());
        result
    }

    fn validate_proposal(&self, proposal: &Proposal) -> Result<(), ValidationError> {
        let started = Instant::now();
        let result = self.inner.validate_proposal(proposal);
        self.metrics.proposal_validation.record(started, result.is_ok());
        result
    }

    fn validate_vote(&self, vote: &Vote, block: &Block) -> Result<Identity, ValidationError> {
        let started = Instant::now();
        let result = self.inner.validate_vote(vote, block);
        self.metrics.vote_validation.record(started, result.is_ok());
        result
    }

    fn validate_vote_signature(&self, vote: &Vote) -> Result<Identity, ValidationError> {
        let started = Instant::now();
        let result = self.inner.validate_vote_signature(vote);
        self.metrics.vote_validation.record(started, result.is_ok());
        result
    }

    fn validate_timeout(&self, timeout: &TimeoutObject) -> Result<Identity, ValidationError> {
        let started = Instant::now();
        let result = self.inner.validate_timeout(timeout);
        self.metrics.timeout_validation.record(started, result.is_ok());
        result
    }
}
