// Notifications - Consensus events reported to interested components
//
// Every hook has a no-op default so consumers implement only what they need.

use crate::types::{Block, Proposal, QuorumCertificate, TimeoutCertificate, TimeoutObject, View, Vote};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

/// Receiver of consensus events
pub trait Consumer: Send + Sync {
    /// A block was added to the fork-tracking structure
    fn on_block_incorporated(&self, _block: &Block) {}

    /// A block became final
    fn on_finalized_block(&self, _block: &Block) {}

    /// Two different blocks proposed for the same view
    fn on_double_propose_detected(&self, _first: &Block, _second: &Block) {}

    /// A QC was built from collected votes (exactly once per view)
    fn on_qc_constructed_from_votes(&self, _qc: &QuorumCertificate) {}

    /// A signer voted for two different blocks in one view
    fn on_double_voting_detected(&self, _first: &Vote, _second: &Vote) {}

    fn on_invalid_vote_detected(&self, _vote: &Vote, _reason: &str) {}

    /// A vote for a block that failed validation
    fn on_vote_for_invalid_block_detected(&self, _vote: &Vote, _proposal: &Proposal) {}

    /// A TC was built from collected timeouts (exactly once per view)
    fn on_tc_constructed_from_timeouts(&self, _tc: &TimeoutCertificate) {}

    /// Timeouts for a view crossed the honest-majority threshold
    fn on_partial_tc_created(
        &self,
        _view: View,
        _newest_qc: &QuorumCertificate,
        _last_view_tc: Option<&TimeoutCertificate>,
    ) {
    }

    /// A timeout revealed a QC newer than any seen so far
    fn on_new_qc_discovered(&self, _qc: &QuorumCertificate) {}

    fn on_double_timeout_detected(&self, _first: &TimeoutObject, _second: &TimeoutObject) {}

    fn on_invalid_timeout_detected(&self, _timeout: &TimeoutObject, _reason: &str) {}
}

/// Consumer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConsumer;

impl Consumer for NoopConsumer {}

/// Fans events out to several consumers, in registration order
#[derive(Default)]
pub struct Distributor {
    consumers: RwLock<Vec<Arc<dyn Consumer>>>,
}

impl Distributor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) {
        self.consumers.write().unwrap_or_else(|e| e.into_inner()).push(consumer);
    }

    fn each(&self, f: impl Fn(&dyn Consumer)) {
        let consumers = self.consumers.read().unwrap_or_else(|e| e.into_inner());
        for consumer in consumers.iter() {
            f(consumer.as_ref());
        }
    }
}

impl Consumer for Distributor {
    fn on_block_incorporated(&self, block: &Block) {
        self.each(|c| c.on_block_incorporated(block));
    }

    fn on_finalized_block(&self, block: &Block) {
        self.each(|c| c.on_finalized_block(block));
    }

    fn on_double_propose_detected(&self, first: &Block, second: &Block) {
        self.each(|c| c.on_double_propose_detected(first, second));
    }

    fn on_qc_constructed_from_votes(&self, qc: &QuorumCertificate) {
        self.each(|c| c.on_qc_constructed_from_votes(qc));
    }

    fn on_double_voting_detected(&self, first: &Vote, second: &Vote) {
        self.each(|c| c.on_double_voting_detected(first, second));
    }

    fn on_invalid_vote_detected(&self, vote: &Vote, reason: &str) {
        self.each(|c| c.on_invalid_vote_detected(vote, reason));
    }

    fn on_vote_for_invalid_block_detected(&self, vote: &Vote, proposal: &Proposal) {
        self.each(|c| c.on_vote_for_invalid_block_detected(vote, proposal));
    }

    fn on_tc_constructed_from_timeouts(&self, tc: &TimeoutCertificate) {
        self.each(|c| c.on_tc_constructed_from_timeouts(tc));
    }

    fn on_partial_tc_created(&self, view: View, newest_qc: &QuorumCertificate, last_view_tc: Option<&TimeoutCertificate>) {
        self.each(|c| c.on_partial_tc_created(view, newest_qc, last_view_tc));
    }

    fn on_new_qc_discovered(&self, qc: &QuorumCertificate) {
        self.each(|c| c.on_new_qc_discovered(qc));
    }

    fn on_double_timeout_detected(&self, first: &TimeoutObject, second: &TimeoutObject) {
        self.each(|c| c.on_double_timeout_detected(first, second));
    }

    fn on_invalid_timeout_detected(&self, timeout: &TimeoutObject, reason: &str) {
        self.each(|c| c.on_invalid_timeout_detected(timeout, reason));
    }
}

/// Owned form of a consensus event
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    BlockIncorporated(Block),
    FinalizedBlock(Block),
    DoubleProposal(Block, Block),
    QcConstructed(QuorumCertificate),
    DoubleVote(Vote, Vote),
    InvalidVote { vote: Vote, reason: String },
    VoteForInvalidBlock { vote: Vote, proposal: Proposal },
    TcConstructed(TimeoutCertificate),
    PartialTc {
        view: View,
        newest_qc: QuorumCertificate,
        last_view_tc: Option<TimeoutCertificate>,
    },
    NewQcDiscovered(QuorumCertificate),
    DoubleTimeout(TimeoutObject, TimeoutObject),
    InvalidTimeout { timeout: TimeoutObject, reason: String },
}

pub type ConsensusEventReceiver = mpsc::UnboundedReceiver<ConsensusEvent>;

/// Forwards events into an unbounded channel
///
/// Sending never blocks, whatever the listener does.
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<ConsensusEvent>,
}

impl ChannelConsumer {
    pub fn new() -> (Self, ConsensusEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ConsensusEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!("Failed to queue consensus event, listener dropped: {:?}", e.0);
        }
    }
}

impl Consumer for ChannelConsumer {
    fn on_block_incorporated(&self, block: &Block) {
        self.send(ConsensusEvent::BlockIncorporated(block.clone()));
    }

    fn on_finalized_block(&self, block: &Block) {
        self.send(ConsensusEvent::FinalizedBlock(block.clone()));
    }

    fn on_double_propose_detected(&self, first: &Block, second: &Block) {
        self.send(ConsensusEvent::DoubleProposal(first.clone(), second.clone()));
    }

    fn on_qc_constructed_from_votes(&self, qc: &QuorumCertificate) {
        self.send(ConsensusEvent::QcConstructed(qc.clone()));
    }

    fn on_double_voting_detected(&self, first: &Vote, second: &Vote) {
        self.send(ConsensusEvent::DoubleVote(first.clone(), second.clone()));
    }

    fn on_invalid_vote_detected(&self, vote: &Vote, reason: &str) {
        self.send(ConsensusEvent::InvalidVote {
            vote: vote.clone(),
            reason: reason.to_string(),
        });
    }

    fn on_vote_for_invalid_block_detected(&self, vote: &Vote, proposal: &Proposal) {
        self.send(ConsensusEvent::VoteForInvalidBlock {
            vote: vote.clone(),
            proposal: proposal.clone(),
        });
    }

    fn on_tc_constructed_from_timeouts(&self, tc: &TimeoutCertificate) {
        self.send(ConsensusEvent::TcConstructed(tc.clone()));
    }

    fn on_partial_tc_created(&self, view: View, newest_qc: &QuorumCertificate, last_view_tc: Option<&TimeoutCertificate>) {
        self.send(ConsensusEvent::PartialTc {
            view,
            newest_qc: newest_qc.clone(),
            last_view_tc: last_view_tc.cloned(),
        });
    }

    fn on_new_qc_discovered(&self, qc: &QuorumCertificate) {
        self.send(ConsensusEvent::NewQcDiscovered(qc.clone()));
    }

    fn on_double_timeout_detected(&self, first: &TimeoutObject, second: &TimeoutObject) {
        self.send(ConsensusEvent::DoubleTimeout(first.clone(), second.clone()));
    }

    fn on_invalid_timeout_detected(&self, timeout: &TimeoutObject, reason: &str) {
        self.send(ConsensusEvent::InvalidTimeout {
            timeout: timeout.clone(),
            reason: reason.to_string(),
        });
    }
}
