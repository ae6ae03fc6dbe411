// Votes - Weighted vote collection and QC construction
//
// A vote's signature is checked before it can claim its signer's slot in a
// view. Signed votes that arrive before their block are cached and counted
// once the validated proposal is added. Each signer counts once per view; the
// QC is built and announced on the first crossing of the quorum threshold only.

use super::{AggregationError, ViewCollectors};
use crate::consensus::committee::Committee;
use crate::consensus::metrics::ConsensusMetrics;
use crate::consensus::notifications::Consumer;
use crate::consensus::packer::{BlockSignatureData, SigDataPacker};
use crate::consensus::threshold::quorum_threshold;
use crate::consensus::validator::ConsensusValidator;
use crate::types::{Block, NodeId, Proposal, QuorumCertificate, SigType, View, Vote, VoteSignature, Weight};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of feeding one vote to the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Block not known yet; kept until the proposal arrives
    Cached,

    /// Counted; quorum either not reached yet or already certified
    Accepted { total_weight: Weight },

    /// This vote completed the quorum
    QcBuilt(QuorumCertificate),

    /// This signer's vote for the same block was seen before
    Duplicate,

    /// Signer already voted for a different block in this view
    DoubleVote,

    /// Bad signature, unauthorized signer, or a block other than the view's proposal
    Invalid,

    /// The view's proposal was found invalid
    ForInvalidBlock,
}

/// Notification to emit once the view's lock is released
enum Event {
    QcConstructed(QuorumCertificate),
    DoubleVote(Vote, Vote),
    InvalidVote(Vote, String),
    VoteForInvalidBlock(Vote, Proposal),
}

/// Accepted vote of one signer
struct Accepted {
    weight: Weight,
    signature: VoteSignature,
}

struct VoteCollector {
    view: View,

    /// Validated block of this view, once known
    block: Option<Block>,

    /// Proposal that failed validation
    invalid_proposal: Option<Proposal>,

    /// Signed votes received before the block
    pending: Vec<Vote>,

    /// First vote per signer whose signature checked out
    signed_votes: HashMap<NodeId, Vote>,

    accepted: HashMap<NodeId, Accepted>,
    total_weight: Weight,
    threshold: Weight,
    qc: Option<QuorumCertificate>,
}

impl VoteCollector {
    fn new(view: View) -> Self {
        Self {
            view,
            block: None,
            invalid_proposal: None,
            pending: Vec::new(),
            signed_votes: HashMap::new(),
            accepted: HashMap::new(),
            total_weight: 0,
            threshold: Weight::MAX,
            qc: None,
        }
    }

    /// Whether this signer's vote for the same block was already taken
    fn is_duplicate(&self, vote: &Vote) -> bool {
        self.signed_votes
            .get(&vote.signer_id)
            .is_some_and(|first| first.block_id == vote.block_id)
    }
}

/// Collects votes for all active views
pub struct VoteAggregator<V: ConsensusValidator + ?Sized> {
    validator: Arc<V>,
    committee: Arc<dyn Committee>,
    packer: SigDataPacker<dyn Committee>,
    consumer: Arc<dyn Consumer>,
    metrics: Option<Arc<ConsensusMetrics>>,
    collectors: ViewCollectors<VoteCollector>,
}

impl<V: ConsensusValidator + ?Sized> VoteAggregator<V> {
    /// Votes below `lowest_retained_view` are rejected from the start
    pub fn new(
        validator: Arc<V>,
        committee: Arc<dyn Committee>,
        consumer: Arc<dyn Consumer>,
        lowest_retained_view: View,
    ) -> Self {
        Self {
            validator,
            packer: SigDataPacker::new(committee.clone()),
            committee,
            consumer,
            metrics: None,
            collectors: ViewCollectors::new(lowest_retained_view),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ConsensusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn lowest_retained_view(&self) -> View {
        self.collectors.lowest_retained()
    }

    /// Feed a vote received from the network
    pub fn add_vote(&self, vote: Vote) -> Result<VoteOutcome, AggregationError> {
        let collector = self.collectors.get_or_create(vote.view, || VoteCollector::new(vote.view))?;
        let mut events = Vec::new();
        let outcome = {
            let mut collector = collector.lock().unwrap_or_else(|e| e.into_inner());
            self.process_vote(&mut collector, vote, &mut events)
        };
        self.emit(events);
        outcome
    }

    /// Start processing votes for a validated proposal
    ///
    /// The proposer's own signature counts as its vote. Returns the QC if the
    /// proposer vote or the cached votes completed the quorum.
    pub fn add_block(&self, proposal: &Proposal) -> Result<Option<QuorumCertificate>, AggregationError> {
        let block = &proposal.block;
        let collector = match self.collectors.get_or_create(block.view, || VoteCollector::new(block.view)) {
            Ok(collector) => collector,
            Err(e) if e.is_view_already_processed() => {
                debug!("Votes: ignoring block {} for pruned view {}", block.block_id, block.view);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut events = Vec::new();
        let result = {
            let mut collector = collector.lock().unwrap_or_else(|e| e.into_inner());
            self.process_block(&mut collector, proposal, &mut events)
        };
        self.emit(events);
        result
    }

    /// The proposal for a view failed validation
    ///
    /// Cached and future votes for it are reported as votes for an invalid block.
    pub fn invalid_block(&self, proposal: &Proposal) -> Result<(), AggregationError> {
        let block = &proposal.block;
        let collector = match self.collectors.get_or_create(block.view, || VoteCollector::new(block.view)) {
            Ok(collector) => collector,
            Err(e) if e.is_view_already_processed() => return Ok(()),
            Err(e) => return Err(e),
        };

        let events: Vec<Event> = {
            let mut collector = collector.lock().unwrap_or_else(|e| e.into_inner());
            if collector.block.is_some() {
                return Ok(());
            }
            collector.invalid_proposal = Some(proposal.clone());
            std::mem::take(&mut collector.pending)
                .into_iter()
                .filter(|vote| vote.block_id == block.block_id)
                .map(|vote| Event::VoteForInvalidBlock(vote, proposal.clone()))
                .collect()
        };
        warn!("🚨 Proposal {} at view {} is invalid", block.block_id, block.view);
        self.emit(events);
        Ok(())
    }

    /// Forget all views up to and including `view`
    pub fn prune_up_to_view(&self, view: View) {
        self.collectors.prune_up_to_view(view);
    }

    fn process_block(
        &self,
        collector: &mut VoteCollector,
        proposal: &Proposal,
        events: &mut Vec<Event>,
    ) -> Result<Option<QuorumCertificate>, AggregationError> {
        let block = &proposal.block;
        if let Some(existing) = &collector.block {
            if existing.block_id != block.block_id {
                debug!(
                    "Votes: view {} already tracks block {}, ignoring {}",
                    collector.view, existing.block_id, block.block_id
                );
            }
            return Ok(None);
        }

        let participants = self.committee.identities(&block.block_id)?;
        collector.threshold = quorum_threshold(participants.total_weight());
        collector.block = Some(block.clone());
        debug!(
            "Votes: tracking block {} at view {} (threshold {})",
            block.block_id, block.view, collector.threshold
        );

        let mut qc = None;
        let mut outcomes = vec![self.process_vote(collector, proposal.proposer_vote(), events)?];
        // cached votes were checked on arrival
        for vote in std::mem::take(&mut collector.pending) {
            outcomes.push(self.count_vote(collector, vote, events)?);
        }
        for outcome in outcomes {
            if let VoteOutcome::QcBuilt(built) = outcome {
                qc = Some(built);
            }
        }
        Ok(qc)
    }

    /// Signature and equivocation checks, then cache or count
    fn process_vote(
        &self,
        collector: &mut VoteCollector,
        vote: Vote,
        events: &mut Vec<Event>,
    ) -> Result<VoteOutcome, AggregationError> {
        if collector.is_duplicate(&vote) {
            return Ok(VoteOutcome::Duplicate);
        }

        // nothing about a signer is recorded before its signature checks out
        match self.validator.validate_vote_signature(&vote) {
            Ok(_) => {}
            Err(e) if e.is_invalid_input() => {
                warn!("🚨 Invalid vote from {} at view {}: {}", vote.signer_id, vote.view, e);
                events.push(Event::InvalidVote(vote, e.to_string()));
                self.record_rejection();
                return Ok(VoteOutcome::Invalid);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(first) = collector.signed_votes.get(&vote.signer_id) {
            events.push(Event::DoubleVote(first.clone(), vote));
            return Ok(VoteOutcome::DoubleVote);
        }
        collector.signed_votes.insert(vote.signer_id, vote.clone());

        if let Some(proposal) = &collector.invalid_proposal {
            if proposal.block.block_id == vote.block_id {
                events.push(Event::VoteForInvalidBlock(vote, proposal.clone()));
                return Ok(VoteOutcome::ForInvalidBlock);
            }
        }

        if collector.block.is_none() {
            collector.pending.push(vote);
            return Ok(VoteOutcome::Cached);
        }
        self.count_vote(collector, vote, events)
    }

    /// Count a signed vote against the view's block
    fn count_vote(
        &self,
        collector: &mut VoteCollector,
        vote: Vote,
        events: &mut Vec<Event>,
    ) -> Result<VoteOutcome, AggregationError> {
        let Some(block) = collector.block.clone() else {
            return Err(AggregationError::Inconsistent(format!(
                "counting vote {} before the block of view {}",
                vote.id(),
                collector.view
            )));
        };

        if vote.block_id != block.block_id {
            let reason = format!("vote for {} but view {} proposes {}", vote.block_id, vote.view, block.block_id);
            warn!("🚨 Invalid vote from {}: {}", vote.signer_id, reason);
            events.push(Event::InvalidVote(vote, reason));
            self.record_rejection();
            return Ok(VoteOutcome::Invalid);
        }

        let voter = match self.validator.validate_vote(&vote, &block) {
            Ok(voter) => voter,
            Err(e) if e.is_invalid_input() => {
                warn!("🚨 Invalid vote from {} at view {}: {}", vote.signer_id, vote.view, e);
                events.push(Event::InvalidVote(vote, e.to_string()));
                self.record_rejection();
                return Ok(VoteOutcome::Invalid);
            }
            Err(e) => return Err(e.into()),
        };
        if collector.accepted.contains_key(&voter.node_id) {
            return Ok(VoteOutcome::Duplicate);
        }

        let signature = VoteSignature::decode(&vote.sig_data).ok_or_else(|| {
            AggregationError::Inconsistent(format!("validated vote {} has undecodable signature", vote.id()))
        })?;
        collector.accepted.insert(
            voter.node_id,
            Accepted {
                weight: voter.weight,
                signature,
            },
        );
        collector.total_weight += voter.weight;
        debug!(
            "Votes: view {} has weight {}/{} after vote from {}",
            collector.view, collector.total_weight, collector.threshold, voter.node_id
        );

        if collector.qc.is_some() || collector.total_weight < collector.threshold {
            return Ok(VoteOutcome::Accepted {
                total_weight: collector.total_weight,
            });
        }

        let qc = self.build_qc(collector, &block)?;
        info!(
            "🏅 QC built for block {} at view {} with weight {}",
            qc.block_id, qc.view, collector.total_weight
        );
        collector.qc = Some(qc.clone());
        events.push(Event::QcConstructed(qc.clone()));
        if let Some(metrics) = &self.metrics {
            metrics.qc_built();
        }
        Ok(VoteOutcome::QcBuilt(qc))
    }

    /// Concatenate signatures per scheme in canonical order and pack them
    fn build_qc(&self, collector: &VoteCollector, block: &Block) -> Result<QuorumCertificate, AggregationError> {
        let participants = self.committee.identities(&block.block_id)?;
        let mut data = BlockSignatureData::default();

        for identity in participants.iter() {
            let Some(accepted) = collector.accepted.get(&identity.node_id) else {
                continue;
            };
            let signature = accepted.signature.signature.as_bytes();
            match accepted.signature.sig_type {
                SigType::Staking => {
                    data.staking_signers.push(identity.node_id);
                    data.aggregated_staking_sig.extend_from_slice(signature);
                }
                SigType::Beacon => {
                    data.beacon_signers.push(identity.node_id);
                    data.aggregated_beacon_sig.extend_from_slice(signature);
                }
            }
        }

        let counted = data.staking_signers.len() + data.beacon_signers.len();
        if counted != collector.accepted.len() {
            return Err(AggregationError::Inconsistent(format!(
                "{} accepted voters but only {} are in the committee of block {}",
                collector.accepted.len(),
                counted,
                block.block_id
            )));
        }

        let (signer_indices, sig_data) = self.packer.pack(&block.block_id, &data)?;
        Ok(QuorumCertificate {
            block_id: block.block_id,
            view: block.view,
            signer_indices,
            sig_data,
        })
    }

    fn record_rejection(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.vote_rejected();
        }
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::QcConstructed(qc) => self.consumer.on_qc_constructed_from_votes(&qc),
                Event::DoubleVote(first, second) => {
                    warn!(
                        "🚨 Double vote by {} at view {}: {} and {}",
                        first.signer_id, first.view, first.block_id, second.block_id
                    );
                    self.consumer.on_double_voting_detected(&first, &second);
                }
                Event::InvalidVote(vote, reason) => self.consumer.on_invalid_vote_detected(&vote, &reason),
                Event::VoteForInvalidBlock(vote, proposal) => {
                    self.consumer.on_vote_for_invalid_block_detected(&vote, &proposal)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::config::MAX_VIEWS_AHEAD;
    use crate::consensus::error::{CommitteeError, ValidationError};
    use crate::consensus::notifications::NoopConsumer;
    use crate::types::{Identifier, Identity, IdentityList, PublicKey, Role, TimeoutCertificate, TimeoutObject};

    /// Accepts or rejects every vote signature; never authorizes a vote at a block
    struct StubValidator {
        signatures_valid: bool,
    }

    fn rejected(vote: &Vote) -> ValidationError {
        ValidationError::InvalidVote {
            vote_id: vote.id(),
            signer_id: vote.signer_id,
            view: vote.view,
            reason: "rejected".to_string(),
            source: None,
        }
    }

    impl ConsensusValidator for StubValidator {
        fn validate_qc(&self, _qc: &QuorumCertificate, _block: &Block) -> Result<(), ValidationError> {
            Ok(())
        }

        fn validate_tc(&self, _tc: &TimeoutCertificate) -> Result<(), ValidationError> {
            Ok(())
        }

        fn validate_proposal(&self, _proposal: &Proposal) -> Result<(), ValidationError> {
            Ok(())
        }

        fn validate_vote(&self, vote: &Vote, _block: &Block) -> Result<Identity, ValidationError> {
            Err(rejected(vote))
        }

        fn validate_vote_signature(&self, vote: &Vote) -> Result<Identity, ValidationError> {
            if !self.signatures_valid {
                return Err(rejected(vote));
            }
            Ok(Identity::new(Role::Consensus, 1, PublicKey::from_bytes([1; 32]), None))
        }

        fn validate_timeout(&self, timeout: &TimeoutObject) -> Result<Identity, ValidationError> {
            Err(ValidationError::invalid_timeout(timeout.signer_id, timeout.view, "rejected"))
        }
    }

    struct EmptyCommittee;

    impl Committee for EmptyCommittee {
        fn identities(&self, block_id: &Identifier) -> Result<IdentityList, CommitteeError> {
            Err(CommitteeError::UnknownBlock(*block_id))
        }

        fn identity(
            &self,
            block_id: &Identifier,
            _participant_id: &NodeId,
        ) -> Result<Identity, CommitteeError> {
            Err(CommitteeError::UnknownBlock(*block_id))
        }

        fn identities_by_epoch(&self, view: View) -> Result<IdentityList, CommitteeError> {
            Err(CommitteeError::EpochNotSetup { view })
        }

        fn identity_by_epoch(&self, view: View, _participant_id: &NodeId) -> Result<Identity, CommitteeError> {
            Err(CommitteeError::EpochNotSetup { view })
        }

        fn leader_for_view(&self, view: View) -> Result<NodeId, CommitteeError> {
            Err(CommitteeError::EpochNotSetup { view })
        }

        fn self_id(&self) -> NodeId {
            NodeId::ZERO
        }
    }

    fn aggregator_with(signatures_valid: bool) -> VoteAggregator<StubValidator> {
        VoteAggregator::new(
            Arc::new(StubValidator { signatures_valid }),
            Arc::new(EmptyCommittee),
            Arc::new(NoopConsumer),
            1,
        )
    }

    fn aggregator() -> VoteAggregator<StubValidator> {
        aggregator_with(true)
    }

    fn vote(view: View, block: u8, signer: u8) -> Vote {
        Vote {
            view,
            block_id: Identifier::hash(&[block]),
            signer_id: Identifier::hash(&[100 + signer]),
            sig_data: vec![0; VoteSignature::ENCODED_LEN],
        }
    }

    #[test]
    fn test_votes_cached_until_block() {
        let agg = aggregator();
        assert_eq!(agg.add_vote(vote(3, 1, 1)).unwrap(), VoteOutcome::Cached);
        assert_eq!(agg.add_vote(vote(3, 1, 1)).unwrap(), VoteOutcome::Duplicate);
        assert_eq!(agg.add_vote(vote(3, 2, 1)).unwrap(), VoteOutcome::DoubleVote);
    }

    #[test]
    fn test_unsigned_votes_claim_nothing() {
        let agg = aggregator_with(false);
        assert_eq!(agg.add_vote(vote(3, 1, 1)).unwrap(), VoteOutcome::Invalid);
        // neither cached nor recorded, so no duplicate or equivocation follows
        assert_eq!(agg.add_vote(vote(3, 1, 1)).unwrap(), VoteOutcome::Invalid);
        assert_eq!(agg.add_vote(vote(3, 2, 1)).unwrap(), VoteOutcome::Invalid);
    }

    #[test]
    fn test_far_future_vote_rejected_before_caching() {
        let agg = aggregator();
        let err = agg.add_vote(vote(1 + MAX_VIEWS_AHEAD + 1, 1, 1)).unwrap_err();
        assert!(matches!(err, AggregationError::ViewTooFarAhead { .. }));
        assert_eq!(agg.add_vote(vote(1 + MAX_VIEWS_AHEAD, 1, 1)).unwrap(), VoteOutcome::Cached);
    }

    #[test]
    fn test_pruned_view_rejected_without_validation() {
        let agg = aggregator();
        agg.prune_up_to_view(5);
        let err = agg.add_vote(vote(5, 1, 1)).unwrap_err();
        assert!(matches!(
            err,
            AggregationError::ViewAlreadyProcessed {
                view: 5,
                lowest_retained: 6
            }
        ));
        assert!(agg.add_vote(vote(0, 1, 1)).unwrap_err().is_view_already_processed());
    }

    #[test]
    fn test_votes_for_invalid_block() {
        let agg = aggregator();
        let v = vote(4, 1, 1);
        assert_eq!(agg.add_vote(v.clone()).unwrap(), VoteOutcome::Cached);

        let mut block = Block::genesis(0);
        block.view = 4;
        block.block_id = v.block_id;
        let proposal = Proposal {
            block,
            sig_data: vec![],
            last_view_tc: None,
        };
        agg.invalid_block(&proposal).unwrap();
        assert_eq!(agg.add_vote(vote(4, 1, 2)).unwrap(), VoteOutcome::ForInvalidBlock);
    }
}
