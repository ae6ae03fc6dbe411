// Validator - Structural and cryptographic validation of consensus messages
//
// Stateless: every check works on the inputs plus fresh reads from the
// committee and the fork tree, so it is safe to call from many tasks.
//
// Failure classes:
// - Invalid*: the message (or its sender) is at fault; log and drop it
// - MissingBlock: an ancestor is unknown locally; fetch it
// - UnverifiableBlock: extends a pruned fork; store, do not propagate
// - Unexpected: local fault or inconsistent caller input; abort

use super::committee::Committee;
use super::error::{BoxError, ValidationError, VerifyError};
use super::forks::ForksReader;
use super::signer_indices::decode_signers;
use super::threshold::quorum_threshold;
use super::verification::Verifier;
use crate::types::{
    Block, Identity, IdentityList, Proposal, QuorumCertificate, TimeoutCertificate, TimeoutObject, View, Vote,
};
use std::sync::Arc;
use tracing::trace;

/// Validation entry points used by the event handlers and aggregators
pub trait ConsensusValidator: Send + Sync {
    /// QC certifying `block`
    fn validate_qc(&self, qc: &QuorumCertificate, block: &Block) -> Result<(), ValidationError>;

    /// TC, including its embedded newest QC
    fn validate_tc(&self, tc: &TimeoutCertificate) -> Result<(), ValidationError>;

    /// Proposer signature, leader, parent linkage and embedded certificates
    fn validate_proposal(&self, proposal: &Proposal) -> Result<(), ValidationError>;

    /// Vote for `block`; returns the voter for weight accounting
    fn validate_vote(&self, vote: &Vote, block: &Block) -> Result<Identity, ValidationError>;

    /// Signature of a vote whose block may be unknown, checked against the
    /// view's epoch. Authorization at the block is left to `validate_vote`.
    fn validate_vote_signature(&self, vote: &Vote) -> Result<Identity, ValidationError>;

    /// Timeout object; returns the signer for weight accounting
    fn validate_timeout(&self, timeout: &TimeoutObject) -> Result<Identity, ValidationError>;
}

/// Why a QC did not check out, before it is attributed to a message kind
enum QcFault {
    Invalid(String, Option<BoxError>),
    Unexpected(String, BoxError),
}

/// Default validator over a committee, fork tree and verifier
pub struct Validator<C: Committee + ?Sized, F: ForksReader + ?Sized, V: Verifier + ?Sized> {
    committee: Arc<C>,
    forks: Arc<F>,
    verifier: Arc<V>,
}

impl<C: Committee + ?Sized, F: ForksReader + ?Sized, V: Verifier + ?Sized> Validator<C, F, V> {
    pub fn new(committee: Arc<C>, forks: Arc<F>, verifier: Arc<V>) -> Self {
        Self {
            committee,
            forks,
            verifier,
        }
    }

    /// Weight and signature checks of a QC against the given participants
    fn check_qc(&self, qc: &QuorumCertificate, all_participants: &IdentityList) -> Result<(), QcFault> {
        let signers = decode_signers(&qc.signer_indices, all_participants)
            .map_err(|e| QcFault::Invalid("signer indices are invalid".to_string(), Some(e.into())))?;

        let threshold = quorum_threshold(all_participants.total_weight());
        if signers.total_weight() < threshold {
            return Err(QcFault::Invalid(
                format!(
                    "signers have insufficient weight {} (required {})",
                    signers.total_weight(),
                    threshold
                ),
                None,
            ));
        }

        match self.verifier.verify_qc(&signers, &qc.sig_data, qc.view, &qc.block_id) {
            Ok(()) => Ok(()),
            Err(e @ VerifyError::InvalidFormat(_)) => {
                Err(QcFault::Invalid("malformed signature data".to_string(), Some(e.into())))
            }
            Err(e @ VerifyError::InvalidSignature(_)) => {
                Err(QcFault::Invalid("bad signature".to_string(), Some(e.into())))
            }
            Err(e) => Err(QcFault::Unexpected(
                format!("cannot verify aggregated signature of QC for {}", qc.block_id),
                e.into(),
            )),
        }
    }

    /// QC embedded in a timeout or TC, checked against its view's epoch
    ///
    /// QCs for blocks at or below the finalized view are trusted: the block
    /// could only have been finalized once certified.
    fn check_embedded_qc(&self, qc: &QuorumCertificate) -> Result<(), QcFault> {
        if qc.view <= self.forks.finalized_view() {
            return Ok(());
        }
        let all_participants = self.committee.identities_by_epoch(qc.view).map_err(|e| {
            QcFault::Unexpected(format!("no committee for view {}", qc.view), e.into())
        })?;
        self.check_qc(qc, &all_participants)
    }

    /// Signature of `vote` over its own `(view, block_id)` by `voter`
    fn check_vote_signature(&self, vote: &Vote, voter: &Identity) -> Result<(), ValidationError> {
        match self.verifier.verify_vote(voter, &vote.sig_data, vote.view, &vote.block_id) {
            Ok(()) => Ok(()),
            Err(e @ (VerifyError::InvalidFormat(_) | VerifyError::InvalidSignature(_))) => {
                Err(ValidationError::InvalidVote {
                    vote_id: vote.id(),
                    signer_id: vote.signer_id,
                    view: vote.view,
                    reason: "signature check failed".to_string(),
                    source: Some(e.into()),
                })
            }
            Err(e) => Err(ValidationError::unexpected(
                format!("cannot verify signature of vote {}", vote.id()),
                Some(e.into()),
            )),
        }
    }
}

impl<C: Committee + ?Sized, F: ForksReader + ?Sized, V: Verifier + ?Sized> ConsensusValidator for Validator<C, F, V> {
    fn validate_qc(&self, qc: &QuorumCertificate, block: &Block) -> Result<(), ValidationError> {
        if qc.block_id != block.block_id {
            return Err(ValidationError::unexpected(
                format!("qc.block_id {} does not match block {}", qc.block_id, block.block_id),
                None,
            ));
        }
        if qc.view != block.view {
            return Err(ValidationError::invalid_block(
                block.block_id,
                block.view,
                format!("qc view {} does not match referenced block view {}", qc.view, block.view),
            ));
        }

        let all_participants = self.committee.identities(&block.block_id).map_err(|e| {
            ValidationError::unexpected(
                format!("could not get consensus participants for block {}", block.block_id),
                Some(e.into()),
            )
        })?;

        self.check_qc(qc, &all_participants).map_err(|fault| match fault {
            QcFault::Invalid(reason, source) => ValidationError::InvalidBlock {
                block_id: block.block_id,
                view: block.view,
                reason,
                source,
            },
            QcFault::Unexpected(reason, source) => ValidationError::unexpected(reason, Some(source)),
        })
    }

    fn validate_tc(&self, tc: &TimeoutCertificate) -> Result<(), ValidationError> {
        if tc.newest_qc.view >= tc.view {
            return Err(ValidationError::invalid_tc(
                tc.view,
                format!("newest QC view {} is not below TC view", tc.newest_qc.view),
            ));
        }
        let highest = tc.newest_qc_views.iter().copied().max();
        if highest != Some(tc.newest_qc.view) {
            return Err(ValidationError::invalid_tc(
                tc.view,
                format!(
                    "newest QC view {} is not the highest reported view {:?}",
                    tc.newest_qc.view, highest
                ),
            ));
        }

        let all_participants = self.committee.identities_by_epoch(tc.view).map_err(|e| {
            ValidationError::unexpected(format!("no committee for view {}", tc.view), Some(e.into()))
        })?;
        let signers = decode_signers(&tc.signer_indices, &all_participants)
            .map_err(|e| ValidationError::invalid_tc(tc.view, "signer indices are invalid").with_source(e))?;
        if signers.len() != tc.newest_qc_views.len() {
            return Err(ValidationError::invalid_tc(
                tc.view,
                format!("{} signers but {} newest QC views", signers.len(), tc.newest_qc_views.len()),
            ));
        }

        let threshold = quorum_threshold(all_participants.total_weight());
        if signers.total_weight() < threshold {
            return Err(ValidationError::invalid_tc(
                tc.view,
                format!(
                    "signers have insufficient weight {} (required {})",
                    signers.total_weight(),
                    threshold
                ),
            ));
        }

        match self.verifier.verify_tc(&signers, &tc.sig_data, tc.view, &tc.newest_qc_views) {
            Ok(()) => {}
            Err(e @ (VerifyError::InvalidFormat(_) | VerifyError::InvalidSignature(_))) => {
                return Err(ValidationError::invalid_tc(tc.view, "invalid aggregated signature").with_source(e));
            }
            Err(e) => {
                return Err(ValidationError::unexpected(
                    format!("cannot verify TC for view {}", tc.view),
                    Some(e.into()),
                ));
            }
        }

        self.check_embedded_qc(&tc.newest_qc).map_err(|fault| match fault {
            QcFault::Invalid(reason, source) => ValidationError::InvalidTc {
                view: tc.view,
                reason: format!("invalid newest QC: {}", reason),
                source,
            },
            QcFault::Unexpected(reason, source) => ValidationError::unexpected(reason, Some(source)),
        })
    }

    fn validate_proposal(&self, proposal: &Proposal) -> Result<(), ValidationError> {
        let block = &proposal.block;
        trace!("Validating proposal {} at view {}", block.block_id, block.view);

        // signatures only cover (view, block_id)
        if !block.is_sealed() {
            return Err(ValidationError::invalid_block(
                block.block_id,
                block.view,
                "block ID does not match content",
            ));
        }

        // proposer's own signature, viewed as a vote
        match self.validate_vote(&proposal.proposer_vote(), block) {
            Ok(_) => {}
            Err(e @ ValidationError::InvalidVote { .. }) => {
                return Err(
                    ValidationError::invalid_block(block.block_id, block.view, "invalid proposer signature")
                        .with_source(e),
                );
            }
            Err(e) => return Err(e),
        }

        let leader = self.committee.leader_for_view(block.view).map_err(|e| {
            ValidationError::unexpected(
                format!("error determining leader for block {}", block.block_id),
                Some(e.into()),
            )
        })?;
        if leader != block.proposer_id {
            return Err(ValidationError::invalid_block(
                block.block_id,
                block.view,
                format!("proposer {} is not leader ({}) for view {}", block.proposer_id, leader, block.view),
            ));
        }

        let qc = block.qc.as_ref().ok_or_else(|| {
            ValidationError::invalid_block(block.block_id, block.view, "proposal without QC")
        })?;
        if block.view <= qc.view {
            return Err(ValidationError::invalid_block(
                block.block_id,
                block.view,
                format!("block view {} does not exceed QC view {}", block.view, qc.view),
            ));
        }
        if block.parent_id != qc.block_id {
            return Err(ValidationError::invalid_block(
                block.block_id,
                block.view,
                format!("parent {} is not the certified block {}", block.parent_id, qc.block_id),
            ));
        }

        // a skipped view must be justified by a TC for the previous view
        let last_view_successful = qc.view + 1 == block.view;
        match (&proposal.last_view_tc, last_view_successful) {
            (Some(_), true) => {
                return Err(ValidationError::invalid_block(
                    block.block_id,
                    block.view,
                    "last view succeeded but proposal carries a TC",
                ));
            }
            (None, false) => {
                return Err(ValidationError::invalid_block(
                    block.block_id,
                    block.view,
                    format!("QC view {} is not the previous view and no TC is included", qc.view),
                ));
            }
            (Some(tc), false) => {
                if tc.view + 1 != block.view {
                    return Err(ValidationError::invalid_block(
                        block.block_id,
                        block.view,
                        format!("last view TC is for view {}", tc.view),
                    ));
                }
                if qc.view < tc.newest_qc.view {
                    return Err(ValidationError::invalid_block(
                        block.block_id,
                        block.view,
                        format!("QC view {} is older than TC's newest QC view {}", qc.view, tc.newest_qc.view),
                    ));
                }
            }
            (None, true) => {}
        }

        let parent = match self.forks.get_block(&qc.block_id) {
            Some(parent) => parent,
            None if qc.view >= self.forks.finalized_view() => {
                return Err(ValidationError::MissingBlock {
                    block_id: qc.block_id,
                    view: qc.view,
                });
            }
            None => {
                return Err(ValidationError::UnverifiableBlock {
                    block_id: block.block_id,
                    view: block.view,
                });
            }
        };

        // most expensive checks last
        match self.validate_qc(qc, &parent) {
            Ok(()) => {}
            Err(e @ ValidationError::InvalidBlock { .. }) => {
                return Err(
                    ValidationError::invalid_block(block.block_id, block.view, "invalid QC included").with_source(e),
                );
            }
            Err(e) => return Err(e),
        }

        if let Some(tc) = &proposal.last_view_tc {
            match self.validate_tc(tc) {
                Ok(()) => {}
                Err(e @ ValidationError::InvalidTc { .. }) => {
                    return Err(
                        ValidationError::invalid_block(block.block_id, block.view, "invalid last view TC")
                            .with_source(e),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn validate_vote(&self, vote: &Vote, block: &Block) -> Result<Identity, ValidationError> {
        if vote.block_id != block.block_id {
            return Err(ValidationError::unexpected(
                format!("vote for {} checked against block {}", vote.block_id, block.block_id),
                None,
            ));
        }

        let invalid_vote = |reason: String, source: Option<BoxError>| ValidationError::InvalidVote {
            vote_id: vote.id(),
            signer_id: vote.signer_id,
            view: vote.view,
            reason,
            source,
        };

        if vote.view != block.view {
            return Err(invalid_vote(
                format!("vote view {} is inconsistent with block view {}", vote.view, block.view),
                None,
            ));
        }

        let voter = match self.committee.identity(&block.block_id, &vote.signer_id) {
            Ok(voter) => voter,
            Err(e) if e.is_invalid_signer() => {
                return Err(invalid_vote("voter is not authorized".to_string(), Some(e.into())));
            }
            Err(e) => {
                return Err(ValidationError::unexpected(
                    format!("error retrieving voter identity at block {}", block.block_id),
                    Some(e.into()),
                ));
            }
        };

        self.check_vote_signature(vote, &voter)?;
        Ok(voter)
    }

    fn validate_vote_signature(&self, vote: &Vote) -> Result<Identity, ValidationError> {
        let voter = match self.committee.identity_by_epoch(vote.view, &vote.signer_id) {
            Ok(voter) => voter,
            Err(e) if e.is_invalid_signer() => {
                return Err(ValidationError::InvalidVote {
                    vote_id: vote.id(),
                    signer_id: vote.signer_id,
                    view: vote.view,
                    reason: "voter is not a member of the view's epoch".to_string(),
                    source: Some(e.into()),
                });
            }
            Err(e) => {
                return Err(ValidationError::unexpected(
                    format!("error retrieving voter identity for view {}", vote.view),
                    Some(e.into()),
                ));
            }
        };

        self.check_vote_signature(vote, &voter)?;
        Ok(voter)
    }

    fn validate_timeout(&self, timeout: &TimeoutObject) -> Result<Identity, ValidationError> {
        let view: View = timeout.view;
        let newest_qc = &timeout.newest_qc;

        if newest_qc.view >= view {
            return Err(ValidationError::invalid_timeout(
                timeout.signer_id,
                view,
                format!("newest QC view {} is not below timeout view", newest_qc.view),
            ));
        }

        let last_view_successful = newest_qc.view + 1 == view;
        match (&timeout.last_view_tc, last_view_successful) {
            (Some(_), true) => {
                return Err(ValidationError::invalid_timeout(
                    timeout.signer_id,
                    view,
                    "last view succeeded but timeout carries a TC",
                ));
            }
            (None, false) => {
                return Err(ValidationError::invalid_timeout(
                    timeout.signer_id,
                    view,
                    "newest QC is not from the previous view and no TC is included",
                ));
            }
            (Some(tc), false) => {
                if tc.view + 1 != view || newest_qc.view < tc.newest_qc.view {
                    return Err(ValidationError::invalid_timeout(
                        timeout.signer_id,
                        view,
                        format!("last view TC for view {} does not justify the timeout", tc.view),
                    ));
                }
            }
            (None, true) => {}
        }

        let signer = match self.committee.identity_by_epoch(view, &timeout.signer_id) {
            Ok(signer) => signer,
            Err(e) if e.is_invalid_signer() => {
                return Err(
                    ValidationError::invalid_timeout(timeout.signer_id, view, "signer is not authorized")
                        .with_source(e),
                );
            }
            Err(e) => {
                return Err(ValidationError::unexpected(
                    format!("error retrieving timeout signer for view {}", view),
                    Some(e.into()),
                ));
            }
        };

        match self.verifier.verify_timeout(&signer, &timeout.sig_data, view, newest_qc.view) {
            Ok(()) => {}
            Err(e @ (VerifyError::InvalidFormat(_) | VerifyError::InvalidSignature(_))) => {
                return Err(
                    ValidationError::invalid_timeout(timeout.signer_id, view, "signature check failed").with_source(e),
                );
            }
            Err(e) => {
                return Err(ValidationError::unexpected(
                    format!("cannot verify timeout of {}", timeout.signer_id),
                    Some(e.into()),
                ));
            }
        }

        self.check_embedded_qc(newest_qc).map_err(|fault| match fault {
            QcFault::Invalid(reason, source) => ValidationError::InvalidTimeout {
                signer_id: timeout.signer_id,
                view,
                reason: format!("invalid newest QC: {}", reason),
                source,
            },
            QcFault::Unexpected(reason, source) => ValidationError::unexpected(reason, Some(source)),
        })?;

        if let Some(tc) = &timeout.last_view_tc {
            match self.validate_tc(tc) {
                Ok(()) => {}
                Err(e @ ValidationError::InvalidTc { .. }) => {
                    return Err(
                        ValidationError::invalid_timeout(timeout.signer_id, view, "invalid last view TC").with_source(e),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(signer)
    }
}
