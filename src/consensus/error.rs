// Consensus errors shared across components
//
// Each component distinguishes its failure kinds by variant; callers match
// on the variant to decide between discard, fetch and abort.

use crate::types::{Identifier, NodeId, View};

/// Boxed underlying cause carried by error variants
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Committee lookups
#[derive(Debug, thiserror::Error)]
pub enum CommitteeError {
    #[error("unknown block {0}")]
    UnknownBlock(Identifier),

    #[error("node {node_id} is not an authorized participant ({context})")]
    InvalidSigner { node_id: NodeId, context: String },

    #[error("epoch for view {view} is not set up")]
    EpochNotSetup { view: View },

    #[error("view {view} precedes the earliest retained epoch (first view {first_view})")]
    ViewOutOfRange { view: View, first_view: View },

    #[error("invalid epoch setup: {0}")]
    InvalidEpoch(String),
}

impl CommitteeError {
    pub fn is_invalid_signer(&self) -> bool {
        matches!(self, CommitteeError::InvalidSigner { .. })
    }
}

/// Signer set codec
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("unknown or duplicate signer: {0}")]
    UnknownOrDuplicateSigner(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid signer indices: {0}")]
    InvalidSignerIndices(String),
}

/// Signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Input cannot be parsed (attributable to the sender)
    #[error("malformed signature data: {0}")]
    InvalidFormat(String),

    /// Well-formed but cryptographically invalid (attributable to the sender)
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Local fault, not attributable to the sender
    #[error("internal verification failure: {0}")]
    Internal(String),
}

/// Validation of proposals, votes, QCs, timeouts and TCs
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid block {block_id} at view {view}: {reason}")]
    InvalidBlock {
        block_id: Identifier,
        view: View,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("invalid vote {vote_id} from {signer_id} at view {view}: {reason}")]
    InvalidVote {
        vote_id: Identifier,
        signer_id: NodeId,
        view: View,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("invalid timeout from {signer_id} at view {view}: {reason}")]
    InvalidTimeout {
        signer_id: NodeId,
        view: View,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("invalid timeout certificate at view {view}: {reason}")]
    InvalidTc {
        view: View,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Ancestor not known locally; fetch it
    #[error("missing block {block_id} at view {view}")]
    MissingBlock { block_id: Identifier, view: View },

    /// Extends a fork abandoned below the finalized view
    #[error("block {block_id} at view {view} extends a pruned fork")]
    UnverifiableBlock { block_id: Identifier, view: View },

    /// Local fault or inconsistent caller input
    #[error("unexpected validation failure: {reason}")]
    Unexpected {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl ValidationError {
    pub fn invalid_block(block_id: Identifier, view: View, reason: impl Into<String>) -> Self {
        ValidationError::InvalidBlock {
            block_id,
            view,
            reason: reason.into(),
            source: None,
        }
    }

    pub fn invalid_tc(view: View, reason: impl Into<String>) -> Self {
        ValidationError::InvalidTc {
            view,
            reason: reason.into(),
            source: None,
        }
    }

    pub fn invalid_timeout(signer_id: NodeId, view: View, reason: impl Into<String>) -> Self {
        ValidationError::InvalidTimeout {
            signer_id,
            view,
            reason: reason.into(),
            source: None,
        }
    }

    pub fn unexpected(reason: impl Into<String>, source: Option<BoxError>) -> Self {
        ValidationError::Unexpected {
            reason: reason.into(),
            source,
        }
    }

    /// Attach an underlying cause
    pub fn with_source(mut self, cause: impl Into<BoxError>) -> Self {
        match &mut self {
            ValidationError::InvalidBlock { source, .. }
            | ValidationError::InvalidVote { source, .. }
            | ValidationError::InvalidTimeout { source, .. }
            | ValidationError::InvalidTc { source, .. }
            | ValidationError::Unexpected { source, .. } => *source = Some(cause.into()),
            ValidationError::MissingBlock { .. } | ValidationError::UnverifiableBlock { .. } => {}
        }
        self
    }

    /// Protocol-invalid input from a peer: log and discard
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            ValidationError::InvalidBlock { .. }
                | ValidationError::InvalidVote { .. }
                | ValidationError::InvalidTimeout { .. }
                | ValidationError::InvalidTc { .. }
        )
    }

    pub fn is_unexpected(&self) -> bool {
        matches!(self, ValidationError::Unexpected { .. })
    }
}
