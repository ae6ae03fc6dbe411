// Block - Block headers, proposals, votes and certificates
use super::primitives::{Height, Identifier, NodeId, Timestamp, View};
use serde::{Deserialize, Serialize};

/// Proof that a weighted quorum voted for a block at a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    /// Certified block
    pub block_id: Identifier,

    /// View of the certified block
    pub view: View,

    /// Bitmap of signers over the committee at `block_id`
    pub signer_indices: Vec<u8>,

    /// Packed signature data
    pub sig_data: Vec<u8>,
}

/// Proof that a weighted quorum timed out in a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCertificate {
    pub view: View,

    /// Newest QC view reported by each signer, in signer order
    pub newest_qc_views: Vec<View>,

    /// Highest QC among the contributing timeouts
    pub newest_qc: QuorumCertificate,

    /// Bitmap of signers over the committee of the view's epoch
    pub signer_indices: Vec<u8>,

    /// Concatenated staking signatures, in signer order
    pub sig_data: Vec<u8>,
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Content hash over every other field
    pub block_id: Identifier,

    pub view: View,

    pub height: Height,

    pub parent_id: Identifier,

    pub proposer_id: NodeId,

    /// Certificate for the parent, absent on the root block
    pub qc: Option<QuorumCertificate>,

    pub payload_hash: Identifier,

    pub timestamp: Timestamp,
}

impl Block {
    /// Create a block and compute its ID
    pub fn new(
        view: View,
        height: Height,
        parent_id: Identifier,
        proposer_id: NodeId,
        qc: Option<QuorumCertificate>,
        payload_hash: Identifier,
        timestamp: Timestamp,
    ) -> Self {
        let mut block = Self {
            block_id: Identifier::ZERO,
            view,
            height,
            parent_id,
            proposer_id,
            qc,
            payload_hash,
            timestamp,
        };
        block.block_id = block.compute_id();
        block
    }

    /// Root block of a chain
    pub fn genesis(timestamp: Timestamp) -> Self {
        Self::new(
            0,
            0,
            Identifier::ZERO,
            Identifier::ZERO,
            None,
            Identifier::hash(b"genesis"),
            timestamp,
        )
    }

    /// Hash over all header fields except the ID itself
    pub fn compute_id(&self) -> Identifier {
        let header = (
            self.view,
            self.height,
            &self.parent_id,
            &self.proposer_id,
            &self.qc,
            &self.payload_hash,
            self.timestamp,
        );
        // plain fixed-layout fields; serializing into a Vec cannot fail
        let bytes = bincode::serialize(&header).unwrap_or_default();
        Identifier::hash(&bytes)
    }

    /// Recompute the ID after mutating fields
    pub fn seal(&mut self) {
        self.block_id = self.compute_id();
    }

    /// ID matches content
    pub fn is_sealed(&self) -> bool {
        self.block_id == self.compute_id()
    }
}

/// A block together with its proposer's vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub block: Block,

    /// Proposer's vote signature over the block
    pub sig_data: Vec<u8>,

    /// Present when the previous view ended in a timeout
    pub last_view_tc: Option<TimeoutCertificate>,
}

impl Proposal {
    /// The proposer's signature viewed as a vote for its own block
    pub fn proposer_vote(&self) -> Vote {
        Vote {
            view: self.block.view,
            block_id: self.block.block_id,
            signer_id: self.block.proposer_id,
            sig_data: self.sig_data.clone(),
        }
    }
}

/// A replica's vote for a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub view: View,
    pub block_id: Identifier,
    pub signer_id: NodeId,
    pub sig_data: Vec<u8>,
}

impl Vote {
    /// Unique identifier for this vote
    pub fn id(&self) -> Identifier {
        let mut data = Vec::with_capacity(72 + self.sig_data.len());
        data.extend_from_slice(&self.view.to_be_bytes());
        data.extend_from_slice(self.block_id.as_bytes());
        data.extend_from_slice(self.signer_id.as_bytes());
        data.extend_from_slice(&self.sig_data);
        Identifier::hash(&data)
    }
}

/// A replica's statement that it gave up on a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutObject {
    pub view: View,

    /// Highest QC known to the signer
    pub newest_qc: QuorumCertificate,

    /// Required unless `newest_qc` is from the previous view
    pub last_view_tc: Option<TimeoutCertificate>,

    pub signer_id: NodeId,

    /// Staking signature over `view || newest_qc.view`
    pub sig_data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_covers_fields() {
        let a = Block::new(1, 1, Identifier::ZERO, Identifier::ZERO, None, Identifier::ZERO, 10);
        let b = Block::new(2, 1, Identifier::ZERO, Identifier::ZERO, None, Identifier::ZERO, 10);
        assert_ne!(a.block_id, b.block_id);
        assert!(a.is_sealed());

        let qc = QuorumCertificate {
            block_id: a.block_id,
            view: 1,
            signer_indices: vec![0b1110_0000],
            sig_data: vec![7; 4],
        };
        let with_qc = Block::new(2, 1, Identifier::ZERO, Identifier::ZERO, Some(qc.clone()), Identifier::ZERO, 10);
        let mut other_sigs = qc;
        other_sigs.sig_data = vec![8; 4];
        let with_other_qc = Block::new(2, 1, Identifier::ZERO, Identifier::ZERO, Some(other_sigs), Identifier::ZERO, 10);
        assert_ne!(with_qc.block_id, with_other_qc.block_id);
        assert_ne!(with_qc.block_id, b.block_id);
    }

    #[test]
    fn test_seal_after_mutation() {
        let mut block = Block::genesis(0);
        block.timestamp = 99;
        assert!(!block.is_sealed());
        block.seal();
        assert!(block.is_sealed());
    }

    #[test]
    fn test_proposer_vote() {
        let block = Block::new(3, 2, Identifier::ZERO, Identifier::hash(b"p"), None, Identifier::ZERO, 0);
        let proposal = Proposal {
            block: block.clone(),
            sig_data: vec![1, 2, 3],
            last_view_tc: None,
        };
        let vote = proposal.proposer_vote();
        assert_eq!(vote.view, 3);
        assert_eq!(vote.block_id, block.block_id);
        assert_eq!(vote.signer_id, block.proposer_id);
    }
}
