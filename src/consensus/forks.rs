// Forks - Tracks certified blocks above the finalized block
//
// Finalization follows the two-chain rule: a block B is final once its
// direct child C with C.view == B.view + 1 is certified, i.e. once some
// block carrying a QC for C has been added.

use super::notifications::Consumer;
use crate::types::{Block, Identifier, View};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Read access to the fork-tracking structure
pub trait ForksReader: Send + Sync {
    /// A block above (or at) the finalized view
    fn get_block(&self, block_id: &Identifier) -> Option<Block>;

    fn finalized_view(&self) -> View;

    fn finalized_block(&self) -> Block;
}

/// Persistent chain state the consensus core hands its results to
pub trait Finalizer: Send + Sync {
    /// Make a block a valid extension of the chain state
    fn extend(&self, block: &Block) -> Result<(), ChainStateError>;

    /// Mark a previously extended block as final
    fn finalize(&self, block_id: &Identifier) -> Result<(), ChainStateError>;
}

/// Chain state failures
#[derive(Debug, thiserror::Error)]
pub enum ChainStateError {
    /// The block is not a valid extension (protocol-invalid)
    #[error("invalid extension by block {block_id}: {reason}")]
    InvalidExtension { block_id: Identifier, reason: String },

    /// The block extends a fork that is already abandoned
    #[error("block {block_id} extends an outdated fork")]
    OutdatedExtension { block_id: Identifier },

    #[error("unknown block {0}")]
    UnknownBlock(Identifier),

    /// Storage or other environment failure
    #[error("chain state failure: {0}")]
    Fatal(String),
}

/// Fork-tracking errors
#[derive(Debug, thiserror::Error)]
pub enum ForksError {
    #[error("invalid block {block_id}: {reason}")]
    InvalidBlock { block_id: Identifier, reason: String },

    #[error("block {block_id} references unknown parent {parent_id}")]
    MissingParent { block_id: Identifier, parent_id: Identifier },

    /// Two conflicting blocks would both be final
    #[error("byzantine threshold exceeded: {0}")]
    ByzantineThresholdExceeded(String),

    #[error("finalizer failed: {0}")]
    Finalizer(#[from] ChainStateError),
}

struct ForksState {
    blocks: HashMap<Identifier, Block>,
    by_view: BTreeMap<View, Vec<Identifier>>,
    finalized: Block,
}

/// In-memory fork tree rooted at the latest finalized block
pub struct Forks {
    state: RwLock<ForksState>,
    finalizer: Arc<dyn Finalizer>,
    consumer: Arc<dyn Consumer>,
}

impl Forks {
    /// Start from a trusted root (its own QC is not needed)
    pub fn new(trusted_root: Block, finalizer: Arc<dyn Finalizer>, consumer: Arc<dyn Consumer>) -> Self {
        info!(
            "🌳 Forks initialized at trusted root {} (view {}, height {})",
            trusted_root.block_id, trusted_root.view, trusted_root.height
        );
        let mut blocks = HashMap::new();
        let mut by_view = BTreeMap::new();
        by_view.insert(trusted_root.view, vec![trusted_root.block_id]);
        blocks.insert(trusted_root.block_id, trusted_root.clone());

        Self {
            state: RwLock::new(ForksState {
                blocks,
                by_view,
                finalized: trusted_root,
            }),
            finalizer,
            consumer,
        }
    }

    /// Add a validated block
    ///
    /// Blocks at or below the finalized view are ignored. Adding a block
    /// certifies its parent, which may finalize the grandparent.
    pub fn add_proposal(&self, block: &Block) -> Result<(), ForksError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        if block.view <= state.finalized.view {
            debug!(
                "Forks: ignoring block {} at view {} (finalized view {})",
                block.block_id, block.view, state.finalized.view
            );
            return Ok(());
        }
        if state.blocks.contains_key(&block.block_id) {
            return Ok(());
        }

        let qc = block.qc.as_ref().ok_or_else(|| ForksError::InvalidBlock {
            block_id: block.block_id,
            reason: "non-root block without QC".to_string(),
        })?;
        let parent = state
            .blocks
            .get(&qc.block_id)
            .cloned()
            .ok_or(ForksError::MissingParent {
                block_id: block.block_id,
                parent_id: qc.block_id,
            })?;

        if block.parent_id != qc.block_id || qc.view != parent.view || block.view <= qc.view {
            return Err(ForksError::InvalidBlock {
                block_id: block.block_id,
                reason: format!(
                    "inconsistent parent linkage (parent {} view {}, qc view {}, block view {})",
                    block.parent_id, parent.view, qc.view, block.view
                ),
            });
        }

        if let Some(existing) = state
            .by_view
            .get(&block.view)
            .and_then(|ids| ids.first())
            .and_then(|id| state.blocks.get(id))
        {
            warn!(
                "🚨 Double proposal at view {}: {} and {}",
                block.view, existing.block_id, block.block_id
            );
            self.consumer.on_double_propose_detected(existing, block);
        }

        state.blocks.insert(block.block_id, block.clone());
        state.by_view.entry(block.view).or_default().push(block.block_id);
        self.consumer.on_block_incorporated(block);
        debug!("Forks: incorporated block {} at view {}", block.block_id, block.view);

        self.check_two_chain(&mut state, &parent)
    }

    /// `certified` just received a QC; finalize its parent if consecutive
    fn check_two_chain(&self, state: &mut ForksState, certified: &Block) -> Result<(), ForksError> {
        let Some(qc) = certified.qc.as_ref() else {
            return Ok(());
        };
        let Some(candidate) = state.blocks.get(&qc.block_id).cloned() else {
            return Ok(());
        };
        if candidate.view + 1 != certified.view || candidate.view <= state.finalized.view {
            return Ok(());
        }

        // collect the not-yet-final ancestors, newest first
        let mut chain = vec![candidate.clone()];
        let mut cursor = candidate.clone();
        while cursor.view > state.finalized.view {
            let parent_id = cursor.parent_id;
            let Some(parent) = state.blocks.get(&parent_id).cloned() else {
                return Err(ForksError::ByzantineThresholdExceeded(format!(
                    "ancestor {} of {} missing above finalized view {}",
                    parent_id, candidate.block_id, state.finalized.view
                )));
            };
            if parent.view <= state.finalized.view {
                if parent.block_id != state.finalized.block_id {
                    error!(
                        "💥 Conflicting finalization: {} does not descend from finalized {}",
                        candidate.block_id, state.finalized.block_id
                    );
                    return Err(ForksError::ByzantineThresholdExceeded(format!(
                        "block {} conflicts with finalized block {}",
                        candidate.block_id, state.finalized.block_id
                    )));
                }
                break;
            }
            chain.push(parent.clone());
            cursor = parent;
        }

        for block in chain.iter().rev() {
            self.finalizer.finalize(&block.block_id)?;
            info!("✅ FINALIZED: block {} at view {} (height {})", block.block_id, block.view, block.height);
            self.consumer.on_finalized_block(block);
        }

        state.finalized = candidate;
        Self::prune(state);
        Ok(())
    }

    /// Drop everything below the finalized view
    fn prune(state: &mut ForksState) {
        let finalized_view = state.finalized.view;
        let retained = state.by_view.split_off(&finalized_view);
        for ids in state.by_view.values() {
            for id in ids {
                state.blocks.remove(id);
            }
        }
        state.by_view = retained;
    }

    /// Number of tracked blocks (finalized root included)
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ForksReader for Forks {
    fn get_block(&self, block_id: &Identifier) -> Option<Block> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .blocks
            .get(block_id)
            .cloned()
    }

    fn finalized_view(&self) -> View {
        self.state.read().unwrap_or_else(|e| e.into_inner()).finalized.view
    }

    fn finalized_block(&self) -> Block {
        self.state.read().unwrap_or_else(|e| e.into_inner()).finalized.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::notifications::NoopConsumer;
    use crate::types::QuorumCertificate;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingFinalizer {
        finalized: Mutex<Vec<Identifier>>,
    }

    impl Finalizer for RecordingFinalizer {
        fn extend(&self, _block: &Block) -> Result<(), ChainStateError> {
            Ok(())
        }

        fn finalize(&self, block_id: &Identifier) -> Result<(), ChainStateError> {
            self.finalized.lock().unwrap().push(*block_id);
            Ok(())
        }
    }

    fn child(parent: &Block, view: View, salt: u8) -> Block {
        let qc = QuorumCertificate {
            block_id: parent.block_id,
            view: parent.view,
            signer_indices: vec![],
            sig_data: vec![],
        };
        Block::new(
            view,
            parent.height + 1,
            parent.block_id,
            Identifier::ZERO,
            Some(qc),
            Identifier::hash(&[salt]),
            0,
        )
    }

    fn forks() -> (Forks, Arc<RecordingFinalizer>, Block) {
        let root = Block::genesis(0);
        let finalizer = Arc::new(RecordingFinalizer::default());
        let forks = Forks::new(root.clone(), finalizer.clone(), Arc::new(NoopConsumer));
        (forks, finalizer, root)
    }

    #[test]
    fn test_two_chain_finalizes_grandparent() {
        let (forks, finalizer, root) = forks();
        let b1 = child(&root, 1, 1);
        let b2 = child(&b1, 2, 2);
        let b3 = child(&b2, 3, 3);

        forks.add_proposal(&b1).unwrap();
        forks.add_proposal(&b2).unwrap();
        assert_eq!(forks.finalized_view(), 0);

        // b3 certifies b2, whose QC certifies b1 at the previous view
        forks.add_proposal(&b3).unwrap();
        assert_eq!(forks.finalized_block().block_id, b1.block_id);
        assert_eq!(*finalizer.finalized.lock().unwrap(), vec![b1.block_id]);
    }

    #[test]
    fn test_view_gap_delays_finality() {
        let (forks, finalizer, root) = forks();
        let b1 = child(&root, 1, 1);
        let b3 = child(&b1, 3, 3);
        let b4 = child(&b3, 4, 4);
        let b5 = child(&b4, 5, 5);

        forks.add_proposal(&b1).unwrap();
        forks.add_proposal(&b3).unwrap();
        forks.add_proposal(&b4).unwrap();
        assert_eq!(forks.finalized_view(), 0);

        forks.add_proposal(&b5).unwrap();
        assert_eq!(forks.finalized_view(), 3);
        // b1 is finalized together with b3, oldest first
        assert_eq!(*finalizer.finalized.lock().unwrap(), vec![b1.block_id, b3.block_id]);
        assert!(forks.get_block(&root.block_id).is_none());
    }

    #[test]
    fn test_missing_parent() {
        let (forks, _, root) = forks();
        let b1 = child(&root, 1, 1);
        let b2 = child(&b1, 2, 2);
        assert!(matches!(forks.add_proposal(&b2), Err(ForksError::MissingParent { .. })));
    }

    #[test]
    fn test_stale_block_ignored() {
        let (forks, _, root) = forks();
        let b1 = child(&root, 1, 1);
        let b2 = child(&b1, 2, 2);
        let b3 = child(&b2, 3, 3);
        for b in [&b1, &b2, &b3] {
            forks.add_proposal(b).unwrap();
        }
        let stale = child(&root, 1, 9);
        assert!(forks.add_proposal(&stale).is_ok());
        assert!(forks.get_block(&stale.block_id).is_none());
    }
}
