// Chain - In-memory chain state for the round-robin loop
//
// Holds every extended block and the finalized head. Extended blocks are
// registered with the committee so the by-block read path can answer for them.

use crate::consensus::coldstuff::{Builder, BuilderError, ProtocolState};
use crate::consensus::committee::StaticCommittee;
use crate::consensus::forks::{ChainStateError, Finalizer};
use crate::types::{now_millis, Block, Height, Identifier, Identity, IdentityList, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

struct ChainInner {
    blocks: HashMap<Identifier, Block>,
    finalized: Block,
}

/// Chain state, block builder and finalizer of one node
pub struct InMemoryChain {
    inner: RwLock<ChainInner>,

    /// All known identities, any role
    identities: IdentityList,

    committee: Arc<StaticCommittee>,
}

impl InMemoryChain {
    pub fn new(genesis: Block, identities: IdentityList, committee: Arc<StaticCommittee>) -> Self {
        committee.register_block(genesis.block_id, genesis.view);
        let mut blocks = HashMap::new();
        blocks.insert(genesis.block_id, genesis.clone());
        Self {
            inner: RwLock::new(ChainInner {
                blocks,
                finalized: genesis,
            }),
            identities,
            committee,
        }
    }

    pub fn finalized_block(&self) -> Block {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).finalized.clone()
    }

    pub fn height(&self) -> Height {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).finalized.height
    }

    pub fn get_block(&self, block_id: &Identifier) -> Option<Block> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .blocks
            .get(block_id)
            .cloned()
    }
}

impl ProtocolState for InMemoryChain {
    fn finalized(&self) -> Result<Block, ChainStateError> {
        Ok(self.finalized_block())
    }

    fn identity(&self, node_id: &NodeId) -> Result<Option<Identity>, ChainStateError> {
        Ok(self.identities.by_node_id(node_id).cloned())
    }
}

impl Builder for InMemoryChain {
    fn build_on(&self, parent_id: &Identifier, setter: &mut dyn FnMut(&mut Block)) -> Result<Block, BuilderError> {
        let parent = self.get_block(parent_id).ok_or(BuilderError::UnknownParent(*parent_id))?;
        let height = parent.height + 1;
        let timestamp = now_millis().max(parent.timestamp + 1);

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&height.to_be_bytes());
        payload.extend_from_slice(&timestamp.to_be_bytes());

        // views follow heights in the round-robin protocol
        let mut block = Block::new(
            height,
            height,
            parent.block_id,
            Identifier::ZERO,
            None,
            Identifier::hash(&payload),
            timestamp,
        );
        setter(&mut block);
        block.seal();
        debug!("Chain: built block {} at height {}", block.block_id, block.height);
        Ok(block)
    }
}

impl Finalizer for InMemoryChain {
    fn extend(&self, block: &Block) -> Result<(), ChainStateError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.blocks.contains_key(&block.block_id) {
            return Ok(());
        }
        if block.height <= inner.finalized.height {
            return Err(ChainStateError::OutdatedExtension {
                block_id: block.block_id,
            });
        }
        let parent = inner
            .blocks
            .get(&block.parent_id)
            .ok_or_else(|| ChainStateError::InvalidExtension {
                block_id: block.block_id,
                reason: format!("unknown parent {}", block.parent_id),
            })?;
        if parent.height + 1 != block.height {
            return Err(ChainStateError::InvalidExtension {
                block_id: block.block_id,
                reason: format!("height {} does not follow parent height {}", block.height, parent.height),
            });
        }
        if !block.is_sealed() {
            return Err(ChainStateError::InvalidExtension {
                block_id: block.block_id,
                reason: "block ID does not match content".to_string(),
            });
        }

        inner.blocks.insert(block.block_id, block.clone());
        self.committee.register_block(block.block_id, block.view);
        Ok(())
    }

    fn finalize(&self, block_id: &Identifier) -> Result<(), ChainStateError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let block = inner
            .blocks
            .get(block_id)
            .cloned()
            .ok_or(ChainStateError::UnknownBlock(*block_id))?;

        if block.height <= inner.finalized.height {
            return if block.block_id == inner.finalized.block_id {
                Ok(())
            } else {
                Err(ChainStateError::OutdatedExtension { block_id: *block_id })
            };
        }
        if block.parent_id != inner.finalized.block_id {
            return Err(ChainStateError::Fatal(format!(
                "block {} does not extend finalized block {}",
                block_id, inner.finalized.block_id
            )));
        }

        info!("⛓️  Chain finalized height {} ({})", block.height, block.block_id);
        let finalized_height = block.height;
        inner.finalized = block;
        inner.blocks.retain(|_, b| b.height >= finalized_height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::committee::EpochSetup;
    use crate::types::{PublicKey, Role};

    fn chain() -> InMemoryChain {
        let members: Vec<Identity> = (1..=3)
            .map(|i| Identity::new(Role::Consensus, 1, PublicKey::from_bytes([i; 32]), None))
            .collect();
        let epoch = EpochSetup::new(0, 0, u64::MAX, members.clone(), [0u8; 32]).unwrap();
        let committee = Arc::new(StaticCommittee::new(members[0].node_id, epoch));
        InMemoryChain::new(Block::genesis(0), IdentityList::canonical(members), committee)
    }

    #[test]
    fn test_build_extend_finalize() {
        let chain = chain();
        let genesis = chain.finalized_block();
        let proposer = Identifier::hash(b"proposer");

        let block = chain
            .build_on(&genesis.block_id, &mut |b: &mut Block| b.proposer_id = proposer)
            .unwrap();
        assert_eq!(block.height, 1);
        assert_eq!(block.proposer_id, proposer);
        assert!(block.is_sealed());

        chain.extend(&block).unwrap();
        chain.finalize(&block.block_id).unwrap();
        assert_eq!(chain.height(), 1);
        assert!(chain.get_block(&genesis.block_id).is_none());
    }

    #[test]
    fn test_outdated_extension() {
        let chain = chain();
        let genesis = chain.finalized_block();
        let a = chain.build_on(&genesis.block_id, &mut |_: &mut Block| {}).unwrap();
        chain.extend(&a).unwrap();
        chain.finalize(&a.block_id).unwrap();

        let mut b = a.clone();
        b.timestamp += 1;
        b.seal();
        assert!(matches!(chain.extend(&b), Err(ChainStateError::OutdatedExtension { .. })));
    }

    #[test]
    fn test_unknown_parent() {
        let chain = chain();
        assert!(matches!(
            chain.build_on(&Identifier::hash(b"x"), &mut |_: &mut Block| {}),
            Err(BuilderError::UnknownParent(_))
        ));
    }
}
