// Signer - Produces this node's votes, proposals and timeouts
use crate::types::{
    timeout_message, vote_message, Block, Identity, NodeId, Proposal, PublicKey, QuorumCertificate, Role,
    SigType, Signature64, TimeoutCertificate, TimeoutObject, View, Vote, VoteSignature, Weight,
};
use ed25519_dalek::{Signer as _, SigningKey};

/// Trait for signing consensus messages (implemented by the key holder)
pub trait Signer: Send + Sync {
    /// Node ID of the key holder
    fn node_id(&self) -> NodeId;

    /// Vote for a block
    fn create_vote(&self, block: &Block) -> Vote;

    /// Wrap a block built by this node into a signed proposal
    fn create_proposal(&self, block: Block, last_view_tc: Option<TimeoutCertificate>) -> Proposal;

    /// Timeout for a view
    fn create_timeout(
        &self,
        view: View,
        newest_qc: QuorumCertificate,
        last_view_tc: Option<TimeoutCertificate>,
    ) -> TimeoutObject;
}

/// In-memory ed25519 key holder
///
/// Nodes holding a beacon key sign votes as beacon signers, the others with
/// their staking key. Timeouts are always signed with the staking key.
pub struct LocalSigner {
    node_id: NodeId,
    staking_key: SigningKey,
    beacon_key: Option<SigningKey>,
}

impl LocalSigner {
    pub fn new(staking_key: SigningKey, beacon_key: Option<SigningKey>) -> Self {
        Self {
            node_id: PublicKey::from_signing_key(&staking_key).node_id(),
            staking_key,
            beacon_key,
        }
    }

    /// Random keys from the OS generator
    pub fn generate(with_beacon: bool) -> Self {
        let mut rng = rand::rngs::OsRng;
        let staking_key = SigningKey::generate(&mut rng);
        let beacon_key = with_beacon.then(|| SigningKey::generate(&mut rng));
        Self::new(staking_key, beacon_key)
    }

    /// Committee entry matching these keys
    pub fn identity(&self, role: Role, weight: Weight) -> Identity {
        Identity::new(
            role,
            weight,
            PublicKey::from_signing_key(&self.staking_key),
            self.beacon_key.as_ref().map(PublicKey::from_signing_key),
        )
    }

    fn vote_sig_data(&self, view: View, block: &Block) -> Vec<u8> {
        let (sig_type, key) = match &self.beacon_key {
            Some(beacon) => (SigType::Beacon, beacon),
            None => (SigType::Staking, &self.staking_key),
        };
        let message = vote_message(sig_type, view, &block.block_id);
        VoteSignature {
            sig_type,
            signature: Signature64::from_bytes(key.sign(&message).to_bytes()),
        }
        .encode()
    }
}

impl Signer for LocalSigner {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn create_vote(&self, block: &Block) -> Vote {
        Vote {
            view: block.view,
            block_id: block.block_id,
            signer_id: self.node_id,
            sig_data: self.vote_sig_data(block.view, block),
        }
    }

    fn create_proposal(&self, block: Block, last_view_tc: Option<TimeoutCertificate>) -> Proposal {
        let sig_data = self.vote_sig_data(block.view, &block);
        Proposal {
            block,
            sig_data,
            last_view_tc,
        }
    }

    fn create_timeout(
        &self,
        view: View,
        newest_qc: QuorumCertificate,
        last_view_tc: Option<TimeoutCertificate>,
    ) -> TimeoutObject {
        let message = timeout_message(view, newest_qc.view);
        let signature = self.staking_key.sign(&message);
        TimeoutObject {
            view,
            newest_qc,
            last_view_tc,
            signer_id: self.node_id,
            sig_data: signature.to_bytes().to_vec(),
        }
    }
}
