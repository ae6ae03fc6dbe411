// Network - In-process message routing between round-robin nodes
//
// Every delivery runs on its own task, so a full mailbox only delays (and
// eventually drops) that one message, never the sender's loop.

use crate::consensus::coldstuff::{ColdStuffHandle, Commit, Communicator, NetworkError, RoundVote};
use crate::types::{Block, NodeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;
use tracing::trace;

/// Registry of all node mailboxes
#[derive(Clone, Default)]
pub struct LocalHub {
    peers: Arc<RwLock<HashMap<NodeId, ColdStuffHandle>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ColdStuffHandle) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.node_id(), handle);
    }

    fn peer(&self, node_id: &NodeId) -> Option<ColdStuffHandle> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).get(node_id).cloned()
    }

    fn others(&self, node_id: &NodeId) -> Vec<ColdStuffHandle> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|h| h.node_id() != *node_id)
            .cloned()
            .collect()
    }
}

/// Communicator of one node over a shared hub
pub struct LocalNetwork {
    self_id: NodeId,
    hub: LocalHub,
}

impl LocalNetwork {
    pub fn new(self_id: NodeId, hub: LocalHub) -> Self {
        Self { self_id, hub }
    }

    fn deliver<F>(&self, delivery: F) -> Result<(), NetworkError>
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| NetworkError::NoRuntime)?;
        runtime.spawn(delivery);
        Ok(())
    }
}

impl Communicator for LocalNetwork {
    fn broadcast_proposal(&self, proposal: &Block) -> Result<(), NetworkError> {
        for peer in self.hub.others(&self.self_id) {
            trace!("Network: proposal {} -> {}", proposal.block_id, peer.node_id());
            let proposal = proposal.clone();
            self.deliver(async move { peer.submit_proposal(proposal).await })?;
        }
        Ok(())
    }

    fn broadcast_commit(&self, commit: &Commit) -> Result<(), NetworkError> {
        for peer in self.hub.others(&self.self_id) {
            trace!("Network: commit {} -> {}", commit.block_id, peer.node_id());
            let commit = commit.clone();
            self.deliver(async move { peer.submit_commit(commit).await })?;
        }
        Ok(())
    }

    fn send_vote(&self, vote: &RoundVote, to: &NodeId) -> Result<(), NetworkError> {
        let peer = self.hub.peer(to).ok_or(NetworkError::UnknownPeer(*to))?;
        trace!("Network: vote {} -> {}", vote.block_id, to);
        let vote = vote.clone();
        self.deliver(async move { peer.submit_vote(vote).await })
    }
}
