// Round - State of one round-robin consensus round

use crate::types::{Block, Height, Identity, NodeId};
use std::collections::HashSet;

/// Result of counting one vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyOutcome {
    /// Voter already counted this round
    Duplicate,

    /// Counted, quorum not reached (or reached earlier)
    Counted { votes: u64 },

    /// This vote reached the quorum; reported once per round
    QuorumReached { votes: u64 },
}

/// One round: parent, leader, candidate and the votes for it
#[derive(Debug, Clone)]
pub struct Round {
    parent: Block,
    leader: Identity,
    quorum: u64,
    candidate: Option<Block>,
    voters: HashSet<NodeId>,
    quorum_reached: bool,
}

impl Round {
    pub fn new(parent: Block, leader: Identity, quorum: u64) -> Self {
        Self {
            parent,
            leader,
            quorum,
            candidate: None,
            voters: HashSet::new(),
            quorum_reached: false,
        }
    }

    pub fn parent(&self) -> &Block {
        &self.parent
    }

    /// Height of the block this round decides
    pub fn height(&self) -> Height {
        self.parent.height + 1
    }

    pub fn leader(&self) -> &Identity {
        &self.leader
    }

    pub fn quorum(&self) -> u64 {
        self.quorum
    }

    pub fn candidate(&self) -> Option<&Block> {
        self.candidate.as_ref()
    }

    /// Cache the round's candidate
    pub fn propose(&mut self, candidate: Block) {
        self.candidate = Some(candidate);
    }

    pub fn voted(&self, voter: &NodeId) -> bool {
        self.voters.contains(voter)
    }

    pub fn votes(&self) -> u64 {
        self.voters.len() as u64
    }

    pub fn quorum_reached(&self) -> bool {
        self.quorum_reached
    }

    /// Count a vote; every voter counts once
    pub fn tally(&mut self, voter: NodeId) -> TallyOutcome {
        if !self.voters.insert(voter) {
            return TallyOutcome::Duplicate;
        }
        let votes = self.votes();
        if !self.quorum_reached && votes >= self.quorum {
            self.quorum_reached = true;
            return TallyOutcome::QuorumReached { votes };
        }
        TallyOutcome::Counted { votes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Identifier, PublicKey, Role};

    fn round(quorum: u64) -> Round {
        let leader = Identity::new(Role::Consensus, 1, PublicKey::from_bytes([1; 32]), None);
        Round::new(Block::genesis(0), leader, quorum)
    }

    #[test]
    fn test_quorum_reached_once() {
        let mut r = round(2);
        let a = Identifier::hash(b"a");
        let b = Identifier::hash(b"b");
        let c = Identifier::hash(b"c");

        assert_eq!(r.tally(a), TallyOutcome::Counted { votes: 1 });
        assert_eq!(r.tally(a), TallyOutcome::Duplicate);
        assert_eq!(r.tally(b), TallyOutcome::QuorumReached { votes: 2 });
        assert_eq!(r.tally(c), TallyOutcome::Counted { votes: 3 });
        assert!(r.quorum_reached());
    }

    #[test]
    fn test_height_follows_parent() {
        let mut r = round(1);
        assert_eq!(r.height(), 1);
        assert!(r.candidate().is_none());
        r.propose(Block::genesis(5));
        assert!(r.candidate().is_some());
    }
}
