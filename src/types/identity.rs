// Identity - Committee members and ordered member lists
use super::keys::PublicKey;
use super::primitives::{NodeId, Weight};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Role a node plays in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Proposes and votes on blocks
    Consensus,
    Collection,
    Execution,
    Verification,
    Access,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Consensus => "consensus",
            Role::Collection => "collection",
            Role::Execution => "execution",
            Role::Verification => "verification",
            Role::Access => "access",
        };
        write!(f, "{}", name)
    }
}

/// A committee member as of a specific block
///
/// Never mutated in place: a changed member (e.g. ejected) is a new value
/// returned for a later block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Hash of the staking key
    pub node_id: NodeId,

    pub role: Role,

    /// Voting power
    pub weight: Weight,

    /// Key for staking signatures (votes, timeouts)
    pub staking_key: PublicKey,

    /// Random beacon key, absent for nodes without a beacon share
    pub beacon_key: Option<PublicKey>,

    /// Administratively removed from the committee
    pub ejected: bool,
}

impl Identity {
    pub fn new(role: Role, weight: Weight, staking_key: PublicKey, beacon_key: Option<PublicKey>) -> Self {
        Self {
            node_id: staking_key.node_id(),
            role,
            weight,
            staking_key,
            beacon_key,
            ejected: false,
        }
    }

    /// Copy of this identity with the ejection flag set
    pub fn ejected(&self) -> Self {
        Self {
            ejected: true,
            ..self.clone()
        }
    }

    /// Eligible to vote and propose
    pub fn is_active_consensus(&self) -> bool {
        self.role == Role::Consensus && self.weight > 0 && !self.ejected
    }
}

/// Ordered list of identities
///
/// Canonical order is ascending node ID; signer indices refer to positions
/// in a canonically ordered list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityList(Vec<Identity>);

impl IdentityList {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self(identities)
    }

    /// Sort into canonical order
    pub fn canonical(mut identities: Vec<Identity>) -> Self {
        identities.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Self(identities)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Identity> {
        self.0.get(index)
    }

    pub fn total_weight(&self) -> Weight {
        self.0.iter().map(|id| id.weight).sum()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.0.iter().map(|id| id.node_id).collect()
    }

    pub fn by_node_id(&self, node_id: &NodeId) -> Option<&Identity> {
        self.0.iter().find(|id| &id.node_id == node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.by_node_id(node_id).is_some()
    }

    /// Keep members matching the predicate, preserving order
    pub fn filter<F>(&self, predicate: F) -> IdentityList
    where
        F: Fn(&Identity) -> bool,
    {
        Self(self.0.iter().filter(|id| predicate(id)).cloned().collect())
    }

    /// Members at the given positions, `None` if any position is out of range
    pub fn select(&self, indices: &[usize]) -> Option<IdentityList> {
        indices
            .iter()
            .map(|&i| self.0.get(i).cloned())
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// Whether the same node ID appears more than once
    pub fn has_duplicates(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.0.len());
        !self.0.iter().all(|id| seen.insert(id.node_id))
    }
}

impl From<Vec<Identity>> for IdentityList {
    fn from(identities: Vec<Identity>) -> Self {
        Self(identities)
    }
}

impl IntoIterator for IdentityList {
    type Item = Identity;
    type IntoIter = std::vec::IntoIter<Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
