// Safety - Voting rules that keep this node from equivocating
//
// The safety data is persisted before any vote or timeout leaves this module,
// so a restarted node never signs twice for the same view.

use super::committee::Committee;
use super::error::CommitteeError;
use super::signer::Signer;
use crate::types::{Block, Proposal, QuorumCertificate, TimeoutCertificate, TimeoutObject, View, Vote};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Durable safety state of this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyData {
    /// Highest QC view a voted-for block extended
    pub locked_one_chain_view: View,

    /// Highest view this node voted or timed out in
    pub highest_acknowledged_view: View,

    /// Last timeout produced, repeated on re-request for the same view
    pub last_timeout: Option<TimeoutObject>,

    /// Block last acknowledged by the round-robin loop
    pub acknowledged_block: Option<Block>,
}

/// Persistence failures
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// Durable storage for the safety data
pub trait Persister: Send + Sync {
    /// Stored data, or the default on first start
    fn get_safety_data(&self) -> Result<SafetyData, PersistError>;

    fn put_safety_data(&self, data: &SafetyData) -> Result<(), PersistError>;
}

/// Persister for tests and throwaway nodes
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    data: RwLock<SafetyData>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for InMemoryPersister {
    fn get_safety_data(&self) -> Result<SafetyData, PersistError> {
        Ok(self.data.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn put_safety_data(&self, data: &SafetyData) -> Result<(), PersistError> {
        *self.data.write().unwrap_or_else(|e| e.into_inner()) = data.clone();
        Ok(())
    }
}

/// Safety rule failures
#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    /// Voting would be unsafe or pointless; not a fault
    #[error("not voting for block at view {view}: {reason}")]
    NoVote { view: View, reason: String },

    #[error("not timing out view {view}: {reason}")]
    NoTimeout { view: View, reason: String },

    #[error("committee lookup failed: {0}")]
    Committee(#[from] CommitteeError),

    /// Safety data could not be stored; the node must stop signing
    #[error("could not persist safety data: {0}")]
    Persist(#[from] PersistError),
}

impl SafetyError {
    pub fn is_no_vote(&self) -> bool {
        matches!(self, SafetyError::NoVote { .. } | SafetyError::NoTimeout { .. })
    }
}

/// Decides whether this node may vote or time out, and signs if so
pub struct SafetyRules {
    signer: Arc<dyn Signer>,
    persister: Arc<dyn Persister>,
    committee: Arc<dyn Committee>,
    data: Mutex<SafetyData>,
}

impl SafetyRules {
    /// Load the persisted safety data
    pub fn new(
        signer: Arc<dyn Signer>,
        persister: Arc<dyn Persister>,
        committee: Arc<dyn Committee>,
    ) -> Result<Self, SafetyError> {
        let data = persister.get_safety_data()?;
        info!(
            "🛡️  Safety rules loaded: locked view {}, highest acknowledged view {}",
            data.locked_one_chain_view, data.highest_acknowledged_view
        );
        Ok(Self {
            signer,
            persister,
            committee,
            data: Mutex::new(data),
        })
    }

    pub fn safety_data(&self) -> SafetyData {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Vote for a validated proposal of the current view
    pub fn produce_vote(&self, proposal: &Proposal, cur_view: View) -> Result<Vote, SafetyError> {
        let block = &proposal.block;
        let no_vote = |reason: String| SafetyError::NoVote {
            view: block.view,
            reason,
        };

        if block.view != cur_view {
            return Err(no_vote(format!("current view is {}", cur_view)));
        }

        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if block.view <= data.highest_acknowledged_view {
            return Err(no_vote(format!(
                "already acknowledged view {}",
                data.highest_acknowledged_view
            )));
        }

        let qc = block.qc.as_ref().ok_or_else(|| no_vote("block has no QC".to_string()))?;
        Self::safe_to_extend(block.view, qc, proposal.last_view_tc.as_ref(), data.locked_one_chain_view)
            .map_err(no_vote)?;

        match self.committee.identity(&block.block_id, &self.signer.node_id()) {
            Ok(_) => {}
            Err(e) if e.is_invalid_signer() => {
                return Err(no_vote("this node is not an authorized voter".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut updated = data.clone();
        updated.locked_one_chain_view = updated.locked_one_chain_view.max(qc.view);
        updated.highest_acknowledged_view = block.view;
        self.persister.put_safety_data(&updated)?;
        *data = updated;

        debug!("Safety: voting for block {} at view {}", block.block_id, block.view);
        Ok(self.signer.create_vote(block))
    }

    /// Timeout for the current view
    ///
    /// A repeated request for the same view returns the stored timeout.
    pub fn produce_timeout(
        &self,
        cur_view: View,
        newest_qc: QuorumCertificate,
        last_view_tc: Option<TimeoutCertificate>,
    ) -> Result<TimeoutObject, SafetyError> {
        let no_timeout = |reason: String| SafetyError::NoTimeout { view: cur_view, reason };

        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = &data.last_timeout {
            if last.view == cur_view {
                return Ok(last.clone());
            }
        }
        if cur_view < data.highest_acknowledged_view {
            return Err(no_timeout(format!(
                "already acknowledged view {}",
                data.highest_acknowledged_view
            )));
        }

        Self::safe_to_extend(cur_view, &newest_qc, last_view_tc.as_ref(), data.locked_one_chain_view)
            .map_err(no_timeout)?;

        match self.committee.identity_by_epoch(cur_view, &self.signer.node_id()) {
            Ok(_) => {}
            Err(e) if e.is_invalid_signer() => {
                return Err(no_timeout("this node is not an authorized signer".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let timeout = self.signer.create_timeout(cur_view, newest_qc, last_view_tc);
        // only votes move the lock
        let mut updated = data.clone();
        updated.highest_acknowledged_view = cur_view;
        updated.last_timeout = Some(timeout.clone());
        self.persister.put_safety_data(&updated)?;
        *data = updated;

        debug!("Safety: timing out view {} (newest QC view {})", cur_view, timeout.newest_qc.view);
        Ok(timeout)
    }

    /// `view` may build on `qc` when the QC is not behind the lock and either
    /// comes from the previous view or is justified by the previous view's TC
    fn safe_to_extend(
        view: View,
        qc: &QuorumCertificate,
        last_view_tc: Option<&TimeoutCertificate>,
        locked_view: View,
    ) -> Result<(), String> {
        if qc.view < locked_view {
            return Err(format!("QC view {} is below locked view {}", qc.view, locked_view));
        }
        if qc.view >= view {
            return Err(format!("QC view {} is not below view {}", qc.view, view));
        }
        if qc.view + 1 == view {
            return Ok(());
        }
        match last_view_tc {
            Some(tc) if tc.view + 1 == view && qc.view >= tc.newest_qc.view => Ok(()),
            Some(tc) => Err(format!("TC for view {} does not justify QC view {}", tc.view, qc.view)),
            None => Err(format!("QC view {} is not the previous view and no TC is given", qc.view)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_persister_roundtrip() {
        let persister = InMemoryPersister::new();
        assert_eq!(persister.get_safety_data().unwrap(), SafetyData::default());

        let data = SafetyData {
            locked_one_chain_view: 3,
            highest_acknowledged_view: 5,
            last_timeout: None,
            acknowledged_block: None,
        };
        persister.put_safety_data(&data).unwrap();
        assert_eq!(persister.get_safety_data().unwrap(), data);
    }

    fn qc(view: View) -> QuorumCertificate {
        QuorumCertificate {
            block_id: crate::types::Identifier::ZERO,
            view,
            signer_indices: vec![],
            sig_data: vec![],
        }
    }

    #[test]
    fn test_safe_to_extend() {
        assert!(SafetyRules::safe_to_extend(5, &qc(4), None, 3).is_ok());
        assert!(SafetyRules::safe_to_extend(5, &qc(2), None, 3).is_err());
        assert!(SafetyRules::safe_to_extend(5, &qc(3), None, 3).is_err());

        let tc = TimeoutCertificate {
            view: 4,
            newest_qc_views: vec![3],
            newest_qc: qc(3),
            signer_indices: vec![],
            sig_data: vec![],
        };
        assert!(SafetyRules::safe_to_extend(5, &qc(3), Some(&tc), 3).is_ok());
        assert!(SafetyRules::safe_to_extend(6, &qc(3), Some(&tc), 3).is_err());
    }
}
