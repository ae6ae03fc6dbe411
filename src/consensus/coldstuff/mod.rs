// ColdStuff - Round-robin reference consensus loop
//
// One round at a time, strictly sequential:
// - leader: build a candidate, broadcast it, collect votes, broadcast commit
// - replica: wait for the leader's proposal, vote, wait for the commit
// After a full round the candidate is extended and finalized; any timeout or
// failure restarts a fresh round from the current finalized block. A node
// acknowledges at most one block per height, and a leader retrying a height
// re-proposes the block it already acknowledged.
//
// The loop owns all round state. Inputs arrive through three mailboxes of
// capacity 1; a producer facing a full mailbox waits briefly, then drops.

pub mod round;

pub use round::{Round, TallyOutcome};

use super::committee::Committee;
use super::config::{DEFAULT_ROUND_INTERVAL_MS, MAILBOX_CAPACITY, MAILBOX_SUBMIT_TIMEOUT_MS};
use super::error::CommitteeError;
use super::forks::{ChainStateError, Finalizer};
use super::metrics::ConsensusMetrics;
use super::pacemaker::{TimeoutConfig, TimeoutController};
use super::safety::{PersistError, Persister};
use super::threshold::quorum_threshold;
use crate::types::{now_millis, Block, Height, Identifier, Identity, NodeId, Role, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ===== MESSAGES =====

/// Replica's approval of the round's candidate, sent to the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundVote {
    pub block_id: Identifier,
    pub voter_id: NodeId,
}

/// Leader's instruction to commit the candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: Identifier,
    pub committer_id: NodeId,
}

// ===== COLLABORATORS =====

/// Read access to the finalized protocol state
pub trait ProtocolState: Send + Sync {
    /// Latest finalized block, parent of the next round
    fn finalized(&self) -> Result<Block, ChainStateError>;

    /// Any known identity, whatever its role or status
    fn identity(&self, node_id: &NodeId) -> Result<Option<Identity>, ChainStateError>;
}

/// Builds candidate blocks
pub trait Builder: Send + Sync {
    /// Build a child of `parent_id`; `setter` fills in header fields before sealing
    fn build_on(&self, parent_id: &Identifier, setter: &mut dyn FnMut(&mut Block)) -> Result<Block, BuilderError>;
}

/// Outbound messaging
pub trait Communicator: Send + Sync {
    fn broadcast_proposal(&self, proposal: &Block) -> Result<(), NetworkError>;

    fn broadcast_commit(&self, commit: &Commit) -> Result<(), NetworkError>;

    fn send_vote(&self, vote: &RoundVote, to: &NodeId) -> Result<(), NetworkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("unknown parent {0}")]
    UnknownParent(Identifier),

    #[error("block building failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("no async runtime to deliver on")]
    NoRuntime,

    #[error("send failed: {0}")]
    SendFailed(String),
}

// ===== ERRORS =====

/// Why a round ended without a commit
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("{0}")]
    TimedOut(&'static str),

    #[error("could not build candidate: {0}")]
    Build(#[from] BuilderError),

    #[error("network failure: {0}")]
    Network(#[from] NetworkError),

    #[error("chain state failure: {0}")]
    ChainState(#[from] ChainStateError),

    #[error("committee failure: {0}")]
    Committee(#[from] CommitteeError),

    #[error("leader {0} is not a known identity")]
    UnknownLeader(NodeId),

    /// Persisted state is ahead of the chain
    #[error("height {height} is below acknowledged height {acknowledged}")]
    Stale { height: Height, acknowledged: Height },

    /// A different block was already acknowledged at this height
    #[error("height {height} already acknowledged for block {acknowledged}, refusing {candidate}")]
    Equivocation {
        height: Height,
        acknowledged: Identifier,
        candidate: Identifier,
    },

    #[error("round has no candidate")]
    NoCandidate,

    /// Cannot record the vote durably; voting must stop
    #[error("could not persist acknowledged height: {0}")]
    Persist(#[from] PersistError),

    #[error("shutdown requested")]
    Shutdown,
}

/// Fatal loop failures
#[derive(Debug, thiserror::Error)]
pub enum ColdStuffError {
    #[error("halting, safety data not persisted: {0}")]
    Persist(#[from] PersistError),
}

// ===== CONFIG =====

#[derive(Debug, Clone, PartialEq)]
pub struct ColdStuffConfig {
    /// Minimum time between the parent's timestamp and the next round
    pub round_interval: Duration,

    /// Timeout for each wait (proposal, votes, commit)
    pub timeouts: TimeoutConfig,
}

impl Default for ColdStuffConfig {
    fn default() -> Self {
        Self {
            round_interval: Duration::from_millis(DEFAULT_ROUND_INTERVAL_MS),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Everything the loop talks to
#[derive(Clone)]
pub struct Collaborators {
    pub state: Arc<dyn ProtocolState>,
    pub committee: Arc<dyn Committee>,
    pub comms: Arc<dyn Communicator>,
    pub builder: Arc<dyn Builder>,
    pub finalizer: Arc<dyn Finalizer>,
    pub persister: Arc<dyn Persister>,
    pub metrics: Arc<ConsensusMetrics>,
}

// ===== HANDLE =====

/// Producer side of the loop's mailboxes
#[derive(Clone)]
pub struct ColdStuffHandle {
    node_id: NodeId,
    proposals: mpsc::Sender<Block>,
    votes: mpsc::Sender<RoundVote>,
    commits: mpsc::Sender<Commit>,
}

impl ColdStuffHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns false if the message was dropped
    pub async fn submit_proposal(&self, proposal: Block) -> bool {
        submit(&self.proposals, proposal, "proposal").await
    }

    pub async fn submit_vote(&self, vote: RoundVote) -> bool {
        submit(&self.votes, vote, "vote").await
    }

    pub async fn submit_commit(&self, commit: Commit) -> bool {
        submit(&self.commits, commit, "commit").await
    }
}

async fn submit<T>(mailbox: &mpsc::Sender<T>, message: T, kind: &str) -> bool {
    match mailbox
        .send_timeout(message, Duration::from_millis(MAILBOX_SUBMIT_TIMEOUT_MS))
        .await
    {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(_)) => {
            debug!("ColdStuff: {} mailbox full, dropping message", kind);
            false
        }
        Err(SendTimeoutError::Closed(_)) => {
            debug!("ColdStuff: {} mailbox closed, dropping message", kind);
            false
        }
    }
}

/// Resolves once shutdown is signalled; never if the signal is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ===== LOOP =====

/// Round-robin consensus loop of one node
pub struct ColdStuff {
    self_id: NodeId,
    deps: Collaborators,
    round_interval: Duration,
    timeouts: TimeoutController,
    proposals: mpsc::Receiver<Block>,
    votes: mpsc::Receiver<RoundVote>,
    commits: mpsc::Receiver<Commit>,
    shutdown: watch::Receiver<bool>,
}

impl ColdStuff {
    pub fn new(
        self_id: NodeId,
        deps: Collaborators,
        config: ColdStuffConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, ColdStuffHandle) {
        let (proposal_tx, proposals) = mpsc::channel(MAILBOX_CAPACITY);
        let (vote_tx, votes) = mpsc::channel(MAILBOX_CAPACITY);
        let (commit_tx, commits) = mpsc::channel(MAILBOX_CAPACITY);

        let handle = ColdStuffHandle {
            node_id: self_id,
            proposals: proposal_tx,
            votes: vote_tx,
            commits: commit_tx,
        };
        let cold = Self {
            self_id,
            deps,
            round_interval: config.round_interval,
            timeouts: TimeoutController::new(config.timeouts),
            proposals,
            votes,
            commits,
            shutdown,
        };
        (cold, handle)
    }

    /// Run rounds until shutdown
    ///
    /// Only a failure to persist the acknowledged height ends the loop with
    /// an error; every other failure restarts the round.
    pub async fn run(mut self) -> Result<(), ColdStuffError> {
        info!("🧊 ColdStuff started for node {}", self.self_id);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.run_round().await {
                Ok(block) => {
                    self.deps.metrics.round_completed();
                    self.timeouts.on_progress();
                    debug!("ColdStuff: round for height {} complete", block.height);
                }
                Err(RoundError::Shutdown) => break,
                Err(RoundError::Persist(e)) => {
                    error!("💥 Could not persist safety data, halting: {}", e);
                    self.deps.metrics.round_failed();
                    return Err(ColdStuffError::Persist(e));
                }
                Err(e @ RoundError::TimedOut(_)) => {
                    warn!("⏰ Round aborted: {}", e);
                    self.deps.metrics.round_timed_out();
                    self.timeouts.on_timeout();
                }
                Err(e) => {
                    warn!("⚠️  Round failed: {}", e);
                    self.deps.metrics.round_failed();
                    if self.sleep(self.round_interval).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!("🛑 ColdStuff stopped for node {}", self.self_id);
        Ok(())
    }

    /// One full round; returns the committed block
    pub(crate) async fn run_round(&mut self) -> Result<Block, RoundError> {
        let mut round = self.new_round()?;
        let limit = round.parent().timestamp.saturating_add(self.round_interval.as_millis() as Timestamp);
        self.wait_until(limit).await?;

        if round.leader().node_id == self.self_id {
            self.send_proposal(&mut round)?;
            self.wait_for_votes(&mut round).await?;
            self.send_commit(&round)?;
        } else {
            self.wait_for_proposal(&mut round, limit).await?;
            self.vote_on_proposal(&round)?;
            self.wait_for_commit(&round).await?;
        }

        self.commit_candidate(&round)
    }

    fn new_round(&self) -> Result<Round, RoundError> {
        let parent = self.deps.state.finalized()?;
        let height = parent.height + 1;

        let leader_id = self.deps.committee.leader_for_view(height)?;
        let leader = self
            .deps
            .state
            .identity(&leader_id)?
            .ok_or(RoundError::UnknownLeader(leader_id))?;

        // one vote per authorized consensus participant
        let participants = self.deps.committee.identities_by_epoch(height)?.len() as u64;
        let quorum = quorum_threshold(participants);

        debug!(
            "ColdStuff: new round for height {} (leader {}, quorum {}/{})",
            height, leader.node_id, quorum, participants
        );
        Ok(Round::new(parent, leader, quorum))
    }

    async fn sleep(&mut self, duration: Duration) -> Result<(), RoundError> {
        tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => Err(RoundError::Shutdown),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn wait_until(&mut self, limit: Timestamp) -> Result<(), RoundError> {
        let delay = Duration::from_millis(limit.saturating_sub(now_millis()));
        self.sleep(delay).await
    }

    // ===== LEADER =====

    fn send_proposal(&mut self, round: &mut Round) -> Result<(), RoundError> {
        let self_id = self.self_id;
        let candidate = match self.pending_candidate(round)? {
            Some(candidate) => {
                info!("🔁 Re-proposing block {} at height {}", candidate.block_id, candidate.height);
                candidate
            }
            None => self
                .deps
                .builder
                .build_on(&round.parent().block_id, &mut |header: &mut Block| header.proposer_id = self_id)?,
        };

        // our proposal carries our vote
        self.acknowledge(&candidate)?;
        round.propose(candidate.clone());
        self.deps.comms.broadcast_proposal(&candidate)?;
        round.tally(self_id);

        info!(
            "📤 Proposal sent: block {} at height {}",
            candidate.block_id, candidate.height
        );
        Ok(())
    }

    /// Our own block already acknowledged for this round's height and parent
    fn pending_candidate(&self, round: &Round) -> Result<Option<Block>, RoundError> {
        let data = self.deps.persister.get_safety_data()?;
        Ok(data.acknowledged_block.filter(|block| {
            block.height == round.height()
                && block.parent_id == round.parent().block_id
                && block.proposer_id == self.self_id
        }))
    }

    async fn wait_for_votes(&mut self, round: &mut Round) -> Result<(), RoundError> {
        let candidate_id = round.candidate().map(|c| c.block_id).ok_or(RoundError::NoCandidate)?;
        if round.quorum_reached() {
            return Ok(());
        }

        let deadline = Instant::now() + self.timeouts.current();
        loop {
            let vote = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return Err(RoundError::Shutdown),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RoundError::TimedOut("timed out waiting for votes"));
                }
                vote = self.votes.recv() => vote.ok_or(RoundError::Shutdown)?,
            };

            if !self.accept_vote(round, &vote, &candidate_id) {
                continue;
            }

            match round.tally(vote.voter_id) {
                TallyOutcome::QuorumReached { votes } => {
                    info!("🗳️  Sufficient votes received ({}/{})", votes, round.quorum());
                    return Ok(());
                }
                TallyOutcome::Counted { votes } => {
                    info!("🗳️  Block vote received from {} ({}/{})", vote.voter_id, votes, round.quorum());
                }
                TallyOutcome::Duplicate => {}
            }
        }
    }

    /// Discard votes that must not be counted, logging why
    fn accept_vote(&self, round: &Round, vote: &RoundVote, candidate_id: &Identifier) -> bool {
        let voter_id = vote.voter_id;
        if round.voted(&voter_id) {
            warn!("🚨 Invalid double vote from {}", voter_id);
            return false;
        }
        if voter_id == self.self_id {
            warn!("🚨 Invalid self-vote");
            return false;
        }

        let identity = match self.deps.state.identity(&voter_id) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                warn!("🚨 Vote by unknown node {}", voter_id);
                return false;
            }
            Err(e) => {
                error!("Could not verify voter {}: {}", voter_id, e);
                return false;
            }
        };
        if identity.role != Role::Consensus {
            warn!("🚨 Vote by non-consensus node {} (role {})", voter_id, identity.role);
            return false;
        }
        if !identity.is_active_consensus() {
            warn!("🚨 Vote by unauthorized node {}", voter_id);
            return false;
        }

        if vote.block_id != *candidate_id {
            warn!("🚨 Invalid candidate vote from {} for {}", voter_id, vote.block_id);
            return false;
        }
        true
    }

    fn send_commit(&self, round: &Round) -> Result<(), RoundError> {
        let candidate = round.candidate().ok_or(RoundError::NoCandidate)?;
        self.deps.comms.broadcast_commit(&Commit {
            block_id: candidate.block_id,
            committer_id: self.self_id,
        })?;
        info!("📣 Commit sent for block {} at height {}", candidate.block_id, candidate.height);
        Ok(())
    }

    // ===== REPLICA =====

    async fn wait_for_proposal(&mut self, round: &mut Round, limit: Timestamp) -> Result<(), RoundError> {
        let deadline = Instant::now() + self.timeouts.current();
        loop {
            let candidate = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return Err(RoundError::Shutdown),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RoundError::TimedOut("timed out waiting for proposal"));
                }
                proposal = self.proposals.recv() => proposal.ok_or(RoundError::Shutdown)?,
            };

            let leader_id = round.leader().node_id;
            if candidate.proposer_id != leader_id {
                warn!(
                    "🚨 Invalid leader: proposal by {}, expected {}",
                    candidate.proposer_id, leader_id
                );
                continue;
            }
            if candidate.height != round.height() {
                warn!(
                    "🚨 Invalid height: candidate at {}, expected {}",
                    candidate.height,
                    round.height()
                );
                continue;
            }
            if candidate.parent_id != round.parent().block_id {
                warn!(
                    "🚨 Invalid parent: candidate extends {}, expected {}",
                    candidate.parent_id,
                    round.parent().block_id
                );
                continue;
            }
            if candidate.timestamp < limit {
                warn!("🚨 Invalid timestamp: candidate at {}, limit {}", candidate.timestamp, limit);
                continue;
            }

            info!(
                "📥 Proposal received: block {} at height {}",
                candidate.block_id, candidate.height
            );
            round.propose(candidate);
            return Ok(());
        }
    }

    fn vote_on_proposal(&self, round: &Round) -> Result<(), RoundError> {
        let candidate = round.candidate().ok_or(RoundError::NoCandidate)?;
        self.acknowledge(candidate)?;

        let vote = RoundVote {
            block_id: candidate.block_id,
            voter_id: self.self_id,
        };
        self.deps.comms.send_vote(&vote, &round.leader().node_id)?;
        info!("🗳️  Vote sent for block {} at height {}", candidate.block_id, candidate.height);
        Ok(())
    }

    async fn wait_for_commit(&mut self, round: &Round) -> Result<(), RoundError> {
        let candidate_id = round.candidate().map(|c| c.block_id).ok_or(RoundError::NoCandidate)?;
        let leader_id = round.leader().node_id;

        let deadline = Instant::now() + self.timeouts.current();
        loop {
            let commit = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return Err(RoundError::Shutdown),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RoundError::TimedOut("timed out waiting for commit"));
                }
                commit = self.commits.recv() => commit.ok_or(RoundError::Shutdown)?,
            };

            if commit.committer_id != leader_id {
                warn!(
                    "🚨 Invalid commit leader: {}, expected {}",
                    commit.committer_id, leader_id
                );
                continue;
            }
            if commit.block_id != candidate_id {
                warn!("🚨 Invalid commit hash: {}", commit.block_id);
                continue;
            }

            info!("📥 Commit received for block {}", commit.block_id);
            return Ok(());
        }
    }

    // ===== COMMON =====

    /// Durably record that this node signed off on `candidate`
    ///
    /// A retried round may acknowledge the same block again, never another
    /// block at the same height.
    fn acknowledge(&self, candidate: &Block) -> Result<(), RoundError> {
        let height = candidate.height;
        let mut data = self.deps.persister.get_safety_data()?;
        if height < data.highest_acknowledged_view {
            return Err(RoundError::Stale {
                height,
                acknowledged: data.highest_acknowledged_view,
            });
        }
        if height == data.highest_acknowledged_view {
            match &data.acknowledged_block {
                Some(block) if block.block_id == candidate.block_id => return Ok(()),
                other => {
                    let acknowledged = other.as_ref().map(|b| b.block_id).unwrap_or(Identifier::ZERO);
                    warn!(
                        "🚨 Refusing block {} at height {}: already acknowledged {}",
                        candidate.block_id, height, acknowledged
                    );
                    return Err(RoundError::Equivocation {
                        height,
                        acknowledged,
                        candidate: candidate.block_id,
                    });
                }
            }
        }
        data.highest_acknowledged_view = height;
        data.acknowledged_block = Some(candidate.clone());
        self.deps.persister.put_safety_data(&data)?;
        Ok(())
    }

    fn commit_candidate(&self, round: &Round) -> Result<Block, RoundError> {
        let candidate = round.candidate().cloned().ok_or(RoundError::NoCandidate)?;

        match self.deps.finalizer.extend(&candidate) {
            Ok(()) => {}
            Err(e @ ChainStateError::OutdatedExtension { .. }) => {
                info!("Candidate {} extends an outdated fork: {}", candidate.block_id, e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
        self.deps.finalizer.finalize(&candidate.block_id)?;

        info!(
            "✅ COMMITTED: block {} at height {}",
            candidate.block_id, candidate.height
        );
        Ok(candidate)
    }
}
