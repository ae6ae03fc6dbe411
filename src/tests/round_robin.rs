// Round Robin Tests - The coldstuff loop against recording and in-process peers
//
// Single-node tests drive one round by hand: the test plays every other
// member through the node's mailboxes and records what the node sends.
// The network test runs four full loops over a local hub.

use super::fixtures::{signer, TestNetwork, EPOCH_SEED};
use crate::consensus::coldstuff::{
    Builder, ColdStuff, ColdStuffConfig, ColdStuffError, ColdStuffHandle, Collaborators, Commit, Communicator,
    NetworkError, RoundError, RoundVote,
};
use crate::consensus::committee::{EpochSetup, StaticCommittee};
use crate::consensus::metrics::ConsensusMetrics;
use crate::consensus::pacemaker::TimeoutConfig;
use crate::consensus::safety::{InMemoryPersister, PersistError, Persister, SafetyData};
use crate::consensus::signer::Signer;
use crate::node::{InMemoryChain, LocalHub, LocalNetwork};
use crate::types::{Block, Identifier, IdentityList, NodeId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

// =============================================================================
// TEST HELPERS
// =============================================================================

/// Communicator that keeps everything it is asked to send
#[derive(Default)]
struct RecordingComms {
    proposals: Mutex<Vec<Block>>,
    commits: Mutex<Vec<Commit>>,
    votes: Mutex<Vec<(RoundVote, NodeId)>>,
    forward: Option<mpsc::UnboundedSender<Block>>,
}

impl RecordingComms {
    fn forwarding(forward: mpsc::UnboundedSender<Block>) -> Self {
        Self {
            forward: Some(forward),
            ..Self::default()
        }
    }
}

impl Communicator for RecordingComms {
    fn broadcast_proposal(&self, proposal: &Block) -> Result<(), NetworkError> {
        self.proposals.lock().unwrap().push(proposal.clone());
        if let Some(forward) = &self.forward {
            forward
                .send(proposal.clone())
                .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn broadcast_commit(&self, commit: &Commit) -> Result<(), NetworkError> {
        self.commits.lock().unwrap().push(commit.clone());
        Ok(())
    }

    fn send_vote(&self, vote: &RoundVote, to: &NodeId) -> Result<(), NetworkError> {
        self.votes.lock().unwrap().push((vote.clone(), *to));
        Ok(())
    }
}

/// Persister whose disk is always full
struct FailingPersister;

impl Persister for FailingPersister {
    fn get_safety_data(&self) -> Result<SafetyData, PersistError> {
        Ok(SafetyData::default())
    }

    fn put_safety_data(&self, _data: &SafetyData) -> Result<(), PersistError> {
        Err(PersistError::Storage("disk full".to_string()))
    }
}

/// One node under test, plus everything the test inspects afterwards
struct TestNode {
    cold: ColdStuff,
    handle: ColdStuffHandle,
    chain: Arc<InMemoryChain>,
    metrics: Arc<ConsensusMetrics>,
    shutdown: watch::Sender<bool>,
}

fn config(interval_ms: u64, timeout_ms: u64) -> ColdStuffConfig {
    ColdStuffConfig {
        round_interval: Duration::from_millis(interval_ms),
        timeouts: TimeoutConfig::fixed(Duration::from_millis(timeout_ms)),
    }
}

fn chain_for(network: &TestNetwork, committee: Arc<StaticCommittee>) -> Arc<InMemoryChain> {
    Arc::new(InMemoryChain::new(
        network.genesis.clone(),
        IdentityList::canonical(network.identities.clone()),
        committee,
    ))
}

fn node(
    network: &TestNetwork,
    self_id: NodeId,
    comms: Arc<dyn Communicator>,
    persister: Arc<dyn Persister>,
    config: ColdStuffConfig,
) -> TestNode {
    let chain = chain_for(network, network.committee.clone());
    let metrics = Arc::new(ConsensusMetrics::new());
    let deps = Collaborators {
        state: chain.clone(),
        committee: network.committee.clone(),
        comms,
        builder: chain.clone(),
        finalizer: chain.clone(),
        persister,
        metrics: metrics.clone(),
    };
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (cold, handle) = ColdStuff::new(self_id, deps, config, shutdown_rx);
    TestNode {
        cold,
        handle,
        chain,
        metrics,
        shutdown,
    }
}

/// The height-1 candidate the leader would build, from a chain of its own
fn leader_candidate(network: &TestNetwork) -> Block {
    let leader_id = network.leader(1).node_id();
    chain_for(network, network.committee.clone())
        .build_on(&network.genesis.block_id, &mut |b: &mut Block| b.proposer_id = leader_id)
        .unwrap()
}

/// Members other than the height-1 leader, in canonical order
fn replicas(network: &TestNetwork) -> Vec<NodeId> {
    let leader_id = network.leader(1).node_id();
    network
        .signers
        .iter()
        .map(|s| s.node_id())
        .filter(|id| *id != leader_id)
        .collect()
}

// =============================================================================
// LEADER
// =============================================================================

mod leader {
    use super::*;

    #[tokio::test]
    async fn test_leader_without_votes_times_out() {
        let network = TestNetwork::new(4);
        let comms = Arc::new(RecordingComms::default());
        let persister = Arc::new(InMemoryPersister::new());
        let leader_id = network.leader(1).node_id();
        let mut node = node(&network, leader_id, comms.clone(), persister.clone(), config(10, 200));

        let result = node.cold.run_round().await;
        assert!(
            matches!(result, Err(RoundError::TimedOut("timed out waiting for votes"))),
            "{:?}",
            result
        );

        // proposed and acknowledged, but nothing committed
        assert_eq!(comms.proposals.lock().unwrap().len(), 1);
        assert!(comms.commits.lock().unwrap().is_empty());
        assert_eq!(persister.get_safety_data().unwrap().highest_acknowledged_view, 1);
        assert_eq!(node.chain.height(), 0);
    }

    #[tokio::test]
    async fn test_leader_commits_after_quorum() {
        let network = TestNetwork::new(4);
        let (forward, mut proposals) = mpsc::unbounded_channel();
        let comms = Arc::new(RecordingComms::forwarding(forward));
        let leader_id = network.leader(1).node_id();
        let mut node = node(
            &network,
            leader_id,
            comms.clone(),
            Arc::new(InMemoryPersister::new()),
            config(10, 2000),
        );

        let voters = replicas(&network);
        let handle = node.handle.clone();
        let responder = tokio::spawn(async move {
            let proposal = proposals.recv().await.unwrap();
            let vote = |voter_id: NodeId| RoundVote {
                block_id: proposal.block_id,
                voter_id,
            };

            // ignored: self-vote, unknown node, wrong candidate, double vote
            assert!(handle.submit_vote(vote(leader_id)).await);
            assert!(handle.submit_vote(vote(signer(99, false).node_id())).await);
            assert!(
                handle
                    .submit_vote(RoundVote {
                        block_id: Identifier::hash(b"elsewhere"),
                        voter_id: voters[0],
                    })
                    .await
            );
            assert!(handle.submit_vote(vote(voters[0])).await);
            assert!(handle.submit_vote(vote(voters[0])).await);
            assert!(handle.submit_vote(vote(voters[1])).await);
            proposal
        });

        let block = node.cold.run_round().await.unwrap();
        let proposal = responder.await.unwrap();

        assert_eq!(block.block_id, proposal.block_id);
        assert_eq!(block.proposer_id, leader_id);
        assert_eq!(node.chain.height(), 1);
        assert_eq!(node.chain.finalized_block().block_id, block.block_id);

        let commits = comms.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].block_id, block.block_id);
        assert_eq!(commits[0].committer_id, leader_id);
    }

    #[tokio::test]
    async fn test_retry_reproposes_acknowledged_block() {
        let network = TestNetwork::new(4);
        let comms = Arc::new(RecordingComms::default());
        let persister = Arc::new(InMemoryPersister::new());
        let leader_id = network.leader(1).node_id();
        let mut node = node(&network, leader_id, comms.clone(), persister.clone(), config(10, 100));

        for _ in 0..2 {
            let result = node.cold.run_round().await;
            assert!(matches!(result, Err(RoundError::TimedOut(_))), "{:?}", result);
        }

        let proposals = comms.proposals.lock().unwrap();
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0], proposals[1]);
        assert_eq!(
            persister.get_safety_data().unwrap().acknowledged_block.map(|b| b.block_id),
            Some(proposals[0].block_id)
        );
    }

    #[tokio::test]
    async fn test_stale_acknowledgement_blocks_proposal() {
        let network = TestNetwork::new(4);
        let comms = Arc::new(RecordingComms::default());
        let persister = Arc::new(InMemoryPersister::new());
        persister
            .put_safety_data(&SafetyData {
                highest_acknowledged_view: 5,
                ..SafetyData::default()
            })
            .unwrap();
        let leader_id = network.leader(1).node_id();
        let mut node = node(&network, leader_id, comms.clone(), persister, config(10, 200));

        let result = node.cold.run_round().await;
        assert!(
            matches!(
                result,
                Err(RoundError::Stale {
                    height: 1,
                    acknowledged: 5
                })
            ),
            "{:?}",
            result
        );
        assert!(comms.proposals.lock().unwrap().is_empty());
    }
}

// =============================================================================
// REPLICA
// =============================================================================

mod replica {
    use super::*;

    #[tokio::test]
    async fn test_replica_without_proposal_times_out() {
        let network = TestNetwork::new(4);
        let comms = Arc::new(RecordingComms::default());
        let persister = Arc::new(InMemoryPersister::new());
        let self_id = network.non_leader(1).node_id();
        let mut node = node(&network, self_id, comms.clone(), persister.clone(), config(10, 100));

        let result = node.cold.run_round().await;
        assert!(
            matches!(result, Err(RoundError::TimedOut("timed out waiting for proposal"))),
            "{:?}",
            result
        );
        assert!(comms.votes.lock().unwrap().is_empty());
        assert_eq!(persister.get_safety_data().unwrap().highest_acknowledged_view, 0);
    }

    #[tokio::test]
    async fn test_replica_votes_and_commits() {
        let network = TestNetwork::new(4);
        let comms = Arc::new(RecordingComms::default());
        let persister = Arc::new(InMemoryPersister::new());
        let self_id = network.non_leader(1).node_id();
        let leader_id = network.leader(1).node_id();
        let mut node = node(&network, self_id, comms.clone(), persister.clone(), config(10, 2000));

        let candidate = leader_candidate(&network);
        let mut impostor = candidate.clone();
        impostor.proposer_id = self_id;
        impostor.seal();

        let handle = node.handle.clone();
        let good = candidate.clone();
        let feeder = tokio::spawn(async move {
            assert!(handle.submit_proposal(impostor).await);
            assert!(handle.submit_proposal(good.clone()).await);
            // commit from the wrong node, then the leader's
            assert!(
                handle
                    .submit_commit(Commit {
                        block_id: good.block_id,
                        committer_id: self_id,
                    })
                    .await
            );
            assert!(
                handle
                    .submit_commit(Commit {
                        block_id: good.block_id,
                        committer_id: leader_id,
                    })
                    .await
            );
        });

        let block = node.cold.run_round().await.unwrap();
        feeder.await.unwrap();

        assert_eq!(block.block_id, candidate.block_id);
        assert_eq!(node.chain.height(), 1);
        assert_eq!(persister.get_safety_data().unwrap().highest_acknowledged_view, 1);

        let votes = comms.votes.lock().unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(
            votes[0],
            (
                RoundVote {
                    block_id: candidate.block_id,
                    voter_id: self_id,
                },
                leader_id
            )
        );
    }

    #[tokio::test]
    async fn test_replica_without_commit_times_out() {
        let network = TestNetwork::new(4);
        let comms = Arc::new(RecordingComms::default());
        let self_id = network.non_leader(1).node_id();
        let mut node = node(
            &network,
            self_id,
            comms.clone(),
            Arc::new(InMemoryPersister::new()),
            config(10, 300),
        );

        assert!(node.handle.submit_proposal(leader_candidate(&network)).await);
        let result = node.cold.run_round().await;
        assert!(
            matches!(result, Err(RoundError::TimedOut("timed out waiting for commit"))),
            "{:?}",
            result
        );
        // the vote went out before the wait
        assert_eq!(comms.votes.lock().unwrap().len(), 1);
        assert_eq!(node.chain.height(), 0);
    }

    #[tokio::test]
    async fn test_replica_refuses_second_block_at_height() {
        let network = TestNetwork::new(4);
        let comms = Arc::new(RecordingComms::default());
        let self_id = network.non_leader(1).node_id();
        let mut node = node(
            &network,
            self_id,
            comms.clone(),
            Arc::new(InMemoryPersister::new()),
            config(10, 100),
        );

        let first = leader_candidate(&network);
        let mut second = first.clone();
        second.payload_hash = Identifier::hash(b"second payload");
        second.timestamp += 1;
        second.seal();

        assert!(node.handle.submit_proposal(first.clone()).await);
        let result = node.cold.run_round().await;
        assert!(matches!(result, Err(RoundError::TimedOut(_))), "{:?}", result);

        // the retried round brings a different candidate for height 1
        assert!(node.handle.submit_proposal(second.clone()).await);
        let result = node.cold.run_round().await;
        assert!(
            matches!(
                result,
                Err(RoundError::Equivocation { height: 1, acknowledged, candidate })
                    if acknowledged == first.block_id && candidate == second.block_id
            ),
            "{:?}",
            result
        );

        // the block already acknowledged may be voted for again
        assert!(node.handle.submit_proposal(first.clone()).await);
        let result = node.cold.run_round().await;
        assert!(matches!(result, Err(RoundError::TimedOut(_))), "{:?}", result);

        let votes = comms.votes.lock().unwrap();
        assert_eq!(votes.len(), 2);
        assert!(votes.iter().all(|(vote, _)| vote.block_id == first.block_id));
    }
}

// =============================================================================
// LOOP
// =============================================================================

mod event_loop {
    use super::*;

    #[tokio::test]
    async fn test_persist_failure_halts_loop() {
        let network = TestNetwork::new(4);
        let leader_id = network.leader(1).node_id();
        let node = node(
            &network,
            leader_id,
            Arc::new(RecordingComms::default()),
            Arc::new(FailingPersister),
            config(10, 200),
        );
        let metrics = node.metrics.clone();
        let _shutdown = node.shutdown;

        let result = tokio::time::timeout(Duration::from_secs(5), node.cold.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(ColdStuffError::Persist(_))), "{:?}", result);
        assert_eq!(metrics.snapshot().rounds_failed, 1);
    }

    #[tokio::test]
    async fn test_round_restarts_from_same_parent_after_partial_votes() {
        let network = TestNetwork::new(4);
        let (forward, mut proposals) = mpsc::unbounded_channel();
        let comms = Arc::new(RecordingComms::forwarding(forward));
        let leader_id = network.leader(1).node_id();
        let TestNode {
            cold,
            handle,
            chain,
            metrics,
            shutdown,
        } = node(
            &network,
            leader_id,
            comms.clone(),
            Arc::new(InMemoryPersister::new()),
            config(10, 150),
        );

        // leader plus one replica is below the quorum of 3
        let voter = replicas(&network)[0];
        let responder = tokio::spawn(async move {
            let first = proposals.recv().await.unwrap();
            assert!(
                handle
                    .submit_vote(RoundVote {
                        block_id: first.block_id,
                        voter_id: voter,
                    })
                    .await
            );
            let second = proposals.recv().await.unwrap();
            shutdown.send(true).unwrap();
            (first, second)
        });

        let result = tokio::time::timeout(Duration::from_secs(5), cold.run())
            .await
            .unwrap();
        assert!(result.is_ok());
        let (first, second) = responder.await.unwrap();

        assert_eq!(first.parent_id, network.genesis.block_id);
        assert_eq!(second.parent_id, first.parent_id);
        assert_eq!(second.block_id, first.block_id);
        assert!(comms.commits.lock().unwrap().is_empty());
        assert_eq!(chain.height(), 0);
        assert!(metrics.snapshot().rounds_timed_out >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting() {
        let network = TestNetwork::new(4);
        let self_id = network.non_leader(1).node_id();
        let node = node(
            &network,
            self_id,
            Arc::new(RecordingComms::default()),
            Arc::new(InMemoryPersister::new()),
            config(10, 30_000),
        );

        let shutdown = node.shutdown;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.send(true).unwrap();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), node.cold.run())
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_local_network_agrees_on_finalized_blocks() {
        let network = TestNetwork::new(4);
        let hub = LocalHub::new();
        let metrics = Arc::new(ConsensusMetrics::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut chains = Vec::new();
        let mut loops = Vec::new();
        for member in &network.signers {
            let self_id = member.node_id();
            let epoch = EpochSetup::new(0, 0, u64::MAX, network.identities.clone(), EPOCH_SEED).unwrap();
            let committee = Arc::new(StaticCommittee::new(self_id, epoch));
            let chain = chain_for(&network, committee.clone());
            let deps = Collaborators {
                state: chain.clone(),
                committee,
                comms: Arc::new(LocalNetwork::new(self_id, hub.clone())),
                builder: chain.clone(),
                finalizer: chain.clone(),
                persister: Arc::new(InMemoryPersister::new()),
                metrics: metrics.clone(),
            };
            let (cold, handle) = ColdStuff::new(self_id, deps, config(20, 2000), shutdown_rx.clone());
            hub.register(handle);
            chains.push(chain);
            loops.push(cold);
        }
        let tasks: Vec<_> = loops.into_iter().map(|cold| tokio::spawn(cold.run())).collect();

        let progress = tokio::time::timeout(Duration::from_secs(30), async {
            while chains.iter().any(|c| c.height() < 3) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        shutdown.send(true).unwrap();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(progress.is_ok(), "network stalled");

        let finalized: Vec<Block> = chains.iter().map(|c| c.finalized_block()).collect();
        for a in &finalized {
            for b in &finalized {
                if a.height == b.height {
                    assert_eq!(a.block_id, b.block_id);
                }
            }
        }
        assert!(metrics.snapshot().rounds_completed >= 12);
    }
}
