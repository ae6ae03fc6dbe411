// Runner - Launch an in-process committee and drive it to completion
// Principle: wire every node from the same genesis and epoch, stop all of them together

use crate::cli::config::{ConfigError, ConsensusConfig};
use crate::consensus::coldstuff::{ColdStuff, ColdStuffError, Collaborators};
use crate::consensus::committee::{EpochSetup, StaticCommittee};
use crate::consensus::error::CommitteeError;
use crate::consensus::metrics::ConsensusMetrics;
use crate::consensus::safety::PersistError;
use crate::consensus::signer::{LocalSigner, Signer};
use crate::consensus::threshold::{quorum_threshold, timeout_partial_threshold};
use crate::node::{InMemoryChain, LocalHub, LocalNetwork};
use crate::storage::DbPersister;
use crate::types::{now_millis, Block, Height, IdentityList, Role, Weight};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Every node carries the same weight in the round-robin network
const NODE_WEIGHT: Weight = 1;

/// How often the runner checks chain progress
const PROGRESS_POLL_MS: u64 = 200;

/// How often counters are logged
const STATS_INTERVAL_SECS: u64 = 30;

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Committee error: {0}")]
    Committee(#[from] CommitteeError),

    #[error("Storage error: {0}")]
    Persist(#[from] PersistError),

    #[error("Node {index} stopped with error: {source}")]
    Node {
        index: usize,
        #[source]
        source: ColdStuffError,
    },

    #[error("Node {0} task panicked")]
    Panicked(usize),
}

/// Run a network of `config.nodes` nodes until Ctrl-C or `target_height` is finalized everywhere
pub async fn run_network(config: ConsensusConfig, target_height: Option<Height>) -> Result<(), RunnerError> {
    let coldstuff_config = config.coldstuff_config()?;

    // fresh directory per run: persisted heights only make sense for this chain
    let run_dir = config
        .data_dir()
        .join(format!("run-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S%3f")));
    std::fs::create_dir_all(&run_dir)
        .map_err(|e| RunnerError::Io(format!("Failed to create data dir: {}", e)))?;

    info!("🚀 Starting {} nodes", config.nodes);
    info!("📁 Data path: {}", run_dir.display());
    info!(
        "⚖️  Quorum: {} of {} votes",
        quorum_threshold(config.nodes as Weight),
        config.nodes
    );

    let signers: Vec<LocalSigner> = (0..config.nodes).map(|_| LocalSigner::generate(false)).collect();
    let identities: Vec<_> = signers
        .iter()
        .map(|s| s.identity(Role::Consensus, NODE_WEIGHT))
        .collect();
    let epoch = EpochSetup::new(0, 0, u64::MAX, identities.clone(), rand::random())?;
    let genesis = Block::genesis(now_millis());
    info!("🔗 Genesis: {}", genesis.block_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = LocalHub::new();
    let metrics = Arc::new(ConsensusMetrics::new());

    let mut chains = Vec::with_capacity(config.nodes);
    let mut loops = Vec::with_capacity(config.nodes);
    for (index, signer) in signers.iter().enumerate() {
        let node_id = signer.node_id();
        let committee = Arc::new(StaticCommittee::new(node_id, epoch.clone()));
        let chain = Arc::new(InMemoryChain::new(
            genesis.clone(),
            IdentityList::canonical(identities.clone()),
            committee.clone(),
        ));
        let persister = DbPersister::open(run_dir.join(format!("node-{}", index)))?;

        let deps = Collaborators {
            state: chain.clone(),
            committee,
            comms: Arc::new(LocalNetwork::new(node_id, hub.clone())),
            builder: chain.clone(),
            finalizer: chain.clone(),
            persister: Arc::new(persister),
            metrics: metrics.clone(),
        };
        let (cold, handle) = ColdStuff::new(node_id, deps, coldstuff_config.clone(), shutdown_rx.clone());
        hub.register(handle);
        debug!("Node {} is {}", index, node_id);

        chains.push(chain);
        loops.push(cold);
    }

    // all mailboxes are registered before the first proposal goes out
    let tasks: Vec<_> = loops.into_iter().map(|cold| tokio::spawn(cold.run())).collect();
    info!("✅ All nodes started");

    if let Some(target) = target_height {
        info!("🎯 Target height: {}", target);
    }

    watch_progress(&chains, target_height, &metrics).await;

    info!("🛑 Shutting down...");
    // the receivers are owned by the loops; a send error only means they are all gone
    let _ = shutdown_tx.send(true);

    let mut first_error = None;
    for (index, result) in futures::future::join_all(tasks).await.into_iter().enumerate() {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                error!("Node {} failed: {}", index, source);
                first_error.get_or_insert(RunnerError::Node { index, source });
            }
            Err(e) => {
                error!("Node {} task failed: {}", index, e);
                first_error.get_or_insert(RunnerError::Panicked(index));
            }
        }
    }

    log_stats(&chains, &metrics);
    match first_error {
        Some(e) => Err(e),
        None => {
            info!("👋 Network stopped");
            Ok(())
        }
    }
}

/// Block until Ctrl-C or until every node has finalized `target_height`
async fn watch_progress(chains: &[Arc<InMemoryChain>], target_height: Option<Height>, metrics: &ConsensusMetrics) {
    let mut progress_interval = tokio::time::interval(Duration::from_millis(PROGRESS_POLL_MS));
    let mut stats_interval = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
    // the first tick completes immediately
    stats_interval.tick().await;

    let mut last_height = 0;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("⚠️  Ctrl+C received, shutting down...");
                break;
            }

            _ = progress_interval.tick() => {
                let height = lowest_height(chains);
                if height > last_height {
                    debug!("Network finalized height {}", height);
                    last_height = height;
                }
                if target_height.is_some_and(|target| height >= target) {
                    info!("🎯 Target height {} reached on every node", height);
                    break;
                }
            }

            _ = stats_interval.tick() => {
                log_stats(chains, metrics);
            }
        }
    }
}

/// Height finalized by every node
fn lowest_height(chains: &[Arc<InMemoryChain>]) -> Height {
    chains.iter().map(|c| c.height()).min().unwrap_or(0)
}

fn log_stats(chains: &[Arc<InMemoryChain>], metrics: &ConsensusMetrics) {
    let heights: Vec<Height> = chains.iter().map(|c| c.height()).collect();
    let snapshot = metrics.snapshot();
    info!(
        "📊 Heights {:?} | rounds: {} completed, {} timed out, {} failed",
        heights, snapshot.rounds_completed, snapshot.rounds_timed_out, snapshot.rounds_failed
    );
    if snapshot.rounds_failed > snapshot.rounds_completed {
        warn!("⚠️  More failed rounds than completed ones");
    }
}

// ===== THRESHOLDS =====

/// Certificate thresholds for a committee weight
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdReport {
    pub total_weight: Weight,
    pub quorum: Weight,
    pub timeout_partial: Weight,
    pub max_faulty: Weight,
}

impl ThresholdReport {
    pub fn new(total_weight: Weight) -> Self {
        let quorum = quorum_threshold(total_weight);
        Self {
            total_weight,
            quorum,
            timeout_partial: timeout_partial_threshold(total_weight),
            max_faulty: total_weight.saturating_sub(quorum),
        }
    }

    pub fn render(&self, format: &str) -> Result<String, RunnerError> {
        match format {
            "json" => serde_json::to_string_pretty(self)
                .map_err(|e| RunnerError::Io(format!("Failed to encode report: {}", e))),
            _ => Ok(format!(
                "Total weight:      {}\nQuorum (QC/TC):    {}\nPartial timeout:   {}\nTolerated faulty:  {}",
                self.total_weight, self.quorum, self.timeout_partial, self.max_faulty
            )),
        }
    }
}
