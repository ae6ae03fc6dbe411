// CLI Configuration - File settings merged with command line overrides
// Principle: every field has a default, flags win over the file

use crate::cli::RunCmd;
use crate::consensus::coldstuff::ColdStuffConfig;
use crate::consensus::config::{
    DEFAULT_ROUND_INTERVAL_MS, DEFAULT_TIMEOUT_DECREASE_FACTOR, DEFAULT_TIMEOUT_INCREASE_FACTOR,
    DEFAULT_TIMEOUT_INITIAL_MS, DEFAULT_TIMEOUT_MAX_MS, DEFAULT_TIMEOUT_MIN_MS,
};
use crate::consensus::pacemaker::{TimeoutConfig, TimeoutConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default committee size of the in-process network
pub const DEFAULT_NODES: usize = 4;

/// Network configuration, as read from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Number of consensus nodes
    pub nodes: usize,

    /// Minimum time between a block and its child
    pub round_interval_ms: u64,

    pub timeout_initial_ms: u64,
    pub timeout_min_ms: u64,
    pub timeout_max_ms: u64,
    pub timeout_increase_factor: f64,
    pub timeout_decrease_factor: f64,

    /// Data directory; the platform data dir when unset
    pub base_path: Option<PathBuf>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            nodes: DEFAULT_NODES,
            round_interval_ms: DEFAULT_ROUND_INTERVAL_MS,
            timeout_initial_ms: DEFAULT_TIMEOUT_INITIAL_MS,
            timeout_min_ms: DEFAULT_TIMEOUT_MIN_MS,
            timeout_max_ms: DEFAULT_TIMEOUT_MAX_MS,
            timeout_increase_factor: DEFAULT_TIMEOUT_INCREASE_FACTOR,
            timeout_decrease_factor: DEFAULT_TIMEOUT_DECREASE_FACTOR,
            base_path: None,
        }
    }
}

impl ConsensusConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// File config (if any) with command line overrides applied
    pub fn from_run_cmd(cmd: &RunCmd) -> Result<Self, ConfigError> {
        let mut config = match &cmd.config {
            Some(path) => {
                info!("📄 Loading config from {}", path.display());
                Self::load(path)?
            }
            None => Self::default(),
        };

        if let Some(nodes) = cmd.nodes {
            config.nodes = nodes;
        }
        if let Some(interval) = cmd.interval_ms {
            config.round_interval_ms = interval;
        }
        if let Some(timeout) = cmd.timeout_ms {
            config.timeout_initial_ms = timeout;
            config.timeout_min_ms = timeout;
            config.timeout_max_ms = timeout;
            config.timeout_increase_factor = 1.0;
            config.timeout_decrease_factor = 1.0;
        }
        if let Some(path) = &cmd.base_path {
            config.base_path = Some(path.clone());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes == 0 {
            return Err(ConfigError::NoNodes);
        }
        self.timeout_config()?;
        Ok(())
    }

    pub fn timeout_config(&self) -> Result<TimeoutConfig, ConfigError> {
        Ok(TimeoutConfig::new(
            Duration::from_millis(self.timeout_initial_ms),
            Duration::from_millis(self.timeout_min_ms),
            Duration::from_millis(self.timeout_max_ms),
            self.timeout_increase_factor,
            self.timeout_decrease_factor,
        )?)
    }

    pub fn coldstuff_config(&self) -> Result<ColdStuffConfig, ConfigError> {
        Ok(ColdStuffConfig {
            round_interval: Duration::from_millis(self.round_interval_ms),
            timeouts: self.timeout_config()?,
        })
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> PathBuf {
        self.base_path.clone().unwrap_or_else(default_base_path)
    }
}

fn default_base_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("quorum-node")
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("A network needs at least one node")]
    NoNodes,

    #[error("Invalid timeouts: {0}")]
    Timeout(#[from] TimeoutConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use crate::cli::{Cli, Commands};
    use tempfile::TempDir;

    fn run_cmd(args: &[&str]) -> RunCmd {
        let mut argv = vec!["quorum-node", "run"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Commands::Run(cmd) => cmd,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ConsensusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout_config().unwrap(), TimeoutConfig::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{ "nodes": 7, "round_interval_ms": 250 }"#).unwrap();

        let config = ConsensusConfig::load(&path).unwrap();
        assert_eq!(config.nodes, 7);
        assert_eq!(config.round_interval_ms, 250);
        assert_eq!(config.timeout_max_ms, DEFAULT_TIMEOUT_MAX_MS);
    }

    #[test]
    fn test_flags_override_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{ "nodes": 7 }"#).unwrap();

        let cmd = run_cmd(&["--config", path.to_str().unwrap(), "--nodes", "3", "--timeout-ms", "400"]);
        let config = ConsensusConfig::from_run_cmd(&cmd).unwrap();
        assert_eq!(config.nodes, 3);
        assert_eq!(
            config.timeout_config().unwrap(),
            TimeoutConfig::fixed(Duration::from_millis(400))
        );
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        let config = ConsensusConfig {
            timeout_min_ms: 5_000,
            timeout_initial_ms: 1_000,
            ..ConsensusConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Timeout(TimeoutConfigError::Bounds { .. }))
        ));

        let config = ConsensusConfig {
            timeout_increase_factor: 0.5,
            ..ConsensusConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Timeout(TimeoutConfigError::IncreaseFactor(_)))
        ));
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.json");
        assert!(matches!(ConsensusConfig::load(&missing), Err(ConfigError::NotFound(_))));

        let broken = temp_dir.path().join("broken.json");
        std::fs::write(&broken, "{ nodes: ").unwrap();
        assert!(matches!(ConsensusConfig::load(&broken), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let cmd = run_cmd(&["--nodes", "0"]);
        assert!(matches!(ConsensusConfig::from_run_cmd(&cmd), Err(ConfigError::NoNodes)));
    }
}
