use std::time::Duration;

use clap::{ArgAction, Args};
use serde::{Deserialize, Serialize};

/// Tunables of a [`crate::Deployer`]. Flatten into a binary's clap parser or
/// load from a serialized config file.
#[derive(Debug, Clone, Args, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployerConfig {
    /// Restore the previous state when a reconciliation fails part way.
    #[arg(long, env = "GRID_REVERT_ON_FAILURE", default_value_t = true, action = ArgAction::Set)]
    pub revert_on_failure: bool,

    /// Check node and farm capacity before mutating anything.
    #[arg(long, env = "GRID_VALIDATE_CAPACITY", default_value_t = true, action = ArgAction::Set)]
    pub validate_capacity: bool,

    #[arg(long, env = "GRID_NODE_CALL_TIMEOUT_SECS", default_value_t = 10)]
    pub node_call_timeout_secs: u64,

    #[arg(long, env = "GRID_CHAIN_CALL_TIMEOUT_SECS", default_value_t = 60)]
    pub chain_call_timeout_secs: u64,

    #[arg(long, env = "GRID_POLL_INITIAL_INTERVAL_MS", default_value_t = 3_000)]
    pub poll_initial_interval_ms: u64,

    #[arg(long, env = "GRID_POLL_MULTIPLIER", default_value_t = 1.25)]
    pub poll_multiplier: f64,

    #[arg(long, env = "GRID_POLL_MAX_INTERVAL_SECS", default_value_t = 40)]
    pub poll_max_interval_secs: u64,

    /// Give up waiting for a deployment to converge after this long.
    #[arg(long, env = "GRID_POLL_MAX_ELAPSED_SECS", default_value_t = 1_200)]
    pub poll_max_elapsed_secs: u64,

    /// Give up when no additional workload became ready for this long.
    #[arg(long, env = "GRID_STALL_TIMEOUT_SECS", default_value_t = 240)]
    pub stall_timeout_secs: u64,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            revert_on_failure: true,
            validate_capacity: true,
            node_call_timeout_secs: 10,
            chain_call_timeout_secs: 60,
            poll_initial_interval_ms: 3_000,
            poll_multiplier: 1.25,
            poll_max_interval_secs: 40,
            poll_max_elapsed_secs: 1_200,
            stall_timeout_secs: 240,
        }
    }
}

impl DeployerConfig {
    pub fn node_call_timeout(&self) -> Duration {
        Duration::from_secs(self.node_call_timeout_secs)
    }

    pub fn chain_call_timeout(&self) -> Duration {
        Duration::from_secs(self.chain_call_timeout_secs)
    }

    pub fn poll_initial_interval(&self) -> Duration {
        Duration::from_millis(self.poll_initial_interval_ms)
    }

    pub fn poll_max_interval(&self) -> Duration {
        Duration::from_secs(self.poll_max_interval_secs)
    }

    pub fn poll_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.poll_max_elapsed_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}
