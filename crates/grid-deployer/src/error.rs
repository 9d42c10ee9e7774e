use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use grid_clients::SignError;
use grid_common::{
    Capacity, CapacityId, ContractId, FarmId, HashError, NodeId, ResultState, ValidationError,
};

/// Step of the deployment lifecycle an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Read => "read",
            Phase::Create => "create",
            Phase::Update => "update",
            Phase::Delete => "delete",
        })
    }
}

#[derive(Debug, Error)]
pub enum ConvergenceError {
    #[error("workload {name:?} at version {version} reported {state:?}: {message}")]
    WorkloadFailed {
        name: String,
        version: u32,
        state: ResultState,
        message: String,
    },

    #[error("no workload became ready for {window:?} ({ok}/{expected} ok)")]
    Stalled {
        window: Duration,
        ok: usize,
        expected: usize,
    },

    #[error("not converged after {elapsed:?} ({ok}/{expected} ok)")]
    DeadlineExceeded {
        elapsed: Duration,
        ok: usize,
        expected: usize,
    },

    #[error("cancelled while waiting for workloads")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("capacity {capacity_id}: failed to sign deployment: {source}")]
    Sign {
        capacity_id: CapacityId,
        #[source]
        source: SignError,
    },

    #[error("capacity {capacity_id}: invalid deployment: {source}")]
    InvalidDeployment {
        capacity_id: CapacityId,
        #[source]
        source: ValidationError,
    },

    #[error("capacity {capacity_id}: {source}")]
    Hash {
        capacity_id: CapacityId,
        #[source]
        source: HashError,
    },

    #[error("capacity {capacity_id}: deployment lives on node {old} but was planned on node {new}")]
    NodeMismatch {
        capacity_id: CapacityId,
        old: NodeId,
        new: NodeId,
    },

    #[error("capacity {capacity_id}: chain {phase} on node {node_id} failed: {source:#}")]
    Chain {
        phase: Phase,
        capacity_id: CapacityId,
        node_id: NodeId,
        deployment_id: Option<ContractId>,
        #[source]
        source: anyhow::Error,
    },

    #[error("capacity {capacity_id}: node {node_id} {phase} failed: {source:#}")]
    Node {
        phase: Phase,
        capacity_id: CapacityId,
        node_id: NodeId,
        deployment_id: Option<ContractId>,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "capacity {capacity_id}: contract {deployment_id} on node {node_id} must be cancelled manually; \
         deploy failed ({deploy:#}) and cancel failed ({cancel:#})"
    )]
    OrphanedContract {
        capacity_id: CapacityId,
        node_id: NodeId,
        deployment_id: ContractId,
        deploy: anyhow::Error,
        cancel: anyhow::Error,
    },

    #[error("capacity {capacity_id}: deployment {deployment_id} on node {node_id} did not converge: {source}")]
    Convergence {
        capacity_id: CapacityId,
        node_id: NodeId,
        deployment_id: ContractId,
        #[source]
        source: ConvergenceError,
    },

    #[error("cancelled during {phase}")]
    Cancelled {
        phase: Phase,
        capacity_id: Option<CapacityId>,
        deployment_id: Option<ContractId>,
    },
}

impl DeployError {
    /// Id of a deployment that exists remotely despite the failure.
    pub fn deployment_id(&self) -> Option<ContractId> {
        match self {
            DeployError::Chain { deployment_id, .. }
            | DeployError::Node { deployment_id, .. }
            | DeployError::Cancelled { deployment_id, .. } => *deployment_id,
            DeployError::OrphanedContract { deployment_id, .. }
            | DeployError::Convergence { deployment_id, .. } => Some(*deployment_id),
            DeployError::Sign { .. }
            | DeployError::Hash { .. }
            | DeployError::InvalidDeployment { .. }
            | DeployError::NodeMismatch { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeployError::Cancelled { .. })
    }
}

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("failed to query {what}: {source:#}")]
    Directory {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("node {node_id} has {free} free, {needed} needed")]
    InsufficientCapacity {
        node_id: NodeId,
        needed: Capacity,
        free: Capacity,
    },

    #[error("farm {farm_id} has {free} free public ips, {needed} needed")]
    NotEnoughPublicIps { farm_id: FarmId, needed: u32, free: u32 },

    #[error("capacity {capacity_id} cannot grow its public ips from {old} to {new}")]
    PublicIpIncrease {
        capacity_id: CapacityId,
        old: u32,
        new: u32,
    },

    #[error("workload {workload:?} needs a public ipv4 config, node {node_id} has none")]
    MissingIpv4 { node_id: NodeId, workload: String },

    #[error("workload {workload:?} needs a domain, node {node_id} has none")]
    MissingDomain { node_id: NodeId, workload: String },

    #[error("capacity {capacity_id} moves from node {old} to node {new}")]
    NodeMismatch {
        capacity_id: CapacityId,
        old: NodeId,
        new: NodeId,
    },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("capacity validation failed: {0}")]
    Validation(#[from] CapacityError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("{original}; revert failed: {revert}")]
    RevertFailed {
        original: Box<ReconcileError>,
        revert: Box<ReconcileError>,
    },
}

impl ReconcileError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            ReconcileError::Deploy(e) => e.is_cancelled(),
            ReconcileError::RevertFailed { original, revert } => {
                original.is_cancelled() || revert.is_cancelled()
            }
            ReconcileError::Validation(_) => false,
        }
    }
}

/// Problems worth reporting that did not stop the reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftFailure {
    ReadOld {
        capacity_id: CapacityId,
        deployment_id: ContractId,
        message: String,
    },
    NodeDelete {
        capacity_id: CapacityId,
        node_id: NodeId,
        deployment_id: ContractId,
        message: String,
    },
}

impl fmt::Display for SoftFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoftFailure::ReadOld {
                capacity_id,
                deployment_id,
                message,
            } => write!(
                f,
                "capacity {capacity_id}: could not read deployment {deployment_id}: {message}"
            ),
            SoftFailure::NodeDelete {
                capacity_id,
                node_id,
                deployment_id,
                message,
            } => write!(
                f,
                "capacity {capacity_id}: node {node_id} did not delete deployment {deployment_id}: {message}"
            ),
        }
    }
}

/// Error side of a reconciliation. `ids` is the best known id map after the
/// failure and must be persisted by the caller just like a success.
#[derive(Debug, Error)]
#[error("reconciliation failed: {error}")]
pub struct ReconcileFailure {
    pub ids: BTreeMap<CapacityId, ContractId>,
    #[source]
    pub error: ReconcileError,
    pub warnings: Vec<SoftFailure>,
}
