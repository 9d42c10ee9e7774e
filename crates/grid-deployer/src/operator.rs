//! Drives one capacity key through create, update or delete against its node
//! and chain contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use grid_clients::{GridClients, Identity, NodeClient};
use grid_common::{
    deployment_hash, same_workload_names, workload_hash, workload_hashes, workload_versions,
    CapacityId, ContractId, ContractRequest, ContractUpdate, Deployment, HashError, NodeId,
    PlannedDeployment, SignatureRequirement, WorkloadResult,
};

use crate::config::DeployerConfig;
use crate::error::{ConvergenceError, DeployError, Phase, SoftFailure};
use crate::metrics::SharedMetrics;
use crate::util::{bounded, CallError};
use crate::waiter::wait_for_convergence;

/// A deployment as read back from its node, with what its contract reserves.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedDeployment {
    pub node_id: NodeId,
    pub public_ips: u32,
    pub deployment: Deployment,
}

impl ObservedDeployment {
    pub fn deployment_id(&self) -> ContractId {
        self.deployment.contract_id
    }
}

/// Map `desired` onto the deployment currently on the node: keep the contract
/// id and the current version, keep each unchanged workload's version and give
/// changed or new workloads the next version.
pub fn project(
    current: &Deployment,
    desired: &Deployment,
    identity: &Identity,
) -> Result<Deployment, HashError> {
    let old_hashes = workload_hashes(current)?;
    let old_versions = workload_versions(current);
    let next = current.version + 1;

    let mut dl = desired.clone();
    dl.contract_id = current.contract_id;
    dl.version = current.version;
    dl.twin_id = identity.twin_id();
    if dl.signature_requirement.requests.is_empty() {
        dl.signature_requirement = SignatureRequirement::single(identity.twin_id());
    }
    dl.signature_requirement.signatures.clear();

    for w in dl.workloads.iter_mut() {
        w.result = WorkloadResult::default();
        let hash = workload_hash(w)?;
        w.version = match (old_hashes.get(&w.name), old_versions.get(&w.name)) {
            (Some(old), Some(version)) if *old == hash => *version,
            _ => next,
        };
    }
    Ok(dl)
}

/// True when `projected` would not change anything on the node.
pub fn is_unchanged(current: &Deployment, projected: &Deployment) -> Result<bool, HashError> {
    Ok(same_workload_names(current, projected)
        && deployment_hash(current)? == deployment_hash(projected)?)
}

pub struct Operator<'a> {
    pub clients: &'a GridClients,
    pub identity: &'a Identity,
    pub config: &'a DeployerConfig,
    pub metrics: &'a SharedMetrics,
    pub cancel: &'a CancellationToken,
}

impl Operator<'_> {
    pub async fn create(
        &self,
        capacity_id: CapacityId,
        planned: &PlannedDeployment,
    ) -> Result<ContractId, DeployError> {
        let node_id = planned.node_id;
        let twin_id = self.identity.twin_id();

        let mut dl = planned.deployment.clone();
        dl.contract_id = 0;
        dl.version = 0;
        dl.twin_id = twin_id;
        for w in dl.workloads.iter_mut() {
            w.version = 0;
            w.result = WorkloadResult::default();
        }
        if dl.signature_requirement.requests.is_empty() {
            dl.signature_requirement = SignatureRequirement::single(twin_id);
        }
        dl.signature_requirement.signatures.clear();
        let hash = self.seal(capacity_id, &mut dl)?;

        let node = self.node(capacity_id, node_id, Phase::Create, None).await?;

        let request = ContractRequest {
            node_id,
            capacity_id,
            metadata: dl.metadata.clone(),
            hash,
            capacity: dl.capacity(),
            public_ips: dl.public_ipv4_count(),
        };
        let deployment_id = bounded(
            self.cancel,
            self.config.chain_call_timeout(),
            self.clients.chain.create_node_contract(self.identity, request),
        )
        .await
        .map_err(|e| self.chain_error(e, Phase::Create, capacity_id, node_id, None))?;
        dl.contract_id = deployment_id;
        info!(capacity_id, node_id, deployment_id, "contract created");

        let deployed = bounded(
            self.cancel,
            self.config.node_call_timeout(),
            node.deployment_deploy(&dl),
        )
        .await;
        match deployed {
            Ok(()) => {}
            Err(CallError::Cancelled) => {
                return Err(DeployError::Cancelled {
                    phase: Phase::Create,
                    capacity_id: Some(capacity_id),
                    deployment_id: Some(deployment_id),
                });
            }
            Err(e) => {
                let deploy = e.into_anyhow();
                warn!(capacity_id, node_id, deployment_id, error = %deploy, "node rejected deployment, cancelling contract");
                let cancelled = bounded(
                    &CancellationToken::new(),
                    self.config.chain_call_timeout(),
                    self.clients.chain.cancel_contract(self.identity, deployment_id),
                )
                .await;
                return Err(match cancelled {
                    Ok(()) => DeployError::Node {
                        phase: Phase::Create,
                        capacity_id,
                        node_id,
                        deployment_id: None,
                        source: deploy,
                    },
                    Err(cancel) => DeployError::OrphanedContract {
                        capacity_id,
                        node_id,
                        deployment_id,
                        deploy,
                        cancel: cancel.into_anyhow(),
                    },
                });
            }
        }

        let expected = workload_versions(&dl);
        self.wait(Phase::Create, capacity_id, node_id, deployment_id, node.as_ref(), &expected)
            .await?;

        SharedMetrics::inc(&self.metrics.creates_total);
        info!(capacity_id, node_id, deployment_id, "deployment created");
        Ok(deployment_id)
    }

    /// Move the deployment `deployment_id` on `current_node` to `planned`.
    /// Returns the deployment id, unchanged.
    pub async fn update(
        &self,
        capacity_id: CapacityId,
        current_node: NodeId,
        deployment_id: ContractId,
        planned: &PlannedDeployment,
    ) -> Result<ContractId, DeployError> {
        let node_id = planned.node_id;
        if current_node != node_id {
            return Err(DeployError::NodeMismatch {
                capacity_id,
                old: current_node,
                new: node_id,
            });
        }

        let node = self
            .node(capacity_id, node_id, Phase::Update, Some(deployment_id))
            .await?;
        let current = bounded(
            self.cancel,
            self.config.node_call_timeout(),
            node.deployment_get(deployment_id),
        )
        .await
        .map_err(|e| self.node_error(e, Phase::Update, capacity_id, node_id, Some(deployment_id)))?;

        let hash_error = |source| DeployError::Hash {
            capacity_id,
            source,
        };
        let mut dl = project(&current, &planned.deployment, self.identity).map_err(hash_error)?;
        if is_unchanged(&current, &dl).map_err(hash_error)? {
            // The node may hold the old state while the contract already
            // carries a failed update; only skip when both agree.
            let contract = bounded(
                self.cancel,
                self.config.chain_call_timeout(),
                self.clients.chain.get_contract(deployment_id),
            )
            .await
            .map_err(|e| self.chain_error(e, Phase::Update, capacity_id, node_id, Some(deployment_id)))?;
            let deployed_hash = deployment_hash(&current).map_err(hash_error)?;
            if contract.is_some_and(|c| c.deployment_hash == deployed_hash) {
                SharedMetrics::inc(&self.metrics.updates_skipped_total);
                info!(capacity_id, node_id, deployment_id, "deployment unchanged");
                return Ok(deployment_id);
            }
            warn!(capacity_id, node_id, deployment_id, "contract out of sync with node, resubmitting");
        }

        dl.version = current.version + 1;
        let hash = self.seal(capacity_id, &mut dl)?;

        let update = ContractUpdate {
            metadata: dl.metadata.clone(),
            hash,
            capacity: dl.capacity(),
        };
        bounded(
            self.cancel,
            self.config.chain_call_timeout(),
            self.clients
                .chain
                .update_node_contract(self.identity, deployment_id, update),
        )
        .await
        .map_err(|e| self.chain_error(e, Phase::Update, capacity_id, node_id, Some(deployment_id)))?;

        bounded(
            self.cancel,
            self.config.node_call_timeout(),
            node.deployment_update(&dl),
        )
        .await
        .map_err(|e| self.node_error(e, Phase::Update, capacity_id, node_id, Some(deployment_id)))?;
        info!(capacity_id, node_id, deployment_id, version = dl.version, "deployment update submitted");

        let expected = workload_versions(&dl);
        self.wait(Phase::Update, capacity_id, node_id, deployment_id, node.as_ref(), &expected)
            .await?;

        SharedMetrics::inc(&self.metrics.updates_total);
        info!(capacity_id, node_id, deployment_id, version = dl.version, "deployment updated");
        Ok(deployment_id)
    }

    /// Cancel the contract, then ask the node to drop the deployment. The node
    /// step is best effort and reported as a warning.
    pub async fn delete(
        &self,
        capacity_id: CapacityId,
        deployment_id: ContractId,
        node_hint: Option<NodeId>,
    ) -> Result<Option<SoftFailure>, DeployError> {
        let node_id = match node_hint {
            Some(node_id) => Some(node_id),
            None => bounded(
                self.cancel,
                self.config.chain_call_timeout(),
                self.clients.chain.get_contract(deployment_id),
            )
            .await
            .map_err(|e| self.chain_error(e, Phase::Delete, capacity_id, 0, Some(deployment_id)))?
            .map(|c| c.node_id),
        };

        bounded(
            self.cancel,
            self.config.chain_call_timeout(),
            self.clients.chain.cancel_contract(self.identity, deployment_id),
        )
        .await
        .map_err(|e| {
            self.chain_error(
                e,
                Phase::Delete,
                capacity_id,
                node_id.unwrap_or_default(),
                Some(deployment_id),
            )
        })?;
        SharedMetrics::inc(&self.metrics.deletes_total);
        info!(capacity_id, deployment_id, "contract cancelled");

        let Some(node_id) = node_id else {
            warn!(capacity_id, deployment_id, "contract already gone, node unknown");
            return Ok(None);
        };

        let notified = match self
            .node(capacity_id, node_id, Phase::Delete, Some(deployment_id))
            .await
        {
            Ok(node) => bounded(
                self.cancel,
                self.config.node_call_timeout(),
                node.deployment_delete(deployment_id),
            )
            .await
            .map_err(|e| e.into_anyhow()),
            Err(e) => Err(anyhow::Error::new(e)),
        };

        match notified {
            Ok(()) => {
                info!(capacity_id, node_id, deployment_id, "deployment deleted");
                Ok(None)
            }
            Err(e) => {
                warn!(capacity_id, node_id, deployment_id, error = %e, "node did not delete deployment");
                Ok(Some(SoftFailure::NodeDelete {
                    capacity_id,
                    node_id,
                    deployment_id,
                    message: format!("{e:#}"),
                }))
            }
        }
    }

    /// Sign, validate and hash `dl`, returning the hash the contract must carry.
    fn seal(&self, capacity_id: CapacityId, dl: &mut Deployment) -> Result<String, DeployError> {
        self.identity
            .sign(dl)
            .map_err(|source| DeployError::Sign {
                capacity_id,
                source,
            })?;
        dl.validate()
            .map_err(|source| DeployError::InvalidDeployment {
                capacity_id,
                source,
            })?;
        deployment_hash(dl).map_err(|source| DeployError::Hash {
            capacity_id,
            source,
        })
    }

    async fn node(
        &self,
        capacity_id: CapacityId,
        node_id: NodeId,
        phase: Phase,
        deployment_id: Option<ContractId>,
    ) -> Result<Arc<dyn NodeClient>, DeployError> {
        bounded(
            self.cancel,
            self.config.node_call_timeout(),
            self.clients.nodes.node_client(node_id),
        )
        .await
        .map_err(|e| self.node_error(e, phase, capacity_id, node_id, deployment_id))
    }

    async fn wait(
        &self,
        phase: Phase,
        capacity_id: CapacityId,
        node_id: NodeId,
        deployment_id: ContractId,
        node: &dyn NodeClient,
        expected: &BTreeMap<String, u32>,
    ) -> Result<(), DeployError> {
        match wait_for_convergence(self.cancel, node, deployment_id, expected, self.config).await {
            Ok(()) => Ok(()),
            Err(ConvergenceError::Cancelled) => Err(DeployError::Cancelled {
                phase,
                capacity_id: Some(capacity_id),
                deployment_id: Some(deployment_id),
            }),
            Err(source) => {
                SharedMetrics::inc(&self.metrics.convergence_failures_total);
                warn!(capacity_id, node_id, deployment_id, error = %source, "deployment did not converge");
                Err(DeployError::Convergence {
                    capacity_id,
                    node_id,
                    deployment_id,
                    source,
                })
            }
        }
    }

    fn chain_error(
        &self,
        e: CallError,
        phase: Phase,
        capacity_id: CapacityId,
        node_id: NodeId,
        deployment_id: Option<ContractId>,
    ) -> DeployError {
        match e {
            CallError::Cancelled => DeployError::Cancelled {
                phase,
                capacity_id: Some(capacity_id),
                deployment_id,
            },
            e => DeployError::Chain {
                phase,
                capacity_id,
                node_id,
                deployment_id,
                source: e.into_anyhow(),
            },
        }
    }

    fn node_error(
        &self,
        e: CallError,
        phase: Phase,
        capacity_id: CapacityId,
        node_id: NodeId,
        deployment_id: Option<ContractId>,
    ) -> DeployError {
        match e {
            CallError::Cancelled => DeployError::Cancelled {
                phase,
                capacity_id: Some(capacity_id),
                deployment_id,
            },
            e => DeployError::Node {
                phase,
                capacity_id,
                node_id,
                deployment_id,
                source: e.into_anyhow(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_clients::{MemoryGrid, NodeBehavior};
    use grid_common::capacity::GIB;
    use grid_common::{
        Capacity, DiskData, FarmInfo, NodeInfo, ResultState, Workload, WorkloadData,
    };

    fn identity() -> Identity {
        Identity::from_seed(7, [3u8; 32])
    }

    fn disks(sizes: &[(&str, u64)]) -> Deployment {
        Deployment::new(
            7,
            sizes
                .iter()
                .map(|(name, size)| Workload::new(*name, WorkloadData::Disk(DiskData { size: *size })))
                .collect(),
        )
    }

    async fn grid() -> MemoryGrid {
        let grid = MemoryGrid::new();
        grid.add_farm(FarmInfo { farm_id: 1, public_ips: vec![] }).await;
        grid.add_node(NodeInfo {
            node_id: 10,
            farm_id: 1,
            twin_id: 100,
            total: Capacity { cru: 8, mru: 16 * GIB, sru: 500 * GIB, hru: 0 },
            used: Capacity::default(),
            public_config: None,
        })
        .await;
        grid
    }

    fn fast_config() -> DeployerConfig {
        DeployerConfig {
            poll_initial_interval_ms: 10,
            poll_max_interval_secs: 1,
            ..DeployerConfig::default()
        }
    }

    #[test]
    fn projection_keeps_unchanged_versions() {
        let id = identity();
        let mut current = disks(&[("a", GIB), ("b", GIB)]);
        current.contract_id = 5;
        current.version = 3;
        current.workloads[0].version = 1;
        current.workloads[1].version = 3;

        let desired = disks(&[("a", GIB), ("b", 2 * GIB), ("c", GIB)]);
        let projected = project(&current, &desired, &id).unwrap();
        assert_eq!(projected.contract_id, 5);
        assert_eq!(projected.version, 3);
        let versions = workload_versions(&projected);
        assert_eq!(versions["a"], 1);
        assert_eq!(versions["b"], 4);
        assert_eq!(versions["c"], 4);
        assert!(!is_unchanged(&current, &projected).unwrap());
    }

    #[test]
    fn projection_of_same_content_is_unchanged() {
        let id = identity();
        let mut current = disks(&[("a", GIB)]);
        current.contract_id = 5;
        current.version = 2;
        current.workloads[0].version = 2;
        current.workloads[0].result.state = ResultState::Ok;

        let projected = project(&current, &disks(&[("a", GIB)]), &id).unwrap();
        assert!(is_unchanged(&current, &projected).unwrap());
    }

    #[tokio::test]
    async fn create_failure_cancels_contract() {
        let grid = grid().await;
        grid.set_behavior(10, NodeBehavior { fail_deploy: true, ..NodeBehavior::default() })
            .await;
        let clients = grid.clients();
        let id = identity();
        let config = fast_config();
        let metrics = SharedMetrics::default();
        let cancel = CancellationToken::new();
        let op = Operator { clients: &clients, identity: &id, config: &config, metrics: &metrics, cancel: &cancel };

        let err = op
            .create(1, &PlannedDeployment::new(10, disks(&[("a", GIB)])))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Node { phase: Phase::Create, deployment_id: None, .. }));
        assert!(grid.contract(1).await.is_none());
        assert_eq!(grid.calls().await.cancel_contract, 1);
    }

    #[tokio::test]
    async fn create_failure_with_failed_cancel_is_orphaned() {
        let grid = grid().await;
        grid.set_behavior(10, NodeBehavior { fail_deploy: true, ..NodeBehavior::default() })
            .await;
        grid.fail_cancel(1).await;
        let clients = grid.clients();
        let id = identity();
        let config = fast_config();
        let metrics = SharedMetrics::default();
        let cancel = CancellationToken::new();
        let op = Operator { clients: &clients, identity: &id, config: &config, metrics: &metrics, cancel: &cancel };

        let err = op
            .create(1, &PlannedDeployment::new(10, disks(&[("a", GIB)])))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::OrphanedContract { deployment_id: 1, .. }));
        assert_eq!(err.deployment_id(), Some(1));
    }

    #[tokio::test]
    async fn invalid_deployment_makes_no_calls() {
        let grid = grid().await;
        let clients = grid.clients();
        let id = identity();
        let config = fast_config();
        let metrics = SharedMetrics::default();
        let cancel = CancellationToken::new();
        let op = Operator { clients: &clients, identity: &id, config: &config, metrics: &metrics, cancel: &cancel };

        let err = op
            .create(1, &PlannedDeployment::new(10, disks(&[("a", 0)])))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidDeployment { capacity_id: 1, .. }));
        assert_eq!(grid.calls().await.mutating(), 0);
    }

    #[tokio::test]
    async fn delete_tolerates_node_failure() {
        let grid = grid().await;
        let clients = grid.clients();
        let id = identity();
        let config = fast_config();
        let metrics = SharedMetrics::default();
        let cancel = CancellationToken::new();
        let op = Operator { clients: &clients, identity: &id, config: &config, metrics: &metrics, cancel: &cancel };

        let deployment_id = op
            .create(1, &PlannedDeployment::new(10, disks(&[("a", GIB)])))
            .await
            .unwrap();
        grid.set_behavior(10, NodeBehavior { fail_delete: true, ..NodeBehavior::default() })
            .await;

        let warning = op.delete(1, deployment_id, None).await.unwrap();
        assert!(matches!(warning, Some(SoftFailure::NodeDelete { node_id: 10, .. })));
        assert!(grid.contract(deployment_id).await.is_none());
    }

    #[tokio::test]
    async fn update_resyncs_contract_after_failed_node_update() {
        let grid = grid().await;
        let clients = grid.clients();
        let id = identity();
        let config = fast_config();
        let metrics = SharedMetrics::default();
        let cancel = CancellationToken::new();
        let op = Operator { clients: &clients, identity: &id, config: &config, metrics: &metrics, cancel: &cancel };

        let original = PlannedDeployment::new(10, disks(&[("a", GIB)]));
        let deployment_id = op.create(1, &original).await.unwrap();

        grid.set_behavior(10, NodeBehavior { fail_update: true, ..NodeBehavior::default() })
            .await;
        let err = op
            .update(1, 10, deployment_id, &PlannedDeployment::new(10, disks(&[("a", 2 * GIB)])))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Node { phase: Phase::Update, .. }));
        let on_node = grid.deployment(10, deployment_id).await.unwrap();
        assert_ne!(
            grid.contract(deployment_id).await.unwrap().deployment_hash,
            deployment_hash(&on_node).unwrap()
        );

        // driving back to the deployed content must still fix the contract
        grid.set_behavior(10, NodeBehavior::default()).await;
        grid.reset_calls().await;
        op.update(1, 10, deployment_id, &original).await.unwrap();

        let calls = grid.calls().await;
        assert_eq!(calls.update_contract, 1);
        assert_eq!(calls.deployment_update, 1);
        let on_node = grid.deployment(10, deployment_id).await.unwrap();
        assert_eq!(on_node.version, 1);
        assert_eq!(
            grid.contract(deployment_id).await.unwrap().deployment_hash,
            deployment_hash(&on_node).unwrap()
        );
        assert_eq!(metrics.updates_skipped_total.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn update_rejects_node_change() {
        let grid = grid().await;
        let clients = grid.clients();
        let id = identity();
        let config = fast_config();
        let metrics = SharedMetrics::default();
        let cancel = CancellationToken::new();
        let op = Operator { clients: &clients, identity: &id, config: &config, metrics: &metrics, cancel: &cancel };

        let err = op
            .update(1, 11, 3, &PlannedDeployment::new(10, disks(&[("a", GIB)])))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NodeMismatch { old: 11, new: 10, .. }));
        assert_eq!(grid.calls().await.mutating(), 0);
    }
}
