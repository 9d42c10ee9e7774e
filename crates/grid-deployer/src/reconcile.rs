use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use grid_clients::{GridClients, Identity};
use grid_common::{CapacityId, ContractId, NodeId, PlannedDeployment};

use crate::config::DeployerConfig;
use crate::error::{DeployError, Phase, ReconcileError, ReconcileFailure, SoftFailure};
use crate::metrics::SharedMetrics;
use crate::operator::{ObservedDeployment, Operator};
use crate::util::{bounded, CallError};
use crate::validator::validate_capacity;

/// Result of a successful reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Capacity id to deployment id, to be persisted by the caller.
    pub ids: BTreeMap<CapacityId, ContractId>,
    pub warnings: Vec<SoftFailure>,
}

/// Old deployments read back from their nodes.
#[derive(Debug, Default)]
struct ReadBack {
    observed: BTreeMap<CapacityId, ObservedDeployment>,
    warnings: Vec<SoftFailure>,
    complete: bool,
}

/// Reconciles a caller-owned map of deployments against the grid.
#[derive(Debug, Clone)]
pub struct Deployer {
    clients: GridClients,
    identity: Arc<Identity>,
    config: DeployerConfig,
    metrics: Arc<SharedMetrics>,
}

impl Deployer {
    pub fn new(clients: GridClients, identity: Arc<Identity>, config: DeployerConfig) -> Self {
        Self {
            clients,
            identity,
            config,
            metrics: Arc::new(SharedMetrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SharedMetrics> {
        &self.metrics
    }

    /// Bring the deployments behind `old_ids` to the desired `new` set.
    ///
    /// Creations run first, then updates, then deletions, each in capacity id
    /// order and stopping at the first failure. On failure the previous state
    /// is restored once when `revert_on_failure` is set. Both sides of the
    /// result carry the id map to persist.
    pub async fn deploy(
        &self,
        cancel: &CancellationToken,
        old_ids: &BTreeMap<CapacityId, ContractId>,
        new: &BTreeMap<CapacityId, PlannedDeployment>,
    ) -> Result<DeployOutcome, ReconcileFailure> {
        SharedMetrics::inc(&self.metrics.reconcile_total);
        info!(old = old_ids.len(), new = new.len(), "reconciling deployments");

        let result = self.reconcile(cancel, old_ids, new).await;
        match &result {
            Ok(outcome) => {
                info!(deployments = outcome.ids.len(), warnings = outcome.warnings.len(), "reconciliation done");
            }
            Err(failure) => {
                SharedMetrics::inc(&self.metrics.reconcile_errors);
                warn!(error = %failure.error, deployments = failure.ids.len(), "reconciliation failed");
            }
        }
        result
    }

    /// Delete every deployment behind `old_ids`.
    pub async fn cancel(
        &self,
        cancel: &CancellationToken,
        old_ids: &BTreeMap<CapacityId, ContractId>,
    ) -> Result<DeployOutcome, ReconcileFailure> {
        self.deploy(cancel, old_ids, &BTreeMap::new()).await
    }

    /// Read back the deployments behind `ids`. Fails on the first one that
    /// cannot be read.
    pub async fn current_deployments(
        &self,
        cancel: &CancellationToken,
        ids: &BTreeMap<CapacityId, ContractId>,
    ) -> Result<BTreeMap<CapacityId, ObservedDeployment>, DeployError> {
        let mut observed = BTreeMap::new();
        for (capacity_id, deployment_id) in ids {
            let current = self.read_one(cancel, *capacity_id, *deployment_id).await?;
            observed.insert(*capacity_id, current);
        }
        Ok(observed)
    }

    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        old_ids: &BTreeMap<CapacityId, ContractId>,
        new: &BTreeMap<CapacityId, PlannedDeployment>,
    ) -> Result<DeployOutcome, ReconcileFailure> {
        let read = self.read_old(cancel, old_ids).await;
        let mut warnings = read.warnings;
        for w in &warnings {
            SharedMetrics::inc(&self.metrics.soft_failures_total);
            warn!(warning = %w, "old deployment unavailable");
        }

        if cancel.is_cancelled() {
            return Err(ReconcileFailure {
                ids: old_ids.clone(),
                error: DeployError::Cancelled {
                    phase: Phase::Read,
                    capacity_id: None,
                    deployment_id: None,
                }
                .into(),
                warnings,
            });
        }

        if !read.complete {
            info!("old state incomplete, skipping capacity validation");
        } else if self.config.validate_capacity {
            let validated = validate_capacity(
                cancel,
                self.clients.directory.as_ref(),
                self.config.node_call_timeout(),
                &read.observed,
                new,
            )
            .await;
            if let Err(e) = validated {
                let error = if cancel.is_cancelled() {
                    DeployError::Cancelled {
                        phase: Phase::Read,
                        capacity_id: None,
                        deployment_id: None,
                    }
                    .into()
                } else {
                    SharedMetrics::inc(&self.metrics.validation_failures_total);
                    ReconcileError::Validation(e)
                };
                return Err(ReconcileFailure {
                    ids: old_ids.clone(),
                    error,
                    warnings,
                });
            }
        }

        let mut ids = old_ids.clone();
        let mut hints: BTreeMap<CapacityId, NodeId> = read
            .observed
            .iter()
            .map(|(capacity_id, old)| (*capacity_id, old.node_id))
            .collect();

        let applied = self
            .apply(cancel, &mut ids, new, &mut hints, &mut warnings)
            .await;
        let err = match applied {
            Ok(()) => return Ok(DeployOutcome { ids, warnings }),
            Err(err) => err,
        };

        if err.is_cancelled() || !self.config.revert_on_failure {
            return Err(ReconcileFailure {
                ids,
                error: err.into(),
                warnings,
            });
        }

        warn!(error = %err, "reconciliation failed, reverting");
        SharedMetrics::inc(&self.metrics.reverts_total);

        // Keys whose old deployment is unknown cannot be restored; leave them be.
        let untouched: BTreeSet<CapacityId> = old_ids
            .keys()
            .filter(|k| !read.observed.contains_key(*k))
            .copied()
            .collect();
        let mut revert_ids: BTreeMap<CapacityId, ContractId> = ids
            .iter()
            .filter(|(k, _)| !untouched.contains(*k))
            .map(|(k, v)| (*k, *v))
            .collect();
        let previous: BTreeMap<CapacityId, PlannedDeployment> = read
            .observed
            .iter()
            .map(|(k, old)| (*k, PlannedDeployment::new(old.node_id, old.deployment.clone())))
            .collect();

        let reverted = self
            .apply(cancel, &mut revert_ids, &previous, &mut hints, &mut warnings)
            .await;
        for k in &untouched {
            if let Some(id) = ids.get(k) {
                revert_ids.insert(*k, *id);
            }
        }

        match reverted {
            Ok(()) => {
                info!(deployments = revert_ids.len(), "previous state restored");
                Err(ReconcileFailure {
                    ids: revert_ids,
                    error: err.into(),
                    warnings,
                })
            }
            Err(revert) => {
                SharedMetrics::inc(&self.metrics.revert_failures_total);
                warn!(error = %revert, "revert failed");
                Err(ReconcileFailure {
                    ids: revert_ids,
                    error: ReconcileError::RevertFailed {
                        original: Box::new(err.into()),
                        revert: Box::new(revert.into()),
                    },
                    warnings,
                })
            }
        }
    }

    /// One pass over the key space. `ids` is kept accurate as keys are
    /// created, updated and deleted, including on failure.
    async fn apply(
        &self,
        cancel: &CancellationToken,
        ids: &mut BTreeMap<CapacityId, ContractId>,
        desired: &BTreeMap<CapacityId, PlannedDeployment>,
        hints: &mut BTreeMap<CapacityId, NodeId>,
        warnings: &mut Vec<SoftFailure>,
    ) -> Result<(), DeployError> {
        let op = Operator {
            clients: &self.clients,
            identity: &self.identity,
            config: &self.config,
            metrics: &self.metrics,
            cancel,
        };

        let creates: Vec<(CapacityId, &PlannedDeployment)> = desired
            .iter()
            .filter(|(k, _)| !ids.contains_key(*k))
            .map(|(k, p)| (*k, p))
            .collect();
        let updates: Vec<(CapacityId, ContractId, &PlannedDeployment)> = desired
            .iter()
            .filter_map(|(k, p)| ids.get(k).map(|id| (*k, *id, p)))
            .collect();
        let deletes: Vec<(CapacityId, ContractId)> = ids
            .iter()
            .filter(|(k, _)| !desired.contains_key(*k))
            .map(|(k, id)| (*k, *id))
            .collect();

        for (capacity_id, planned) in creates {
            hints.insert(capacity_id, planned.node_id);
            match op.create(capacity_id, planned).await {
                Ok(deployment_id) => {
                    ids.insert(capacity_id, deployment_id);
                }
                Err(e) => {
                    if let Some(deployment_id) = e.deployment_id() {
                        ids.insert(capacity_id, deployment_id);
                    }
                    return Err(e);
                }
            }
        }

        for (capacity_id, deployment_id, planned) in updates {
            let node_id = hints.get(&capacity_id).copied().unwrap_or(planned.node_id);
            let updated = op
                .update(capacity_id, node_id, deployment_id, planned)
                .await?;
            ids.insert(capacity_id, updated);
        }

        for (capacity_id, deployment_id) in deletes {
            let warning = op
                .delete(capacity_id, deployment_id, hints.get(&capacity_id).copied())
                .await?;
            ids.remove(&capacity_id);
            if let Some(w) = warning {
                SharedMetrics::inc(&self.metrics.soft_failures_total);
                warnings.push(w);
            }
        }

        Ok(())
    }

    async fn read_old(
        &self,
        cancel: &CancellationToken,
        old_ids: &BTreeMap<CapacityId, ContractId>,
    ) -> ReadBack {
        let reads = old_ids.iter().map(|(capacity_id, deployment_id)| async move {
            let res = self.read_one(cancel, *capacity_id, *deployment_id).await;
            (*capacity_id, *deployment_id, res)
        });

        let mut read = ReadBack {
            complete: true,
            ..ReadBack::default()
        };
        for (capacity_id, deployment_id, res) in join_all(reads).await {
            match res {
                Ok(observed) => {
                    read.observed.insert(capacity_id, observed);
                }
                Err(e) => {
                    read.complete = false;
                    read.warnings.push(SoftFailure::ReadOld {
                        capacity_id,
                        deployment_id,
                        message: e.to_string(),
                    });
                }
            }
        }
        read
    }

    async fn read_one(
        &self,
        cancel: &CancellationToken,
        capacity_id: CapacityId,
        deployment_id: ContractId,
    ) -> Result<ObservedDeployment, DeployError> {
        let chain_error = |source: anyhow::Error| DeployError::Chain {
            phase: Phase::Read,
            capacity_id,
            node_id: 0,
            deployment_id: Some(deployment_id),
            source,
        };
        let cancelled = || DeployError::Cancelled {
            phase: Phase::Read,
            capacity_id: Some(capacity_id),
            deployment_id: Some(deployment_id),
        };

        let contract = match bounded(
            cancel,
            self.config.chain_call_timeout(),
            self.clients.chain.get_contract(deployment_id),
        )
        .await
        {
            Ok(Some(contract)) => contract,
            Ok(None) => {
                return Err(chain_error(anyhow::anyhow!(
                    "contract {deployment_id} does not exist"
                )))
            }
            Err(CallError::Cancelled) => return Err(cancelled()),
            Err(e) => return Err(chain_error(e.into_anyhow())),
        };

        let node_id = contract.node_id;
        let node_error = |source: anyhow::Error| DeployError::Node {
            phase: Phase::Read,
            capacity_id,
            node_id,
            deployment_id: Some(deployment_id),
            source,
        };
        let timeout = self.config.node_call_timeout();

        let node = match bounded(cancel, timeout, self.clients.nodes.node_client(node_id)).await {
            Ok(node) => node,
            Err(CallError::Cancelled) => return Err(cancelled()),
            Err(e) => return Err(node_error(e.into_anyhow())),
        };
        let deployment = match bounded(cancel, timeout, node.deployment_get(deployment_id)).await {
            Ok(deployment) => deployment,
            Err(CallError::Cancelled) => return Err(cancelled()),
            Err(e) => return Err(node_error(e.into_anyhow())),
        };

        Ok(ObservedDeployment {
            node_id,
            public_ips: contract.public_ips,
            deployment,
        })
    }
}
