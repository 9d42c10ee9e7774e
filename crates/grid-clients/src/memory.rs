//! In-memory chain, capacity directory and node fleet.
//!
//! Nodes apply deployments synchronously and report results on the next
//! `deployment_changes` poll. Behaviour knobs let tests script node failures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::sync::Mutex;
use tracing::debug;

use grid_common::{
    deployment_hash, ContractId, ContractRequest, ContractState, ContractUpdate, Deployment,
    FarmId, FarmInfo, NodeContract, NodeId, NodeInfo, ResultState, Workload, WorkloadResult,
};

use crate::identity::Identity;
use crate::types::{CapacityDirectory, ChainClient, GridClients, NodeClient, NodePool};

/// Number of calls made against the grid, per method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create_contract: usize,
    pub update_contract: usize,
    pub cancel_contract: usize,
    pub get_contract: usize,
    pub deployment_deploy: usize,
    pub deployment_update: usize,
    pub deployment_delete: usize,
    pub deployment_get: usize,
    pub deployment_changes: usize,
    pub directory_node: usize,
    pub directory_farm: usize,
}

impl CallCounts {
    /// Calls that change chain or node state.
    pub fn mutating(&self) -> usize {
        self.create_contract
            + self.update_contract
            + self.cancel_contract
            + self.deployment_deploy
            + self.deployment_update
            + self.deployment_delete
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeBehavior {
    /// Every RPC to the node fails.
    pub unreachable: bool,
    pub fail_deploy: bool,
    pub fail_update: bool,
    pub fail_delete: bool,
    /// Applied workloads never leave `Unset`.
    pub never_converge: bool,
    /// Reported result for specific workloads instead of `Ok`.
    pub workload_states: BTreeMap<String, (ResultState, String)>,
}

impl NodeBehavior {
    fn result_for(&self, name: &str) -> WorkloadResult {
        if self.never_converge {
            return WorkloadResult::default();
        }
        match self.workload_states.get(name) {
            Some((state, message)) => WorkloadResult {
                state: *state,
                message: message.clone(),
                data: None,
            },
            None => WorkloadResult {
                state: ResultState::Ok,
                ..WorkloadResult::default()
            },
        }
    }
}

#[derive(Debug)]
struct MemoryNode {
    info: NodeInfo,
    deployments: BTreeMap<ContractId, Deployment>,
    behavior: NodeBehavior,
}

#[derive(Debug, Default)]
struct Inner {
    last_contract_id: ContractId,
    contracts: BTreeMap<ContractId, NodeContract>,
    nodes: BTreeMap<NodeId, MemoryNode>,
    farms: BTreeMap<FarmId, FarmInfo>,
    calls: CallCounts,
    fail_cancel: BTreeSet<ContractId>,
    fail_create_contract: bool,
}

impl Inner {
    fn node_mut(&mut self, node_id: NodeId) -> Result<&mut MemoryNode> {
        self.nodes
            .get_mut(&node_id)
            .ok_or_else(|| anyhow!("node {node_id} not found"))
    }

    /// Contracts that were not cancelled.
    fn live_contract(&self, contract_id: ContractId) -> Option<&NodeContract> {
        self.contracts
            .get(&contract_id)
            .filter(|c| c.state == ContractState::Created)
    }

    fn check_contract(&self, node_id: NodeId, deployment: &Deployment) -> Result<()> {
        let contract = self
            .live_contract(deployment.contract_id)
            .ok_or_else(|| anyhow!("contract {} not found", deployment.contract_id))?;
        if contract.node_id != node_id {
            bail!(
                "contract {} belongs to node {}, not {node_id}",
                contract.contract_id,
                contract.node_id
            );
        }
        let hash = deployment_hash(deployment)?;
        if contract.deployment_hash != hash {
            bail!("deployment hash does not match contract {}", contract.contract_id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryGrid {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trait-object bundle backed by this grid.
    pub fn clients(&self) -> GridClients {
        GridClients::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    pub async fn add_farm(&self, farm: FarmInfo) {
        self.inner.lock().await.farms.insert(farm.farm_id, farm);
    }

    pub async fn add_node(&self, info: NodeInfo) {
        let node = MemoryNode {
            info,
            deployments: BTreeMap::new(),
            behavior: NodeBehavior::default(),
        };
        self.inner.lock().await.nodes.insert(node.info.node_id, node);
    }

    pub async fn set_behavior(&self, node_id: NodeId, behavior: NodeBehavior) {
        if let Some(node) = self.inner.lock().await.nodes.get_mut(&node_id) {
            node.behavior = behavior;
        }
    }

    pub async fn fail_cancel(&self, contract_id: ContractId) {
        self.inner.lock().await.fail_cancel.insert(contract_id);
    }

    pub async fn set_fail_create_contract(&self, fail: bool) {
        self.inner.lock().await.fail_create_contract = fail;
    }

    pub async fn calls(&self) -> CallCounts {
        self.inner.lock().await.calls
    }

    pub async fn reset_calls(&self) {
        self.inner.lock().await.calls = CallCounts::default();
    }

    /// Live contract by id; cancelled contracts are `None`.
    pub async fn contract(&self, contract_id: ContractId) -> Option<NodeContract> {
        self.inner.lock().await.live_contract(contract_id).cloned()
    }

    /// State of any contract ever created, including cancelled ones.
    pub async fn contract_state(&self, contract_id: ContractId) -> Option<ContractState> {
        let inner = self.inner.lock().await;
        inner.contracts.get(&contract_id).map(|c| c.state)
    }

    pub async fn deployment(&self, node_id: NodeId, contract_id: ContractId) -> Option<Deployment> {
        let inner = self.inner.lock().await;
        inner
            .nodes
            .get(&node_id)
            .and_then(|n| n.deployments.get(&contract_id))
            .cloned()
    }

    pub async fn node_info(&self, node_id: NodeId) -> Option<NodeInfo> {
        let inner = self.inner.lock().await;
        inner.nodes.get(&node_id).map(|n| n.info.clone())
    }
}

#[async_trait::async_trait]
impl ChainClient for MemoryGrid {
    async fn create_node_contract(
        &self,
        identity: &Identity,
        request: ContractRequest,
    ) -> Result<ContractId> {
        let mut inner = self.inner.lock().await;
        inner.calls.create_contract += 1;
        if inner.fail_create_contract {
            bail!("chain rejected contract creation");
        }

        let farm_id = inner.node_mut(request.node_id)?.info.farm_id;
        let contract_id = inner.last_contract_id + 1;

        if request.public_ips > 0 {
            let farm = inner
                .farms
                .get_mut(&farm_id)
                .ok_or_else(|| anyhow!("farm {farm_id} not found"))?;
            if farm.free_public_ips() < request.public_ips {
                bail!("farm {farm_id} has not enough free public ips");
            }
            farm.public_ips
                .iter_mut()
                .filter(|ip| ip.contract_id == 0)
                .take(request.public_ips as usize)
                .for_each(|ip| ip.contract_id = contract_id);
        }

        inner.last_contract_id = contract_id;
        inner.contracts.insert(
            contract_id,
            NodeContract {
                contract_id,
                capacity_id: request.capacity_id,
                node_id: request.node_id,
                twin_id: identity.twin_id(),
                deployment_hash: request.hash,
                deployment_data: request.metadata,
                capacity: request.capacity,
                public_ips: request.public_ips,
                state: ContractState::Created,
            },
        );
        debug!(contract_id, "memory contract created");
        Ok(contract_id)
    }

    async fn update_node_contract(
        &self,
        identity: &Identity,
        contract_id: ContractId,
        update: ContractUpdate,
    ) -> Result<ContractId> {
        let mut inner = self.inner.lock().await;
        inner.calls.update_contract += 1;
        let contract = inner
            .contracts
            .get_mut(&contract_id)
            .filter(|c| c.state == ContractState::Created)
            .ok_or_else(|| anyhow!("contract {contract_id} not found"))?;
        if contract.twin_id != identity.twin_id() {
            bail!("twin {} does not own contract {contract_id}", identity.twin_id());
        }
        contract.deployment_hash = update.hash;
        contract.deployment_data = update.metadata;
        contract.capacity = update.capacity;
        Ok(contract_id)
    }

    async fn cancel_contract(&self, identity: &Identity, contract_id: ContractId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.cancel_contract += 1;
        if inner.fail_cancel.contains(&contract_id) {
            bail!("chain rejected cancellation of contract {contract_id}");
        }
        let Some(contract) = inner.live_contract(contract_id) else {
            return Ok(());
        };
        if contract.twin_id != identity.twin_id() {
            bail!("twin {} does not own contract {contract_id}", identity.twin_id());
        }
        if let Some(contract) = inner.contracts.get_mut(&contract_id) {
            contract.state = ContractState::Deleted;
        }
        for farm in inner.farms.values_mut() {
            for ip in farm.public_ips.iter_mut().filter(|ip| ip.contract_id == contract_id) {
                ip.contract_id = 0;
            }
        }
        Ok(())
    }

    async fn get_contract(&self, contract_id: ContractId) -> Result<Option<NodeContract>> {
        let mut inner = self.inner.lock().await;
        inner.calls.get_contract += 1;
        Ok(inner.live_contract(contract_id).cloned())
    }
}

#[async_trait::async_trait]
impl CapacityDirectory for MemoryGrid {
    async fn node(&self, node_id: NodeId) -> Result<NodeInfo> {
        let mut inner = self.inner.lock().await;
        inner.calls.directory_node += 1;
        Ok(inner.node_mut(node_id)?.info.clone())
    }

    async fn farm(&self, farm_id: FarmId) -> Result<FarmInfo> {
        let mut inner = self.inner.lock().await;
        inner.calls.directory_farm += 1;
        inner
            .farms
            .get(&farm_id)
            .cloned()
            .ok_or_else(|| anyhow!("farm {farm_id} not found"))
    }
}

#[async_trait::async_trait]
impl NodePool for MemoryGrid {
    async fn node_client(&self, node_id: NodeId) -> Result<Arc<dyn NodeClient>> {
        if !self.inner.lock().await.nodes.contains_key(&node_id) {
            bail!("no route to node {node_id}");
        }
        Ok(Arc::new(MemoryNodeClient {
            grid: self.clone(),
            node_id,
        }))
    }
}

/// Client for one node of a [`MemoryGrid`].
#[derive(Debug, Clone)]
pub struct MemoryNodeClient {
    grid: MemoryGrid,
    node_id: NodeId,
}

#[async_trait::async_trait]
impl NodeClient for MemoryNodeClient {
    async fn deployment_deploy(&self, deployment: &Deployment) -> Result<()> {
        let mut inner = self.grid.inner.lock().await;
        inner.calls.deployment_deploy += 1;
        inner.check_contract(self.node_id, deployment)?;

        let node = inner.node_mut(self.node_id)?;
        if node.behavior.unreachable || node.behavior.fail_deploy {
            bail!("node {} failed to deploy", self.node_id);
        }
        if node.deployments.contains_key(&deployment.contract_id) {
            bail!("deployment {} already exists", deployment.contract_id);
        }

        let mut stored = deployment.clone();
        for w in stored.workloads.iter_mut() {
            w.result = node.behavior.result_for(&w.name);
        }
        node.info.used += stored.capacity();
        debug!(node_id = self.node_id, contract_id = stored.contract_id, "memory deployment stored");
        node.deployments.insert(stored.contract_id, stored);
        Ok(())
    }

    async fn deployment_update(&self, deployment: &Deployment) -> Result<()> {
        let mut inner = self.grid.inner.lock().await;
        inner.calls.deployment_update += 1;
        inner.check_contract(self.node_id, deployment)?;

        let node = inner.node_mut(self.node_id)?;
        if node.behavior.unreachable || node.behavior.fail_update {
            bail!("node {} failed to update", self.node_id);
        }
        let current = node
            .deployments
            .get(&deployment.contract_id)
            .ok_or_else(|| anyhow!("deployment {} not found", deployment.contract_id))?;
        if deployment.version <= current.version {
            bail!(
                "deployment version {} is not newer than {}",
                deployment.version,
                current.version
            );
        }

        let mut stored = deployment.clone();
        for w in stored.workloads.iter_mut() {
            let previous = current.workload(&w.name);
            w.result = match previous {
                Some(prev) if w.version != deployment.version => prev.result.clone(),
                _ => node.behavior.result_for(&w.name),
            };
        }
        node.info.used = node.info.used.saturating_sub(&current.capacity()) + stored.capacity();
        node.deployments.insert(stored.contract_id, stored);
        Ok(())
    }

    async fn deployment_delete(&self, contract_id: ContractId) -> Result<()> {
        let mut inner = self.grid.inner.lock().await;
        inner.calls.deployment_delete += 1;
        let node = inner.node_mut(self.node_id)?;
        if node.behavior.unreachable || node.behavior.fail_delete {
            bail!("node {} failed to delete deployment {contract_id}", self.node_id);
        }
        if let Some(removed) = node.deployments.remove(&contract_id) {
            node.info.used = node.info.used.saturating_sub(&removed.capacity());
        }
        Ok(())
    }

    async fn deployment_get(&self, contract_id: ContractId) -> Result<Deployment> {
        let mut inner = self.grid.inner.lock().await;
        inner.calls.deployment_get += 1;
        let node = inner.node_mut(self.node_id)?;
        if node.behavior.unreachable {
            bail!("node {} is unreachable", self.node_id);
        }
        node.deployments
            .get(&contract_id)
            .cloned()
            .ok_or_else(|| anyhow!("deployment {contract_id} not found on node {}", self.node_id))
    }

    async fn deployment_changes(&self, contract_id: ContractId) -> Result<Vec<Workload>> {
        let mut inner = self.grid.inner.lock().await;
        inner.calls.deployment_changes += 1;
        let node = inner.node_mut(self.node_id)?;
        if node.behavior.unreachable {
            bail!("node {} is unreachable", self.node_id);
        }
        node.deployments
            .get(&contract_id)
            .map(|d| d.workloads.clone())
            .ok_or_else(|| anyhow!("deployment {contract_id} not found on node {}", self.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_common::{Capacity, DiskData, FarmPublicIp, WorkloadData};

    async fn grid() -> MemoryGrid {
        let grid = MemoryGrid::new();
        grid.add_farm(FarmInfo {
            farm_id: 1,
            public_ips: vec![FarmPublicIp {
                ip: "185.1.1.10/24".to_string(),
                gateway: "185.1.1.1".to_string(),
                contract_id: 0,
            }],
        })
        .await;
        grid.add_node(NodeInfo {
            node_id: 11,
            farm_id: 1,
            twin_id: 111,
            total: Capacity { cru: 8, mru: 1 << 34, sru: 1 << 40, hru: 1 << 40 },
            used: Capacity::default(),
            public_config: None,
        })
        .await;
        grid
    }

    fn request(hash: String, public_ips: u32) -> ContractRequest {
        ContractRequest {
            node_id: 11,
            capacity_id: 1,
            metadata: String::new(),
            hash,
            capacity: Capacity::default(),
            public_ips,
        }
    }

    #[tokio::test]
    async fn contract_lifecycle_reserves_and_releases_ips() {
        let grid = grid().await;
        let id = Identity::from_seed(7, [1u8; 32]);

        let contract_id = grid.create_node_contract(&id, request("h".into(), 1)).await.unwrap();
        assert_eq!(contract_id, 1);
        assert_eq!(grid.farm(1).await.unwrap().free_public_ips(), 0);
        assert!(grid.create_node_contract(&id, request("h".into(), 1)).await.is_err());

        grid.cancel_contract(&id, contract_id).await.unwrap();
        assert_eq!(grid.farm(1).await.unwrap().free_public_ips(), 1);
        assert!(grid.get_contract(contract_id).await.unwrap().is_none());
        assert_eq!(grid.contract_state(contract_id).await, Some(ContractState::Deleted));
        assert!(grid
            .update_node_contract(
                &id,
                contract_id,
                ContractUpdate {
                    metadata: String::new(),
                    hash: "h2".into(),
                    capacity: Capacity::default(),
                },
            )
            .await
            .is_err());

        // already gone
        grid.cancel_contract(&id, contract_id).await.unwrap();
    }

    #[tokio::test]
    async fn node_checks_contract_hash() {
        let grid = grid().await;
        let id = Identity::from_seed(7, [1u8; 32]);
        let mut dl = Deployment::new(
            7,
            vec![Workload::new("d", WorkloadData::Disk(DiskData { size: 1 << 30 }))],
        );
        let hash = deployment_hash(&dl).unwrap();
        dl.contract_id = grid.create_node_contract(&id, request(hash, 0)).await.unwrap();

        let node = grid.node_client(11).await.unwrap();
        node.deployment_deploy(&dl).await.unwrap();
        let changes = node.deployment_changes(dl.contract_id).await.unwrap();
        assert_eq!(changes[0].result.state, ResultState::Ok);
        assert_eq!(grid.node_info(11).await.unwrap().used.sru, 1 << 30);

        let mut tampered = dl.clone();
        tampered.metadata = "changed".to_string();
        assert!(node.deployment_update(&tampered).await.is_err());
        assert_eq!(grid.calls().await.deployment_deploy, 1);
    }

    #[tokio::test]
    async fn unknown_node_has_no_route() {
        let grid = grid().await;
        assert!(grid.node_client(99).await.is_err());
    }
}
