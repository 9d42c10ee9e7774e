use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use grid_common::{
    ContractId, ContractRequest, ContractUpdate, Deployment, FarmId, FarmInfo, NodeContract,
    NodeId, NodeInfo, Workload,
};

use crate::identity::Identity;

/// Contract CRUD on the chain. Every mutating call is signed by `identity`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn create_node_contract(
        &self,
        identity: &Identity,
        request: ContractRequest,
    ) -> Result<ContractId>;

    async fn update_node_contract(
        &self,
        identity: &Identity,
        contract_id: ContractId,
        update: ContractUpdate,
    ) -> Result<ContractId>;

    /// Cancelling a contract that no longer exists succeeds.
    async fn cancel_contract(&self, identity: &Identity, contract_id: ContractId) -> Result<()>;

    async fn get_contract(&self, contract_id: ContractId) -> Result<Option<NodeContract>>;
}

/// RPC surface of one node, reached over the message bus.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn deployment_deploy(&self, deployment: &Deployment) -> Result<()>;
    async fn deployment_update(&self, deployment: &Deployment) -> Result<()>;
    async fn deployment_delete(&self, contract_id: ContractId) -> Result<()>;
    async fn deployment_get(&self, contract_id: ContractId) -> Result<Deployment>;

    /// Current workloads of a deployment with their latest results.
    async fn deployment_changes(&self, contract_id: ContractId) -> Result<Vec<Workload>>;
}

/// Resolves a node id to a client for that node.
#[async_trait]
pub trait NodePool: Send + Sync {
    async fn node_client(&self, node_id: NodeId) -> Result<Arc<dyn NodeClient>>;
}

/// Read-only view of node capacity and farm IP inventory.
#[async_trait]
pub trait CapacityDirectory: Send + Sync {
    async fn node(&self, node_id: NodeId) -> Result<NodeInfo>;
    async fn farm(&self, farm_id: FarmId) -> Result<FarmInfo>;
}

/// The collaborators one reconciliation talks to.
#[derive(Clone)]
pub struct GridClients {
    pub chain: Arc<dyn ChainClient>,
    pub nodes: Arc<dyn NodePool>,
    pub directory: Arc<dyn CapacityDirectory>,
}

impl GridClients {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        nodes: Arc<dyn NodePool>,
        directory: Arc<dyn CapacityDirectory>,
    ) -> Self {
        Self {
            chain,
            nodes,
            directory,
        }
    }
}

impl std::fmt::Debug for GridClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridClients").finish_non_exhaustive()
    }
}
