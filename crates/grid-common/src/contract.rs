use serde::{Deserialize, Serialize};

use crate::capacity::Capacity;
use crate::{CapacityId, ContractId, NodeId, TwinId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Created,
    /// Cancelled; the record is kept but no longer binds a deployment.
    Deleted,
}

/// Chain record binding a deployment to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeContract {
    pub contract_id: ContractId,
    pub capacity_id: CapacityId,
    pub node_id: NodeId,
    pub twin_id: TwinId,
    pub deployment_hash: String,
    #[serde(default)]
    pub deployment_data: String,
    pub capacity: Capacity,
    /// Public IPv4 addresses reserved from the node's farm.
    #[serde(default)]
    pub public_ips: u32,
    pub state: ContractState,
}

/// Arguments of a contract creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractRequest {
    pub node_id: NodeId,
    pub capacity_id: CapacityId,
    pub metadata: String,
    pub hash: String,
    pub capacity: Capacity,
    pub public_ips: u32,
}

/// Arguments of a contract update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractUpdate {
    pub metadata: String,
    pub hash: String,
    pub capacity: Capacity,
}
