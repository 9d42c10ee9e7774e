pub mod capacity;
pub mod contract;
pub mod deployment;
pub mod directory;
pub mod hash;
pub mod workload;

pub use capacity::Capacity;
pub use contract::{ContractRequest, ContractState, ContractUpdate, NodeContract};
pub use deployment::{
    Deployment, PlannedDeployment, Signature, SignatureRequest, SignatureRequirement,
    ValidationError,
};
pub use directory::{FarmInfo, FarmPublicIp, NodeInfo, PublicConfig};
pub use hash::{
    deployment_hash, same_workload_names, workload_hash, workload_hashes, workload_versions,
    HashError,
};
pub use workload::*;

pub mod telemetry;

pub type NodeId = u32;
pub type FarmId = u32;
pub type TwinId = u32;
/// Chain id of a deployment's node contract; doubles as the deployment id.
pub type ContractId = u64;
/// Caller-side key of a capacity reservation; stable across reconciliations.
pub type CapacityId = u64;
