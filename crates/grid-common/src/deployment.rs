use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capacity::Capacity;
use crate::workload::{Workload, WorkloadData, WorkloadType};
use crate::{ContractId, NodeId, TwinId};

pub const SIGNATURE_TYPE_ED25519: &str = "ed25519";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureRequest {
    pub twin_id: TwinId,
    #[serde(default)]
    pub required: bool,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    pub twin_id: TwinId,
    /// Hex encoded.
    pub signature: String,
    pub signature_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureRequirement {
    #[serde(default)]
    pub requests: Vec<SignatureRequest>,
    #[serde(default)]
    pub weight_required: u32,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

impl SignatureRequirement {
    /// A single signer that alone satisfies the requirement.
    pub fn single(twin_id: TwinId) -> Self {
        Self {
            requests: vec![SignatureRequest {
                twin_id,
                required: false,
                weight: 1,
            }],
            weight_required: 1,
            signatures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("deployment has no workloads")]
    Empty,

    #[error("workload name is empty")]
    EmptyName,

    #[error("duplicate workload name {0:?}")]
    DuplicateName(String),

    #[error("workload {name:?} is invalid: {reason}")]
    Workload { name: String, reason: String },

    #[error("workload {name:?} references missing {kind} workload {target:?}")]
    MissingReference {
        name: String,
        kind: WorkloadType,
        target: String,
    },

    #[error("signature requirement has no requests")]
    NoSigners,

    #[error("signature requirement weight {required} is unreachable (total weight {total})")]
    UnreachableWeight { required: u32, total: u64 },
}

/// The unit of submission to one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    /// Chain-assigned id; 0 until the contract exists.
    #[serde(default)]
    pub contract_id: ContractId,

    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub twin_id: TwinId,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub expiration: u64,

    #[serde(default)]
    pub signature_requirement: SignatureRequirement,

    #[serde(default)]
    pub workloads: Vec<Workload>,
}

impl Deployment {
    pub fn new(twin_id: TwinId, workloads: Vec<Workload>) -> Self {
        Self {
            twin_id,
            signature_requirement: SignatureRequirement::single(twin_id),
            workloads,
            ..Self::default()
        }
    }

    pub fn workload(&self, name: &str) -> Option<&Workload> {
        self.workloads.iter().find(|w| w.name == name)
    }

    /// Total node resources reserved by every workload.
    pub fn capacity(&self) -> Capacity {
        self.workloads
            .iter()
            .fold(Capacity::default(), |acc, w| acc + w.data.capacity())
    }

    pub fn public_ipv4_count(&self) -> u32 {
        self.workloads.iter().map(|w| w.data.public_ipv4_count()).sum()
    }

    /// Structural well-formedness. Capacity is checked elsewhere.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workloads.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut names: BTreeMap<&str, WorkloadType> = BTreeMap::new();
        for w in &self.workloads {
            if w.name.is_empty() {
                return Err(ValidationError::EmptyName);
            }
            if names.insert(w.name.as_str(), w.workload_type()).is_some() {
                return Err(ValidationError::DuplicateName(w.name.clone()));
            }
            w.data.validate().map_err(|reason| ValidationError::Workload {
                name: w.name.clone(),
                reason,
            })?;
        }

        let expect = |name: &str, kind: WorkloadType, target: &str| {
            if names.get(target) == Some(&kind) {
                Ok(())
            } else {
                Err(ValidationError::MissingReference {
                    name: name.to_string(),
                    kind,
                    target: target.to_string(),
                })
            }
        };

        for w in &self.workloads {
            match &w.data {
                WorkloadData::Vm(vm) => {
                    expect(&w.name, WorkloadType::Network, &vm.network)?;
                    if let Some(ip) = vm.public_ip.as_deref() {
                        expect(&w.name, WorkloadType::PublicIp, ip)?;
                    }
                    for mount in &vm.mounts {
                        expect(&w.name, WorkloadType::Disk, &mount.disk)?;
                    }
                }
                WorkloadData::LogShipper(logs) => {
                    expect(&w.name, WorkloadType::Vm, &logs.vm)?;
                }
                WorkloadData::Disk(_)
                | WorkloadData::Zdb(_)
                | WorkloadData::Qsfs(_)
                | WorkloadData::GatewayName(_)
                | WorkloadData::GatewayFqdn(_)
                | WorkloadData::Network(_)
                | WorkloadData::PublicIp(_) => {}
            }
        }

        let req = &self.signature_requirement;
        if req.requests.is_empty() {
            return Err(ValidationError::NoSigners);
        }
        let total: u64 = req.requests.iter().map(|r| u64::from(r.weight)).sum();
        if req.weight_required == 0 || total < u64::from(req.weight_required) {
            return Err(ValidationError::UnreachableWeight {
                required: req.weight_required,
                total,
            });
        }

        Ok(())
    }
}

/// A desired deployment together with the node the scheduler picked for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedDeployment {
    pub node_id: NodeId,
    pub deployment: Deployment,
}

impl PlannedDeployment {
    pub fn new(node_id: NodeId, deployment: Deployment) -> Self {
        Self { node_id, deployment }
    }
}
