//! Content hashes used to decide whether a deployment or a workload changed.
//!
//! These digests are equality checks, not security primitives. Signatures are
//! computed over [`deployment_hash`].

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::deployment::{Deployment, SignatureRequest};
use crate::workload::{Workload, WorkloadData, WorkloadType};
use crate::TwinId;

#[derive(Debug, Error)]
#[error("failed to encode {what} for hashing: {source}")]
pub struct HashError {
    what: String,
    #[source]
    source: serde_json::Error,
}

#[derive(Serialize)]
struct WorkloadContent<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: WorkloadType,
    metadata: &'a str,
    description: &'a str,
    data: &'a WorkloadData,
}

impl<'a> From<&'a Workload> for WorkloadContent<'a> {
    fn from(w: &'a Workload) -> Self {
        Self {
            name: &w.name,
            kind: w.workload_type(),
            metadata: &w.metadata,
            description: &w.description,
            data: &w.data,
        }
    }
}

#[derive(Serialize)]
struct VersionedWorkload<'a> {
    version: u32,
    content: WorkloadContent<'a>,
}

#[derive(Serialize)]
struct DeploymentContent<'a> {
    version: u32,
    twin_id: TwinId,
    metadata: &'a str,
    description: &'a str,
    expiration: u64,
    signers: &'a [SignatureRequest],
    weight_required: u32,
    workloads: Vec<VersionedWorkload<'a>>,
}

impl HashError {
    pub fn new(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self {
            what: what.into(),
            source,
        }
    }
}

fn digest<T: Serialize>(what: impl Into<String>, value: &T) -> Result<String, HashError> {
    let bytes = serde_json::to_vec(value).map_err(|source| HashError::new(what, source))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hash over the deployment version, owner, metadata, signer set and every
/// workload including its version. Signatures, node results and the contract id
/// are left out so the hash can be signed before the contract exists.
pub fn deployment_hash(deployment: &Deployment) -> Result<String, HashError> {
    let content = DeploymentContent {
        version: deployment.version,
        twin_id: deployment.twin_id,
        metadata: &deployment.metadata,
        description: &deployment.description,
        expiration: deployment.expiration,
        signers: &deployment.signature_requirement.requests,
        weight_required: deployment.signature_requirement.weight_required,
        workloads: deployment
            .workloads
            .iter()
            .map(|w| VersionedWorkload {
                version: w.version,
                content: w.into(),
            })
            .collect(),
    };
    digest("deployment", &content)
}

/// Content hash of one workload. The version is not part of the content.
pub fn workload_hash(workload: &Workload) -> Result<String, HashError> {
    digest(
        format!("workload {}", workload.name),
        &WorkloadContent::from(workload),
    )
}

pub fn workload_hashes(deployment: &Deployment) -> Result<BTreeMap<String, String>, HashError> {
    deployment
        .workloads
        .iter()
        .map(|w| Ok((w.name.clone(), workload_hash(w)?)))
        .collect()
}

pub fn workload_versions(deployment: &Deployment) -> BTreeMap<String, u32> {
    deployment
        .workloads
        .iter()
        .map(|w| (w.name.clone(), w.version))
        .collect()
}

/// True when both deployments carry the same multiset of workload names.
pub fn same_workload_names(a: &Deployment, b: &Deployment) -> bool {
    let mut left: Vec<&str> = a.workloads.iter().map(|w| w.name.as_str()).collect();
    let mut right: Vec<&str> = b.workloads.iter().map(|w| w.name.as_str()).collect();
    left.sort_unstable();
    right.sort_unstable();
    left == right
}
