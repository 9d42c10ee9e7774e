use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

use grid_common::deployment::SIGNATURE_TYPE_ED25519;
use grid_common::{deployment_hash, Deployment, HashError, Signature, TwinId};

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid ed25519 seed: {0}")]
    InvalidSeed(String),

    #[error("twin {0} is not a requested signer of this deployment")]
    NotRequested(TwinId),

    #[error("deployment has no signature from twin {0}")]
    MissingSignature(TwinId),

    #[error("signature from twin {0} does not verify")]
    BadSignature(TwinId),

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Owning identity of deployments and contracts: a twin and its ed25519 key.
#[derive(Clone)]
pub struct Identity {
    twin_id: TwinId,
    key: SigningKey,
}

impl Identity {
    pub fn from_seed(twin_id: TwinId, seed: [u8; 32]) -> Self {
        Self {
            twin_id,
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a hex encoded 32-byte seed.
    pub fn from_hex_seed(twin_id: TwinId, seed: &str) -> Result<Self, SignError> {
        let bytes = hex::decode(seed.trim_start_matches("0x"))
            .map_err(|e| SignError::InvalidSeed(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| SignError::InvalidSeed(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self::from_seed(twin_id, seed))
    }

    pub fn twin_id(&self) -> TwinId {
        self.twin_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Sign the deployment hash and record the signature, replacing any earlier
    /// signature by this twin. Safe to call again after a version bump.
    pub fn sign(&self, deployment: &mut Deployment) -> Result<(), SignError> {
        let requested = deployment
            .signature_requirement
            .requests
            .iter()
            .any(|r| r.twin_id == self.twin_id);
        if !requested {
            return Err(SignError::NotRequested(self.twin_id));
        }

        let hash = deployment_hash(deployment)?;
        let signature = self.key.sign(hash.as_bytes());

        let signatures = &mut deployment.signature_requirement.signatures;
        signatures.retain(|s| s.twin_id != self.twin_id);
        signatures.push(Signature {
            twin_id: self.twin_id,
            signature: hex::encode(signature.to_bytes()),
            signature_type: SIGNATURE_TYPE_ED25519.to_string(),
        });
        Ok(())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("twin_id", &self.twin_id)
            .field("public_key", &hex::encode(self.key.verifying_key().as_bytes()))
            .finish()
    }
}

/// Check the signature `twin_id` left on `deployment`.
pub fn verify(deployment: &Deployment, twin_id: TwinId, key: &VerifyingKey) -> Result<(), SignError> {
    let sig = deployment
        .signature_requirement
        .signatures
        .iter()
        .find(|s| s.twin_id == twin_id)
        .ok_or(SignError::MissingSignature(twin_id))?;

    let bytes: [u8; 64] = hex::decode(&sig.signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(SignError::BadSignature(twin_id))?;
    let signature = ed25519_dalek::Signature::from_bytes(&bytes);

    let hash = deployment_hash(deployment)?;
    key.verify(hash.as_bytes(), &signature)
        .map_err(|_| SignError::BadSignature(twin_id))
}
