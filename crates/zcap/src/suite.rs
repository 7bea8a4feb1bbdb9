//! External collaborators.
//!
//! The engine never encodes, signs, resolves keys, or stores anything
//! itself. Those concerns are injected through the traits below, so that a
//! deployment can plug in its own signature suite, DID resolver and
//! revocation service, and tests can plug in fakes.

use crate::error::BoxError;
use crate::{Capability, Proof};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Produces the deterministic byte form that proofs sign.
pub trait Canonicalizer: Send + Sync {
    fn canonicalize(&self, document: &Value) -> Result<Vec<u8>, BoxError>;
}

/// Creates proof values.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Proof `type` written into proofs produced by this signer.
    fn proof_type(&self) -> &str;

    /// Sign `data` with the key identified by `verification_method`.
    async fn sign(&self, data: &[u8], verification_method: &str) -> Result<String, BoxError>;
}

/// A resolved public key and the principal that controls it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationKey {
    /// Verification method URI.
    pub id: String,
    /// Principal the key belongs to.
    pub controller: String,
    pub public_key: Vec<u8>,
}

/// Resolves verification method URIs to keys.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, verification_method: &str) -> Result<VerificationKey, BoxError>;
}

/// Checks proof values.
pub trait ProofVerifier: Send + Sync {
    fn verify(&self, data: &[u8], proof: &Proof, key: &VerificationKey) -> bool;
}

/// External revocation veto, keyed by capability id.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn is_revoked(&self, capability_id: &str) -> Result<bool, BoxError>;
}

/// Fetches capabilities referenced by id only (typically roots).
#[async_trait]
pub trait CapabilityLoader: Send + Sync {
    async fn load(&self, capability_id: &str) -> Result<Option<Capability>, BoxError>;
}

/// The collaborators a verifier consults.
#[derive(Clone)]
pub struct Collaborators {
    pub canonicalizer: Arc<dyn Canonicalizer>,
    pub keys: Arc<dyn KeyResolver>,
    pub proofs: Arc<dyn ProofVerifier>,
    pub revocations: Arc<dyn RevocationStore>,
    pub loader: Arc<dyn CapabilityLoader>,
}

/// A revocation store in which nothing is ever revoked.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRevoked;

#[async_trait]
impl RevocationStore for NeverRevoked {
    async fn is_revoked(&self, _capability_id: &str) -> Result<bool, BoxError> {
        Ok(false)
    }
}

/// In-memory revocation set.
#[derive(Debug, Default)]
pub struct MemoryRevocationStore {
    revoked: RwLock<HashSet<String>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn revoke(&self, capability_id: impl Into<String>) {
        self.revoked.write().await.insert(capability_id.into());
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn is_revoked(&self, capability_id: &str) -> Result<bool, BoxError> {
        Ok(self.revoked.read().await.contains(capability_id))
    }
}

/// In-memory capability lookup.
#[derive(Debug, Default)]
pub struct MemoryCapabilityLoader {
    capabilities: RwLock<HashMap<String, Capability>>,
}

impl MemoryCapabilityLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, capability: Capability) {
        self.capabilities
            .write()
            .await
            .insert(capability.id.clone(), capability);
    }
}

#[async_trait]
impl CapabilityLoader for MemoryCapabilityLoader {
    async fn load(&self, capability_id: &str) -> Result<Option<Capability>, BoxError> {
        Ok(self.capabilities.read().await.get(capability_id).cloned())
    }
}
