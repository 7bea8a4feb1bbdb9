//! Test fixtures: an ed25519 suite, a sorted-key JSON canonicalizer and a
//! fixture that wires them to in-memory stores.

use crate::caveat::CaveatRegistry;
use crate::clock::FixedClock;
use crate::delegate::{Attenuation, ChainBuilder};
use crate::error::BoxError;
use crate::invoke::InvocationVerifier;
use crate::suite::{
    Canonicalizer, Collaborators, KeyResolver, MemoryCapabilityLoader, MemoryRevocationStore,
    ProofVerifier, Signer, VerificationKey,
};
use crate::verify::ChainVerifier;
use crate::{Capability, ChainLink, Proof, VerifierConfig};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) const TARGET: &str = "https://svc/res";

/// Principals `did:key:A` .. `did:key:L`.
const PRINCIPALS: &str = "ABCDEFGHIJKL";

/// Fixed reference instant, offset by whole hours.
pub(crate) fn at(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap() + TimeDelta::hours(hours)
}

pub(crate) fn principal(index: usize) -> String {
    format!("did:key:{}", &PRINCIPALS[index..=index])
}

pub(crate) fn vm(did: &str) -> String {
    format!("{did}#key-1")
}

/// serde_json maps are ordered, so plain serialization is deterministic.
pub(crate) struct JsonCanonicalizer;

impl Canonicalizer for JsonCanonicalizer {
    fn canonicalize(&self, document: &Value) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(document)?)
    }
}

pub(crate) struct Ed25519Suite {
    keys: HashMap<String, (String, SigningKey)>,
}

impl Ed25519Suite {
    fn new() -> Self {
        let keys = (0..PRINCIPALS.len())
            .map(|i| {
                let did = principal(i);
                let key = SigningKey::from_bytes(&[i as u8 + 1; 32]);
                (vm(&did), (did, key))
            })
            .collect();
        Self { keys }
    }

    fn key(&self, verification_method: &str) -> Result<&(String, SigningKey), BoxError> {
        self.keys
            .get(verification_method)
            .ok_or_else(|| format!("unknown verification method {verification_method}").into())
    }
}

#[async_trait]
impl Signer for Ed25519Suite {
    fn proof_type(&self) -> &str {
        "Ed25519Signature2020"
    }

    async fn sign(&self, data: &[u8], verification_method: &str) -> Result<String, BoxError> {
        let (_, key) = self.key(verification_method)?;
        Ok(hex::encode(key.sign(data).to_bytes()))
    }
}

#[async_trait]
impl KeyResolver for Ed25519Suite {
    async fn resolve(&self, verification_method: &str) -> Result<VerificationKey, BoxError> {
        let (controller, key) = self.key(verification_method)?;
        Ok(VerificationKey {
            id: verification_method.to_string(),
            controller: controller.clone(),
            public_key: key.verifying_key().to_bytes().to_vec(),
        })
    }
}

impl ProofVerifier for Ed25519Suite {
    fn verify(&self, data: &[u8], proof: &Proof, key: &VerificationKey) -> bool {
        let Some(Ok(signature)) = proof.proof_value.as_deref().map(hex::decode) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature) else {
            return false;
        };
        let Ok(public_key) = <[u8; 32]>::try_from(key.public_key.as_slice()) else {
            return false;
        };
        VerifyingKey::from_bytes(&public_key)
            .is_ok_and(|key| key.verify_strict(data, &signature).is_ok())
    }
}

pub(crate) struct FailingSigner;

#[async_trait]
impl Signer for FailingSigner {
    fn proof_type(&self) -> &str {
        "Ed25519Signature2020"
    }

    async fn sign(&self, _data: &[u8], _verification_method: &str) -> Result<String, BoxError> {
        Err("keystore unavailable".into())
    }
}

pub(crate) struct UnreachableResolver;

#[async_trait]
impl KeyResolver for UnreachableResolver {
    async fn resolve(&self, _verification_method: &str) -> Result<VerificationKey, BoxError> {
        Err("resolver unreachable".into())
    }
}

pub(crate) struct Fixture {
    pub suite: Arc<Ed25519Suite>,
    pub revocations: Arc<MemoryRevocationStore>,
    pub loader: Arc<MemoryCapabilityLoader>,
    pub caveats: Arc<CaveatRegistry>,
    /// Root over [`TARGET`] controlled by `did:key:A`.
    pub root: Capability,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_caveats(CaveatRegistry::default()).await
    }

    pub async fn with_caveats(caveats: CaveatRegistry) -> Self {
        let root = Capability::root(TARGET, principal(0));
        let loader = Arc::new(MemoryCapabilityLoader::new());
        loader.insert(root.clone()).await;

        Self {
            suite: Arc::new(Ed25519Suite::new()),
            revocations: Arc::new(MemoryRevocationStore::new()),
            loader,
            caveats: Arc::new(caveats),
            root,
        }
    }

    pub fn builder(&self) -> ChainBuilder {
        self.builder_at(at(0))
    }

    pub fn builder_at(&self, now: DateTime<Utc>) -> ChainBuilder {
        ChainBuilder::new(self.suite.clone(), Arc::new(JsonCanonicalizer))
            .with_caveats(self.caveats.clone())
            .with_clock(Arc::new(FixedClock(now)))
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            canonicalizer: Arc::new(JsonCanonicalizer),
            keys: self.suite.clone(),
            proofs: self.suite.clone(),
            revocations: self.revocations.clone(),
            loader: self.loader.clone(),
        }
    }

    pub fn verifier(&self) -> ChainVerifier {
        self.verifier_at(at(0))
    }

    pub fn verifier_at(&self, now: DateTime<Utc>) -> ChainVerifier {
        self.verifier_with(now, VerifierConfig::default())
    }

    pub fn verifier_with(&self, now: DateTime<Utc>, config: VerifierConfig) -> ChainVerifier {
        ChainVerifier::new(self.collaborators())
            .with_caveats(self.caveats.clone())
            .with_clock(Arc::new(FixedClock(now)))
            .with_config(config)
    }

    pub fn invocations_at(&self, now: DateTime<Utc>) -> InvocationVerifier {
        InvocationVerifier::new(self.verifier_at(now))
    }

    /// Delegate `parent` from `from` to `to`, panicking on failure.
    pub async fn delegate(
        &self,
        parent: &Capability,
        from: &str,
        to: &str,
        attenuation: Attenuation,
    ) -> Capability {
        self.builder()
            .delegate(parent, [to], &vm(from), attenuation)
            .await
            .unwrap()
    }

    /// A root-first chain of `length` capabilities; link `i` is controlled by
    /// principal `i` and expires one hour after the reference instant.
    pub async fn chain(&self, length: usize) -> Vec<Capability> {
        let mut chain = vec![self.root.clone()];
        for i in 1..length {
            let parent = &chain[i - 1];
            let next = self
                .delegate(
                    parent,
                    &principal(i - 1),
                    &principal(i),
                    Attenuation::new().expires(at(1)),
                )
                .await;
            chain.push(next);
        }
        chain
    }

    /// Sign a hand-built capability, bypassing every builder check.
    pub async fn sign_out_of_band(
        &self,
        mut capability: Capability,
        signer: &str,
        chain: Vec<ChainLink>,
    ) -> Capability {
        capability.proof.clear();
        let proof = Proof::delegation("Ed25519Signature2020", vm(signer), at(0), chain);
        let proof = self.builder().sign(&capability, proof).await.unwrap();
        capability.proof.push(proof);
        capability
    }
}
