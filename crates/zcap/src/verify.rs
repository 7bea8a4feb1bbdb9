//! Chain verification.
//!
//! The chain is discovered leaf to root with a bounded loop and then checked
//! root to leaf. Each delegated link must be signed by a controller of its
//! parent, so authority is re-derived at every step rather than trusted from
//! the leaf.

use crate::caveat::{Caveat, CaveatError, CaveatRegistry};
use crate::clock::{Clock, SystemClock, saturating_sub};
use crate::config::VerifierConfig;
use crate::proof::{ProofPurpose, signing_input};
use crate::suite::Collaborators;
use crate::target::check_target_attenuation;
use crate::{Capability, ChainLink, Error, Proof, Result, root_capability_id};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a successful chain verification.
///
/// Built fresh on every call and never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedSet {
    /// Principals holding authority at the leaf.
    pub controllers: BTreeSet<String>,
    /// Earliest expiration along the chain.
    pub expires: Option<DateTime<Utc>>,
    /// Effective allowed actions; `None` when unrestricted.
    pub allowed_action: Option<BTreeSet<String>>,
    /// Target of the leaf.
    pub invocation_target: String,
    /// Caveats merged root to leaf.
    pub caveats: Vec<Caveat>,
    /// The verified chain, root first.
    pub chain: Vec<Capability>,
}

impl AuthorizedSet {
    pub fn contains(&self, principal: &str) -> bool {
        self.controllers.contains(principal)
    }

    pub fn permits_action(&self, action: &str) -> bool {
        self.allowed_action
            .as_ref()
            .is_none_or(|actions| actions.contains(action))
    }

    pub fn root(&self) -> Option<&Capability> {
        self.chain.first()
    }

    pub fn leaf(&self) -> Option<&Capability> {
        self.chain.last()
    }
}

/// Restrictions accumulated while walking root to leaf.
struct Accumulated {
    authorized: BTreeSet<String>,
    expires: Option<DateTime<Utc>>,
    allowed_action: Option<BTreeSet<String>>,
    invocation_target: String,
    caveats: Vec<Caveat>,
}

/// Why no delegation proof on a capability was accepted.
#[derive(Default)]
struct Rejection {
    unauthorized: Option<String>,
    chain: Option<String>,
    signature: bool,
    resolution: Option<Error>,
}

impl Rejection {
    /// Report the failure that got furthest through the checks.
    fn into_error(self, id: &str) -> Error {
        if let Some(controller) = self.unauthorized {
            return Error::UnauthorizedDelegator {
                id: id.to_string(),
                controller,
            };
        }
        if let Some(reason) = self.chain {
            return Error::InvalidCapabilityChain {
                id: id.to_string(),
                reason,
            };
        }
        if self.signature {
            return Error::InvalidProofSignature { id: id.to_string() };
        }
        self.resolution
            .unwrap_or_else(|| Error::InvalidProofSignature { id: id.to_string() })
    }
}

/// Verifies delegation chains.
///
/// Holds only shared, read-only state; one instance may serve any number of
/// concurrent verifications.
pub struct ChainVerifier {
    collaborators: Collaborators,
    caveats: Arc<CaveatRegistry>,
    clock: Arc<dyn Clock>,
    config: VerifierConfig,
}

impl ChainVerifier {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            caveats: Arc::new(CaveatRegistry::default()),
            clock: Arc::new(SystemClock),
            config: VerifierConfig::default(),
        }
    }

    pub fn with_caveats(mut self, caveats: Arc<CaveatRegistry>) -> Self {
        self.caveats = caveats;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: VerifierConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn caveats(&self) -> &CaveatRegistry {
        &self.caveats
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Verify the chain ending at `leaf` and return who may act on it.
    #[tracing::instrument(skip_all, fields(leaf = %leaf.id))]
    pub async fn verify_chain(&self, leaf: &Capability) -> Result<AuthorizedSet> {
        let result = self.verify_chain_at(leaf, self.now()).await;
        if let Err(e) = &result {
            warn!(error = %e, "chain rejected");
        }
        result
    }

    pub(crate) async fn verify_chain_at(
        &self,
        leaf: &Capability,
        now: DateTime<Utc>,
    ) -> Result<AuthorizedSet> {
        let chain = self.walk(leaf).await?;
        let Some((root, links)) = chain.split_first() else {
            return Err(Error::Malformed("empty capability chain".into()));
        };

        self.check_root(root, now).await?;
        let mut acc = Accumulated {
            authorized: root.controllers(),
            expires: root.expires,
            allowed_action: root.allowed_actions(),
            invocation_target: root.invocation_target.clone(),
            caveats: self
                .caveats
                .merge_caveats(&[root.caveat.as_slice()])
                .map_err(|e| incompatible(root, e))?,
        };

        for (depth, capability) in links.iter().enumerate() {
            let ancestors = &chain[..=depth];
            let signer = self
                .verify_delegation(capability, ancestors, &acc.authorized)
                .await?;
            let expires = self.check_expiration(capability, acc.expires, now)?;
            self.check_revocation(&capability.id).await?;
            self.check_attenuation(capability, &acc)?;

            acc.caveats = self
                .caveats
                .merge_caveats(&[acc.caveats.as_slice(), capability.caveat.as_slice()])
                .map_err(|e| incompatible(capability, e))?;
            acc.expires = Some(expires);
            acc.allowed_action = capability.allowed_actions().or(acc.allowed_action);
            acc.invocation_target = capability.invocation_target.clone();
            acc.authorized = capability.controllers();

            debug!(id = %capability.id, %signer, depth = depth + 1, "verified delegation");
        }

        Ok(AuthorizedSet {
            controllers: acc.authorized,
            expires: acc.expires,
            allowed_action: acc.allowed_action,
            invocation_target: acc.invocation_target,
            caveats: acc.caveats,
            chain,
        })
    }

    /// Collect the chain leaf to root, then return it root first.
    ///
    /// Delegated parents may come from the embedded copy; the root always
    /// comes from the loader.
    async fn walk(&self, leaf: &Capability) -> Result<Vec<Capability>> {
        if leaf.is_root() {
            let trusted = self.load(&leaf.id).await?;
            if trusted != *leaf {
                return Err(Error::InvalidRootCapability {
                    id: leaf.id.clone(),
                    reason: "does not match the trusted root".into(),
                });
            }
        }

        let max = self.config.max_chain_length;
        let mut seen = HashSet::from([leaf.id.clone()]);
        let mut chain = vec![leaf.clone()];

        while let Some(parent_id) = chain.last().and_then(|c| c.parent_capability.clone()) {
            if seen.contains(&parent_id) {
                return Err(Error::CyclicChain { id: parent_id });
            }
            if chain.len() >= max {
                return Err(Error::ChainTooLong { max });
            }

            let embedded = chain.last().and_then(Capability::embedded_parent).cloned();
            let parent = match embedded {
                Some(parent) => parent,
                None => self.load(&parent_id).await?,
            };
            if parent.id != parent_id {
                return Err(Error::InvalidCapabilityChain {
                    id: parent_id,
                    reason: format!("loader returned '{}'", parent.id),
                });
            }

            seen.insert(parent_id);
            chain.push(parent);
        }

        chain.reverse();
        Ok(chain)
    }

    async fn load(&self, id: &str) -> Result<Capability> {
        match self.collaborators.loader.load(id).await {
            Ok(Some(capability)) => Ok(capability),
            Ok(None) => Err(Error::CapabilityNotFound { id: id.to_string() }),
            Err(source) => Err(Error::LoadFailed {
                id: id.to_string(),
                source,
            }),
        }
    }

    async fn check_root(&self, root: &Capability, now: DateTime<Utc>) -> Result<()> {
        root.validate_shape()?;

        let expected = root_capability_id(&root.invocation_target);
        if root.id != expected {
            return Err(Error::InvalidRootCapability {
                id: root.id.clone(),
                reason: format!(
                    "expected '{expected}' for target '{}'",
                    root.invocation_target
                ),
            });
        }

        let roots = &self.config.expected_root_capabilities;
        if !roots.is_empty() && !roots.contains(&root.id) {
            return Err(Error::UnexpectedRootCapability {
                id: root.id.clone(),
            });
        }

        if let Some(expires) = root.expires {
            self.check_not_expired(&root.id, expires, now)?;
        }
        self.check_revocation(&root.id).await
    }

    /// Accept the first delegation proof that verifies and was made by an
    /// authorized controller. Returns that controller.
    async fn verify_delegation(
        &self,
        capability: &Capability,
        ancestors: &[Capability],
        authorized: &BTreeSet<String>,
    ) -> Result<String> {
        capability.validate_shape()?;

        let unsigned = capability.without_proof();
        let mut rejection = Rejection::default();

        for proof in capability.proofs_for(ProofPurpose::CapabilityDelegation) {
            if let Err(reason) = check_chain_shape(proof, ancestors) {
                rejection.chain.get_or_insert(reason);
                continue;
            }

            let key = match self.collaborators.keys.resolve(&proof.verification_method).await {
                Ok(key) => key,
                Err(source) => {
                    rejection
                        .resolution
                        .get_or_insert(Error::KeyResolutionFailed {
                            verification_method: proof.verification_method.clone(),
                            source,
                        });
                    continue;
                }
            };

            let bytes = self.canonical_bytes(&signing_input(&unsigned, proof)?)?;
            if !self.collaborators.proofs.verify(&bytes, proof, &key) {
                rejection.signature = true;
                continue;
            }

            if authorized.contains(&key.controller) {
                return Ok(key.controller);
            }
            rejection.unauthorized.get_or_insert(key.controller);
        }

        Err(rejection.into_error(&capability.id))
    }

    pub(crate) fn canonical_bytes(&self, document: &Value) -> Result<Vec<u8>> {
        self.collaborators
            .canonicalizer
            .canonicalize(document)
            .map_err(Error::Canonicalization)
    }

    fn check_expiration(
        &self,
        capability: &Capability,
        bound: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let expires = capability.expires.ok_or_else(|| {
            Error::Malformed(format!(
                "delegated capability '{}' has no expiration",
                capability.id
            ))
        })?;

        self.check_not_expired(&capability.id, expires, now)?;
        if let Some(bound) = bound.filter(|bound| expires > *bound) {
            return Err(Error::ExpirationExceedsParent {
                parent: bound,
                requested: expires,
            });
        }
        Ok(expires)
    }

    fn check_not_expired(&self, id: &str, expires: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        if saturating_sub(now, self.config.max_clock_skew()) > expires {
            return Err(Error::CapabilityExpired {
                id: id.to_string(),
                expires,
            });
        }
        Ok(())
    }

    async fn check_revocation(&self, id: &str) -> Result<()> {
        match self.collaborators.revocations.is_revoked(id).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(Error::CapabilityRevoked { id: id.to_string() }),
            Err(source) => Err(Error::RevocationCheckFailed {
                id: id.to_string(),
                source,
            }),
        }
    }

    /// Allowed actions, target and caveats may only narrow.
    fn check_attenuation(&self, capability: &Capability, acc: &Accumulated) -> Result<()> {
        if let (Some(parent), Some(child)) = (&acc.allowed_action, capability.allowed_actions()) {
            if !child.is_subset(parent) {
                return Err(Error::CaveatIncompatible {
                    id: capability.id.clone(),
                    reason: format!("allowed actions {child:?} are not a subset of {parent:?}"),
                });
            }
        }

        if capability.invocation_target != acc.invocation_target {
            if !self.config.allow_target_attenuation {
                return Err(Error::CaveatIncompatible {
                    id: capability.id.clone(),
                    reason: "target attenuation is disabled".into(),
                });
            }
            check_target_attenuation(&acc.invocation_target, &capability.invocation_target)
                .map_err(|e| Error::CaveatIncompatible {
                    id: capability.id.clone(),
                    reason: e.to_string(),
                })?;
        }

        self.caveats
            .check_compatibility(&acc.caveats, &capability.caveat)
            .map_err(|e| incompatible(capability, e))
    }
}

fn incompatible(capability: &Capability, error: CaveatError) -> Error {
    Error::CaveatIncompatible {
        id: capability.id.clone(),
        reason: error.to_string(),
    }
}

/// The proof's chain must list the walked ancestors, root first, with the
/// root referenced by id and a delegated parent embedded.
fn check_chain_shape(proof: &Proof, ancestors: &[Capability]) -> std::result::Result<(), String> {
    let links = &proof.capability_chain;
    if links.len() != ancestors.len() {
        return Err(format!(
            "expected {} chain entries, found {}",
            ancestors.len(),
            links.len()
        ));
    }

    for (link, ancestor) in links.iter().zip(ancestors) {
        if link.id() != ancestor.id {
            return Err(format!("expected '{}', found '{}'", ancestor.id, link.id()));
        }
        if let ChainLink::Embedded(embedded) = link {
            if embedded.as_ref() != ancestor {
                return Err(format!("embedded copy of '{}' differs", ancestor.id));
            }
        }
    }

    if links.first().is_some_and(ChainLink::is_embedded) {
        return Err("the root must be referenced by id".into());
    }
    if links.len() > 1 && !links.last().is_some_and(ChainLink::is_embedded) {
        return Err("a delegated parent must be embedded".into());
    }
    Ok(())
}
