//! Delegation: building attenuated child capabilities.

use crate::caveat::{Caveat, CaveatRegistry};
use crate::clock::{Clock, SystemClock, saturating_add};
use crate::config::BuilderConfig;
use crate::proof::signing_input;
use crate::suite::{Canonicalizer, Signer};
use crate::target::check_target_attenuation;
use crate::{Capability, ChainLink, Error, Invocation, Proof, Result, ZCAP_CONTEXT};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Restrictions requested for a new delegation. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attenuation {
    pub invocation_target: Option<String>,
    pub allowed_action: Option<Vec<String>>,
    pub expires: Option<DateTime<Utc>>,
    pub caveat: Vec<Caveat>,
}

impl Attenuation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Narrow the target to a suffix-extension of the parent's.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.invocation_target = Some(target.into());
        self
    }

    /// Narrow the allowed actions.
    pub fn actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_action = Some(actions.into_iter().map(Into::into).collect());
        self
    }

    /// Expire no later than `expires`.
    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Add a caveat.
    pub fn caveat(mut self, caveat: Caveat) -> Self {
        self.caveat.push(caveat);
        self
    }
}

/// Builds and signs delegated capabilities and invocations.
pub struct ChainBuilder {
    signer: Arc<dyn Signer>,
    canonicalizer: Arc<dyn Canonicalizer>,
    caveats: Arc<CaveatRegistry>,
    clock: Arc<dyn Clock>,
    config: BuilderConfig,
}

impl ChainBuilder {
    pub fn new(signer: Arc<dyn Signer>, canonicalizer: Arc<dyn Canonicalizer>) -> Self {
        Self {
            signer,
            canonicalizer,
            caveats: Arc::new(CaveatRegistry::default()),
            clock: Arc::new(SystemClock),
            config: BuilderConfig::default(),
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

    pub fn with_config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    /// Delegate `parent` to `controller`, signing with `verification_method`.
    ///
    /// All attenuation rules are checked before anything is signed; on any
    /// failure no capability is returned.
    #[tracing::instrument(skip_all, fields(parent = %parent.id))]
    pub async fn delegate<I, S>(
        &self,
        parent: &Capability,
        controller: I,
        verification_method: &str,
        attenuation: Attenuation,
    ) -> Result<Capability>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let controller: Vec<String> = controller.into_iter().map(Into::into).collect();
        if controller.is_empty() {
            return Err(Error::Malformed(
                "a delegation needs at least one controller".into(),
            ));
        }
        parent.validate_shape()?;

        let now = self.clock.now();
        if let Some(expires) = parent.expires.filter(|expires| *expires < now) {
            return Err(Error::CapabilityExpired {
                id: parent.id.clone(),
                expires,
            });
        }

        let invocation_target = attenuate_target(parent, attenuation.invocation_target)?;
        let allowed_action = attenuate_actions(parent, attenuation.allowed_action)?;
        let expires = self.attenuate_expiration(parent, attenuation.expires, now)?;
        let caveat = self
            .caveats
            .merge_caveats(&[parent.caveat.as_slice(), attenuation.caveat.as_slice()])
            .map_err(|e| Error::CaveatIncompatible {
                id: parent.id.clone(),
                reason: e.to_string(),
            })?;
        let capability_chain = capability_chain(parent)?;

        let mut capability = Capability {
            context: vec![ZCAP_CONTEXT.to_string()],
            id: format!("urn:uuid:{}", Uuid::new_v4()),
            controller,
            invocation_target,
            parent_capability: Some(parent.id.clone()),
            allowed_action,
            expires: Some(expires),
            caveat,
            proof: Vec::new(),
        };

        let proof = Proof::delegation(
            self.signer.proof_type(),
            verification_method,
            now.trunc_subsecs(0),
            capability_chain,
        );
        let proof = self.sign(&capability, proof).await?;
        capability.proof.push(proof);

        info!(id = %capability.id, expires = %expires, "delegated capability");
        Ok(capability)
    }

    /// Attach an invocation proof signed with `verification_method`.
    pub async fn sign_invocation(
        &self,
        invocation: Invocation,
        verification_method: &str,
    ) -> Result<Invocation> {
        let proof = Proof::invocation(
            self.signer.proof_type(),
            verification_method,
            self.clock.now().trunc_subsecs(0),
            &invocation.capability,
            &invocation.action,
            &invocation.invocation_target,
        );
        let proof = self.sign(&invocation.without_proof(), proof).await?;
        Ok(Invocation {
            proof: Some(proof),
            ..invocation
        })
    }

    /// Fill in `proof.proof_value` over `document` plus the unsigned proof.
    pub(crate) async fn sign<T>(&self, document: &T, mut proof: Proof) -> Result<Proof>
    where
        T: Serialize + Sync,
    {
        let input = signing_input(document, &proof)?;
        let bytes = self
            .canonicalizer
            .canonicalize(&input)
            .map_err(Error::Canonicalization)?;
        let value = self
            .signer
            .sign(&bytes, &proof.verification_method)
            .await
            .map_err(Error::Signing)?;
        proof.proof_value = Some(value);
        Ok(proof)
    }

    fn attenuate_expiration(
        &self,
        parent: &Capability,
        requested: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let max_ttl = self.config.max_delegation_ttl();
        let latest = max_ttl.map(|ttl| saturating_add(now, ttl));

        let expires = match (requested, parent.expires) {
            (Some(requested), Some(parent)) if requested > parent => {
                return Err(Error::ExpirationExceedsParent { parent, requested });
            }
            (Some(requested), _) => requested,
            (None, Some(parent)) => latest.map_or(parent, |latest| parent.min(latest)),
            (None, None) => latest.ok_or_else(|| Error::MissingExpiration {
                parent: parent.id.clone(),
            })?,
        };

        if let (Some(max_ttl), Some(latest)) = (max_ttl, latest) {
            if expires > latest {
                return Err(Error::DelegationTtlExceeded {
                    max_secs: max_ttl.num_seconds(),
                    requested_secs: (expires - now).num_seconds(),
                });
            }
        }
        Ok(expires)
    }
}

fn attenuate_target(parent: &Capability, requested: Option<String>) -> Result<String> {
    match requested {
        Some(target) if target != parent.invocation_target => {
            check_target_attenuation(&parent.invocation_target, &target)?;
            Ok(target)
        }
        _ => Ok(parent.invocation_target.clone()),
    }
}

/// An explicit set replaces the parent's only if it narrows it.
fn attenuate_actions(
    parent: &Capability,
    requested: Option<Vec<String>>,
) -> Result<Option<Vec<String>>> {
    let Some(requested) = requested else {
        return Ok(parent.allowed_action.clone());
    };

    let narrowed: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
    let within_parent = match &parent.allowed_action {
        Some(allowed) => narrowed.iter().all(|a| allowed.iter().any(|p| p == a)),
        None => true,
    };
    if narrowed.is_empty() || !within_parent {
        return Err(Error::ActionNotSubsetOfParent {
            parent: parent.allowed_action.clone().unwrap_or_default(),
            requested,
        });
    }

    Ok(Some(narrowed.into_iter().map(String::from).collect()))
}

/// `[root id, intermediate ids..., embedded parent]`, or `[root id]` when the
/// parent is the root.
fn capability_chain(parent: &Capability) -> Result<Vec<ChainLink>> {
    if parent.is_root() {
        return Ok(vec![ChainLink::Id(parent.id.clone())]);
    }

    let proof = parent.delegation_proof().ok_or_else(|| {
        Error::Malformed(format!("capability '{}' has no delegation proof", parent.id))
    })?;
    let mut chain: Vec<ChainLink> = proof
        .capability_chain
        .iter()
        .map(|link| ChainLink::Id(link.id().to_string()))
        .collect();
    chain.push(ChainLink::Embedded(Box::new(parent.clone())));
    Ok(chain)
}
