//! Invocation verification.

use crate::caveat::{CaveatError, InvocationContext};
use crate::clock::{saturating_add, saturating_sub};
use crate::proof::{ProofPurpose, signing_input};
use crate::target::is_within_target;
use crate::verify::{AuthorizedSet, ChainVerifier};
use crate::{Capability, Error, Invocation, Proof, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// A verified invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorized {
    /// Nonce of the invocation, for callers that track replays.
    pub invocation_id: String,
    /// Controller whose key signed the invocation.
    pub invoker: String,
    pub action: String,
    pub invocation_target: String,
    /// Id of the invoked capability.
    pub capability: String,
    /// Result of verifying the capability's chain.
    pub authorized: AuthorizedSet,
}

/// Decides whether an invocation may proceed.
///
/// Verification is stateless: every call re-verifies the full chain.
pub struct InvocationVerifier {
    chain: ChainVerifier,
}

impl InvocationVerifier {
    pub fn new(chain: ChainVerifier) -> Self {
        Self { chain }
    }

    pub fn chain_verifier(&self) -> &ChainVerifier {
        &self.chain
    }

    /// Verify `invocation` of `capability`.
    ///
    /// Chain, signature, invoker, action, target and caveats must all pass.
    #[tracing::instrument(skip_all, fields(invocation = %invocation.id, action = %invocation.action))]
    pub async fn verify_invocation(
        &self,
        invocation: &Invocation,
        capability: &Capability,
    ) -> Result<Authorized> {
        let result = self.verify(invocation, capability).await;
        match &result {
            Ok(authorized) => info!(invoker = %authorized.invoker, "invocation authorized"),
            Err(e) => warn!(error = %e, "invocation rejected"),
        }
        result
    }

    async fn verify(&self, invocation: &Invocation, capability: &Capability) -> Result<Authorized> {
        if invocation.capability != capability.id {
            return Err(Error::CapabilityMismatch {
                expected: capability.id.clone(),
                requested: invocation.capability.clone(),
            });
        }

        // One instant for the whole decision.
        let now = self.chain.now();
        let authorized = self.chain.verify_chain_at(capability, now).await?;
        let invoker = self.verify_proof(invocation, &authorized, now).await?;

        if !authorized.permits_action(&invocation.action) {
            return Err(Error::ActionNotAllowed {
                action: invocation.action.clone(),
            });
        }
        self.check_target(invocation, &authorized)?;

        let context = InvocationContext {
            now,
            clock_skew: self.chain.config().max_clock_skew(),
            action: &invocation.action,
            invocation_target: &invocation.invocation_target,
            parameters: &invocation.caveat_parameters,
        };
        self.chain
            .caveats()
            .evaluate_all(&authorized.caveats, &context)
            .map_err(|e| match e {
                CaveatError::Violated {
                    caveat_type,
                    reason,
                } => Error::CaveatViolation {
                    caveat_type,
                    reason,
                },
                other => Error::CaveatViolation {
                    caveat_type: other.caveat_type().to_string(),
                    reason: other.to_string(),
                },
            })?;

        Ok(Authorized {
            invocation_id: invocation.id.clone(),
            invoker,
            action: invocation.action.clone(),
            invocation_target: invocation.invocation_target.clone(),
            capability: capability.id.clone(),
            authorized,
        })
    }

    /// Check the invocation proof and return the invoker.
    async fn verify_proof(
        &self,
        invocation: &Invocation,
        authorized: &AuthorizedSet,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let proof = invocation
            .proof
            .as_ref()
            .filter(|p| p.proof_purpose == ProofPurpose::CapabilityInvocation)
            .ok_or_else(|| Error::InvalidProofSignature {
                id: invocation.id.clone(),
            })?;
        check_bindings(invocation, proof)?;

        let collaborators = self.chain.collaborators();
        let key = collaborators
            .keys
            .resolve(&proof.verification_method)
            .await
            .map_err(|source| Error::KeyResolutionFailed {
                verification_method: proof.verification_method.clone(),
                source,
            })?;

        let input = signing_input(&invocation.without_proof(), proof)?;
        let bytes = self.chain.canonical_bytes(&input)?;
        if !collaborators.proofs.verify(&bytes, proof, &key) {
            return Err(Error::InvalidProofSignature {
                id: invocation.id.clone(),
            });
        }

        if !authorized.contains(&key.controller) {
            return Err(Error::InvokerNotAuthorized {
                controller: key.controller,
            });
        }

        self.check_freshness(proof.created, now)?;
        Ok(key.controller)
    }

    fn check_freshness(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let config = self.chain.config();
        let skew = config.max_clock_skew();

        if created > saturating_add(now, skew) {
            return Err(Error::InvocationStale { created });
        }
        if let Some(max_age) = config.max_invocation_age() {
            if created < saturating_sub(saturating_sub(now, max_age), skew) {
                return Err(Error::InvocationStale { created });
            }
        }
        Ok(())
    }

    fn check_target(&self, invocation: &Invocation, authorized: &AuthorizedSet) -> Result<()> {
        let requested = &invocation.invocation_target;
        let expected = &authorized.invocation_target;

        let allowed = requested == expected
            || (self.chain.config().allow_target_attenuation
                && is_within_target(expected, requested));
        if !allowed {
            return Err(Error::TargetMismatch {
                expected: expected.clone(),
                requested: requested.clone(),
            });
        }
        Ok(())
    }
}

/// The proof must restate what the invocation asks for; a proof made for a
/// different request is treated as no proof at all.
fn check_bindings(invocation: &Invocation, proof: &Proof) -> Result<()> {
    let bound = [
        ("capability", &proof.capability, &invocation.capability),
        ("capabilityAction", &proof.capability_action, &invocation.action),
        (
            "invocationTarget",
            &proof.invocation_target,
            &invocation.invocation_target,
        ),
    ];
    for (field, in_proof, requested) in bound {
        if in_proof.as_ref() != Some(requested) {
            debug!(field, "invocation proof is bound to a different request");
            return Err(Error::InvalidProofSignature {
                id: invocation.id.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caveat::{Caveat, CaveatEvaluator, CaveatRegistry};
    use crate::config::VerifierConfig;
    use crate::delegate::Attenuation;
    use crate::testing::{Fixture, TARGET, at, vm};
    use chrono::TimeDelta;
    use serde_json::{Map, Value, json};
    use std::sync::Arc;

    /// Caps a numeric `amount` parameter.
    struct MaxAmount;

    impl MaxAmount {
        fn limit(caveat: &Caveat) -> Option<u64> {
            caveat.parameters()?.get("max")?.as_u64()
        }

        fn caveat(max: u64) -> Caveat {
            let mut params = Map::new();
            params.insert("max".into(), json!(max));
            Caveat::custom("MaxAmount", params)
        }
    }

    impl CaveatEvaluator for MaxAmount {
        fn caveat_type(&self) -> &str {
            "MaxAmount"
        }

        fn evaluate(
            &self,
            caveat: &Caveat,
            context: &InvocationContext<'_>,
        ) -> std::result::Result<(), String> {
            let max = Self::limit(caveat).ok_or("missing max")?;
            match context.parameters.get("amount").and_then(Value::as_u64) {
                Some(amount) if amount <= max => Ok(()),
                Some(amount) => Err(format!("{amount} exceeds {max}")),
                None => Err("no amount supplied".into()),
            }
        }

        fn is_compatible(&self, parent: &Caveat, child: &Caveat) -> bool {
            matches!((Self::limit(parent), Self::limit(child)), (Some(p), Some(c)) if c <= p)
        }
    }

    async fn read_for_b(fx: &Fixture) -> Capability {
        fx.delegate(
            &fx.root,
            "did:key:A",
            "did:key:B",
            Attenuation::new().actions(["read"]).expires(at(1)),
        )
        .await
    }

    async fn signed(fx: &Fixture, invocation: Invocation, by: &str) -> Invocation {
        fx.builder().sign_invocation(invocation, &vm(by)).await.unwrap()
    }

    #[tokio::test]
    async fn test_delegated_read() {
        let fx = Fixture::new().await;
        let cap = read_for_b(&fx).await;

        let read = signed(&fx, Invocation::new(&cap, "read"), "did:key:B").await;
        let authorized = fx.invocations_at(at(0)).verify_invocation(&read, &cap).await.unwrap();
        assert_eq!(authorized.invoker, "did:key:B");
        assert_eq!(authorized.invocation_id, read.id);
        assert_eq!(authorized.invocation_target, TARGET);

        let write = signed(&fx, Invocation::new(&cap, "write"), "did:key:B").await;
        let err = fx.invocations_at(at(0)).verify_invocation(&write, &cap).await.unwrap_err();
        assert!(matches!(err, Error::ActionNotAllowed { action } if action == "write"));

        let err = fx.invocations_at(at(2)).verify_invocation(&read, &cap).await.unwrap_err();
        assert!(matches!(err, Error::CapabilityExpired { .. }));
    }

    #[tokio::test]
    async fn test_former_controller_cannot_invoke() {
        let fx = Fixture::new().await;
        let cap = read_for_b(&fx).await;

        let invocation = signed(&fx, Invocation::new(&cap, "read"), "did:key:A").await;
        let err = fx.invocations_at(at(0)).verify_invocation(&invocation, &cap).await.unwrap_err();
        assert!(matches!(err, Error::InvokerNotAuthorized { controller } if controller == "did:key:A"));
    }

    #[tokio::test]
    async fn test_root_controller_invokes_root() {
        let fx = Fixture::new().await;
        let invocation = signed(&fx, Invocation::new(&fx.root, "anything"), "did:key:A").await;

        let authorized = fx
            .invocations_at(at(0))
            .verify_invocation(&invocation, &fx.root)
            .await
            .unwrap();
        assert_eq!(authorized.authorized.allowed_action, None);
    }

    #[tokio::test]
    async fn test_invocation_targets() {
        let fx = Fixture::new().await;
        let cap = read_for_b(&fx).await;
        let verifier = fx.invocations_at(at(0));

        let nested = Invocation::new(&cap, "read").with_target("https://svc/res/photos/1");
        let nested = signed(&fx, nested, "did:key:B").await;
        assert!(verifier.verify_invocation(&nested, &cap).await.is_ok());

        let escape = Invocation::new(&cap, "read").with_target("https://svc/res/../admin");
        let escape = signed(&fx, escape, "did:key:B").await;
        let err = verifier.verify_invocation(&escape, &cap).await.unwrap_err();
        assert!(matches!(err, Error::TargetMismatch { .. }));

        let strict = fx.verifier_with(
            at(0),
            VerifierConfig {
                allow_target_attenuation: false,
                ..VerifierConfig::default()
            },
        );
        let err = InvocationVerifier::new(strict)
            .verify_invocation(&nested, &cap)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetMismatch { .. }));
    }

    #[tokio::test]
    async fn test_custom_caveat_is_evaluated() {
        let fx = Fixture::with_caveats(CaveatRegistry::default().with(MaxAmount)).await;
        let cap = fx
            .delegate(
                &fx.root,
                "did:key:A",
                "did:key:B",
                Attenuation::new().expires(at(1)).caveat(MaxAmount::caveat(100)),
            )
            .await;
        let verifier = fx.invocations_at(at(0));

        let small = Invocation::new(&cap, "pay").with_caveat_parameter("amount", 40);
        let small = signed(&fx, small, "did:key:B").await;
        assert!(verifier.verify_invocation(&small, &cap).await.is_ok());

        let large = Invocation::new(&cap, "pay").with_caveat_parameter("amount", 400);
        let large = signed(&fx, large, "did:key:B").await;
        let err = verifier.verify_invocation(&large, &cap).await.unwrap_err();
        assert!(matches!(err, Error::CaveatViolation { caveat_type, .. } if caveat_type == "MaxAmount"));
    }

    #[tokio::test]
    async fn test_unknown_caveat_fails_closed() {
        let fx = Fixture::with_caveats(CaveatRegistry::default().with(MaxAmount)).await;
        let cap = fx
            .delegate(
                &fx.root,
                "did:key:A",
                "did:key:B",
                Attenuation::new().expires(at(1)).caveat(MaxAmount::caveat(100)),
            )
            .await;
        let invocation = Invocation::new(&cap, "pay").with_caveat_parameter("amount", 1);
        let invocation = signed(&fx, invocation, "did:key:B").await;

        // A verifier that was never told about MaxAmount.
        let verifier = InvocationVerifier::new(
            crate::verify::ChainVerifier::new(fx.collaborators())
                .with_clock(Arc::new(crate::FixedClock(at(0)))),
        );
        let err = verifier.verify_invocation(&invocation, &cap).await.unwrap_err();
        assert!(matches!(err, Error::CaveatIncompatible { .. }));
    }

    #[tokio::test]
    async fn test_capability_mismatch() {
        let fx = Fixture::new().await;
        let cap = read_for_b(&fx).await;
        let other = read_for_b(&fx).await;

        let invocation = signed(&fx, Invocation::new(&other, "read"), "did:key:B").await;
        let err = fx.invocations_at(at(0)).verify_invocation(&invocation, &cap).await.unwrap_err();
        assert!(matches!(err, Error::CapabilityMismatch { .. }));
    }

    #[tokio::test]
    async fn test_revoked_capability() {
        let fx = Fixture::new().await;
        let cap = read_for_b(&fx).await;
        let invocation = signed(&fx, Invocation::new(&cap, "read"), "did:key:B").await;
        fx.revocations.revoke(cap.id.clone()).await;

        let err = fx.invocations_at(at(0)).verify_invocation(&invocation, &cap).await.unwrap_err();
        assert!(matches!(err, Error::CapabilityRevoked { id } if id == cap.id));
    }

    #[tokio::test]
    async fn test_tampered_or_unsigned_invocation() {
        let fx = Fixture::new().await;
        let cap = read_for_b(&fx).await;
        let verifier = fx.invocations_at(at(0));

        let mut tampered = signed(&fx, Invocation::new(&cap, "read"), "did:key:B").await;
        tampered.caveat_parameters.insert("amount".into(), json!(5));
        let err = verifier.verify_invocation(&tampered, &cap).await.unwrap_err();
        assert!(matches!(err, Error::InvalidProofSignature { .. }));

        let mut rebound = signed(&fx, Invocation::new(&cap, "read"), "did:key:B").await;
        rebound.action = "write".into();
        let err = verifier.verify_invocation(&rebound, &cap).await.unwrap_err();
        assert!(matches!(err, Error::InvalidProofSignature { .. }));
        assert_eq!(err.class(), crate::ErrorClass::Policy);

        let mut retargeted = signed(&fx, Invocation::new(&cap, "read"), "did:key:B").await;
        retargeted.invocation_target = "https://svc/res/other".into();
        let err = verifier.verify_invocation(&retargeted, &cap).await.unwrap_err();
        assert!(matches!(err, Error::InvalidProofSignature { .. }));

        let unsigned = Invocation::new(&cap, "read");
        let err = verifier.verify_invocation(&unsigned, &cap).await.unwrap_err();
        assert!(matches!(err, Error::InvalidProofSignature { .. }));
    }

    #[tokio::test]
    async fn test_invocation_freshness() {
        let fx = Fixture::new().await;
        let cap = fx
            .delegate(&fx.root, "did:key:A", "did:key:B", Attenuation::new().expires(at(3)))
            .await;
        let invocation = signed(&fx, Invocation::new(&cap, "read"), "did:key:B").await;
        let config = VerifierConfig {
            max_invocation_age_secs: Some(60),
            ..VerifierConfig::default()
        };

        let fresh = fx.verifier_with(at(0) + TimeDelta::seconds(30), config.clone());
        assert!(InvocationVerifier::new(fresh).verify_invocation(&invocation, &cap).await.is_ok());

        let late = fx.verifier_with(at(1), config);
        let err = InvocationVerifier::new(late)
            .verify_invocation(&invocation, &cap)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvocationStale { .. }));

        // Signed well ahead of the verifier's clock.
        let future = fx
            .builder_at(at(1))
            .sign_invocation(Invocation::new(&cap, "read"), &vm("did:key:B"))
            .await
            .unwrap();
        let err = fx.invocations_at(at(0)).verify_invocation(&future, &cap).await.unwrap_err();
        assert!(matches!(err, Error::InvocationStale { .. }));
    }
}
