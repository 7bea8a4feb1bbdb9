//! Proofs attached to capabilities and invocations.

use crate::capability::ChainLink;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a proof authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProofPurpose {
    CapabilityDelegation,
    CapabilityInvocation,
}

/// A cryptographic proof over a capability or invocation.
///
/// `proof_value` is produced by the signer and is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    #[serde(rename = "type")]
    pub proof_type: String,

    pub created: DateTime<Utc>,

    pub verification_method: String,

    pub proof_purpose: ProofPurpose,

    /// Ancestry of a delegated capability, root first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_chain: Vec<ChainLink>,

    /// Invoked capability id (invocation proofs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_value: Option<String>,
}

impl Proof {
    /// An unsigned delegation proof.
    pub fn delegation(
        proof_type: impl Into<String>,
        verification_method: impl Into<String>,
        created: DateTime<Utc>,
        capability_chain: Vec<ChainLink>,
    ) -> Self {
        Self {
            proof_type: proof_type.into(),
            created,
            verification_method: verification_method.into(),
            proof_purpose: ProofPurpose::CapabilityDelegation,
            capability_chain,
            capability: None,
            capability_action: None,
            invocation_target: None,
            proof_value: None,
        }
    }

    /// An unsigned invocation proof.
    pub fn invocation(
        proof_type: impl Into<String>,
        verification_method: impl Into<String>,
        created: DateTime<Utc>,
        capability: impl Into<String>,
        action: impl Into<String>,
        invocation_target: impl Into<String>,
    ) -> Self {
        Self {
            proof_type: proof_type.into(),
            created,
            verification_method: verification_method.into(),
            proof_purpose: ProofPurpose::CapabilityInvocation,
            capability_chain: Vec::new(),
            capability: Some(capability.into()),
            capability_action: Some(action.into()),
            invocation_target: Some(invocation_target.into()),
            proof_value: None,
        }
    }

    /// This proof with its value stripped.
    pub fn unsigned(&self) -> Self {
        Self {
            proof_value: None,
            ..self.clone()
        }
    }
}

/// Build the document a proof signs: `document` with its `proof` member
/// replaced by `proof` minus its value.
pub(crate) fn signing_input<T: Serialize>(document: &T, proof: &Proof) -> Result<Value> {
    let mut value = serde_json::to_value(document)
        .map_err(|e| Error::Malformed(format!("document is not serializable: {e}")))?;
    let proof = serde_json::to_value(proof.unsigned())
        .map_err(|e| Error::Malformed(format!("proof is not serializable: {e}")))?;

    let Value::Object(map) = &mut value else {
        return Err(Error::Malformed("document must be a JSON object".into()));
    };
    map.insert("proof".to_string(), proof);
    Ok(value)
}
