//! Capability documents and chain links.

use crate::caveat::Caveat;
use crate::proof::{Proof, ProofPurpose};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// JSON-LD context for ZCAP-LD documents.
pub const ZCAP_CONTEXT: &str = "https://w3id.org/zcap/v1";

/// Prefix of every root capability id.
pub const ROOT_CAPABILITY_PREFIX: &str = "urn:zcap:root:";

/// An authorization capability, root or delegated.
///
/// A capability is root iff `parent_capability` is absent. Delegated
/// capabilities carry an expiration and at least one delegation proof whose
/// `capabilityChain` ends with the parent (embedded unless the parent is the
/// root).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    #[serde(
        rename = "@context",
        with = "one_or_many",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub context: Vec<String>,

    pub id: String,

    #[serde(with = "one_or_many")]
    pub controller: Vec<String>,

    pub invocation_target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_capability: Option<String>,

    /// Absent means the parent's effective actions are inherited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_action: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caveat: Vec<Caveat>,

    #[serde(
        with = "one_or_many",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub proof: Vec<Proof>,
}

impl Capability {
    /// Create a root capability over `target`, controlled by `controller`.
    pub fn root(target: impl Into<String>, controller: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            context: vec![ZCAP_CONTEXT.to_string()],
            id: root_capability_id(&target),
            controller: vec![controller.into()],
            invocation_target: target,
            parent_capability: None,
            allowed_action: None,
            expires: None,
            caveat: Vec::new(),
            proof: Vec::new(),
        }
    }

    /// Add a controller.
    pub fn with_controller(mut self, controller: impl Into<String>) -> Self {
        self.controller.push(controller.into());
        self
    }

    /// Restrict the actions this capability allows.
    pub fn with_allowed_action<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_action = Some(actions.into_iter().map(Into::into).collect());
        self
    }

    /// Set an expiration.
    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Append a caveat.
    pub fn with_caveat(mut self, caveat: Caveat) -> Self {
        self.caveat.push(caveat);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_capability.is_none()
    }

    pub fn is_controller(&self, principal: &str) -> bool {
        self.controller.iter().any(|c| c == principal)
    }

    /// Controllers as a set.
    pub fn controllers(&self) -> BTreeSet<String> {
        self.controller.iter().cloned().collect()
    }

    /// Allowed actions as a set; `None` when unrestricted at this link.
    pub fn allowed_actions(&self) -> Option<BTreeSet<String>> {
        self.allowed_action
            .as_ref()
            .map(|actions| actions.iter().cloned().collect())
    }

    /// Proofs with the given purpose, in document order.
    pub fn proofs_for(&self, purpose: ProofPurpose) -> impl Iterator<Item = &Proof> {
        self.proof.iter().filter(move |p| p.proof_purpose == purpose)
    }

    /// The first delegation proof, if any.
    pub fn delegation_proof(&self) -> Option<&Proof> {
        self.proofs_for(ProofPurpose::CapabilityDelegation).next()
    }

    /// The delegated parent embedded at the tail of a delegation proof's
    /// chain. An embedded root is never returned; roots are only trusted
    /// from a [`CapabilityLoader`](crate::CapabilityLoader).
    pub fn embedded_parent(&self) -> Option<&Capability> {
        let parent_id = self.parent_capability.as_deref()?;
        self.proofs_for(ProofPurpose::CapabilityDelegation)
            .filter_map(|p| p.capability_chain.last())
            .find_map(|link| match link {
                ChainLink::Embedded(parent) if parent.id == parent_id && !parent.is_root() => {
                    Some(parent.as_ref())
                }
                _ => None,
            })
    }

    /// This capability without any proofs, as signed content.
    pub(crate) fn without_proof(&self) -> Self {
        Self {
            proof: Vec::new(),
            ..self.clone()
        }
    }

    /// Reject documents missing the fields every capability needs.
    pub(crate) fn validate_shape(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Malformed("capability id is empty".into()));
        }
        if self.controller.is_empty() {
            return Err(Error::Malformed(format!(
                "capability '{}' has no controller",
                self.id
            )));
        }
        if self.invocation_target.is_empty() {
            return Err(Error::Malformed(format!(
                "capability '{}' has no invocation target",
                self.id
            )));
        }
        if !self.is_root() && self.expires.is_none() {
            return Err(Error::Malformed(format!(
                "delegated capability '{}' has no expiration",
                self.id
            )));
        }
        Ok(())
    }
}

/// One entry of a proof's `capabilityChain`.
///
/// Ancestors are referenced by id; the immediate parent of a delegated
/// capability is embedded so that a verifier does not need to fetch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainLink {
    Id(String),
    Embedded(Box<Capability>),
}

impl ChainLink {
    pub fn id(&self) -> &str {
        match self {
            ChainLink::Id(id) => id,
            ChainLink::Embedded(capability) => &capability.id,
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, ChainLink::Embedded(_))
    }
}

/// Derive the deterministic root capability id for a target.
pub fn root_capability_id(target: &str) -> String {
    format!("{ROOT_CAPABILITY_PREFIX}{}", urlencoding::encode(target))
}

/// Recover the invocation target encoded in a root capability id.
pub fn root_capability_target(id: &str) -> Result<String> {
    let Some(encoded) = id.strip_prefix(ROOT_CAPABILITY_PREFIX) else {
        return Err(Error::InvalidRootCapability {
            id: id.to_string(),
            reason: format!("id must start with {ROOT_CAPABILITY_PREFIX}"),
        });
    };

    urlencoding::decode(encoded)
        .map(|target| target.into_owned())
        .map_err(|e| Error::InvalidRootCapability {
            id: id.to_string(),
            reason: format!("target is not valid percent-encoding: {e}"),
        })
}

/// Serialize a list as a bare value when it has one element.
pub(crate) mod one_or_many {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    #[allow(clippy::ptr_arg)]
    pub fn serialize<T, S>(values: &Vec<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match values.as_slice() {
            [one] => one.serialize(serializer),
            many => many.serialize(serializer),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        })
    }
}
