//! Invocation requests.

use crate::Capability;
use crate::proof::Proof;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A single request to use a capability.
///
/// `id` is a nonce. The engine does not track it; callers that need replay
/// protection record it after a successful verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub id: String,

    pub action: String,

    /// Id of the invoked capability.
    pub capability: String,

    /// Resource the action is performed on.
    pub invocation_target: String,

    /// Invocation-time arguments consumed by caveat evaluators.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub caveat_parameters: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

impl Invocation {
    /// An unsigned invocation of `capability` against its own target.
    pub fn new(capability: &Capability, action: impl Into<String>) -> Self {
        Self {
            id: format!("urn:uuid:{}", Uuid::new_v4()),
            action: action.into(),
            capability: capability.id.clone(),
            invocation_target: capability.invocation_target.clone(),
            caveat_parameters: Map::new(),
            proof: None,
        }
    }

    /// Target a sub-resource of the capability's target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.invocation_target = target.into();
        self
    }

    /// Supply a caveat parameter.
    pub fn with_caveat_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.caveat_parameters.insert(name.into(), value.into());
        self
    }

    /// This invocation without its proof, as signed content.
    pub(crate) fn without_proof(&self) -> Self {
        Self {
            proof: None,
            ..self.clone()
        }
    }
}
