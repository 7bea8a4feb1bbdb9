//! Caveats: restrictions attached to capabilities.
//!
//! A [`Caveat`] is plain data tagged by its `type`. Behaviour lives in a
//! [`CaveatRegistry`] that maps each tag to a [`CaveatEvaluator`]; new caveat
//! kinds are supported by registering an evaluator, never by touching the
//! verifiers.

mod builtin;
mod registry;

pub use builtin::{ActionEvaluator, ExpirationEvaluator};
pub use registry::{CaveatError, CaveatEvaluator, CaveatRegistry, InvocationContext};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Type tag of the built-in expiration caveat.
pub const EXPIRATION: &str = "Expiration";

/// Type tag of the built-in action-set caveat.
pub const ACTION: &str = "Action";

/// A restriction predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCaveat", into = "RawCaveat")]
pub enum Caveat {
    /// Invalid after `expires`.
    Expiration { expires: DateTime<Utc> },
    /// Only the listed actions may be invoked.
    Action { allowed_action: BTreeSet<String> },
    /// Any other registered caveat type.
    Custom {
        caveat_type: String,
        parameters: Map<String, Value>,
    },
}

impl Caveat {
    pub fn expiration(expires: DateTime<Utc>) -> Self {
        Caveat::Expiration { expires }
    }

    pub fn action<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Caveat::Action {
            allowed_action: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn custom(caveat_type: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Caveat::Custom {
            caveat_type: caveat_type.into(),
            parameters,
        }
    }

    /// The tag used to dispatch to an evaluator.
    pub fn caveat_type(&self) -> &str {
        match self {
            Caveat::Expiration { .. } => EXPIRATION,
            Caveat::Action { .. } => ACTION,
            Caveat::Custom { caveat_type, .. } => caveat_type,
        }
    }

    /// Parameters of a custom caveat.
    pub fn parameters(&self) -> Option<&Map<String, Value>> {
        match self {
            Caveat::Custom { parameters, .. } => Some(parameters),
            _ => None,
        }
    }
}

/// Wire form: `{"type": "...", ...parameters}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCaveat {
    #[serde(rename = "type")]
    caveat_type: String,
    #[serde(flatten)]
    parameters: Map<String, Value>,
}

impl TryFrom<RawCaveat> for Caveat {
    type Error = String;

    fn try_from(raw: RawCaveat) -> Result<Self, Self::Error> {
        match raw.caveat_type.as_str() {
            EXPIRATION => {
                let expires = raw
                    .parameters
                    .get("expires")
                    .cloned()
                    .ok_or("Expiration caveat requires 'expires'")?;
                let expires = serde_json::from_value(expires)
                    .map_err(|e| format!("invalid Expiration caveat: {e}"))?;
                Ok(Caveat::Expiration { expires })
            }
            ACTION => {
                let actions = raw
                    .parameters
                    .get("allowedAction")
                    .cloned()
                    .ok_or("Action caveat requires 'allowedAction'")?;
                let allowed_action = serde_json::from_value(actions)
                    .map_err(|e| format!("invalid Action caveat: {e}"))?;
                Ok(Caveat::Action { allowed_action })
            }
            _ => Ok(Caveat::Custom {
                caveat_type: raw.caveat_type,
                parameters: raw.parameters,
            }),
        }
    }
}

impl From<Caveat> for RawCaveat {
    fn from(caveat: Caveat) -> Self {
        let caveat_type = caveat.caveat_type().to_string();
        let mut parameters = Map::new();
        match caveat {
            Caveat::Expiration { expires } => {
                let expires = expires.to_rfc3339_opts(SecondsFormat::AutoSi, true);
                parameters.insert("expires".into(), Value::String(expires));
            }
            Caveat::Action { allowed_action } => {
                parameters.insert(
                    "allowedAction".into(),
                    Value::Array(allowed_action.into_iter().map(Value::String).collect()),
                );
            }
            Caveat::Custom { parameters: p, .. } => parameters = p,
        }
        RawCaveat {
            caveat_type,
            parameters,
        }
    }
}
