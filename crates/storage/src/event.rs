//! Revocation records and audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A capability that is currently revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub capability_id: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// What happened to a capability's revocation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevocationEventKind {
    /// The capability was revoked.
    Revoked { reason: Option<String> },
    /// A revocation was withdrawn.
    Reinstated,
}

impl RevocationEventKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            RevocationEventKind::Revoked { .. } => "revoked",
            RevocationEventKind::Reinstated => "reinstated",
        }
    }
}

/// An entry in the revocation audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEvent {
    pub id: Uuid,
    pub capability_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: RevocationEventKind,
}

impl RevocationEvent {
    pub fn new(capability_id: impl Into<String>, kind: RevocationEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            capability_id: capability_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn revoked(capability_id: impl Into<String>, reason: Option<String>) -> Self {
        Self::new(capability_id, RevocationEventKind::Revoked { reason })
    }
}
