//! Delegation and verification error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Boxed error returned by external collaborators (signers, resolvers, stores).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How a caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request was rejected by policy. Retrying will not change the outcome.
    Policy,
    /// A collaborator failed (key resolution, signing, storage). Safe to retry.
    Infrastructure,
    /// The input violated a structural contract (missing or malformed fields).
    Contract,
}

/// Engine errors.
///
/// Every check is terminal: the first violation is reported and no partial
/// chain or authorized set is returned alongside it.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested target does not start with the parent's target.
    #[error("invocation target '{requested}' is not within parent target '{parent}'")]
    InvocationTargetMismatch { parent: String, requested: String },

    /// The requested actions are empty or not a subset of the parent's.
    #[error("allowed actions {requested:?} are not a non-empty subset of {parent:?}")]
    ActionNotSubsetOfParent {
        parent: Vec<String>,
        requested: Vec<String>,
    },

    /// A delegated expiration outlives its parent.
    #[error("expiration {requested} exceeds parent expiration {parent}")]
    ExpirationExceedsParent {
        parent: DateTime<Utc>,
        requested: DateTime<Utc>,
    },

    /// The target extension is not an acceptable path or query suffix.
    #[error("invalid target suffix '{suffix}': {reason}")]
    InvalidTargetSuffix { suffix: String, reason: &'static str },

    /// Neither the delegation request nor the parent carries an expiration.
    #[error("capability '{parent}' has no expiration and none was requested")]
    MissingExpiration { parent: String },

    /// The requested lifetime is longer than the configured maximum.
    #[error("delegation lifetime of {requested_secs}s exceeds the maximum of {max_secs}s")]
    DelegationTtlExceeded { max_secs: i64, requested_secs: i64 },

    /// The external signer failed; no capability was produced.
    #[error("failed to sign: {0}")]
    Signing(#[source] BoxError),

    /// The chain has more links than the configured maximum.
    #[error("capability chain exceeds the maximum length of {max}")]
    ChainTooLong { max: usize },

    /// A capability id appears twice while walking to the root.
    #[error("capability chain contains a cycle at '{id}'")]
    CyclicChain { id: String },

    /// A parent capability could not be found.
    #[error("capability '{id}' not found")]
    CapabilityNotFound { id: String },

    /// The root capability is not well-formed.
    #[error("invalid root capability '{id}': {reason}")]
    InvalidRootCapability { id: String, reason: String },

    /// The root capability is not one the verifier was told to accept.
    #[error("root capability '{id}' is not an expected root")]
    UnexpectedRootCapability { id: String },

    /// A proof's `capabilityChain` does not match the walked ancestry.
    #[error("invalid capability chain on '{id}': {reason}")]
    InvalidCapabilityChain { id: String, reason: String },

    /// No proof of the right purpose verified against its key.
    #[error("invalid proof signature on '{id}'")]
    InvalidProofSignature { id: String },

    /// The delegation was signed by someone outside the authorized set.
    #[error("'{controller}' is not authorized to delegate '{id}'")]
    UnauthorizedDelegator { id: String, controller: String },

    /// A capability in the chain has expired.
    #[error("capability '{id}' expired at {expires}")]
    CapabilityExpired { id: String, expires: DateTime<Utc> },

    /// A capability in the chain was revoked.
    #[error("capability '{id}' has been revoked")]
    CapabilityRevoked { id: String },

    /// A link relaxes a restriction inherited from its ancestors.
    #[error("capability '{id}' is incompatible with its parent: {reason}")]
    CaveatIncompatible { id: String, reason: String },

    /// The key resolver could not produce a key.
    #[error("failed to resolve verification method '{verification_method}': {source}")]
    KeyResolutionFailed {
        verification_method: String,
        #[source]
        source: BoxError,
    },

    /// The revocation store could not be consulted.
    #[error("revocation check failed for '{id}': {source}")]
    RevocationCheckFailed {
        id: String,
        #[source]
        source: BoxError,
    },

    /// The capability loader failed.
    #[error("failed to load capability '{id}': {source}")]
    LoadFailed {
        id: String,
        #[source]
        source: BoxError,
    },

    /// The canonicalizer rejected a document.
    #[error("canonicalization failed: {0}")]
    Canonicalization(#[source] BoxError),

    /// The invocation names a different capability than the one supplied.
    #[error("invocation references '{requested}' but capability '{expected}' was supplied")]
    CapabilityMismatch { expected: String, requested: String },

    /// The invoker is not among the authorized controllers.
    #[error("'{controller}' is not authorized to invoke this capability")]
    InvokerNotAuthorized { controller: String },

    /// The requested action is not permitted by the capability.
    #[error("action '{action}' is not allowed")]
    ActionNotAllowed { action: String },

    /// The requested resource is outside the capability's target.
    #[error("target '{requested}' does not match capability target '{expected}'")]
    TargetMismatch { expected: String, requested: String },

    /// A caveat evaluated to false for this invocation.
    #[error("caveat '{caveat_type}' violated: {reason}")]
    CaveatViolation { caveat_type: String, reason: String },

    /// The invocation proof was created outside the accepted time window.
    #[error("invocation proof created at {created} is outside the accepted window")]
    InvocationStale { created: DateTime<Utc> },

    /// A required field is missing or malformed.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The configuration is invalid.
    #[error("invalid config: {0}")]
    Config(String),

    /// An I/O error occurred while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Signing(_)
            | Error::KeyResolutionFailed { .. }
            | Error::RevocationCheckFailed { .. }
            | Error::LoadFailed { .. }
            | Error::Io(_) => ErrorClass::Infrastructure,
            Error::Canonicalization(_) | Error::Malformed(_) | Error::Config(_) => {
                ErrorClass::Contract
            }
            _ => ErrorClass::Policy,
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }
}

pub type Result<T> = std::result::Result<T, Error>;
