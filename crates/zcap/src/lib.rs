//! ZCAP-LD capability delegation and verification.
//!
//! Authority in this crate is an explicit, signed object. A resource owner
//! holds a root capability; delegating hands a narrower copy to someone else,
//! who may narrow it again. Anyone presented with the last link of such a
//! chain can check, without trusting the presenter, that every step was
//! signed by a holder of the step before and never widened what it received.
//!
//! # Core Concepts
//!
//! ## Capability
//!
//! A [`Capability`] grants its `controller`s the right to act on an
//! `invocationTarget`. A root capability has no parent and its id is derived
//! from the target (see [`root_capability_id`]). A delegated capability names
//! its parent, expires, and carries a delegation [`Proof`] whose
//! `capabilityChain` records its ancestry.
//!
//! ## Attenuation
//!
//! A child may only narrow its parent: fewer actions, an earlier expiration,
//! a target that extends the parent's, and caveats at least as strict.
//! [`ChainBuilder`] enforces this before signing; [`ChainVerifier`] enforces
//! it again at every link, since chains may be built by anyone.
//!
//! ## Caveats
//!
//! [`Caveat`]s are typed restrictions checked by a [`CaveatRegistry`]. The
//! built-in `Expiration` and `Action` types are always available; others are
//! added by registering a [`CaveatEvaluator`]. Unknown types never pass.
//!
//! ## Collaborators
//!
//! Canonicalization, signatures, key resolution, revocation and capability
//! lookup are injected through the traits in [`Collaborators`]. The crate
//! ships in-memory stores for revocations and capabilities; everything else
//! comes from the caller's proof suite.
//!
//! # Example
//!
//! ```
//! use zcap::{Capability, Config, Invocation, root_capability_id};
//!
//! let config = Config::parse("[verifier]\nmax_chain_length = 4\n")?;
//! assert_eq!(config.verifier.max_chain_length, 4);
//!
//! let root = Capability::root("https://example.com/photos", "did:key:alice");
//! assert_eq!(root.id, root_capability_id("https://example.com/photos"));
//!
//! let invocation = Invocation::new(&root, "read");
//! assert_eq!(invocation.capability, root.id);
//! # Ok::<(), zcap::Error>(())
//! ```

pub mod caveat;
mod capability;
mod clock;
mod config;
mod delegate;
mod error;
mod invocation;
mod invoke;
mod proof;
mod suite;
mod target;
mod verify;

#[cfg(test)]
mod testing;

pub use capability::{
    Capability, ChainLink, ROOT_CAPABILITY_PREFIX, ZCAP_CONTEXT, root_capability_id,
    root_capability_target,
};
pub use caveat::{Caveat, CaveatError, CaveatEvaluator, CaveatRegistry, InvocationContext};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    BuilderConfig, Config, DEFAULT_MAX_CHAIN_LENGTH, DEFAULT_MAX_CLOCK_SKEW_SECS, VerifierConfig,
};
pub use delegate::{Attenuation, ChainBuilder};
pub use error::{BoxError, Error, ErrorClass, Result};
pub use invocation::Invocation;
pub use invoke::{Authorized, InvocationVerifier};
pub use proof::{Proof, ProofPurpose};
pub use suite::{
    Canonicalizer, CapabilityLoader, Collaborators, KeyResolver, MemoryCapabilityLoader,
    MemoryRevocationStore, NeverRevoked, ProofVerifier, RevocationStore, Signer, VerificationKey,
};
pub use target::{check_target_attenuation, is_within_target};
pub use verify::{AuthorizedSet, ChainVerifier};
